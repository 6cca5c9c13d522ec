use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Inclusive byte interval `[start, end]` over a blob's content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    start: u64,
    end: u64,
}

impl ByteRange {
    /// Create a range, rejecting `end < start`.
    pub fn new(start: u64, end: u64) -> Result<Self, TypeError> {
        if end < start {
            return Err(TypeError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Range covering `length` bytes starting at `start`. `length` must be non-zero.
    pub fn with_length(start: u64, length: u64) -> Result<Self, TypeError> {
        if length == 0 {
            return Err(TypeError::InvalidRange {
                start,
                end: start.wrapping_sub(1),
            });
        }
        let end = start.checked_add(length - 1).ok_or(TypeError::InvalidRange {
            start,
            end: u64::MAX,
        })?;
        Self::new(start, end)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered: `end - start + 1`.
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Parse an HTTP-style `bytes=START-END` specifier.
    pub fn parse(header: &str) -> Result<Self, TypeError> {
        let spec = header
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(|| TypeError::MalformedRange(header.to_string()))?;
        let (start, end) = spec
            .split_once('-')
            .ok_or_else(|| TypeError::MalformedRange(header.to_string()))?;
        let start: u64 = start
            .trim()
            .parse()
            .map_err(|_| TypeError::MalformedRange(header.to_string()))?;
        let end: u64 = end
            .trim()
            .parse()
            .map_err(|_| TypeError::MalformedRange(header.to_string()))?;
        Self::new(start, end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}
