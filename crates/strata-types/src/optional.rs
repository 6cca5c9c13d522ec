/// Result of a lookup that a store may be unable to answer.
///
/// `Missing` means the store is authoritative and the blob does not exist.
/// `Unknown` means this particular access path is not supported by the store
/// and the caller should try another one (for instance a stream instead of a
/// local file).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionalOrUnknown<T> {
    Present(T),
    Missing,
    Unknown,
}

impl<T> OptionalOrUnknown<T> {
    /// Wrap an `Option`, mapping `None` to `Missing`.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Present(v),
            None => Self::Missing,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Transform the present value, keeping `Missing`/`Unknown` as they are.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> OptionalOrUnknown<U> {
        match self {
            Self::Present(v) => OptionalOrUnknown::Present(f(v)),
            Self::Missing => OptionalOrUnknown::Missing,
            Self::Unknown => OptionalOrUnknown::Unknown,
        }
    }

    /// The present value, if any. Loses the missing/unknown distinction.
    pub fn present(self) -> Option<T> {
        match self {
            Self::Present(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> OptionalOrUnknown<&T> {
        match self {
            Self::Present(v) => OptionalOrUnknown::Present(v),
            Self::Missing => OptionalOrUnknown::Missing,
            Self::Unknown => OptionalOrUnknown::Unknown,
        }
    }
}

impl<T> From<Option<T>> for OptionalOrUnknown<T> {
    fn from(value: Option<T>) -> Self {
        Self::from_option(value)
    }
}
