use std::fmt;

use strata_crypto::DigestAlgorithm;
use strata_types::BlobContext;

use crate::error::{StoreError, StoreResult};
use crate::write::{BlobWriteContext, DigestObserver, KeySupplier};

/// Separator between a base key and a store-assigned version.
pub const VERSION_SEPARATOR: char = '@';

/// Policy deriving a blob's storage key from its content or context.
///
/// Strategies compare by value, so two stores can tell whether they were
/// configured compatibly.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyStrategy {
    /// Key is the lowercase hex digest of the content.
    Digest(DigestAlgorithm),
    /// Key is the owning document's id. Only the main attachment is supported.
    DocId,
    /// Reuse the key a managed blob already carries, else use the fallback.
    Managed(Box<KeyStrategy>),
}

impl KeyStrategy {
    pub fn digest(algorithm: DigestAlgorithm) -> Self {
        Self::Digest(algorithm)
    }

    pub fn managed(fallback: KeyStrategy) -> Self {
        Self::Managed(Box::new(fallback))
    }

    /// Build the per-write context for `ctx`.
    pub fn blob_write_context<'a>(&self, ctx: &'a BlobContext) -> StoreResult<BlobWriteContext<'a>> {
        match self {
            Self::Digest(algorithm) => Ok(BlobWriteContext::new(
                ctx,
                Some(Box::new(DigestObserver::new(*algorithm))),
                KeySupplier::Observed,
            )),
            Self::DocId => {
                if !ctx.is_main_blob() {
                    return Err(StoreError::config(format!(
                        "doc-id key strategy only supports the main blob, not {:?}",
                        ctx.xpath
                    )));
                }
                let doc_id = ctx
                    .doc_id
                    .as_ref()
                    .ok_or_else(|| StoreError::config("doc-id key strategy requires a document id"))?;
                Ok(BlobWriteContext::new(ctx, None, KeySupplier::Fixed(doc_id.clone())))
            }
            Self::Managed(fallback) => match &ctx.managed_key {
                Some(key) => Ok(BlobWriteContext::new(ctx, None, KeySupplier::Fixed(key.clone()))),
                None => fallback.blob_write_context(ctx),
            },
        }
    }

    /// Whether identical content is meant to converge on one key.
    pub fn use_deduplication(&self) -> bool {
        matches!(self, Self::Digest(_))
    }

    /// The content digest encoded in `key`, if this strategy produces digest keys.
    pub fn digest_from_key(&self, key: &str) -> Option<String> {
        match self {
            Self::Digest(algorithm) => {
                let base = base_key(key);
                algorithm.is_valid_digest(base).then(|| base.to_string())
            }
            Self::DocId => None,
            Self::Managed(fallback) => fallback.digest_from_key(key),
        }
    }

    /// The digest algorithm when keys are digests.
    pub fn digest_algorithm(&self) -> Option<DigestAlgorithm> {
        match self {
            Self::Digest(algorithm) => Some(*algorithm),
            _ => None,
        }
    }
}

impl Default for KeyStrategy {
    fn default() -> Self {
        Self::Digest(DigestAlgorithm::default())
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Digest(algorithm) => write!(f, "digest:{algorithm}"),
            Self::DocId => write!(f, "docid"),
            Self::Managed(fallback) => write!(f, "managed({fallback})"),
        }
    }
}

/// `key` without any `@version` suffix.
pub fn base_key(key: &str) -> &str {
    match key.split_once(VERSION_SEPARATOR) {
        Some((base, _)) => base,
        None => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::transfer;

    fn resolve(strategy: &KeyStrategy, blob: &BlobContext) -> StoreResult<String> {
        let mut ctx = strategy.blob_write_context(blob)?;
        transfer(&mut ctx, &mut std::io::sink())?;
        ctx.key()
    }

    #[test]
    fn digest_key_is_content_hash() {
        let strategy = KeyStrategy::digest(DigestAlgorithm::Md5);
        let key = resolve(&strategy, &BlobContext::new(b"hello world".to_vec())).unwrap();
        assert_eq!(key, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert!(strategy.use_deduplication());
        assert_eq!(strategy.digest_from_key(&key), Some(key.clone()));
    }

    #[test]
    fn digest_identical_content_same_key() {
        let strategy = KeyStrategy::digest(DigestAlgorithm::Sha256);
        let a = resolve(&strategy, &BlobContext::new(b"same".to_vec()).with_document("r", "doc-a")).unwrap();
        let b = resolve(&strategy, &BlobContext::new(b"same".to_vec()).with_document("r", "doc-b")).unwrap();
        let c = resolve(&strategy, &BlobContext::new(b"other".to_vec())).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn doc_id_key_is_document_id() {
        let strategy = KeyStrategy::DocId;
        let blob = BlobContext::new(b"content".to_vec()).with_document("default", "doc1");
        assert_eq!(resolve(&strategy, &blob).unwrap(), "doc1");
        assert!(!strategy.use_deduplication());
        assert_eq!(strategy.digest_from_key("doc1"), None);
    }

    #[test]
    fn doc_id_rejects_secondary_attachment() {
        let strategy = KeyStrategy::DocId;
        let blob = BlobContext::new(b"content".to_vec())
            .with_document("default", "doc1")
            .with_xpath("files/0/file");
        assert!(matches!(strategy.blob_write_context(&blob), Err(StoreError::Config(_))));
    }

    #[test]
    fn doc_id_requires_document() {
        let blob = BlobContext::new(b"content".to_vec());
        assert!(matches!(KeyStrategy::DocId.blob_write_context(&blob), Err(StoreError::Config(_))));
    }

    #[test]
    fn managed_reuses_foreign_key() {
        let strategy = KeyStrategy::managed(KeyStrategy::digest(DigestAlgorithm::Md5));
        let blob = BlobContext::new(b"hello world".to_vec()).with_managed_key("foreign-key");
        let ctx = strategy.blob_write_context(&blob).unwrap();
        assert!(!ctx.has_observer());
        assert_eq!(ctx.key().unwrap(), "foreign-key");
        assert!(!strategy.use_deduplication());
    }

    #[test]
    fn managed_falls_back_without_key() {
        let strategy = KeyStrategy::managed(KeyStrategy::digest(DigestAlgorithm::Md5));
        let key = resolve(&strategy, &BlobContext::new(b"hello world".to_vec())).unwrap();
        assert_eq!(key, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn strategies_compare_by_value() {
        assert_eq!(
            KeyStrategy::digest(DigestAlgorithm::Md5),
            KeyStrategy::digest(DigestAlgorithm::Md5)
        );
        assert_ne!(
            KeyStrategy::digest(DigestAlgorithm::Md5),
            KeyStrategy::digest(DigestAlgorithm::Sha256)
        );
        assert_ne!(KeyStrategy::DocId, KeyStrategy::default());
    }

    #[test]
    fn digest_from_versioned_key() {
        let strategy = KeyStrategy::digest(DigestAlgorithm::Md5);
        assert_eq!(
            strategy.digest_from_key("5eb63bbbe01eeed093cb22bb8f5acdc3@42"),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3".to_string())
        );
        assert_eq!(strategy.digest_from_key("not-a-digest"), None);
        assert_eq!(base_key("abc@1"), "abc");
        assert_eq!(base_key("abc"), "abc");
    }
}
