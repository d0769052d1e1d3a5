use crate::MetadataError;

/// Produces a signed copy of a metadata document.
///
/// Implementations typically insert an enveloped `ds:Signature` into the root
/// element. The returned text replaces the input for every later step of a store.
pub trait MetadataSigner: Send + Sync {
    /// Sign one metadata document.
    ///
    /// # Errors
    /// Returns [`MetadataError::Signing`] when key material or the document cannot be signed.
    fn sign(&self, metadata: &str) -> Result<String, MetadataError>;
}

impl<F> MetadataSigner for F
where
    F: Fn(&str) -> Result<String, MetadataError> + Send + Sync,
{
    fn sign(&self, metadata: &str) -> Result<String, MetadataError> {
        self(metadata)
    }
}
