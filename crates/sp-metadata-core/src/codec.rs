//! Text-safe storage encoding of metadata documents.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::MetadataError;

/// Encode a metadata document as padded standard base64 of its UTF-8 bytes.
#[must_use]
pub fn encode_metadata(metadata: &str) -> String {
    STANDARD.encode(metadata.as_bytes())
}

/// Decode a stored blob back to the raw document bytes.
///
/// # Errors
/// Returns [`MetadataError::Decode`] when the blob is not valid base64.
pub fn decode_metadata(blob: &str) -> Result<Vec<u8>, MetadataError> {
    STANDARD
        .decode(blob.trim())
        .map_err(|err| MetadataError::Decode(format!("base64 decode failed: {err}")))
}

/// Decode a stored blob back to the document text.
///
/// # Errors
/// Returns [`MetadataError::Decode`] when the blob is not valid base64 or not UTF-8.
pub fn decode_metadata_text(blob: &str) -> Result<String, MetadataError> {
    String::from_utf8(decode_metadata(blob)?)
        .map_err(|err| MetadataError::Decode(format!("invalid UTF-8: {err}")))
}
