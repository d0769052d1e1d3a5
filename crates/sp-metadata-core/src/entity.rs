use crate::xml::{DocumentParser, Element, QuickXmlParser};
use crate::{MetadataError, SAML_METADATA_NS};

/// Reads the entity identifier a metadata document declares about itself.
pub trait EntityIdExtractor: Send + Sync {
    /// Return the declared entity ID, or `None` when the document declares none.
    ///
    /// # Errors
    /// Returns [`MetadataError::Parse`] when the document cannot be parsed at all.
    fn extract_entity_id(&self, metadata: &str) -> Result<Option<String>, MetadataError>;

    /// Same as [`EntityIdExtractor::extract_entity_id`] for a document parsed elsewhere.
    fn extract_from_root(&self, root: &Element) -> Option<String>;
}

/// Extracts `entityID` from a SAML 2.0 `md:EntityDescriptor` root.
///
/// An `EntitiesDescriptor` aggregate has no single identity and yields `None`.
#[derive(Debug, Clone, Default)]
pub struct SamlEntityIdExtractor<P = QuickXmlParser> {
    parser: P,
}

impl<P: DocumentParser> SamlEntityIdExtractor<P> {
    #[must_use]
    pub fn with_parser(parser: P) -> Self {
        Self { parser }
    }
}

impl<P: DocumentParser> EntityIdExtractor for SamlEntityIdExtractor<P> {
    fn extract_entity_id(&self, metadata: &str) -> Result<Option<String>, MetadataError> {
        let document = self.parser.parse(metadata.as_bytes())?;
        Ok(self.extract_from_root(document.root_element()))
    }

    fn extract_from_root(&self, root: &Element) -> Option<String> {
        if !root.is(SAML_METADATA_NS, "EntityDescriptor") {
            return None;
        }

        root.attribute("entityID")
            .filter(|entity_id| !entity_id.trim().is_empty())
            .map(str::to_string)
    }
}
