use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod entity;
pub mod resolver;
pub mod signer;
pub mod xml;

pub use codec::{decode_metadata, decode_metadata_text, encode_metadata};
pub use entity::{EntityIdExtractor, SamlEntityIdExtractor};
pub use resolver::{
    DomResolverFactory, Endpoint, EntityDescriptorView, MetadataResolver, ResolverFactory,
};
pub use signer::MetadataSigner;
pub use xml::{DocumentParser, Element, QuickXmlParser, XmlDocument};

pub const SAML_METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

pub const DEFAULT_TABLE_NAME: &str = "sp_metadata";
const MAX_TABLE_NAME_LEN: usize = 64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MetadataError {
    #[error("metadata parse error: {0}")]
    Parse(String),
    #[error("metadata decode error: {0}")]
    Decode(String),
    #[error("unexpected metadata root element {0}")]
    UnexpectedRoot(String),
    #[error("metadata signing failed: {0}")]
    Signing(String),
    #[error("invalid table name {0:?}: expected [A-Za-z_][A-Za-z0-9_]* of at most 64 chars")]
    InvalidTableName(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// SQL identifier of the table holding one metadata row per entity.
///
/// Only names matching `[A-Za-z_][A-Za-z0-9_]*` are accepted, since the name is
/// the one piece of every statement that cannot be bound as a parameter.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// Validate and wrap a table name.
    ///
    /// # Errors
    /// Returns [`MetadataError::InvalidTableName`] when the value is not a plain SQL identifier.
    pub fn new(value: impl Into<String>) -> Result<Self, MetadataError> {
        let value = value.into();
        let mut chars = value.chars();
        let valid_head = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_head || !valid_tail || value.len() > MAX_TABLE_NAME_LEN {
            return Err(MetadataError::InvalidTableName(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self(DEFAULT_TABLE_NAME.to_string())
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TableName {
    type Error = MetadataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

/// Immutable settings of one metadata store instance.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MetadataStoreConfig {
    pub entity_id: String,
    #[serde(default)]
    pub table_name: TableName,
    /// Sign every stored document, not only forced stores.
    #[serde(default)]
    pub sign_metadata: bool,
}

impl MetadataStoreConfig {
    #[must_use]
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self { entity_id: entity_id.into(), table_name: TableName::default(), sign_metadata: false }
    }

    #[must_use]
    pub fn with_table_name(mut self, table_name: TableName) -> Self {
        self.table_name = table_name;
        self
    }

    #[must_use]
    pub fn with_sign_metadata(mut self, sign_metadata: bool) -> Self {
        self.sign_metadata = sign_metadata;
        self
    }

    /// Check the settings that cannot be expressed in the types.
    ///
    /// # Errors
    /// Returns [`MetadataError::InvalidConfig`] when the entity ID is blank.
    pub fn validate(&self) -> Result<(), MetadataError> {
        if self.entity_id.trim().is_empty() {
            return Err(MetadataError::InvalidConfig(
                "entity_id MUST be provided for a metadata store".to_string(),
            ));
        }
        Ok(())
    }
}
