use std::borrow::Cow;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sp_metadata_core::{
    decode_metadata, decode_metadata_text, encode_metadata, DocumentParser, DomResolverFactory,
    EntityIdExtractor, MetadataError, MetadataResolver, MetadataSigner, MetadataStoreConfig,
    QuickXmlParser, ResolverFactory, SamlEntityIdExtractor, TableName,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("metadata signing is enabled but no signer is configured")]
    SignerMissing,
    #[error("metadata does not declare an entity id")]
    MissingEntityId,
    #[error(
        "entity id from metadata {metadata_entity_id} does not match supplied entity id {configured_entity_id}"
    )]
    IdentityMismatch { metadata_entity_id: String, configured_entity_id: String },
    #[error("no metadata stored for entity {entity_id} in table {table}")]
    NotFound { entity_id: String, table: String },
    #[error("duplicate key {entity_id} on metadata insert")]
    Conflict {
        entity_id: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Inserted,
    Updated,
}

impl WriteKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
        }
    }
}

/// Result of the single write statement issued by a store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOutcome {
    pub kind: WriteKind,
    pub rows_affected: usize,
}

impl StoreOutcome {
    #[must_use]
    pub fn is_applied(self) -> bool {
        self.rows_affected > 0
    }
}

/// One-row-per-entity store of SAML service provider metadata.
pub struct SqliteMetadataStore {
    conn: Connection,
    config: MetadataStoreConfig,
    signer: Option<Box<dyn MetadataSigner>>,
    parser: Box<dyn DocumentParser>,
    extractor: Box<dyn EntityIdExtractor>,
}

impl SqliteMetadataStore {
    /// Open a SQLite-backed metadata store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the config is invalid, or the database cannot be opened or configured.
    pub fn open(path: &Path, config: MetadataStoreConfig) -> StoreResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;

        Self::from_connection(conn, config)
    }

    /// Wrap a connection the caller has already configured.
    ///
    /// # Errors
    /// Returns [`StoreError::Validation`] when the config names no entity.
    pub fn from_connection(conn: Connection, config: MetadataStoreConfig) -> StoreResult<Self> {
        config.validate().map_err(|err| StoreError::Validation(err.to_string()))?;

        Ok(Self {
            conn,
            config,
            signer: None,
            parser: Box::new(QuickXmlParser),
            extractor: Box::new(SamlEntityIdExtractor::<QuickXmlParser>::default()),
        })
    }

    #[must_use]
    pub fn with_signer(mut self, signer: impl MetadataSigner + 'static) -> Self {
        self.signer = Some(Box::new(signer));
        self
    }

    #[must_use]
    pub fn with_parser(mut self, parser: impl DocumentParser + 'static) -> Self {
        self.parser = Box::new(parser);
        self
    }

    #[must_use]
    pub fn with_extractor(mut self, extractor: impl EntityIdExtractor + 'static) -> Self {
        self.extractor = Box::new(extractor);
        self
    }

    #[must_use]
    pub fn config(&self) -> &MetadataStoreConfig {
        &self.config
    }

    #[must_use]
    pub fn entity_id(&self) -> &str {
        &self.config.entity_id
    }

    #[must_use]
    pub fn table_name(&self) -> &TableName {
        &self.config.table_name
    }

    /// Create the metadata table when it does not exist yet.
    ///
    /// # Errors
    /// Returns [`StoreError::Storage`] when the DDL statement fails.
    pub fn ensure_table(&self) -> StoreResult<()> {
        self.conn.execute_batch(&create_table_sql(&self.config.table_name))?;
        Ok(())
    }

    /// Store a metadata document for the configured entity, inserting or updating its row.
    ///
    /// Returns `false` without touching the database when `metadata` is blank.
    ///
    /// # Errors
    /// See [`SqliteMetadataStore::store_metadata_with_outcome`].
    pub fn store_metadata(&mut self, metadata: &str, force_signing: bool) -> StoreResult<bool> {
        let outcome = self.store_metadata_with_outcome(metadata, force_signing)?;
        Ok(outcome.is_some_and(StoreOutcome::is_applied))
    }

    /// Store a metadata document and report which write statement ran.
    ///
    /// Steps run in a fixed order: blank check, optional signing, identity check on the
    /// tree built by the installed parser,
    /// then probe and write inside one IMMEDIATE transaction so concurrent writers
    /// on the same database are serialized.
    ///
    /// # Errors
    /// Returns [`StoreError::IdentityMismatch`] when the document belongs to another entity,
    /// [`StoreError::MissingEntityId`] or [`StoreError::Metadata`] when its identity cannot be
    /// read, [`StoreError::SignerMissing`] or [`StoreError::Validation`] for signing problems,
    /// [`StoreError::Conflict`] on a duplicate key and [`StoreError::Storage`] for any other
    /// database failure.
    pub fn store_metadata_with_outcome(
        &mut self,
        metadata: &str,
        force_signing: bool,
    ) -> StoreResult<Option<StoreOutcome>> {
        if metadata.trim().is_empty() {
            tracing::info!(entity_id = %self.config.entity_id, "no metadata is provided");
            return Ok(None);
        }

        let metadata_to_use = self.sign_if_enabled(metadata, force_signing)?;
        if metadata_to_use.trim().is_empty() {
            return Err(StoreError::Validation("signed metadata cannot be blank".to_string()));
        }

        self.check_identity(&metadata_to_use)?;
        let encoded = encode_metadata(&metadata_to_use);
        self.write_metadata(&encoded).map(Some)
    }

    /// Load the stored document bytes for the configured entity.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when no row exists and [`StoreError::Metadata`] when
    /// the stored blob cannot be decoded.
    pub fn fetch_metadata(&self) -> StoreResult<Vec<u8>> {
        let blob = self.fetch_encoded()?;
        Ok(decode_metadata(&blob)?)
    }

    /// Load the stored document as text.
    ///
    /// # Errors
    /// Same as [`SqliteMetadataStore::fetch_metadata`], plus a decode error for non-UTF-8 content.
    pub fn fetch_metadata_text(&self) -> StoreResult<String> {
        let blob = self.fetch_encoded()?;
        Ok(decode_metadata_text(&blob)?)
    }

    /// # Errors
    /// Returns [`StoreError::Storage`] when the lookup fails.
    pub fn has_metadata(&self) -> StoreResult<bool> {
        let exists = self.conn.query_row(
            &exists_sql(&self.config.table_name),
            params![self.config.entity_id],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(exists == 1)
    }

    /// Build a resolver over the stored document with the default DOM resolver factory.
    ///
    /// # Errors
    /// See [`SqliteMetadataStore::create_metadata_resolver_with`].
    pub fn create_metadata_resolver(&self) -> StoreResult<MetadataResolver> {
        self.create_metadata_resolver_with(&DomResolverFactory)
    }

    /// Fetch, decode and parse the stored document, then hand its root to `factory`.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when nothing is stored for the entity and
    /// [`StoreError::Metadata`] when the stored document cannot be decoded, parsed or resolved.
    pub fn create_metadata_resolver_with<F: ResolverFactory>(
        &self,
        factory: &F,
    ) -> StoreResult<F::Resolver> {
        let metadata = self.fetch_metadata()?;
        let document = self.parser.parse(&metadata)?;
        Ok(factory.resolver_for_root(document.into_root_element())?)
    }

    fn sign_if_enabled<'a>(
        &self,
        metadata: &'a str,
        force_signing: bool,
    ) -> StoreResult<Cow<'a, str>> {
        if !self.config.sign_metadata && !force_signing {
            return Ok(Cow::Borrowed(metadata));
        }

        match &self.signer {
            Some(signer) => Ok(Cow::Owned(signer.sign(metadata)?)),
            None if self.config.sign_metadata => Err(StoreError::SignerMissing),
            None => {
                tracing::warn!(
                    entity_id = %self.config.entity_id,
                    "signing was forced but no signer is configured; storing metadata unsigned"
                );
                Ok(Cow::Borrowed(metadata))
            }
        }
    }

    fn check_identity(&self, metadata: &str) -> StoreResult<()> {
        let document = self.parser.parse(metadata.as_bytes())?;
        let metadata_entity_id = self
            .extractor
            .extract_from_root(document.root_element())
            .ok_or(StoreError::MissingEntityId)?;

        if metadata_entity_id != self.config.entity_id {
            return Err(StoreError::IdentityMismatch {
                metadata_entity_id,
                configured_entity_id: self.config.entity_id.clone(),
            });
        }
        Ok(())
    }

    fn write_metadata(&mut self, encoded: &str) -> StoreResult<StoreOutcome> {
        let Self { conn, config, .. } = self;
        let table = &config.table_name;
        let entity_id = config.entity_id.as_str();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(&select_entity_sql(table), params![entity_id], |row| row.get::<_, String>(0))
            .optional()?;

        let outcome = if let Some(existing) = existing {
            tracing::debug!(entity_id = %existing, %table, "updating metadata entity");
            let rows_affected = tx.execute(&update_sql(table), params![encoded, entity_id])?;
            StoreOutcome { kind: WriteKind::Updated, rows_affected }
        } else {
            tracing::debug!(%entity_id, %table, "inserting metadata entity");
            let rows_affected = tx
                .execute(&insert_sql(table), params![entity_id, encoded])
                .map_err(|err| classify_insert_error(entity_id, err))?;
            StoreOutcome { kind: WriteKind::Inserted, rows_affected }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn fetch_encoded(&self) -> StoreResult<String> {
        self.conn
            .query_row(
                &select_metadata_sql(&self.config.table_name),
                params![self.config.entity_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                entity_id: self.config.entity_id.clone(),
                table: self.config.table_name.to_string(),
            })
    }
}

fn create_table_sql(table: &TableName) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
           entityId TEXT PRIMARY KEY NOT NULL,
           metadata TEXT NOT NULL
         );"
    )
}

fn select_entity_sql(table: &TableName) -> String {
    format!("SELECT entityId FROM \"{table}\" WHERE entityId = ?1")
}

fn select_metadata_sql(table: &TableName) -> String {
    format!("SELECT metadata FROM \"{table}\" WHERE entityId = ?1")
}

fn exists_sql(table: &TableName) -> String {
    format!("SELECT EXISTS(SELECT 1 FROM \"{table}\" WHERE entityId = ?1)")
}

fn update_sql(table: &TableName) -> String {
    format!("UPDATE \"{table}\" SET metadata = ?1 WHERE entityId = ?2")
}

fn insert_sql(table: &TableName) -> String {
    format!("INSERT INTO \"{table}\"(entityId, metadata) VALUES (?1, ?2)")
}

fn classify_insert_error(entity_id: &str, err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        let duplicate_key = failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE;
        if duplicate_key {
            return StoreError::Conflict { entity_id: entity_id.to_string(), source: err };
        }
    }
    StoreError::Storage(err)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::thread;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::{anyhow, Context, Result};

    use super::*;

    const SP_ENTITY_ID: &str = "https://sp.example.org/metadata";
    const SIGNATURE_BLOCK: &str = "<ds:Signature xmlns:ds=\"http://www.w3.org/2000/09/xmldsig#\">\
        <ds:SignatureValue>c2lnbmVk</ds:SignatureValue></ds:Signature>";

    fn sp_metadata(entity_id: &str, acs_location: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity_id}">
  <md:SPSSODescriptor AuthnRequestsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:NameIDFormat>urn:oasis:names:tc:SAML:2.0:nameid-format:transient</md:NameIDFormat>
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"
        Location="{acs_location}" index="0"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#
        )
    }

    fn fake_sign(metadata: &str) -> Result<String, MetadataError> {
        Ok(metadata.replacen("<md:SPSSODescriptor", &format!("{SIGNATURE_BLOCK}<md:SPSSODescriptor"), 1))
    }

    fn open_store(config: MetadataStoreConfig) -> Result<SqliteMetadataStore> {
        let store = SqliteMetadataStore::open(Path::new(":memory:"), config)?;
        store.ensure_table()?;
        Ok(store)
    }

    fn row_count(store: &SqliteMetadataStore, table: &str) -> Result<i64> {
        store
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |row| row.get(0))
            .context("failed to count metadata rows")
    }

    fn unique_temp_db(prefix: &str) -> Result<PathBuf> {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        Ok(std::env::temp_dir().join(format!("{prefix}-{}-{nanos}.sqlite3", std::process::id())))
    }

    #[test]
    fn first_store_inserts_and_second_store_updates_in_place() -> Result<()> {
        let mut store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;
        assert_eq!(row_count(&store, "sp_metadata")?, 0);

        let first = store
            .store_metadata_with_outcome(&sp_metadata(SP_ENTITY_ID, "https://sp/acs/v1"), false)?;
        assert_eq!(first, Some(StoreOutcome { kind: WriteKind::Inserted, rows_affected: 1 }));
        assert_eq!(row_count(&store, "sp_metadata")?, 1);

        let second = sp_metadata(SP_ENTITY_ID, "https://sp/acs/v2");
        assert!(store.store_metadata(&second, false)?);
        assert_eq!(row_count(&store, "sp_metadata")?, 1);
        assert_eq!(store.fetch_metadata_text()?, second);

        let third = store.store_metadata_with_outcome(&second, false)?;
        assert_eq!(third.map(|outcome| outcome.kind), Some(WriteKind::Updated));
        Ok(())
    }

    #[test]
    fn stored_blob_is_base64_and_decodes_to_same_identity() -> Result<()> {
        let mut store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;
        let metadata = sp_metadata(SP_ENTITY_ID, "https://sp/acs");
        assert!(store.store_metadata(&metadata, false)?);

        let raw: String = store.conn.query_row(
            "SELECT metadata FROM sp_metadata WHERE entityId = ?1",
            params![SP_ENTITY_ID],
            |row| row.get(0),
        )?;
        assert_eq!(raw, encode_metadata(&metadata));
        assert!(!raw.contains('<'));

        let decoded = String::from_utf8(store.fetch_metadata()?)?;
        let declared =
            SamlEntityIdExtractor::<QuickXmlParser>::default().extract_entity_id(&decoded)?;
        assert_eq!(declared.as_deref(), Some(SP_ENTITY_ID));
        assert!(store.has_metadata()?);
        Ok(())
    }

    #[test]
    fn blank_metadata_returns_false_without_touching_database() -> Result<()> {
        // No table exists, so any statement would fail.
        let mut store = SqliteMetadataStore::open(
            Path::new(":memory:"),
            MetadataStoreConfig::new(SP_ENTITY_ID).with_sign_metadata(true),
        )?;

        assert!(!store.store_metadata("", false)?);
        assert!(!store.store_metadata("   \n\t", true)?);
        assert_eq!(store.store_metadata_with_outcome(" ", false)?, None);
        Ok(())
    }

    #[test]
    fn identity_mismatch_is_rejected_before_any_write() -> Result<()> {
        let mut store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;

        let foreign = sp_metadata("https://other.example.org/metadata", "https://other/acs");
        let err = store.store_metadata(&foreign, false);
        let Err(StoreError::IdentityMismatch { metadata_entity_id, configured_entity_id }) = err else {
            return Err(anyhow!("expected identity mismatch, got {err:?}"));
        };
        assert_eq!(metadata_entity_id, "https://other.example.org/metadata");
        assert_eq!(configured_entity_id, SP_ENTITY_ID);
        assert_eq!(row_count(&store, "sp_metadata")?, 0);

        let original = sp_metadata(SP_ENTITY_ID, "https://sp/acs");
        store.store_metadata(&original, false)?;
        assert!(store.store_metadata(&foreign, false).is_err());
        assert_eq!(store.fetch_metadata_text()?, original);
        Ok(())
    }

    #[test]
    fn identity_comparison_is_exact() -> Result<()> {
        let mut store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;
        for near_miss in [
            "https://sp.example.org/metadata/",
            "HTTPS://sp.example.org/metadata",
            " https://sp.example.org/metadata",
        ] {
            let err = store.store_metadata(&sp_metadata(near_miss, "https://sp/acs"), false);
            assert!(matches!(err, Err(StoreError::IdentityMismatch { .. })), "{near_miss:?}");
        }
        assert_eq!(row_count(&store, "sp_metadata")?, 0);
        Ok(())
    }

    #[test]
    fn metadata_without_declared_identity_is_fatal() -> Result<()> {
        let mut store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;

        let aggregate = format!(
            r#"<md:EntitiesDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata">{}</md:EntitiesDescriptor>"#,
            r#"<md:EntityDescriptor entityID="https://sp.example.org/metadata"/>"#
        );
        assert!(matches!(store.store_metadata(&aggregate, false), Err(StoreError::MissingEntityId)));

        let unparseable = store.store_metadata("<md:EntityDescriptor entityID=", false);
        assert!(matches!(unparseable, Err(StoreError::Metadata(MetadataError::Parse(_)))));
        assert_eq!(row_count(&store, "sp_metadata")?, 0);
        Ok(())
    }

    #[test]
    fn resolver_for_missing_row_is_not_found() -> Result<()> {
        let store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;

        let err = store.create_metadata_resolver();
        let Err(StoreError::NotFound { entity_id, table }) = err else {
            return Err(anyhow!("expected not found, got {err:?}"));
        };
        assert_eq!(entity_id, SP_ENTITY_ID);
        assert_eq!(table, "sp_metadata");
        assert!(!store.has_metadata()?);
        assert!(matches!(store.fetch_metadata(), Err(StoreError::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn resolver_reads_back_stored_document() -> Result<()> {
        let mut store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;
        store.store_metadata(&sp_metadata(SP_ENTITY_ID, "https://sp/acs/post"), false)?;

        let resolver = store.create_metadata_resolver()?;
        let entity = resolver
            .resolve(SP_ENTITY_ID)
            .ok_or_else(|| anyhow!("stored entity should be resolvable"))?;
        assert!(entity.authn_requests_signed());
        assert!(!entity.is_signed());
        assert_eq!(
            entity.default_assertion_consumer_service().map(|acs| acs.location),
            Some("https://sp/acs/post".to_string())
        );
        Ok(())
    }

    #[test]
    fn custom_resolver_factory_receives_parsed_root() -> Result<()> {
        struct RootNameFactory;

        impl ResolverFactory for RootNameFactory {
            type Resolver = String;

            fn resolver_for_root(
                &self,
                root: sp_metadata_core::Element,
            ) -> Result<String, MetadataError> {
                Ok(root.local_name().to_string())
            }
        }

        let mut store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;
        store.store_metadata(&sp_metadata(SP_ENTITY_ID, "https://sp/acs"), false)?;
        assert_eq!(store.create_metadata_resolver_with(&RootNameFactory)?, "EntityDescriptor");
        Ok(())
    }

    #[test]
    fn installed_parser_gates_writes_as_well_as_reads() -> Result<()> {
        struct RejectingParser;

        impl DocumentParser for RejectingParser {
            fn parse(&self, _bytes: &[u8]) -> Result<sp_metadata_core::XmlDocument, MetadataError> {
                Err(MetadataError::Parse("document type not accepted".to_string()))
            }
        }

        let mut store =
            open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?.with_parser(RejectingParser);
        let err = store.store_metadata(&sp_metadata(SP_ENTITY_ID, "https://sp/acs"), false);
        assert!(matches!(err, Err(StoreError::Metadata(MetadataError::Parse(_)))));
        assert_eq!(row_count(&store, "sp_metadata")?, 0);
        assert!(!store.has_metadata()?);
        Ok(())
    }

    #[test]
    fn installed_extractor_reads_the_installed_parser_tree() -> Result<()> {
        struct FirstChildExtractor;

        impl EntityIdExtractor for FirstChildExtractor {
            fn extract_entity_id(&self, _metadata: &str) -> Result<Option<String>, MetadataError> {
                Ok(None)
            }

            fn extract_from_root(&self, root: &sp_metadata_core::Element) -> Option<String> {
                root.children().first().and_then(|child| child.attribute("entityID")).map(str::to_string)
            }
        }

        let wrapped = format!(
            r#"<md:EntitiesDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata">{}</md:EntitiesDescriptor>"#,
            r#"<md:EntityDescriptor entityID="https://sp.example.org/metadata"/>"#
        );
        let mut store =
            open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?.with_extractor(FirstChildExtractor);
        assert!(store.store_metadata(&wrapped, false)?);
        let resolver = store.create_metadata_resolver()?;
        assert_eq!(resolver.entity_ids(), vec![SP_ENTITY_ID]);
        Ok(())
    }

    #[test]
    fn always_on_signing_stores_signed_variant() -> Result<()> {
        let mut store =
            open_store(MetadataStoreConfig::new(SP_ENTITY_ID).with_sign_metadata(true))?
                .with_signer(fake_sign);

        let original = sp_metadata(SP_ENTITY_ID, "https://sp/acs");
        assert!(store.store_metadata(&original, false)?);

        let stored = store.fetch_metadata_text()?;
        assert_ne!(stored, original);
        assert_eq!(stored, fake_sign(&original)?);

        let resolver = store.create_metadata_resolver()?;
        let entity =
            resolver.resolve(SP_ENTITY_ID).ok_or_else(|| anyhow!("signed entity missing"))?;
        assert!(entity.is_signed());
        Ok(())
    }

    #[test]
    fn forced_signing_uses_signer_only_when_one_is_configured() -> Result<()> {
        let original = sp_metadata(SP_ENTITY_ID, "https://sp/acs");

        let mut unsigned_store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;
        assert!(unsigned_store.store_metadata(&original, true)?);
        assert_eq!(unsigned_store.fetch_metadata_text()?, original);

        let mut signing_store =
            open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?.with_signer(fake_sign);
        assert!(signing_store.store_metadata(&original, false)?);
        assert_eq!(signing_store.fetch_metadata_text()?, original);
        assert!(signing_store.store_metadata(&original, true)?);
        assert_eq!(signing_store.fetch_metadata_text()?, fake_sign(&original)?);
        Ok(())
    }

    #[test]
    fn always_on_signing_without_signer_fails() -> Result<()> {
        let mut store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID).with_sign_metadata(true))?;
        let err = store.store_metadata(&sp_metadata(SP_ENTITY_ID, "https://sp/acs"), false);
        assert!(matches!(err, Err(StoreError::SignerMissing)));
        assert_eq!(row_count(&store, "sp_metadata")?, 0);
        Ok(())
    }

    #[test]
    fn signed_output_is_revalidated() -> Result<()> {
        let metadata = sp_metadata(SP_ENTITY_ID, "https://sp/acs");

        let mut blanking = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?
            .with_signer(|_: &str| -> Result<String, MetadataError> { Ok("  ".to_string()) });
        assert!(matches!(blanking.store_metadata(&metadata, true), Err(StoreError::Validation(_))));

        let mut retargeting = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?.with_signer(
            |text: &str| -> Result<String, MetadataError> {
                Ok(text.replace(SP_ENTITY_ID, "https://attacker.example.org"))
            },
        );
        let err = retargeting.store_metadata(&metadata, true);
        assert!(matches!(err, Err(StoreError::IdentityMismatch { .. })));

        let mut failing = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?.with_signer(
            |_: &str| -> Result<String, MetadataError> {
                Err(MetadataError::Signing("no private key".to_string()))
            },
        );
        let err = failing.store_metadata(&metadata, true);
        assert!(matches!(err, Err(StoreError::Metadata(MetadataError::Signing(_)))));

        for store in [&blanking, &retargeting, &failing] {
            assert_eq!(row_count(store, "sp_metadata")?, 0);
        }
        Ok(())
    }

    #[test]
    fn configured_table_name_is_used_for_every_statement() -> Result<()> {
        let tenant_table = TableName::new("tenant_a_metadata")?;
        let mut store = open_store(
            MetadataStoreConfig::new(SP_ENTITY_ID).with_table_name(tenant_table.clone()),
        )?;
        store.conn.execute_batch(&create_table_sql(&TableName::default()))?;

        store.store_metadata(&sp_metadata(SP_ENTITY_ID, "https://sp/acs"), false)?;
        assert_eq!(store.table_name(), &tenant_table);
        assert_eq!(row_count(&store, "tenant_a_metadata")?, 1);
        assert_eq!(row_count(&store, "sp_metadata")?, 0);
        assert!(store.create_metadata_resolver().is_ok());
        Ok(())
    }

    #[test]
    fn missing_table_surfaces_as_storage_error() -> Result<()> {
        let mut store =
            SqliteMetadataStore::open(Path::new(":memory:"), MetadataStoreConfig::new(SP_ENTITY_ID))?;
        let err = store.store_metadata(&sp_metadata(SP_ENTITY_ID, "https://sp/acs"), false);
        assert!(matches!(err, Err(StoreError::Storage(_))));
        assert!(matches!(store.fetch_metadata(), Err(StoreError::Storage(_))));
        Ok(())
    }

    #[test]
    fn duplicate_key_insert_is_reported_as_conflict() -> Result<()> {
        let store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;
        let insert = insert_sql(store.table_name());
        store.conn.execute(&insert, params![SP_ENTITY_ID, "PGEvPg=="])?;

        let Err(duplicate) = store.conn.execute(&insert, params![SP_ENTITY_ID, "PGIvPg=="]) else {
            return Err(anyhow!("second insert for the same entity should fail"));
        };
        let err = classify_insert_error(SP_ENTITY_ID, duplicate);
        assert!(matches!(err, StoreError::Conflict { ref entity_id, .. } if entity_id == SP_ENTITY_ID));
        assert_eq!(err.to_string(), format!("duplicate key {SP_ENTITY_ID} on metadata insert"));

        let Err(not_null) = store.conn.execute(&insert, params!["https://x", Option::<String>::None])
        else {
            return Err(anyhow!("NULL metadata should be rejected"));
        };
        assert!(matches!(classify_insert_error("https://x", not_null), StoreError::Storage(_)));
        Ok(())
    }

    #[test]
    fn corrupt_stored_blob_is_a_decode_error() -> Result<()> {
        let store = open_store(MetadataStoreConfig::new(SP_ENTITY_ID))?;
        store.conn.execute(&insert_sql(store.table_name()), params![SP_ENTITY_ID, "not base64!"])?;

        let err = store.create_metadata_resolver();
        assert!(matches!(err, Err(StoreError::Metadata(MetadataError::Decode(_)))));
        Ok(())
    }

    #[test]
    fn blank_configured_entity_id_is_rejected() {
        let err = SqliteMetadataStore::open(Path::new(":memory:"), MetadataStoreConfig::new(" "));
        assert!(matches!(err, Err(StoreError::Validation(_))));
    }

    #[test]
    fn concurrent_stores_for_one_entity_leave_a_single_row() -> Result<()> {
        let db_path = unique_temp_db("sp-metadata-concurrency")?;
        {
            let init = SqliteMetadataStore::open(&db_path, MetadataStoreConfig::new(SP_ENTITY_ID))?;
            init.ensure_table()?;
        }

        let writer_threads = 4;
        let writes_per_thread = 10;
        let mut handles = Vec::new();

        for writer in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteMetadataStore::open(
                    &writer_path,
                    MetadataStoreConfig::new(SP_ENTITY_ID),
                )?;
                for write in 0..writes_per_thread {
                    let acs = format!("https://sp/acs/{writer}/{write}");
                    if !store.store_metadata(&sp_metadata(SP_ENTITY_ID, &acs), false)? {
                        return Err(anyhow!("store reported no affected rows"));
                    }
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteMetadataStore::open(&db_path, MetadataStoreConfig::new(SP_ENTITY_ID))?;
        assert_eq!(row_count(&store, "sp_metadata")?, 1);
        assert!(store.create_metadata_resolver()?.resolve(SP_ENTITY_ID).is_some());
        drop(store);

        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
