//! Query side of stored metadata: a resolver built from a parsed root element.

use serde::{Deserialize, Serialize};

use crate::xml::Element;
use crate::{MetadataError, SAML_METADATA_NS, XMLDSIG_NS};

/// Builds the resolver handed to consumers of stored metadata.
pub trait ResolverFactory {
    type Resolver;

    /// Wrap a parsed document root.
    ///
    /// # Errors
    /// Returns [`MetadataError::UnexpectedRoot`] when the root is not metadata this factory understands.
    fn resolver_for_root(&self, root: Element) -> Result<Self::Resolver, MetadataError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DomResolverFactory;

impl ResolverFactory for DomResolverFactory {
    type Resolver = MetadataResolver;

    fn resolver_for_root(&self, root: Element) -> Result<Self::Resolver, MetadataError> {
        MetadataResolver::new(root)
    }
}

/// Answers queries over an `EntityDescriptor` or an `EntitiesDescriptor` aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataResolver {
    root: Element,
}

impl MetadataResolver {
    /// # Errors
    /// Returns [`MetadataError::UnexpectedRoot`] for roots other than SAML 2.0 metadata descriptors.
    pub fn new(root: Element) -> Result<Self, MetadataError> {
        if root.is(SAML_METADATA_NS, "EntityDescriptor")
            || root.is(SAML_METADATA_NS, "EntitiesDescriptor")
        {
            Ok(Self { root })
        } else {
            Err(MetadataError::UnexpectedRoot(root.expanded_name()))
        }
    }

    #[must_use]
    pub fn root_element(&self) -> &Element {
        &self.root
    }

    /// Every entity descriptor in document order, nested aggregates included.
    #[must_use]
    pub fn entities(&self) -> Vec<EntityDescriptorView<'_>> {
        let mut out = Vec::new();
        collect_entities(&self.root, &mut out);
        out
    }

    #[must_use]
    pub fn entity_ids(&self) -> Vec<&str> {
        self.entities().into_iter().map(|entity| entity.entity_id()).collect()
    }

    #[must_use]
    pub fn resolve(&self, entity_id: &str) -> Option<EntityDescriptorView<'_>> {
        self.entities().into_iter().find(|entity| entity.entity_id() == entity_id)
    }
}

fn collect_entities<'a>(element: &'a Element, out: &mut Vec<EntityDescriptorView<'a>>) {
    if element.is(SAML_METADATA_NS, "EntityDescriptor") {
        if element.attribute("entityID").is_some() {
            out.push(EntityDescriptorView { element });
        }
        return;
    }
    if element.is(SAML_METADATA_NS, "EntitiesDescriptor") {
        for child in element.children() {
            collect_entities(child, out);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub binding: String,
    pub location: String,
    pub response_location: Option<String>,
    pub index: Option<u16>,
    pub is_default: bool,
}

impl Endpoint {
    fn from_element(element: &Element) -> Option<Self> {
        Some(Self {
            binding: element.attribute("Binding")?.to_string(),
            location: element.attribute("Location")?.to_string(),
            response_location: element.attribute("ResponseLocation").map(str::to_string),
            index: element.attribute("index").and_then(|raw| raw.trim().parse().ok()),
            is_default: element.attribute("isDefault").is_some_and(xs_boolean),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyUse {
    Signing,
    Encryption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDescriptorView<'a> {
    element: &'a Element,
}

impl<'a> EntityDescriptorView<'a> {
    #[must_use]
    pub fn entity_id(&self) -> &'a str {
        self.element.attribute("entityID").unwrap_or_default()
    }

    #[must_use]
    pub fn element(&self) -> &'a Element {
        self.element
    }

    /// True when the descriptor carries an enveloped `ds:Signature`.
    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.element.child(XMLDSIG_NS, "Signature").is_some()
    }

    #[must_use]
    pub fn has_sp_sso_descriptor(&self) -> bool {
        self.sp_sso_descriptor().is_some()
    }

    #[must_use]
    pub fn authn_requests_signed(&self) -> bool {
        self.sp_flag("AuthnRequestsSigned")
    }

    #[must_use]
    pub fn want_assertions_signed(&self) -> bool {
        self.sp_flag("WantAssertionsSigned")
    }

    #[must_use]
    pub fn assertion_consumer_services(&self) -> Vec<Endpoint> {
        self.sp_endpoints("AssertionConsumerService")
    }

    #[must_use]
    pub fn single_logout_services(&self) -> Vec<Endpoint> {
        self.sp_endpoints("SingleLogoutService")
    }

    /// The endpoint flagged `isDefault`, else the lowest `index`, else the first listed.
    #[must_use]
    pub fn default_assertion_consumer_service(&self) -> Option<Endpoint> {
        let services = self.assertion_consumer_services();
        if let Some(flagged) = services.iter().find(|service| service.is_default) {
            return Some(flagged.clone());
        }
        services
            .iter()
            .filter(|service| service.index.is_some())
            .min_by_key(|service| service.index)
            .or_else(|| services.first())
            .cloned()
    }

    #[must_use]
    pub fn name_id_formats(&self) -> Vec<&'a str> {
        self.sp_sso_descriptor()
            .map(|sp| {
                sp.children_named(SAML_METADATA_NS, "NameIDFormat")
                    .map(|format| format.text().trim())
                    .filter(|format| !format.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Base64 DER certificates usable for signature verification, whitespace removed.
    #[must_use]
    pub fn signing_certificates(&self) -> Vec<String> {
        self.certificates(KeyUse::Signing)
    }

    #[must_use]
    pub fn encryption_certificates(&self) -> Vec<String> {
        self.certificates(KeyUse::Encryption)
    }

    fn sp_sso_descriptor(&self) -> Option<&'a Element> {
        self.element.child(SAML_METADATA_NS, "SPSSODescriptor")
    }

    fn sp_flag(&self, name: &str) -> bool {
        self.sp_sso_descriptor().and_then(|sp| sp.attribute(name)).is_some_and(xs_boolean)
    }

    fn sp_endpoints(&self, local_name: &str) -> Vec<Endpoint> {
        self.sp_sso_descriptor()
            .map(|sp| {
                sp.children_named(SAML_METADATA_NS, local_name)
                    .filter_map(Endpoint::from_element)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn certificates(&self, wanted: KeyUse) -> Vec<String> {
        let Some(sp) = self.sp_sso_descriptor() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for key_descriptor in sp.children_named(SAML_METADATA_NS, "KeyDescriptor") {
            let applies = match key_descriptor.attribute("use") {
                None => true,
                Some("signing") => wanted == KeyUse::Signing,
                Some("encryption") => wanted == KeyUse::Encryption,
                Some(_) => false,
            };
            if !applies {
                continue;
            }

            let certificates = key_descriptor
                .children_named(XMLDSIG_NS, "KeyInfo")
                .flat_map(|key_info| key_info.children_named(XMLDSIG_NS, "X509Data"))
                .flat_map(|data| data.children_named(XMLDSIG_NS, "X509Certificate"));
            for certificate in certificates {
                let compact =
                    certificate.text().chars().filter(|c| !c.is_whitespace()).collect::<String>();
                if !compact.is_empty() {
                    out.push(compact);
                }
            }
        }
        out
    }
}

fn xs_boolean(raw: &str) -> bool {
    matches!(raw.trim(), "true" | "1")
}
