//! Owned XML element tree and the parser seam used on both the write and read paths.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::NsReader;

use crate::MetadataError;

/// Parses raw document bytes into an owned element tree.
pub trait DocumentParser: Send + Sync {
    /// Parse one complete XML document.
    ///
    /// # Errors
    /// Returns [`MetadataError::Parse`] when the bytes are not a single well-formed document.
    fn parse(&self, bytes: &[u8]) -> Result<XmlDocument, MetadataError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDocument {
    root: Element,
}

impl XmlDocument {
    #[must_use]
    pub fn root_element(&self) -> &Element {
        &self.root
    }

    #[must_use]
    pub fn into_root_element(self) -> Element {
        self.root
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    namespace: Option<String>,
    local_name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    #[must_use]
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// True when the element has the given namespace URI and local name.
    #[must_use]
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.namespace.as_deref() == Some(namespace) && self.local_name == local_name
    }

    /// Attribute value by qualified name as written in the document (`entityID`, `xmlns:md`).
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        local_name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.is(namespace, local_name))
    }

    #[must_use]
    pub fn child(&self, namespace: &str, local_name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.is(namespace, local_name))
    }

    /// Concatenated character data directly inside this element, whitespace-trimmed per chunk.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Qualified display name, `{namespace}local` or `local` when unbound.
    #[must_use]
    pub fn expanded_name(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{{{namespace}}}{}", self.local_name),
            None => self.local_name.clone(),
        }
    }
}

/// Namespace-aware parser backed by `quick_xml::NsReader`.
///
/// DOCTYPE declarations are refused outright; metadata never needs them and they are
/// the entry point for entity expansion attacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuickXmlParser;

impl QuickXmlParser {
    /// Parse a document held as text.
    ///
    /// # Errors
    /// Returns [`MetadataError::Parse`] for malformed or disallowed XML.
    pub fn parse_str(&self, text: &str) -> Result<XmlDocument, MetadataError> {
        let mut reader = NsReader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let (resolved, event) = reader
                .read_resolved_event()
                .map_err(|err| MetadataError::Parse(format!("malformed XML: {err}")))?;
            let namespace = match &event {
                Event::Start(_) | Event::Empty(_) => resolved_namespace(&resolved)?,
                _ => None,
            };

            match event {
                Event::Start(start) => stack.push(element_from_start(namespace, &start)?),
                Event::Empty(start) => {
                    let element = element_from_start(namespace, &start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        MetadataError::Parse("closing tag without matching start".to_string())
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let unescaped = text
                        .unescape()
                        .map_err(|err| MetadataError::Parse(format!("invalid text: {err}")))?;
                    push_text(&mut stack, &unescaped)?;
                }
                Event::CData(data) => {
                    let raw = std::str::from_utf8(&data)
                        .map_err(|err| MetadataError::Parse(format!("invalid CDATA: {err}")))?;
                    push_text(&mut stack, raw)?;
                }
                Event::DocType(_) => {
                    return Err(MetadataError::Parse(
                        "DOCTYPE declarations are not allowed".to_string(),
                    ));
                }
                Event::Eof => break,
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(MetadataError::Parse(format!(
                "unexpected end of document inside <{}>",
                open.local_name
            )));
        }

        root.map(|root| XmlDocument { root })
            .ok_or_else(|| MetadataError::Parse("document has no root element".to_string()))
    }
}

impl DocumentParser for QuickXmlParser {
    fn parse(&self, bytes: &[u8]) -> Result<XmlDocument, MetadataError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| MetadataError::Parse(format!("document is not UTF-8: {err}")))?;
        self.parse_str(text)
    }
}

fn resolved_namespace(resolved: &ResolveResult<'_>) -> Result<Option<String>, MetadataError> {
    match resolved {
        ResolveResult::Bound(namespace) => {
            Ok(Some(String::from_utf8_lossy(namespace.as_ref()).into_owned()))
        }
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(MetadataError::Parse(format!(
            "undeclared namespace prefix {}",
            String::from_utf8_lossy(prefix)
        ))),
    }
}

fn element_from_start(
    namespace: Option<String>,
    start: &BytesStart<'_>,
) -> Result<Element, MetadataError> {
    let local_name = std::str::from_utf8(start.local_name().as_ref())
        .map_err(|err| MetadataError::Parse(format!("invalid element name: {err}")))?
        .to_string();

    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr =
            attr.map_err(|err| MetadataError::Parse(format!("invalid attribute: {err}")))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| MetadataError::Parse(format!("invalid attribute name: {err}")))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|err| MetadataError::Parse(format!("invalid value for {key}: {err}")))?
            .into_owned();
        attributes.push((key, value));
    }

    Ok(Element { namespace, local_name, attributes, children: Vec::new(), text: String::new() })
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), MetadataError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(MetadataError::Parse("document has more than one root element".to_string()));
    }
    *root = Some(element);
    Ok(())
}

fn push_text(stack: &mut [Element], text: &str) -> Result<(), MetadataError> {
    match stack.last_mut() {
        Some(current) => {
            current.text.push_str(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(MetadataError::Parse("text outside the root element".to_string())),
    }
}
