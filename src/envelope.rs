//! SOAP request envelope builder.
//!
//! Renders namespaces, the optional header and the body into the request XML, or
//! returns a caller-supplied document verbatim.

use crate::config::{self, SoapVersion};
use crate::error::{Error, MultipartError};
use crate::multipart::{self, Part};
use crate::value::{to_xml, Mapping};
use indexmap::IndexMap;
use quick_xml::escape::escape;
use std::fmt;
use std::sync::Arc;

/// XML Schema type namespaces, declared on every envelope.
pub const SCHEMA_TYPES: [(&str, &str); 2] = [
    ("xmlns:xsd", "http://www.w3.org/2001/XMLSchema"),
    ("xmlns:xsi", "http://www.w3.org/2001/XMLSchema-instance"),
];

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Renders an XML fragment appended to the SOAP header, e.g. a WS-Security token.
pub trait HeaderRenderer: Send + Sync {
    fn render_to_xml(&self) -> String;
}

/// SOAP body content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Rendered through [`to_xml`]
    Structured(Mapping),
    /// Emitted verbatim
    Raw(String),
}

impl Default for Body {
    fn default() -> Self {
        Body::Raw(String::new())
    }
}

impl Body {
    fn to_xml(&self) -> String {
        match self {
            Body::Structured(map) => to_xml(map),
            Body::Raw(xml) => xml.clone(),
        }
    }
}

impl From<Mapping> for Body {
    fn from(map: Mapping) -> Self {
        Body::Structured(map)
    }
}

impl From<String> for Body {
    fn from(xml: String) -> Self {
        Body::Raw(xml)
    }
}

impl From<&str> for Body {
    fn from(xml: &str) -> Self {
        Body::Raw(xml.to_string())
    }
}

/// The operation element wrapped by `Body`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputTag {
    name: String,
    attributes: IndexMap<String, String>,
}

impl InputTag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: IndexMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &IndexMap<String, String> {
        &self.attributes
    }
}

impl From<&str> for InputTag {
    fn from(name: &str) -> Self {
        InputTag::new(name)
    }
}

impl From<String> for InputTag {
    fn from(name: String) -> Self {
        InputTag::new(name)
    }
}

/// A SOAP request envelope with its pending attachments.
#[derive(Clone)]
pub struct Envelope {
    endpoint: String,
    version: Option<SoapVersion>,
    env_namespace: String,
    namespaces: Option<IndexMap<String, String>>,
    namespace_identifier: String,
    namespace: Option<String>,
    header: Mapping,
    security: Option<Arc<dyn HeaderRenderer>>,
    input: InputTag,
    body: Body,
    xml: Option<String>,
    parts: Vec<Part>,
    parts_sort_order: Option<Vec<String>>,
}

impl Envelope {
    pub fn new(endpoint: impl Into<String>, input: impl Into<InputTag>) -> Self {
        Self {
            endpoint: endpoint.into(),
            version: None,
            env_namespace: "env".to_string(),
            namespaces: None,
            namespace_identifier: "wsdl".to_string(),
            namespace: None,
            header: Mapping::new(),
            security: None,
            input: input.into(),
            body: Body::default(),
            xml: None,
            parts: Vec::new(),
            parts_sort_order: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        self.endpoint = endpoint.into();
    }

    /// SOAP version, falling back to the process-wide default at call time.
    pub fn version(&self) -> SoapVersion {
        self.version.unwrap_or_else(config::soap_version)
    }

    /// Set the SOAP version from a [`SoapVersion`], `1`/`2`, or `"1.1"`/`"1.2"`.
    pub fn set_version<V>(&mut self, version: V) -> Result<(), Error>
    where
        V: TryInto<SoapVersion>,
        Error: From<V::Error>,
    {
        self.version = Some(version.try_into()?);
        Ok(())
    }

    pub fn env_namespace(&self) -> &str {
        &self.env_namespace
    }

    /// Envelope prefix. Empty renders unprefixed elements with a default namespace.
    pub fn set_env_namespace(&mut self, prefix: impl Into<String>) {
        self.env_namespace = prefix.into();
    }

    /// Namespace declarations merged over the schema defaults.
    ///
    /// Unless set explicitly, this declares the envelope namespace of the current
    /// version under `xmlns:<env_namespace>` (or `xmlns` for an empty prefix).
    pub fn namespaces(&self) -> IndexMap<String, String> {
        if let Some(ref namespaces) = self.namespaces {
            return namespaces.clone();
        }
        let key = if self.env_namespace.is_empty() {
            "xmlns".to_string()
        } else {
            format!("xmlns:{}", self.env_namespace)
        };
        IndexMap::from([(key, self.version().namespace().to_string())])
    }

    pub fn set_namespaces(&mut self, namespaces: IndexMap<String, String>) {
        self.namespaces = Some(namespaces);
    }

    pub fn namespace_identifier(&self) -> &str {
        &self.namespace_identifier
    }

    pub fn set_namespace_identifier(&mut self, identifier: impl Into<String>) {
        self.namespace_identifier = identifier.into();
    }

    /// Target namespace URI, declared as `xmlns:<namespace_identifier>`.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn set_namespace(&mut self, uri: impl Into<String>) {
        self.namespace = Some(uri.into());
    }

    pub fn header(&self) -> &Mapping {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Mapping {
        &mut self.header
    }

    pub fn set_header(&mut self, header: Mapping) {
        self.header = header;
    }

    /// Attach a security header renderer, appended after the structured header.
    pub fn set_security(&mut self, security: impl HeaderRenderer + 'static) {
        self.security = Some(Arc::new(security));
    }

    pub fn clear_security(&mut self) {
        self.security = None;
    }

    pub fn input(&self) -> &InputTag {
        &self.input
    }

    pub fn set_input(&mut self, input: impl Into<InputTag>) {
        self.input = input.into();
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Replace the whole request document. Every other setting is ignored by
    /// [`render`](Envelope::render) while this is set.
    pub fn set_xml(&mut self, xml: impl Into<String>) {
        self.xml = Some(xml.into());
    }

    pub fn clear_xml(&mut self) {
        self.xml = None;
    }

    /// Render the request XML. Repeated calls without mutation return identical output.
    pub fn render(&self) -> String {
        if let Some(ref xml) = self.xml {
            return xml.clone();
        }

        let mut out = String::from(XML_DECLARATION);

        let envelope_tag = self.qualified("Envelope");
        out.push('<');
        out.push_str(&envelope_tag);
        for (name, uri) in self.complete_namespaces() {
            push_attribute(&mut out, &name, &uri);
        }
        out.push('>');

        let header = self.header_xml();
        if !header.is_empty() {
            let header_tag = self.qualified("Header");
            push_element(&mut out, &header_tag, &header);
        }

        let body_tag = self.qualified("Body");
        out.push('<');
        out.push_str(&body_tag);
        out.push_str("><");
        out.push_str(self.input.name());
        for (name, value) in self.input.attributes() {
            push_attribute(&mut out, name, value);
        }
        out.push('>');
        out.push_str(&self.body.to_xml());
        out.push_str("</");
        out.push_str(self.input.name());
        out.push_str("></");
        out.push_str(&body_tag);
        out.push('>');

        out.push_str("</");
        out.push_str(&envelope_tag);
        out.push('>');
        out
    }

    /// Whether attachments were added.
    pub fn has_parts(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Append an attachment. No dedup, no content-type validation.
    pub fn add_part(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn parts_sort_order(&self) -> Option<&[String]> {
        self.parts_sort_order.as_deref()
    }

    /// Content-type priority applied when composing the multipart message.
    pub fn set_parts_sort_order(&mut self, order: Vec<String>) {
        self.parts_sort_order = Some(order);
    }

    /// Wrap the rendered envelope and the attachments into a multipart/related part.
    ///
    /// Callers check [`has_parts`](Envelope::has_parts) first.
    pub fn compose_multipart(
        &self,
        sort_order: Option<&[String]>,
    ) -> Result<Part, MultipartError> {
        multipart::compose(self.render(), &self.parts, sort_order)
    }

    fn qualified(&self, name: &str) -> String {
        if self.env_namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.env_namespace, name)
        }
    }

    fn complete_namespaces(&self) -> IndexMap<String, String> {
        let mut all: IndexMap<String, String> = SCHEMA_TYPES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Some(ref uri) = self.namespace {
            all.insert(format!("xmlns:{}", self.namespace_identifier), uri.clone());
        }
        // Caller declarations win and keep the default's position.
        all.extend(self.namespaces());
        all
    }

    fn header_xml(&self) -> String {
        let mut xml = to_xml(&self.header);
        if let Some(ref security) = self.security {
            xml.push_str(&security.render_to_xml());
        }
        xml
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("endpoint", &self.endpoint)
            .field("version", &self.version)
            .field("env_namespace", &self.env_namespace)
            .field("input", &self.input)
            .field("has_security", &self.security.is_some())
            .field("has_xml_override", &self.xml.is_some())
            .field("parts", &self.parts.len())
            .finish_non_exhaustive()
    }
}

fn push_attribute(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&escape(value));
    out.push('"');
}

fn push_element(out: &mut String, tag: &str, content: &str) {
    out.push('<');
    out.push_str(tag);
    out.push('>');
    out.push_str(content);
    out.push_str("</");
    out.push_str(tag);
    out.push('>');
}
