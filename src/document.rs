//! Structured XML document model.
//!
//! Bodies and header sections travel through the exchange as [`XmlElement`]
//! trees. Parsing uses quick-xml's namespace-aware reader, and [`transform`]
//! writes a tree back out, re-declaring any namespace binding that the
//! element relies on but that is not in scope at the point of writing.

use crate::error::SoapError;
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::name::{PrefixDeclaration, ResolveResult};
use quick_xml::{NsReader, Writer};
use std::fmt;
use std::io::Write;

/// Namespace bound to the `xml` prefix by definition.
pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Qualified name of an element or attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    /// Namespace URI (if bound)
    pub namespace: Option<String>,
    /// Prefix as written in the source document
    pub prefix: Option<String>,
    /// Local part
    pub local_name: String,
}

impl QualifiedName {
    /// Unqualified name with no namespace.
    pub fn local(local_name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            prefix: None,
            local_name: local_name.into(),
        }
    }

    /// Name in a namespace, written with the given prefix.
    pub fn prefixed(
        namespace: impl Into<String>,
        prefix: impl Into<String>,
        local_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: Some(namespace.into()),
            prefix: Some(prefix.into()),
            local_name: local_name.into(),
        }
    }

    /// Name in the default namespace (no prefix).
    pub fn namespaced(namespace: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            prefix: None,
            local_name: local_name.into(),
        }
    }

    /// Name as written in markup: `prefix:local` or `local`.
    pub fn qualified(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}:{}", prefix, self.local_name),
            None => self.local_name.clone(),
        }
    }

    /// Clark notation: `{namespace}local`, or just `local` without a namespace.
    pub fn expanded(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{{{}}}{}", ns, self.local_name),
            None => self.local_name.clone(),
        }
    }

    fn same_expanded(&self, other: &QualifiedName) -> bool {
        self.namespace == other.namespace && self.local_name == other.local_name
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expanded())
    }
}

/// An attribute (namespace declarations are kept separately).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlAttribute {
    pub name: QualifiedName,
    pub value: String,
}

impl XmlAttribute {
    pub fn new(name: QualifiedName, value: impl Into<String>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

/// A namespace declaration carried by an element. `prefix == None` is the
/// default namespace; an empty URI undeclares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDeclaration {
    pub prefix: Option<String>,
    pub uri: String,
}

/// Child node of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    CData(String),
}

/// An element and its subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub name: QualifiedName,
    pub namespace_declarations: Vec<NamespaceDeclaration>,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlNode>,
}

impl XmlElement {
    /// Create an empty element.
    pub fn new(name: QualifiedName) -> Self {
        Self {
            name,
            namespace_declarations: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Local part of the element name.
    pub fn local_name(&self) -> &str {
        &self.name.local_name
    }

    /// Namespace URI of the element, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.name.namespace.as_deref()
    }

    /// Add an attribute, builder style.
    pub fn with_attribute(mut self, name: QualifiedName, value: impl Into<String>) -> Self {
        self.attributes.push(XmlAttribute::new(name, value));
        self
    }

    /// Append a child element, builder style.
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    /// Append a text node, builder style.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    /// Value of the first attribute with the given local name.
    pub fn attribute(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.local_name == local_name)
            .map(|a| a.value.as_str())
    }

    /// Child elements in document order.
    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    /// First child element with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&XmlElement> {
        self.child_elements().find(|e| e.local_name() == local_name)
    }

    /// Concatenated text and CDATA content of direct children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                XmlNode::Text(t) | XmlNode::CData(t) => Some(t.as_str()),
                XmlNode::Element(_) => None,
            })
            .collect()
    }

    /// Serialize this element (no XML declaration).
    pub fn to_xml_string(&self) -> Result<String, SoapError> {
        let mut buf = Vec::new();
        transform(self, &mut buf)?;
        String::from_utf8(buf).map_err(|e| SoapError::Serialize(e.to_string()))
    }

    /// Compare element names, attribute sets and character content,
    /// ignoring prefixes, namespace declaration placement, attribute order
    /// and the split between text and CDATA nodes.
    pub fn structurally_eq(&self, other: &XmlElement) -> bool {
        if !self.name.same_expanded(&other.name) {
            return false;
        }
        if self.attributes.len() != other.attributes.len() {
            return false;
        }
        let attributes_match = self.attributes.iter().all(|a| {
            other
                .attributes
                .iter()
                .any(|b| a.name.same_expanded(&b.name) && a.value == b.value)
        });
        if !attributes_match {
            return false;
        }

        let ours = normalized_children(self);
        let theirs = normalized_children(other);
        ours.len() == theirs.len()
            && ours.iter().zip(theirs.iter()).all(|pair| match pair {
                (Normalized::Text(a), Normalized::Text(b)) => a == b,
                (Normalized::Element(a), Normalized::Element(b)) => a.structurally_eq(b),
                _ => false,
            })
    }
}

enum Normalized<'a> {
    Element(&'a XmlElement),
    Text(String),
}

fn normalized_children(element: &XmlElement) -> Vec<Normalized<'_>> {
    let mut out: Vec<Normalized<'_>> = Vec::new();
    for node in &element.children {
        match node {
            XmlNode::Element(e) => out.push(Normalized::Element(e)),
            XmlNode::Text(t) | XmlNode::CData(t) => {
                if let Some(Normalized::Text(prev)) = out.last_mut() {
                    prev.push_str(t);
                } else {
                    out.push(Normalized::Text(t.clone()));
                }
            }
        }
    }
    out
}

/// Whether `name` can be written as an unprefixed element or attribute name.
///
/// Colons are rejected, as is the reserved `xmlns`.
pub fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_alphabetic() || first == '_')
        && chars.all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && name != "xmlns"
}

/// Parse a document and return its root element.
///
/// Whitespace-only text used as formatting between child elements is
/// dropped; text in leaf elements and mixed content is kept as found.
/// Comments, processing instructions and the XML declaration are not
/// retained.
pub fn parse_document(xml: &str) -> Result<XmlElement, SoapError> {
    let mut reader = NsReader::from_str(xml);
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let element = start_element(&reader, e)?;
                stack.push(element);
            }
            Ok(Event::Empty(ref e)) => {
                let element = start_element(&reader, e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(_)) => {
                let mut element = stack
                    .pop()
                    .ok_or_else(|| SoapError::XmlParse("unexpected closing tag".to_string()))?;
                strip_formatting(&mut element);
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().map_err(|e| SoapError::XmlParse(e.to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(XmlNode::Text(text.into_owned())),
                    None if text.trim().is_empty() => {}
                    None => {
                        return Err(SoapError::XmlParse(
                            "text content outside of the root element".to_string(),
                        ))
                    }
                }
            }
            Ok(Event::CData(e)) => {
                let text = String::from_utf8(e.into_inner().into_owned())
                    .map_err(|e| SoapError::XmlParse(format!("Invalid UTF-8 in CDATA: {}", e)))?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlNode::CData(text));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SoapError::XmlParse(format!(
                    "{} at position {}",
                    e,
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(SoapError::XmlParse(format!(
            "unclosed element <{}>",
            stack[stack.len() - 1].name.qualified()
        )));
    }

    root.ok_or_else(|| SoapError::XmlParse("document has no root element".to_string()))
}

/// Drop whitespace-only text between child elements when the element has no
/// other character content. Leaf elements and mixed content keep every
/// character.
fn strip_formatting(element: &mut XmlElement) {
    let mut has_elements = false;
    let mut has_content = false;
    for node in &element.children {
        match node {
            XmlNode::Element(_) => has_elements = true,
            XmlNode::Text(t) if !t.trim().is_empty() => has_content = true,
            XmlNode::CData(_) => has_content = true,
            XmlNode::Text(_) => {}
        }
    }
    if has_elements && !has_content {
        element
            .children
            .retain(|node| !matches!(node, XmlNode::Text(_)));
    }
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), SoapError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(XmlNode::Element(element));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(SoapError::XmlParse(
            "document has more than one root element".to_string(),
        )),
    }
}

fn start_element(reader: &NsReader<&[u8]>, e: &BytesStart) -> Result<XmlElement, SoapError> {
    let (resolved, local) = reader.resolve_element(e.name());
    let name = QualifiedName {
        namespace: resolved_namespace(resolved)?,
        prefix: e.name().prefix().map(|p| utf8(p.as_ref())).transpose()?,
        local_name: utf8(local.as_ref())?,
    };

    let mut element = XmlElement::new(name);
    for attr in e.attributes() {
        let attr = attr.map_err(|e| SoapError::XmlParse(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| SoapError::XmlParse(e.to_string()))?
            .into_owned();

        match attr.key.as_namespace_binding() {
            Some(PrefixDeclaration::Default) => {
                element.namespace_declarations.push(NamespaceDeclaration {
                    prefix: None,
                    uri: value,
                });
            }
            Some(PrefixDeclaration::Named(prefix)) => {
                element.namespace_declarations.push(NamespaceDeclaration {
                    prefix: Some(utf8(prefix)?),
                    uri: value,
                });
            }
            None => {
                let (resolved, local) = reader.resolve_attribute(attr.key);
                element.attributes.push(XmlAttribute {
                    name: QualifiedName {
                        namespace: resolved_namespace(resolved)?,
                        prefix: attr.key.prefix().map(|p| utf8(p.as_ref())).transpose()?,
                        local_name: utf8(local.as_ref())?,
                    },
                    value,
                });
            }
        }
    }

    Ok(element)
}

fn resolved_namespace(resolved: ResolveResult) -> Result<Option<String>, SoapError> {
    match resolved {
        ResolveResult::Bound(ns) => Ok(Some(utf8(ns.as_ref())?)),
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(SoapError::XmlParse(format!(
            "unbound namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, SoapError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| SoapError::XmlParse(format!("Invalid UTF-8: {}", e)))
}

/// Copy a document source into a result sink.
///
/// Namespaces, attributes, text and CDATA are written as found in the tree.
/// Bindings that the source inherited from an ancestor it was detached from
/// are declared on the first element that needs them.
pub fn transform<W: Write>(source: &XmlElement, result: W) -> Result<(), SoapError> {
    let mut writer = Writer::new(result);
    let mut scope = NamespaceScope::default();
    write_element(&mut writer, source, &mut scope)
}

/// Stack of in-scope prefix bindings while writing.
#[derive(Default)]
struct NamespaceScope {
    frames: Vec<Vec<NamespaceDeclaration>>,
}

impl NamespaceScope {
    fn lookup(&self, prefix: Option<&str>, pending: &[NamespaceDeclaration]) -> Option<String> {
        if prefix == Some("xml") {
            return Some(XML_NS.to_string());
        }
        pending
            .iter()
            .rev()
            .chain(self.frames.iter().rev().flat_map(|frame| frame.iter().rev()))
            .find(|decl| decl.prefix.as_deref() == prefix)
            .map(|decl| decl.uri.clone())
    }
}

fn write_element<W: Write>(
    writer: &mut Writer<W>,
    element: &XmlElement,
    scope: &mut NamespaceScope,
) -> Result<(), SoapError> {
    let mut declarations = element.namespace_declarations.clone();

    let element_prefix = element.name.prefix.as_deref();
    let bound = scope.lookup(element_prefix, &declarations);
    match (&element.name.namespace, bound) {
        (Some(ns), Some(uri)) if *ns == uri => {}
        (Some(ns), _) => bind(&mut declarations, element.name.prefix.clone(), ns.clone()),
        // An unqualified element under a default namespace has to undeclare it.
        (None, Some(uri)) if element_prefix.is_none() && !uri.is_empty() => {
            bind(&mut declarations, None, String::new())
        }
        (None, _) => {}
    }

    for attr in &element.attributes {
        if let (Some(ns), Some(prefix)) = (&attr.name.namespace, &attr.name.prefix) {
            if scope.lookup(Some(prefix.as_str()), &declarations).as_deref() != Some(ns.as_str()) {
                bind(&mut declarations, Some(prefix.clone()), ns.clone());
            }
        }
    }

    let qname = element.name.qualified();
    let mut start = BytesStart::new(qname.clone());
    for decl in &declarations {
        let key = match &decl.prefix {
            Some(prefix) => format!("xmlns:{}", prefix),
            None => "xmlns".to_string(),
        };
        start.push_attribute((key.as_str(), decl.uri.as_str()));
    }
    for attr in &element.attributes {
        let key = attr.name.qualified();
        start.push_attribute((key.as_str(), attr.value.as_str()));
    }

    if element.children.is_empty() {
        return writer
            .write_event(Event::Empty(start))
            .map_err(serialize_error);
    }

    writer
        .write_event(Event::Start(start))
        .map_err(serialize_error)?;

    scope.frames.push(declarations);
    for child in &element.children {
        match child {
            XmlNode::Element(e) => write_element(writer, e, scope)?,
            XmlNode::Text(t) => writer
                .write_event(Event::Text(BytesText::new(t)))
                .map_err(serialize_error)?,
            XmlNode::CData(t) => write_cdata(writer, t)?,
        }
    }
    scope.frames.pop();

    writer
        .write_event(Event::End(BytesEnd::new(qname)))
        .map_err(serialize_error)
}

/// Bind a prefix on the element being written. A declaration of the same
/// prefix already on the element is replaced, so each prefix appears once.
fn bind(declarations: &mut Vec<NamespaceDeclaration>, prefix: Option<String>, uri: String) {
    match declarations.iter_mut().find(|decl| decl.prefix == prefix) {
        Some(existing) => existing.uri = uri,
        None => declarations.push(NamespaceDeclaration { prefix, uri }),
    }
}

/// Write a CDATA node, splitting the section wherever the content contains
/// the `]]>` terminator.
fn write_cdata<W: Write>(writer: &mut Writer<W>, text: &str) -> Result<(), SoapError> {
    let mut rest = text;
    while let Some(idx) = rest.find("]]>") {
        writer
            .write_event(Event::CData(BytesCData::new(&rest[..idx + 2])))
            .map_err(serialize_error)?;
        rest = &rest[idx + 2..];
    }
    writer
        .write_event(Event::CData(BytesCData::new(rest)))
        .map_err(serialize_error)
}

fn serialize_error(e: impl fmt::Display) -> SoapError {
    SoapError::Serialize(e.to_string())
}
