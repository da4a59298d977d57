//! Wire-level SOAP messages as delivered by, and handed back to, the transport.

use crate::config::SoapVersion;
use crate::document::{transform, QualifiedName, XmlAttribute, XmlElement};
use crate::error::SoapError;
use crate::parser::{parse_payload, parse_soap_envelope, SoapEnvelope, SoapHeader};
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;

/// Case-insensitive, multi-valued transport headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MimeHeaders {
    entries: Vec<(String, String)>,
}

impl MimeHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, keeping existing values for the name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values for the name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// All values for the name, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value for the name.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reference-counted handle to attachment content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHandle {
    content_type: String,
    data: Bytes,
}

impl DataHandle {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Shared view of the content; cloning does not copy the bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A MIME attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub content_id: String,
    pub data: DataHandle,
}

impl Attachment {
    pub fn new(content_id: impl Into<String>, data: DataHandle) -> Self {
        Self {
            content_id: content_id.into(),
            data,
        }
    }
}

/// A SOAP envelope packaged with MIME transport headers and attachments.
#[derive(Debug, Clone)]
pub struct MimeSoapMessage {
    pub envelope: SoapEnvelope,
    pub mime_headers: MimeHeaders,
    pub attachments: Vec<Attachment>,
}

/// A bare XML payload without an envelope.
#[derive(Debug, Clone, Default)]
pub struct PlainMessage {
    pub payload: Option<XmlElement>,
}

/// Kind of wire request, without its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKind {
    MimeCapable,
    SoapCapable,
    Plain,
}

/// The request as received from the transport.
#[derive(Debug, Clone)]
pub enum WireRequest {
    /// SOAP with MIME headers and attachments
    Mime(MimeSoapMessage),
    /// SOAP envelope without MIME packaging
    Soap(SoapEnvelope),
    /// Payload only
    Plain(PlainMessage),
}

impl WireRequest {
    /// Parse a SOAP envelope received without MIME packaging.
    pub fn parse_soap(data: &[u8], max_body_size: usize) -> Result<Self, SoapError> {
        check_size(data, max_body_size)?;
        Ok(Self::Soap(parse_soap_envelope(data)?))
    }

    /// Build a MIME-packaged request from its root part and attachments.
    pub fn mime(
        root_part: &[u8],
        mime_headers: MimeHeaders,
        attachments: Vec<Attachment>,
        max_body_size: usize,
    ) -> Result<Self, SoapError> {
        check_size(root_part, max_body_size)?;
        Ok(Self::Mime(MimeSoapMessage {
            envelope: parse_soap_envelope(root_part)?,
            mime_headers,
            attachments,
        }))
    }

    /// Parse a bare payload. An empty body yields a request without payload.
    pub fn plain(data: &[u8], max_body_size: usize) -> Result<Self, SoapError> {
        check_size(data, max_body_size)?;
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::Plain(PlainMessage::default()));
        }
        Ok(Self::Plain(PlainMessage {
            payload: Some(parse_payload(data)?),
        }))
    }

    pub fn kind(&self) -> WireKind {
        match self {
            Self::Mime(_) => WireKind::MimeCapable,
            Self::Soap(_) => WireKind::SoapCapable,
            Self::Plain(_) => WireKind::Plain,
        }
    }

    /// The envelope, for SOAP-capable requests.
    pub fn envelope(&self) -> Option<&SoapEnvelope> {
        match self {
            Self::Mime(m) => Some(&m.envelope),
            Self::Soap(envelope) => Some(envelope),
            Self::Plain(_) => None,
        }
    }

    /// SOAP version, for SOAP-capable requests.
    pub fn version(&self) -> Option<SoapVersion> {
        self.envelope().map(|e| e.version)
    }

    /// The SOAP Header section, if the request has one.
    pub fn soap_header(&self) -> Option<&SoapHeader> {
        self.envelope().and_then(|e| e.header.as_ref())
    }

    /// The body payload document.
    pub fn payload(&self) -> Option<&XmlElement> {
        match self {
            Self::Mime(m) => m.envelope.payload(),
            Self::Soap(envelope) => envelope.payload(),
            Self::Plain(p) => p.payload.as_ref(),
        }
    }

    /// MIME transport headers, for MIME-capable requests.
    pub fn mime_headers(&self) -> Option<&MimeHeaders> {
        match self {
            Self::Mime(m) => Some(&m.mime_headers),
            _ => None,
        }
    }

    /// Attachments in transport order, for MIME-capable requests.
    pub fn attachments(&self) -> Option<impl Iterator<Item = &Attachment>> {
        match self {
            Self::Mime(m) => Some(m.attachments.iter()),
            _ => None,
        }
    }
}

fn check_size(data: &[u8], max: usize) -> Result<(), SoapError> {
    if data.len() > max {
        return Err(SoapError::BodyTooLarge {
            size: data.len(),
            max,
        });
    }
    Ok(())
}

/// The underlying HTTP request, when the transport is HTTP.
#[derive(Debug, Clone, Default)]
pub struct TransportRequest {
    pub method: String,
    pub uri: String,
    pub headers: MimeHeaders,
}

impl TransportRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: MimeHeaders::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.first(name)
    }

    /// Path component of the request URI.
    pub fn path(&self) -> &str {
        let without_scheme = match self.uri.find("://") {
            Some(idx) => {
                let rest = &self.uri[idx + 3..];
                rest.find('/').map(|p| &rest[p..]).unwrap_or("/")
            }
            None => self.uri.as_str(),
        };
        without_scheme
            .split(['?', '#'])
            .next()
            .unwrap_or(without_scheme)
    }
}

/// Per-invocation context supplied by the transport.
#[derive(Debug, Clone, Default)]
pub struct TransportContext {
    properties: BTreeMap<String, Value>,
    transport_request: Option<TransportRequest>,
}

impl TransportContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_transport_request(mut self, request: TransportRequest) -> Self {
        self.transport_request = Some(request);
        self
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The raw transport request, if the transport provided one.
    pub fn transport_request(&self) -> Option<&TransportRequest> {
        self.transport_request.as_ref()
    }
}

/// Response carrier owned by the transport for one invocation.
#[derive(Debug, Clone)]
pub struct WireResponse {
    version: SoapVersion,
    /// Transport headers (e.g. HTTP response headers)
    pub transport_headers: MimeHeaders,
    /// Attributes to put on the response SOAP Header
    pub header_attributes: Vec<XmlAttribute>,
    /// Elements to put in the response SOAP Header
    pub header_elements: Vec<XmlElement>,
    /// MIME attachments of the response
    pub attachments: Vec<Attachment>,
    payload: Vec<u8>,
}

impl WireResponse {
    pub fn new(version: SoapVersion) -> Self {
        Self {
            version,
            transport_headers: MimeHeaders::new(),
            header_attributes: Vec::new(),
            header_elements: Vec::new(),
            attachments: Vec::new(),
            payload: Vec::new(),
        }
    }

    pub fn version(&self) -> SoapVersion {
        self.version
    }

    /// Sink the body payload is serialized into.
    pub fn payload_result(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    /// Serialized body payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Render the full response envelope.
    pub fn to_envelope(&self) -> Result<Vec<u8>, SoapError> {
        let ns = self.version.namespace();
        let mut out = Vec::new();
        out.extend_from_slice(br#"<?xml version="1.0" encoding="UTF-8"?>"#);
        write!(out, r#"<soap:Envelope xmlns:soap="{}">"#, ns)?;

        if !self.header_attributes.is_empty() || !self.header_elements.is_empty() {
            let mut header = XmlElement::new(QualifiedName::prefixed(ns, "soap", "Header"));
            header.attributes = self.header_attributes.clone();
            for element in &self.header_elements {
                header = header.with_child(element.clone());
            }
            transform(&header, &mut out)?;
        }

        out.extend_from_slice(b"<soap:Body>");
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(b"</soap:Body></soap:Envelope>");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOAP_REQUEST: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header><t:Trace xmlns:t="urn:trace">1</t:Trace></soap:Header>
  <soap:Body><m:Ping xmlns:m="urn:ping"/></soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_mime_headers_case_insensitive() {
        let mut headers = MimeHeaders::new();
        headers.add("breadcrumbId", "id-1");
        headers.add("BREADCRUMBID", "id-2");
        assert_eq!(headers.get_all("breadcrumbid"), vec!["id-1", "id-2"]);
        assert_eq!(headers.first("BreadcrumbId"), Some("id-1"));

        headers.set("breadcrumbId", "id-3");
        assert_eq!(headers.get_all("breadcrumbId"), vec!["id-3"]);
        headers.remove("breadcrumbid");
        assert!(headers.is_empty());
    }

    #[test]
    fn test_request_kinds() {
        let soap = WireRequest::parse_soap(SOAP_REQUEST.as_bytes(), 1024).unwrap();
        assert_eq!(soap.kind(), WireKind::SoapCapable);
        assert!(soap.soap_header().is_some());
        assert!(soap.mime_headers().is_none());
        assert!(soap.attachments().is_none());

        let mime = WireRequest::mime(
            SOAP_REQUEST.as_bytes(),
            MimeHeaders::new(),
            vec![Attachment::new("a1", DataHandle::new("text/plain", "hi"))],
            1024,
        )
        .unwrap();
        assert_eq!(mime.kind(), WireKind::MimeCapable);
        assert_eq!(mime.attachments().unwrap().count(), 1);
        assert_eq!(mime.payload().unwrap().local_name(), "Ping");

        let plain = WireRequest::plain(b"<ping/>", 1024).unwrap();
        assert_eq!(plain.kind(), WireKind::Plain);
        assert!(plain.soap_header().is_none());
        assert!(plain.version().is_none());
        assert_eq!(plain.payload().unwrap().local_name(), "ping");
    }

    #[test]
    fn test_empty_plain_request_has_no_payload() {
        let plain = WireRequest::plain(b"  \n", 1024).unwrap();
        assert!(plain.payload().is_none());
    }

    #[test]
    fn test_body_too_large() {
        let result = WireRequest::parse_soap(SOAP_REQUEST.as_bytes(), 16);
        assert!(matches!(result, Err(SoapError::BodyTooLarge { max: 16, .. })));
    }

    #[test]
    fn test_data_handle_shares_bytes() {
        let handle = DataHandle::new("application/octet-stream", Bytes::from_static(b"abc"));
        let copy = handle.clone();
        assert_eq!(handle.data().as_ptr(), copy.data().as_ptr());
        assert_eq!(copy.len(), 3);
    }

    #[test]
    fn test_transport_request_path() {
        let req = TransportRequest::new("POST", "http://localhost:8080/ws/orders?wsdl");
        assert_eq!(req.path(), "/ws/orders");
        let req = TransportRequest::new("POST", "/ws/quotes#x");
        assert_eq!(req.path(), "/ws/quotes");
        let req = TransportRequest::new("POST", "https://host");
        assert_eq!(req.path(), "/");
    }

    #[test]
    fn test_transport_context_properties() {
        let context = TransportContext::new()
            .with_property("tenant", "acme")
            .with_property("retries", 3);
        let names: Vec<&str> = context.property_names().collect();
        assert_eq!(names, vec!["retries", "tenant"]);
        assert_eq!(context.property("tenant"), Some(&Value::from("acme")));
        assert!(context.transport_request().is_none());
    }

    #[test]
    fn test_response_envelope() {
        let mut response = WireResponse::new(SoapVersion::Soap11);
        response.payload_result().extend_from_slice(b"<ack/>");
        response
            .header_attributes
            .push(XmlAttribute::new(QualifiedName::local("tier"), "gold"));

        let envelope = String::from_utf8(response.to_envelope().unwrap()).unwrap();
        assert!(envelope.contains("<soap:Body><ack/></soap:Body>"));
        assert!(envelope.contains(r#"tier="gold""#));

        let parsed = parse_soap_envelope(envelope.as_bytes()).unwrap();
        assert_eq!(parsed.payload().unwrap().local_name(), "ack");
        assert_eq!(parsed.header.unwrap().attributes().count(), 1);
    }
}
