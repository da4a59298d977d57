//! SOAP envelope parsing.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand entities).

use crate::config::SoapVersion;
use crate::document::{parse_document, XmlAttribute, XmlElement};
use crate::error::SoapError;

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// Parsed SOAP envelope.
#[derive(Debug, Clone)]
pub struct SoapEnvelope {
    /// Detected SOAP version
    pub version: SoapVersion,
    /// SOAP Header (if present)
    pub header: Option<SoapHeader>,
    /// SOAP Body element (if present)
    pub body: Option<XmlElement>,
}

impl SoapEnvelope {
    /// Envelope with only a body payload.
    pub fn with_payload(version: SoapVersion, payload: XmlElement) -> Self {
        let ns = version.namespace();
        let body = XmlElement::new(crate::document::QualifiedName::prefixed(ns, "soap", "Body"))
            .with_child(payload);
        Self {
            version,
            header: None,
            body: Some(body),
        }
    }

    /// First element inside the Body.
    pub fn payload(&self) -> Option<&XmlElement> {
        self.body.as_ref().and_then(|b| b.child_elements().next())
    }
}

/// The SOAP Header section.
#[derive(Debug, Clone)]
pub struct SoapHeader {
    element: XmlElement,
}

impl SoapHeader {
    pub fn new(element: XmlElement) -> Self {
        Self { element }
    }

    /// The raw `Header` element.
    pub fn source(&self) -> &XmlElement {
        &self.element
    }

    /// Attributes of the Header element (namespace declarations excluded).
    pub fn attributes(&self) -> impl Iterator<Item = &XmlAttribute> {
        self.element.attributes.iter()
    }

    /// Header elements in document order.
    pub fn header_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.element.child_elements()
    }
}

/// Parse raw bytes as SOAP envelope.
pub fn parse_soap_envelope(data: &[u8]) -> Result<SoapEnvelope, SoapError> {
    let xml_str = std::str::from_utf8(data)
        .map_err(|e| SoapError::XmlParse(format!("Invalid UTF-8: {}", e)))?;

    check_xxe_patterns(xml_str)?;

    let root = parse_document(xml_str)?;
    if root.local_name() != "Envelope" {
        return Err(SoapError::InvalidEnvelope(format!(
            "root element is <{}>, expected Envelope",
            root.name.qualified()
        )));
    }

    let version = match root.namespace() {
        Some(SOAP_11_NS) => SoapVersion::Soap11,
        Some(SOAP_12_NS) => SoapVersion::Soap12,
        other => {
            return Err(SoapError::InvalidEnvelope(format!(
                "unrecognized envelope namespace {:?}",
                other
            )))
        }
    };
    let ns = version.namespace();

    let mut header = None;
    let mut body = None;
    for child in root.child_elements() {
        if child.namespace() != Some(ns) {
            continue;
        }
        match child.local_name() {
            "Header" if header.is_none() && body.is_none() => {
                header = Some(SoapHeader::new(child.clone()));
            }
            "Body" if body.is_none() => body = Some(child.clone()),
            _ => {}
        }
    }

    Ok(SoapEnvelope {
        version,
        header,
        body,
    })
}

/// Parse a bare XML payload (no envelope).
pub fn parse_payload(data: &[u8]) -> Result<XmlElement, SoapError> {
    let xml_str = std::str::from_utf8(data)
        .map_err(|e| SoapError::XmlParse(format!("Invalid UTF-8: {}", e)))?;
    check_xxe_patterns(xml_str)?;
    parse_document(xml_str)
}

/// Check for XXE attack patterns.
fn check_xxe_patterns(xml: &str) -> Result<(), SoapError> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(SoapError::XmlParse(
            "DOCTYPE declarations are not allowed".to_string(),
        ));
    }

    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(SoapError::XmlParse(
            "Entity declarations are not allowed".to_string(),
        ));
    }

    Ok(())
}

/// Extract SOAPAction from HTTP header value (removes quotes).
pub fn parse_soap_action(header_value: &str) -> String {
    header_value.trim().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOAP_11_SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header soap:actor="next" tier="gold">
    <m:Trans xmlns:m="http://example.org/trans">234</m:Trans>
  </soap:Header>
  <soap:Body>
    <m:GetPrice xmlns:m="http://example.org/stock">
      <m:Item>Apples</m:Item>
    </m:GetPrice>
  </soap:Body>
</soap:Envelope>"#;

    const SOAP_12_SAMPLE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <m:GetUser xmlns:m="http://example.org/users">
      <m:UserId>123</m:UserId>
    </m:GetUser>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_parse_soap_11() {
        let envelope = parse_soap_envelope(SOAP_11_SAMPLE.as_bytes()).unwrap();
        assert_eq!(envelope.version, SoapVersion::Soap11);
        let header = envelope.header.as_ref().unwrap();
        assert_eq!(header.attributes().count(), 2);
        let names: Vec<&str> = header.header_elements().map(|e| e.local_name()).collect();
        assert_eq!(names, vec!["Trans"]);
        assert_eq!(envelope.payload().unwrap().local_name(), "GetPrice");
    }

    #[test]
    fn test_parse_soap_12() {
        let envelope = parse_soap_envelope(SOAP_12_SAMPLE.as_bytes()).unwrap();
        assert_eq!(envelope.version, SoapVersion::Soap12);
        assert!(envelope.header.is_none());
        let payload = envelope.payload().unwrap();
        assert_eq!(payload.local_name(), "GetUser");
        assert_eq!(payload.namespace(), Some("http://example.org/users"));
    }

    #[test]
    fn test_missing_body_is_not_a_parse_error() {
        let xml = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"/>"#;
        let envelope = parse_soap_envelope(xml.as_bytes()).unwrap();
        assert!(envelope.body.is_none());
        assert!(envelope.payload().is_none());
    }

    #[test]
    fn test_xxe_detection() {
        let xxe_payload = r#"<?xml version="1.0"?>
<!DOCTYPE foo [<!ENTITY xxe SYSTEM "file:///etc/passwd">]>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>&xxe;</soap:Body>
</soap:Envelope>"#;

        let result = parse_soap_envelope(xxe_payload.as_bytes());
        assert!(matches!(result, Err(SoapError::XmlParse(_))));
    }

    #[test]
    fn test_non_soap_root_rejected() {
        let result = parse_soap_envelope(b"<root><message/></root>");
        assert!(matches!(result, Err(SoapError::InvalidEnvelope(_))));

        let wrong_ns = r#"<Envelope xmlns="urn:not-soap"><Body/></Envelope>"#;
        let result = parse_soap_envelope(wrong_ns.as_bytes());
        assert!(matches!(result, Err(SoapError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_invalid_utf8() {
        let result = parse_soap_envelope(&[0x3c, 0xff, 0xfe]);
        assert!(matches!(result, Err(SoapError::XmlParse(_))));
    }

    #[test]
    fn test_envelope_with_payload() {
        let payload = parse_payload(b"<ack/>").unwrap();
        let envelope = SoapEnvelope::with_payload(SoapVersion::Soap12, payload);
        assert_eq!(envelope.payload().unwrap().local_name(), "ack");
        assert_eq!(envelope.body.unwrap().namespace(), Some(SOAP_12_NS));
    }

    #[test]
    fn test_parse_soap_action() {
        assert_eq!(parse_soap_action("\"GetUser\""), "GetUser");
        assert_eq!(parse_soap_action("GetUser"), "GetUser");
        assert_eq!(parse_soap_action("  \"GetUser\"  "), "GetUser");
    }
}
