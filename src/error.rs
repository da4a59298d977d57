//! Error types for the inbound SOAP adapter.

use crate::config::SoapVersion;
use quick_xml::escape::escape;
use thiserror::Error;

/// Inbound adapter errors.
#[derive(Error, Debug)]
pub enum SoapError {
    #[error("XML parsing error: {0}")]
    XmlParse(String),

    #[error("Invalid SOAP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("SOAP message has no body payload")]
    MissingBody,

    #[error("Request body size {size} exceeds maximum {max}")]
    BodyTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Endpoint mapping error: {0}")]
    Mapping(String),

    #[error("Exchange release failed: {0}")]
    Release(String),

    /// Failure attached to the exchange by the pipeline, re-raised unchanged.
    #[error(transparent)]
    Pipeline(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SoapError {
    /// Whether the error was caused by the request rather than by the
    /// service processing it.
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            Self::XmlParse(_) | Self::InvalidEnvelope(_) | Self::MissingBody | Self::BodyTooLarge { .. }
        )
    }
}

/// Generate a SOAP Fault document for an error raised by the adapter.
pub fn soap_fault_response(error: &SoapError, version: SoapVersion) -> String {
    let reason = error.to_string();
    match version {
        SoapVersion::Soap11 => soap_11_fault(&reason, error.is_client_fault()),
        SoapVersion::Soap12 => soap_12_fault(&reason, error.is_client_fault()),
    }
}

fn soap_11_fault(reason: &str, client: bool) -> String {
    let code = if client { "soap:Client" } else { "soap:Server" };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <soap:Fault>
      <faultcode>{}</faultcode>
      <faultstring>{}</faultstring>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        code,
        escape(reason)
    )
}

fn soap_12_fault(reason: &str, client: bool) -> String {
    let code = if client { "soap:Sender" } else { "soap:Receiver" };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Body>
    <soap:Fault>
      <soap:Code>
        <soap:Value>{}</soap:Value>
      </soap:Code>
      <soap:Reason>
        <soap:Text xml:lang="en">{}</soap:Text>
      </soap:Reason>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
        code,
        escape(reason)
    )
}
