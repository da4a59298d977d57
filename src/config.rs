//! Configuration types for the inbound SOAP adapter.

use crate::error::SoapError;
use crate::mapping::EndpointMappingKey;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for a SOAP consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoapConsumerConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Endpoint registration
    pub endpoint: EndpointConfig,

    /// Response message filter
    pub filter: FilterConfig,
}

impl Default for SoapConsumerConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            endpoint: EndpointConfig::default(),
            filter: FilterConfig::default(),
        }
    }
}

impl SoapConsumerConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SoapError> {
        serde_yaml::from_str(yaml).map_err(|e| SoapError::Config(e.to_string()))
    }

    /// Load a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SoapError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Propagate the breadcrumb id from transport headers onto the exchange
    pub use_breadcrumb: bool,

    /// Message exchange pattern of created exchanges
    pub exchange_pattern: ExchangePattern,

    /// Maximum request body size accepted when building wire requests (bytes)
    pub max_body_size: usize,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            use_breadcrumb: false,
            exchange_pattern: ExchangePattern::InOut,
            max_body_size: 1_048_576, // 1MB
        }
    }
}

/// Message exchange pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExchangePattern {
    /// One-way: no response is written
    InOnly,
    /// Request/response
    #[default]
    InOut,
}

impl ExchangePattern {
    /// Whether the pattern expects a response.
    pub fn is_out_capable(&self) -> bool {
        matches!(self, Self::InOut)
    }
}

/// Endpoint registration configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Key under which the consumer is registered with the endpoint mapping
    pub mapping_key: Option<EndpointMappingKey>,
}

/// Response filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Filter implementation
    pub kind: FilterKind,

    /// Message headers never copied onto the response (case-insensitive)
    pub exclude_headers: Vec<String>,

    /// Echo the breadcrumb id as a response transport header
    pub propagate_breadcrumb: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            kind: FilterKind::Basic,
            exclude_headers: Vec::new(),
            propagate_breadcrumb: true,
        }
    }
}

/// Available response filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    /// Copy headers and attachments onto the response
    #[default]
    Basic,
    /// Leave the response untouched
    Identity,
}

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    #[default]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2")]
    Soap12,
}

impl SoapVersion {
    /// Envelope namespace URI.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Soap11 => crate::parser::SOAP_11_NS,
            Self::Soap12 => crate::parser::SOAP_12_NS,
        }
    }

    /// HTTP content type for messages of this version.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Soap11 => "text/xml; charset=utf-8",
            Self::Soap12 => "application/soap+xml; charset=utf-8",
        }
    }
}
