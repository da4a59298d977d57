//! Endpoint registration and lookup.

use crate::error::SoapError;
use crate::parser::parse_soap_action;
use crate::wire::{TransportContext, WireRequest, WireResponse};
use glob::Pattern;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry point the transport calls for each request routed to an endpoint.
pub trait MessageEndpoint: Send + Sync {
    fn invoke(
        &self,
        request: WireRequest,
        response: &mut WireResponse,
        context: &TransportContext,
    ) -> Result<(), SoapError>;
}

/// Registry mapping keys to endpoints.
pub trait EndpointMapping: Send + Sync {
    fn add_consumer(
        &self,
        key: &EndpointMappingKey,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> Result<(), SoapError>;

    fn remove_consumer(&self, key: &EndpointMappingKey) -> Result<(), SoapError>;
}

/// What part of a request a mapping key is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointMappingKeyType {
    /// The SOAPAction HTTP header
    SoapAction,
    /// Payload root element in `{namespace}local` form
    RootQname,
    /// Full request URI
    Uri,
    /// Request path, glob pattern
    UriPath,
}

/// Key an endpoint is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointMappingKey {
    pub key_type: EndpointMappingKeyType,
    pub lookup_key: String,
}

impl EndpointMappingKey {
    pub fn new(key_type: EndpointMappingKeyType, lookup_key: impl Into<String>) -> Self {
        Self {
            key_type,
            lookup_key: lookup_key.into(),
        }
    }
}

impl fmt::Display for EndpointMappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.key_type, self.lookup_key)
    }
}

struct MappingEntry {
    key: EndpointMappingKey,
    /// Compiled pattern for URI path keys
    pattern: Option<Pattern>,
    endpoint: Arc<dyn MessageEndpoint>,
}

/// In-process endpoint mapping.
///
/// Lookup tries SOAPAction keys first, then payload root names, full URIs
/// and finally URI path patterns, in registration order within each type.
#[derive(Default)]
pub struct InMemoryEndpointMapping {
    entries: RwLock<Vec<MappingEntry>>,
}

impl InMemoryEndpointMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &EndpointMappingKey) -> bool {
        self.entries.read().iter().any(|e| &e.key == key)
    }

    /// Find the endpoint for a request.
    pub fn resolve(
        &self,
        request: &WireRequest,
        context: &TransportContext,
    ) -> Option<Arc<dyn MessageEndpoint>> {
        let transport = context.transport_request();
        let soap_action = transport
            .and_then(|t| t.header("SOAPAction"))
            .map(parse_soap_action)
            .filter(|a| !a.is_empty());
        let root_qname = request.payload().map(|p| p.name.expanded());
        let uri = transport.map(|t| t.uri.as_str());
        let path = transport.map(|t| t.path());

        let entries = self.entries.read();
        let lookup_order = [
            EndpointMappingKeyType::SoapAction,
            EndpointMappingKeyType::RootQname,
            EndpointMappingKeyType::Uri,
            EndpointMappingKeyType::UriPath,
        ];

        for key_type in lookup_order {
            let found = entries
                .iter()
                .filter(|e| e.key.key_type == key_type)
                .find(|e| match key_type {
                    EndpointMappingKeyType::SoapAction => {
                        soap_action.as_deref() == Some(e.key.lookup_key.as_str())
                    }
                    EndpointMappingKeyType::RootQname => {
                        root_qname.as_deref() == Some(e.key.lookup_key.as_str())
                    }
                    EndpointMappingKeyType::Uri => uri == Some(e.key.lookup_key.as_str()),
                    EndpointMappingKeyType::UriPath => match (&e.pattern, path) {
                        (Some(pattern), Some(path)) => pattern.matches(path),
                        _ => false,
                    },
                });
            if let Some(entry) = found {
                debug!(key = %entry.key, "Resolved endpoint");
                return Some(Arc::clone(&entry.endpoint));
            }
        }

        None
    }
}

impl EndpointMapping for InMemoryEndpointMapping {
    fn add_consumer(
        &self,
        key: &EndpointMappingKey,
        endpoint: Arc<dyn MessageEndpoint>,
    ) -> Result<(), SoapError> {
        let pattern = match key.key_type {
            EndpointMappingKeyType::UriPath => Some(Pattern::new(&key.lookup_key).map_err(|e| {
                SoapError::Mapping(format!("invalid path pattern '{}': {}", key.lookup_key, e))
            })?),
            _ => None,
        };

        let mut entries = self.entries.write();
        if let Some(existing) = entries.iter_mut().find(|e| &e.key == key) {
            warn!(key = %key, "Replacing endpoint already registered under key");
            existing.endpoint = endpoint;
            existing.pattern = pattern;
        } else {
            entries.push(MappingEntry {
                key: key.clone(),
                pattern,
                endpoint,
            });
        }
        info!(key = %key, "Endpoint registered");
        Ok(())
    }

    fn remove_consumer(&self, key: &EndpointMappingKey) -> Result<(), SoapError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| &e.key != key);
        if entries.len() == before {
            debug!(key = %key, "No endpoint registered under key");
        } else {
            info!(key = %key, "Endpoint unregistered");
        }
        Ok(())
    }
}
