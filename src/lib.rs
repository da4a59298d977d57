//! Inbound SOAP adapter for Zentinel
//!
//! Bridges SOAP requests received by a transport to a generic exchange
//! pipeline, and turns the pipeline's result back into a SOAP response.
//!
//! # Features
//!
//! - Exchange population from SOAP, MIME-packaged SOAP and plain payloads
//! - SOAP Header projection (attributes, elements and the raw section)
//! - MIME attachment projection
//! - Breadcrumb (correlation id) propagation
//! - Response filtering and body serialization
//! - Endpoint registration by SOAPAction, payload root name, URI or path
//! - Exchange release on every exit path, with optional pooling
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use zentinel_soap_inbound::{SoapConsumer, SoapConsumerConfig, WireRequest, WireResponse};
//!
//! let consumer = SoapConsumer::new(SoapConsumerConfig::default(), Arc::new(my_route));
//! let request = WireRequest::parse_soap(body, 1 << 20)?;
//! let mut response = WireResponse::new(request.version().unwrap_or_default());
//! consumer.invoke(request, &mut response, &TransportContext::new())?;
//! ```

pub mod config;
pub mod consumer;
pub mod correlation;
pub mod document;
pub mod error;
pub mod exchange;
pub mod filter;
pub mod mapping;
pub mod parser;
pub mod projector;
pub mod wire;

pub use config::SoapConsumerConfig;
pub use consumer::{Processor, SoapConsumer};
pub use error::SoapError;
pub use exchange::{Exchange, Message};
pub use wire::{TransportContext, WireRequest, WireResponse};
