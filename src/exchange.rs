//! Transport-agnostic exchange model handed to the pipeline.

use crate::config::ExchangePattern;
use crate::document::XmlElement;
use crate::error::SoapError;
use crate::parser::parse_payload;
use crate::wire::{DataHandle, WireRequest};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Header key carrying the breadcrumb (correlation) id.
pub const BREADCRUMB_ID: &str = "breadcrumbId";

/// Header key carrying the raw SOAP Header section.
pub const SOAP_HEADER_SOURCE: &str = "ZentinelSoapHeader";

/// Value stored in a message header.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    /// Plain string value (attributes, breadcrumb)
    Text(String),
    /// A SOAP header element
    Element(XmlElement),
    /// The raw SOAP Header section document
    Source(XmlElement),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_element(&self) -> Option<&XmlElement> {
        match self {
            Self::Element(e) | Self::Source(e) => Some(e),
            Self::Text(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

pub type Headers = HashMap<String, HeaderValue>;

/// Attachment collection keyed by content id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attachments {
    entries: HashMap<String, DataHandle>,
}

impl Attachments {
    /// Insert or replace the attachment for a content id.
    pub fn add(&mut self, content_id: impl Into<String>, data: DataHandle) {
        self.entries.insert(content_id.into(), data);
    }

    pub fn get(&self, content_id: &str) -> Option<&DataHandle> {
        self.entries.get(content_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DataHandle)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Explicitly set message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Document(XmlElement),
    Text(String),
}

/// One side of an exchange.
#[derive(Debug, Clone)]
pub struct Message {
    id: Uuid,
    headers: Headers,
    body: Option<Body>,
    attachments: Option<Attachments>,
    wire: Option<Arc<WireRequest>>,
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

impl Message {
    /// A message not backed by a wire request.
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: Headers::new(),
            body: None,
            attachments: None,
            wire: None,
        }
    }

    /// A message whose body is read from the wire request.
    pub fn from_wire(request: Arc<WireRequest>) -> Self {
        Self {
            wire: Some(request),
            ..Self::new()
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether this message wraps a wire request.
    pub fn is_wire_backed(&self) -> bool {
        self.wire.is_some()
    }

    pub fn wire_request(&self) -> Option<&WireRequest> {
        self.wire.as_deref()
    }

    /// Point the message at a new wire request, keeping its identity,
    /// headers and attachments.
    pub fn set_wire_request(&mut self, request: Arc<WireRequest>) {
        self.wire = Some(request);
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = Some(body);
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Read the body as a document.
    ///
    /// An explicit body takes precedence; otherwise a wire-backed message
    /// reads the wire payload and fails with [`SoapError::MissingBody`] when
    /// the request carried none. A plain message without body yields `None`.
    pub fn body_document(&self) -> Result<Option<XmlElement>, SoapError> {
        match (&self.body, &self.wire) {
            (Some(Body::Document(doc)), _) => Ok(Some(doc.clone())),
            (Some(Body::Text(text)), _) => parse_payload(text.as_bytes()).map(Some),
            (None, Some(wire)) => wire
                .payload()
                .cloned()
                .map(Some)
                .ok_or(SoapError::MissingBody),
            (None, None) => Ok(None),
        }
    }

    /// Attachments, if any were ever added.
    pub fn attachments(&self) -> Option<&Attachments> {
        self.attachments.as_ref()
    }

    /// Attachment collection, created on first use.
    pub fn attachments_mut(&mut self) -> &mut Attachments {
        self.attachments.get_or_insert_with(Attachments::default)
    }

    pub fn add_attachment(&mut self, content_id: impl Into<String>, data: DataHandle) {
        self.attachments_mut().add(content_id, data);
    }

    fn clear_content(&mut self) {
        self.headers.clear();
        self.body = None;
        self.attachments = None;
    }
}

/// Unit of work for one request/response cycle.
#[derive(Debug)]
pub struct Exchange {
    id: Uuid,
    created: DateTime<Utc>,
    pattern: ExchangePattern,
    properties: HashMap<String, Value>,
    inbound: Option<Message>,
    outbound: Option<Message>,
    failure: Option<anyhow::Error>,
}

impl Exchange {
    pub fn new(pattern: ExchangePattern) -> Self {
        Self {
            id: Uuid::new_v4(),
            created: Utc::now(),
            pattern,
            properties: HashMap::new(),
            inbound: None,
            outbound: None,
            failure: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), value);
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn inbound(&self) -> Option<&Message> {
        self.inbound.as_ref()
    }

    /// Inbound message, created empty if absent.
    pub fn inbound_mut(&mut self) -> &mut Message {
        self.inbound.get_or_insert_with(Message::new)
    }

    pub fn set_inbound(&mut self, message: Message) {
        self.inbound = Some(message);
    }

    /// The inbound message, only if it is wire-backed.
    pub fn wire_inbound_mut(&mut self) -> Option<&mut Message> {
        self.inbound.as_mut().filter(|m| m.is_wire_backed())
    }

    pub fn outbound(&self) -> Option<&Message> {
        self.outbound.as_ref()
    }

    /// Outbound message, created empty if absent.
    pub fn outbound_mut(&mut self) -> &mut Message {
        self.outbound.get_or_insert_with(Message::new)
    }

    pub fn set_outbound(&mut self, message: Message) {
        self.outbound = Some(message);
    }

    /// Record a processing failure.
    pub fn set_failure(&mut self, failure: impl Into<anyhow::Error>) {
        self.failure = Some(failure.into());
    }

    pub fn failure(&self) -> Option<&anyhow::Error> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<anyhow::Error> {
        self.failure.take()
    }

    /// Clear per-request state for reuse. A wire-backed inbound message is
    /// kept (emptied) so the next population updates it in place.
    fn reset(&mut self, pattern: ExchangePattern) {
        self.id = Uuid::new_v4();
        self.created = Utc::now();
        self.pattern = pattern;
        self.properties.clear();
        self.outbound = None;
        self.failure = None;
        let keep_inbound = self.inbound.as_ref().is_some_and(Message::is_wire_backed);
        if !keep_inbound {
            self.inbound = None;
        } else if let Some(message) = self.inbound.as_mut() {
            message.clear_content();
        }
    }
}

/// Creates and releases exchanges.
pub trait ExchangeFactory: Send + Sync {
    fn create(&self, pattern: ExchangePattern) -> Exchange;

    fn release(&self, exchange: Exchange) -> Result<(), SoapError>;
}

/// Snapshot of factory counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactoryStats {
    pub created: u64,
    pub released: u64,
}

/// Creates a fresh exchange per request.
#[derive(Debug, Default)]
pub struct DefaultExchangeFactory {
    created: AtomicU64,
    released: AtomicU64,
}

impl DefaultExchangeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            created: self.created.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

impl ExchangeFactory for DefaultExchangeFactory {
    fn create(&self, pattern: ExchangePattern) -> Exchange {
        self.created.fetch_add(1, Ordering::Relaxed);
        Exchange::new(pattern)
    }

    fn release(&self, _exchange: Exchange) -> Result<(), SoapError> {
        self.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Recycles released exchanges, up to a fixed capacity.
#[derive(Debug)]
pub struct PooledExchangeFactory {
    pool: Mutex<Vec<Exchange>>,
    capacity: usize,
    created: AtomicU64,
    released: AtomicU64,
}

impl PooledExchangeFactory {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            created: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Number of exchanges waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            created: self.created.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

impl ExchangeFactory for PooledExchangeFactory {
    fn create(&self, pattern: ExchangePattern) -> Exchange {
        self.created.fetch_add(1, Ordering::Relaxed);
        match self.pool.lock().pop() {
            Some(mut exchange) => {
                exchange.reset(pattern);
                exchange
            }
            None => Exchange::new(pattern),
        }
    }

    fn release(&self, exchange: Exchange) -> Result<(), SoapError> {
        self.released.fetch_add(1, Ordering::Relaxed);
        let mut pool = self.pool.lock();
        if pool.len() < self.capacity {
            pool.push(exchange);
        }
        Ok(())
    }
}

/// Owns an exchange for the duration of one invocation and hands it back
/// to its factory when dropped.
///
/// `exchange` is `Some` from `acquire` until `drop`, which is the only
/// place that takes it.
pub(crate) struct ExchangeGuard<'a> {
    factory: &'a dyn ExchangeFactory,
    exchange: Option<Exchange>,
}

impl<'a> ExchangeGuard<'a> {
    pub(crate) fn acquire(factory: &'a dyn ExchangeFactory, pattern: ExchangePattern) -> Self {
        Self {
            factory,
            exchange: Some(factory.create(pattern)),
        }
    }

    pub(crate) fn exchange_mut(&mut self) -> &mut Exchange {
        self.exchange
            .as_mut()
            .expect("exchange is held until the guard is dropped")
    }
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        if let Some(exchange) = self.exchange.take() {
            let exchange_id = exchange.id();
            if let Err(e) = self.factory.release(exchange) {
                warn!(
                    exchange_id = %exchange_id,
                    error = %e,
                    "Failed to release exchange"
                );
            }
        }
    }
}
