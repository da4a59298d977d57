//! SOAP consumer: bridges wire requests to the exchange pipeline.
//!
//! One [`SoapConsumer::invoke`] call runs the whole cycle for a request:
//! the exchange is populated from the wire request, handed to the
//! [`Processor`], and the outbound body (if any) is filtered and serialized
//! into the [`WireResponse`]. The exchange goes back to its factory when the
//! call returns, whatever the outcome.

use crate::config::SoapConsumerConfig;
use crate::correlation::populate_breadcrumb;
use crate::document::{transform, XmlElement};
use crate::error::SoapError;
use crate::exchange::{
    DefaultExchangeFactory, Exchange, ExchangeFactory, ExchangeGuard, Message,
};
use crate::filter::{message_filter_from_config, MessageFilter};
use crate::mapping::{EndpointMapping, MessageEndpoint};
use crate::projector::{project_attachments, project_soap_header};
use crate::wire::{TransportContext, WireRequest, WireResponse};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The message processing pipeline.
///
/// Failures are reported by attaching them to the exchange with
/// [`Exchange::set_failure`], not by panicking.
pub trait Processor: Send + Sync {
    fn process(&self, exchange: &mut Exchange);
}

impl<F> Processor for F
where
    F: Fn(&mut Exchange) + Send + Sync,
{
    fn process(&self, exchange: &mut Exchange) {
        self(exchange)
    }
}

/// Invocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerMetrics {
    pub invocations: u64,
    pub failures: u64,
}

/// Inbound SOAP adapter.
pub struct SoapConsumer {
    config: SoapConsumerConfig,
    processor: Arc<dyn Processor>,
    message_filter: Arc<dyn MessageFilter>,
    exchange_factory: Arc<dyn ExchangeFactory>,
    endpoint_mapping: Option<Arc<dyn EndpointMapping>>,
    invocations: AtomicU64,
    failures: AtomicU64,
}

impl SoapConsumer {
    /// Create a consumer with the filter selected by configuration and a
    /// [`DefaultExchangeFactory`].
    pub fn new(config: SoapConsumerConfig, processor: Arc<dyn Processor>) -> Self {
        let message_filter = message_filter_from_config(&config.filter);
        Self {
            config,
            processor,
            message_filter,
            exchange_factory: Arc::new(DefaultExchangeFactory::new()),
            endpoint_mapping: None,
            invocations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_message_filter(mut self, filter: Arc<dyn MessageFilter>) -> Self {
        self.message_filter = filter;
        self
    }

    pub fn with_exchange_factory(mut self, factory: Arc<dyn ExchangeFactory>) -> Self {
        self.exchange_factory = factory;
        self
    }

    pub fn with_endpoint_mapping(mut self, mapping: Arc<dyn EndpointMapping>) -> Self {
        self.endpoint_mapping = Some(mapping);
        self
    }

    pub fn config(&self) -> &SoapConsumerConfig {
        &self.config
    }

    pub fn metrics(&self) -> ConsumerMetrics {
        ConsumerMetrics {
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// Register with the endpoint mapping, if one is configured.
    pub fn start(self: &Arc<Self>) -> Result<(), SoapError> {
        let Some(mapping) = &self.endpoint_mapping else {
            debug!("No endpoint mapping configured, nothing to register");
            return Ok(());
        };
        let key = self.config.endpoint.mapping_key.as_ref().ok_or_else(|| {
            SoapError::Config("endpoint mapping configured without a mapping key".to_string())
        })?;

        let endpoint: Arc<dyn MessageEndpoint> = Arc::clone(self) as Arc<dyn MessageEndpoint>;
        mapping.add_consumer(key, endpoint)?;
        info!(key = %key, "SOAP consumer started");
        Ok(())
    }

    /// Unregister from the endpoint mapping, if one is configured.
    pub fn stop(&self) -> Result<(), SoapError> {
        let (Some(mapping), Some(key)) =
            (&self.endpoint_mapping, self.config.endpoint.mapping_key.as_ref())
        else {
            return Ok(());
        };

        mapping.remove_consumer(key)?;
        info!(key = %key, "SOAP consumer stopped");
        Ok(())
    }

    /// Handle one request.
    pub fn invoke(
        &self,
        request: WireRequest,
        response: &mut WireResponse,
        context: &TransportContext,
    ) -> Result<(), SoapError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let result = self.run_exchange(Arc::new(request), response, context);
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn run_exchange(
        &self,
        request: Arc<WireRequest>,
        response: &mut WireResponse,
        context: &TransportContext,
    ) -> Result<(), SoapError> {
        let mut guard = ExchangeGuard::acquire(
            self.exchange_factory.as_ref(),
            self.config.settings.exchange_pattern,
        );
        let exchange = guard.exchange_mut();
        let exchange_id = exchange.id();

        self.populate_exchange(Arc::clone(&request), context, exchange);
        if self.config.settings.use_breadcrumb {
            populate_breadcrumb(exchange, &request, context);
        }

        debug!(
            exchange_id = %exchange_id,
            kind = ?request.kind(),
            pattern = ?exchange.pattern(),
            "Processing exchange"
        );
        self.processor.process(exchange);

        if let Some(failure) = exchange.take_failure() {
            warn!(
                exchange_id = %exchange_id,
                error = %failure,
                "Pipeline reported a failure"
            );
            return Err(SoapError::Pipeline(failure));
        }

        if !exchange.pattern().is_out_capable() {
            debug!(exchange_id = %exchange_id, "One-way exchange, no response written");
            return Ok(());
        }

        let Some(outbound) = exchange.outbound() else {
            debug!(exchange_id = %exchange_id, "No outbound message, nothing to write");
            return Ok(());
        };

        let body = match outbound.body_document() {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    exchange_id = %exchange_id,
                    error = %e,
                    "Outbound body is not a readable document, nothing to write"
                );
                None
            }
        };
        self.filter_and_serialize(exchange, body.as_ref(), response)?;

        let elapsed_ms = (Utc::now() - exchange.created()).num_milliseconds();
        debug!(
            exchange_id = %exchange_id,
            payload_bytes = response.payload().len(),
            elapsed_ms = elapsed_ms,
            "Response written"
        );
        Ok(())
    }

    /// Build the inbound side of the exchange from the wire request.
    pub fn populate_exchange(
        &self,
        request: Arc<WireRequest>,
        context: &TransportContext,
        exchange: &mut Exchange,
    ) {
        for (name, value) in context.properties() {
            exchange.set_property(name, value.clone());
        }

        match exchange.wire_inbound_mut() {
            Some(message) => message.set_wire_request(Arc::clone(&request)),
            None => exchange.set_inbound(Message::from_wire(Arc::clone(&request))),
        }

        let message = exchange.inbound_mut();
        project_soap_header(message.headers_mut(), &request);
        project_attachments(&request, message);

        debug!(
            exchange_id = %exchange.id(),
            properties = exchange.properties().len(),
            attachments = exchange
                .inbound()
                .and_then(Message::attachments)
                .map_or(0, |a| a.len()),
            "Exchange populated"
        );
    }

    /// Apply the message filter, then serialize the body into the
    /// response payload.
    pub fn filter_and_serialize(
        &self,
        exchange: &Exchange,
        body: Option<&XmlElement>,
        response: &mut WireResponse,
    ) -> Result<(), SoapError> {
        self.message_filter.filter_consumer(exchange, response);
        match body {
            Some(body) => transform(body, response.payload_result()),
            None => Ok(()),
        }
    }
}

impl MessageEndpoint for SoapConsumer {
    fn invoke(
        &self,
        request: WireRequest,
        response: &mut WireResponse,
        context: &TransportContext,
    ) -> Result<(), SoapError> {
        SoapConsumer::invoke(self, request, response, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangePattern, FilterKind, SoapVersion};
    use crate::document::QualifiedName;
    use crate::exchange::{Body, FactoryStats, HeaderValue, PooledExchangeFactory, BREADCRUMB_ID};
    use crate::mapping::{EndpointMappingKey, EndpointMappingKeyType, InMemoryEndpointMapping};
    use crate::wire::{Attachment, DataHandle, MimeHeaders, TransportRequest};
    use serde_json::Value;

    const REQUEST: &str = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Header><t:Tenant xmlns:t="urn:t">acme</t:Tenant></soap:Header>
  <soap:Body><m:Ping xmlns:m="urn:ping"><m:Seq>1</m:Seq></m:Ping></soap:Body>
</soap:Envelope>"#;

    fn soap_request() -> WireRequest {
        WireRequest::parse_soap(REQUEST.as_bytes(), 1 << 20).unwrap()
    }

    fn consumer(processor: impl Processor + 'static) -> SoapConsumer {
        let mut config = SoapConsumerConfig::default();
        config.filter.kind = FilterKind::Identity;
        SoapConsumer::new(config, Arc::new(processor))
    }

    fn ack(exchange: &mut Exchange) {
        exchange
            .outbound_mut()
            .set_body(Body::Document(XmlElement::new(QualifiedName::local("ack"))));
    }

    // --- Population ---

    #[test]
    fn test_populate_copies_properties_and_headers() {
        let consumer = consumer(|_: &mut Exchange| {});
        let context = TransportContext::new()
            .with_property("tenant", "acme")
            .with_property("attempt", 2);
        let mut exchange = Exchange::new(ExchangePattern::InOut);
        consumer.populate_exchange(Arc::new(soap_request()), &context, &mut exchange);

        assert_eq!(exchange.property("tenant"), Some(&Value::from("acme")));
        assert_eq!(exchange.property("attempt"), Some(&Value::from(2)));
        let inbound = exchange.inbound().unwrap();
        assert!(inbound.is_wire_backed());
        assert!(matches!(inbound.header("Tenant"), Some(HeaderValue::Element(_))));
        assert!(inbound.attachments().is_none());
    }

    #[test]
    fn test_populate_reuses_wire_backed_message() {
        let consumer = consumer(|_: &mut Exchange| {});
        let mut exchange = Exchange::new(ExchangePattern::InOut);
        let mut previous = Message::from_wire(Arc::new(WireRequest::plain(b"<old/>", 64).unwrap()));
        previous.add_attachment("kept", DataHandle::new("text/plain", "x"));
        let message_id = previous.id();
        exchange.set_inbound(previous);

        consumer.populate_exchange(Arc::new(soap_request()), &TransportContext::new(), &mut exchange);

        let inbound = exchange.inbound().unwrap();
        assert_eq!(inbound.id(), message_id);
        assert!(inbound.attachments().unwrap().get("kept").is_some());
        assert_eq!(inbound.body_document().unwrap().unwrap().local_name(), "Ping");
    }

    #[test]
    fn test_populate_replaces_generic_message() {
        let consumer = consumer(|_: &mut Exchange| {});
        let mut exchange = Exchange::new(ExchangePattern::InOut);
        let generic = Message::new();
        let generic_id = generic.id();
        exchange.set_inbound(generic);

        consumer.populate_exchange(Arc::new(soap_request()), &TransportContext::new(), &mut exchange);

        let inbound = exchange.inbound().unwrap();
        assert_ne!(inbound.id(), generic_id);
        assert!(inbound.is_wire_backed());
    }

    #[test]
    fn test_populate_mime_attachments() {
        let consumer = consumer(|_: &mut Exchange| {});
        let request = WireRequest::mime(
            REQUEST.as_bytes(),
            MimeHeaders::new(),
            vec![
                Attachment::new("a", DataHandle::new("text/plain", "1")),
                Attachment::new("b", DataHandle::new("text/plain", "2")),
            ],
            1 << 20,
        )
        .unwrap();
        let mut exchange = Exchange::new(ExchangePattern::InOut);
        consumer.populate_exchange(Arc::new(request), &TransportContext::new(), &mut exchange);
        assert_eq!(exchange.inbound().unwrap().attachments().unwrap().len(), 2);
    }

    // --- Invocation ---

    #[test]
    fn test_invoke_writes_ack() {
        let inbound_breadcrumb = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let processor = {
            let inbound_breadcrumb = Arc::clone(&inbound_breadcrumb);
            move |exchange: &mut Exchange| {
                let crumb = exchange
                    .inbound()
                    .and_then(|m| m.header(BREADCRUMB_ID))
                    .cloned();
                inbound_breadcrumb.lock().push(crumb);
                ack(exchange);
            }
        };
        let factory = Arc::new(DefaultExchangeFactory::new());
        let consumer = consumer(processor).with_exchange_factory(factory.clone());
        let mut response = WireResponse::new(SoapVersion::Soap11);
        consumer
            .invoke(soap_request(), &mut response, &TransportContext::new())
            .unwrap();
        assert_eq!(response.payload(), b"<ack/>");
        assert!(response.transport_headers.first(BREADCRUMB_ID).is_none());
        assert_eq!(*inbound_breadcrumb.lock(), vec![None]);
        assert_eq!(factory.stats(), FactoryStats { created: 1, released: 1 });
        assert_eq!(consumer.metrics(), ConsumerMetrics { invocations: 1, failures: 0 });
    }

    #[test]
    fn test_invoke_pipeline_failure() {
        let consumer = consumer(|exchange: &mut Exchange| {
            ack(exchange);
            exchange.set_failure(anyhow::anyhow!("route rejected"));
        });
        let mut response = WireResponse::new(SoapVersion::Soap11);
        let err = consumer
            .invoke(soap_request(), &mut response, &TransportContext::new())
            .unwrap_err();
        assert!(matches!(err, SoapError::Pipeline(_)));
        assert_eq!(err.to_string(), "route rejected");
        assert!(!response.has_payload());
        assert_eq!(consumer.metrics().failures, 1);
    }

    #[test]
    fn test_invoke_in_only_writes_nothing() {
        let mut config = SoapConsumerConfig::default();
        config.settings.exchange_pattern = ExchangePattern::InOnly;
        let factory = Arc::new(DefaultExchangeFactory::new());
        let consumer =
            SoapConsumer::new(config, Arc::new(ack)).with_exchange_factory(factory.clone());
        let mut response = WireResponse::new(SoapVersion::Soap11);
        consumer
            .invoke(soap_request(), &mut response, &TransportContext::new())
            .unwrap();
        assert!(!response.has_payload());
        assert!(response.header_attributes.is_empty());
        assert_eq!(factory.stats(), FactoryStats { created: 1, released: 1 });
    }

    #[test]
    fn test_invoke_without_outbound_writes_nothing() {
        let factory = Arc::new(DefaultExchangeFactory::new());
        let consumer = consumer(|_: &mut Exchange| {}).with_exchange_factory(factory.clone());
        let mut response = WireResponse::new(SoapVersion::Soap11);
        consumer
            .invoke(soap_request(), &mut response, &TransportContext::new())
            .unwrap();
        assert!(!response.has_payload());
        assert_eq!(factory.stats(), FactoryStats { created: 1, released: 1 });
    }

    #[test]
    fn test_invoke_unreadable_outbound_body_writes_nothing() {
        let consumer = consumer(|exchange: &mut Exchange| {
            exchange
                .outbound_mut()
                .set_body(Body::Text("<broken".to_string()));
        });
        let mut response = WireResponse::new(SoapVersion::Soap11);
        consumer
            .invoke(soap_request(), &mut response, &TransportContext::new())
            .unwrap();
        assert!(!response.has_payload());
    }

    #[test]
    fn test_invoke_missing_request_body_surfaces_on_read() {
        let consumer = consumer(|exchange: &mut Exchange| {
            let read = exchange.inbound().map(Message::body_document);
            if let Some(Err(e)) = read {
                exchange.set_failure(e);
            }
        });
        let request = WireRequest::parse_soap(
            br#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"/>"#,
            1 << 20,
        )
        .unwrap();
        let mut response = WireResponse::new(SoapVersion::Soap11);
        let err = consumer
            .invoke(request, &mut response, &TransportContext::new())
            .unwrap_err();
        assert_eq!(err.to_string(), SoapError::MissingBody.to_string());
    }

    #[test]
    fn test_breadcrumb_only_when_enabled() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder = {
            let seen = Arc::clone(&seen);
            move |exchange: &mut Exchange| {
                let crumb = exchange
                    .inbound()
                    .and_then(|m| m.header(BREADCRUMB_ID))
                    .and_then(HeaderValue::as_text)
                    .map(str::to_string);
                seen.lock().push(crumb);
            }
        };
        let context = TransportContext::new().with_transport_request(
            TransportRequest::new("POST", "/ws").with_header(BREADCRUMB_ID, "crumb-1"),
        );

        let disabled = SoapConsumer::new(SoapConsumerConfig::default(), Arc::new(recorder.clone()));
        let mut response = WireResponse::new(SoapVersion::Soap11);
        disabled.invoke(soap_request(), &mut response, &context).unwrap();

        let mut config = SoapConsumerConfig::default();
        config.settings.use_breadcrumb = true;
        let enabled = SoapConsumer::new(config, Arc::new(recorder));
        let mut response = WireResponse::new(SoapVersion::Soap11);
        enabled.invoke(soap_request(), &mut response, &context).unwrap();

        assert_eq!(*seen.lock(), vec![None, Some("crumb-1".to_string())]);
    }

    #[test]
    fn test_release_once_on_every_path() {
        let factory = Arc::new(DefaultExchangeFactory::new());
        let failing = consumer(|exchange: &mut Exchange| exchange.set_failure(anyhow::anyhow!("x")))
            .with_exchange_factory(factory.clone());
        let ok = consumer(ack).with_exchange_factory(factory.clone());
        let context = TransportContext::new();

        let mut response = WireResponse::new(SoapVersion::Soap11);
        assert!(failing.invoke(soap_request(), &mut response, &context).is_err());
        assert_eq!(factory.stats().released, 1);

        let mut response = WireResponse::new(SoapVersion::Soap11);
        ok.invoke(soap_request(), &mut response, &context).unwrap();
        assert_eq!(factory.stats().created, 2);
        assert_eq!(factory.stats().released, 2);
    }

    #[test]
    fn test_release_on_processor_panic() {
        let factory = Arc::new(DefaultExchangeFactory::new());
        let consumer = consumer(|_: &mut Exchange| panic!("processor blew up"))
            .with_exchange_factory(factory.clone());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut response = WireResponse::new(SoapVersion::Soap11);
            consumer.invoke(soap_request(), &mut response, &TransportContext::new())
        }));
        assert!(result.is_err());
        assert_eq!(factory.stats(), FactoryStats { created: 1, released: 1 });
    }

    #[test]
    fn test_pooled_exchange_reuses_inbound_message() {
        let factory = Arc::new(PooledExchangeFactory::new(1));
        let ids = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let recorder = {
            let ids = Arc::clone(&ids);
            move |exchange: &mut Exchange| {
                if let Some(inbound) = exchange.inbound() {
                    ids.lock().push(inbound.id());
                }
                ack(exchange);
            }
        };
        let consumer = consumer(recorder).with_exchange_factory(factory.clone());

        for _ in 0..2 {
            let mut response = WireResponse::new(SoapVersion::Soap11);
            consumer
                .invoke(soap_request(), &mut response, &TransportContext::new())
                .unwrap();
            assert_eq!(response.payload(), b"<ack/>");
        }

        let ids = ids.lock();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
        assert_eq!(factory.pooled(), 1);
    }

    // --- Registration ---

    #[test]
    fn test_start_stop_without_mapping_is_noop() {
        let consumer = Arc::new(consumer(ack));
        consumer.start().unwrap();
        consumer.stop().unwrap();
    }

    #[test]
    fn test_start_requires_mapping_key() {
        let mapping = Arc::new(InMemoryEndpointMapping::new());
        let consumer = Arc::new(consumer(ack).with_endpoint_mapping(mapping.clone()));
        assert!(matches!(consumer.start(), Err(SoapError::Config(_))));
        assert!(mapping.is_empty());
    }

    #[test]
    fn test_start_registers_and_stop_unregisters() {
        let key = EndpointMappingKey::new(EndpointMappingKeyType::UriPath, "/ws/*");
        let mut config = SoapConsumerConfig::default();
        config.endpoint.mapping_key = Some(key.clone());
        let mapping = Arc::new(InMemoryEndpointMapping::new());
        let consumer = Arc::new(
            SoapConsumer::new(config, Arc::new(ack)).with_endpoint_mapping(mapping.clone()),
        );

        consumer.start().unwrap();
        assert!(mapping.contains(&key));

        let context = TransportContext::new()
            .with_transport_request(TransportRequest::new("POST", "/ws/ping"));
        let endpoint = mapping.resolve(&soap_request(), &context).unwrap();
        let mut response = WireResponse::new(SoapVersion::Soap11);
        endpoint.invoke(soap_request(), &mut response, &context).unwrap();
        assert_eq!(response.payload(), b"<ack/>");

        consumer.stop().unwrap();
        assert!(!mapping.contains(&key));
    }
}
