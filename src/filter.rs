//! Response message filters, applied before the body is serialized.

use crate::config::{FilterConfig, FilterKind};
use crate::document::{is_xml_name, QualifiedName, XmlAttribute};
use crate::exchange::{Exchange, HeaderValue, BREADCRUMB_ID, SOAP_HEADER_SOURCE};
use crate::wire::{Attachment, WireResponse};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Adjusts the wire response from the exchange. Filters see headers,
/// properties and attachments, never the body.
pub trait MessageFilter: Send + Sync {
    fn filter_consumer(&self, exchange: &Exchange, response: &mut WireResponse);
}

/// Leaves the response untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityFilter;

impl MessageFilter for IdentityFilter {
    fn filter_consumer(&self, _exchange: &Exchange, _response: &mut WireResponse) {}
}

/// Copies text headers of the response message as SOAP Header attributes
/// and its attachments as MIME attachments. Headers whose names are not
/// valid XML names are skipped. The response message is the
/// outbound message, or the inbound one when the pipeline set none.
#[derive(Debug, Clone)]
pub struct BasicMessageFilter {
    excluded: HashSet<String>,
    propagate_breadcrumb: bool,
}

impl BasicMessageFilter {
    pub fn new(exclude_headers: &[String], propagate_breadcrumb: bool) -> Self {
        let mut excluded: HashSet<String> =
            exclude_headers.iter().map(|h| h.to_lowercase()).collect();
        excluded.insert(SOAP_HEADER_SOURCE.to_lowercase());
        excluded.insert(BREADCRUMB_ID.to_lowercase());
        Self {
            excluded,
            propagate_breadcrumb,
        }
    }

    fn is_excluded(&self, key: &str) -> bool {
        self.excluded.contains(&key.to_lowercase())
    }
}

impl Default for BasicMessageFilter {
    fn default() -> Self {
        Self::new(&[], true)
    }
}

impl MessageFilter for BasicMessageFilter {
    fn filter_consumer(&self, exchange: &Exchange, response: &mut WireResponse) {
        let Some(message) = exchange.outbound().or(exchange.inbound()) else {
            return;
        };

        let mut attributes: Vec<(&str, &str)> = message
            .headers()
            .iter()
            .filter(|(key, _)| !self.is_excluded(key))
            .filter_map(|(key, value)| value.as_text().map(|text| (key.as_str(), text)))
            .filter(|(key, _)| {
                let valid = is_xml_name(key);
                if !valid {
                    debug!(header = %key, "Header name is not an XML name, not copied");
                }
                valid
            })
            .collect();
        attributes.sort_unstable();
        for (key, value) in attributes {
            response
                .header_attributes
                .push(XmlAttribute::new(QualifiedName::local(key), value));
        }

        if let Some(attachments) = message.attachments() {
            let mut entries: Vec<_> = attachments.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            for (content_id, data) in entries {
                response
                    .attachments
                    .push(Attachment::new(content_id, data.clone()));
            }
        }

        if self.propagate_breadcrumb {
            let breadcrumb = exchange
                .inbound()
                .and_then(|m| m.header(BREADCRUMB_ID))
                .and_then(HeaderValue::as_text);
            if let Some(breadcrumb) = breadcrumb {
                response.transport_headers.set(BREADCRUMB_ID, breadcrumb);
            }
        }
    }
}

/// Build the filter selected by configuration.
pub fn message_filter_from_config(config: &FilterConfig) -> Arc<dyn MessageFilter> {
    match config.kind {
        FilterKind::Basic => Arc::new(BasicMessageFilter::new(
            &config.exclude_headers,
            config.propagate_breadcrumb,
        )),
        FilterKind::Identity => Arc::new(IdentityFilter),
    }
}
