//! Breadcrumb (correlation id) extraction from transport headers.

use crate::exchange::{Exchange, BREADCRUMB_ID};
use crate::wire::{TransportContext, WireRequest};
use tracing::debug;

/// Find the breadcrumb id for a request.
///
/// MIME-packaged requests are only looked up in their MIME headers, taking
/// the first value when several are present. Any other request is looked up
/// in the HTTP request carried by the transport context; without one there
/// is no breadcrumb.
pub fn extract_breadcrumb(request: &WireRequest, context: &TransportContext) -> Option<String> {
    match request {
        WireRequest::Mime(message) => message
            .mime_headers
            .get_all(BREADCRUMB_ID)
            .first()
            .map(|value| value.to_string()),
        WireRequest::Soap(_) | WireRequest::Plain(_) => match context.transport_request() {
            Some(transport) => transport.header(BREADCRUMB_ID).map(str::to_string),
            None => {
                debug!("No transport request in context, no breadcrumb available");
                None
            }
        },
    }
}

/// Set the breadcrumb id on the inbound message when one is found.
pub fn populate_breadcrumb(exchange: &mut Exchange, request: &WireRequest, context: &TransportContext) {
    if let Some(breadcrumb) = extract_breadcrumb(request, context) {
        debug!(
            exchange_id = %exchange.id(),
            breadcrumb_id = %breadcrumb,
            "Propagating breadcrumb"
        );
        exchange.inbound_mut().set_header(BREADCRUMB_ID, breadcrumb);
    }
}
