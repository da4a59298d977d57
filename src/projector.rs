//! Projection of wire SOAP headers and attachments onto the internal message.

use crate::exchange::{HeaderValue, Headers, Message, SOAP_HEADER_SOURCE};
use crate::wire::WireRequest;
use tracing::debug;

/// Copy the SOAP Header section into the header map.
///
/// Stores the raw section under [`SOAP_HEADER_SOURCE`], then each Header
/// attribute and each header element under its local name. Names from
/// different namespaces with the same local part overwrite each other; later
/// elements win.
pub fn project_soap_header(headers: &mut Headers, request: &WireRequest) {
    let Some(soap_header) = request.soap_header() else {
        return;
    };

    headers.insert(
        SOAP_HEADER_SOURCE.to_string(),
        HeaderValue::Source(soap_header.source().clone()),
    );

    for attribute in soap_header.attributes() {
        headers.insert(
            attribute.name.local_name.clone(),
            HeaderValue::Text(attribute.value.clone()),
        );
    }

    let mut elements = 0usize;
    for element in soap_header.header_elements() {
        headers.insert(
            element.local_name().to_string(),
            HeaderValue::Element(element.clone()),
        );
        elements += 1;
    }

    debug!(
        attributes = soap_header.attributes().count(),
        elements = elements,
        "Projected SOAP header"
    );
}

/// Copy MIME attachments onto the message, keyed by content id.
///
/// The attachment collection is only created once a first attachment is
/// found; duplicate content ids overwrite.
pub fn project_attachments(request: &WireRequest, message: &mut Message) {
    let Some(attachments) = request.attachments() else {
        return;
    };

    for attachment in attachments {
        message.add_attachment(attachment.content_id.clone(), attachment.data.clone());
    }
}
