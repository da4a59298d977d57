//! Zentinel inbound SOAP adapter binary.
//!
//! Run with: `zentinel-soap-inbound --config config.yaml request.xml`
//!
//! Feeds one SOAP request through a consumer wired to an echo pipeline and
//! prints the response envelope (or a SOAP Fault) to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_soap_inbound::config::SoapVersion;
use zentinel_soap_inbound::error::soap_fault_response;
use zentinel_soap_inbound::exchange::{Body, BREADCRUMB_ID};
use zentinel_soap_inbound::mapping::{
    EndpointMappingKey, EndpointMappingKeyType, InMemoryEndpointMapping,
};
use zentinel_soap_inbound::wire::{Attachment, DataHandle, MimeHeaders, TransportRequest};
use zentinel_soap_inbound::{
    Exchange, SoapConsumer, SoapConsumerConfig, SoapError, TransportContext, WireRequest,
    WireResponse,
};

/// Inbound SOAP adapter for Zentinel proxy.
///
/// Parses a SOAP request, runs it through the consumer with an echo
/// pipeline and writes the resulting envelope to stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// SOAP request file
    request: PathBuf,

    /// MIME attachment as `content-id=path[:content-type]` (repeatable)
    #[arg(short, long = "attachment")]
    attachments: Vec<String>,

    /// Breadcrumb id sent with the request
    #[arg(long)]
    breadcrumb: Option<String>,

    /// SOAPAction header value
    #[arg(long)]
    soap_action: Option<String>,

    /// Request URI
    #[arg(long, default_value = "/")]
    uri: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout carries only the envelope
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting Zentinel SOAP inbound adapter v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());

    let mut config = if args.config.exists() {
        let content = tokio::fs::read_to_string(&args.config)
            .await
            .context("Failed to read config file")?;
        SoapConsumerConfig::from_yaml_str(&content).context("Failed to parse config file")?
    } else {
        info!("Config file not found, using defaults");
        SoapConsumerConfig::default()
    };
    if config.endpoint.mapping_key.is_none() {
        config.endpoint.mapping_key = Some(EndpointMappingKey::new(
            EndpointMappingKeyType::UriPath,
            "*",
        ));
    }

    info!(
        use_breadcrumb = config.settings.use_breadcrumb,
        exchange_pattern = ?config.settings.exchange_pattern,
        filter = ?config.filter.kind,
        "Configuration loaded"
    );

    let request_body = tokio::fs::read(&args.request)
        .await
        .with_context(|| format!("Failed to read request {}", args.request.display()))?;

    let mut attachments = Vec::with_capacity(args.attachments.len());
    for arg in &args.attachments {
        attachments.push(load_attachment(arg).await?);
    }

    let mut transport = TransportRequest::new("POST", args.uri.as_str())
        .with_header("Content-Type", SoapVersion::default().content_type());
    if let Some(action) = &args.soap_action {
        transport = transport.with_header("SOAPAction", format!("\"{}\"", action));
    }
    if let Some(breadcrumb) = &args.breadcrumb {
        transport = transport.with_header(BREADCRUMB_ID, breadcrumb.as_str());
    }
    let context = TransportContext::new().with_transport_request(transport);

    let max_body_size = config.settings.max_body_size;
    let request = if attachments.is_empty() {
        WireRequest::parse_soap(&request_body, max_body_size)
    } else {
        let mut mime_headers = MimeHeaders::new();
        if let Some(breadcrumb) = &args.breadcrumb {
            mime_headers.add(BREADCRUMB_ID, breadcrumb.as_str());
        }
        WireRequest::mime(&request_body, mime_headers, attachments, max_body_size)
    };
    let request = match request {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected request");
            println!("{}", soap_fault_response(&e, SoapVersion::default()));
            return Ok(());
        }
    };
    let version = request.version().unwrap_or_default();

    let mapping = Arc::new(InMemoryEndpointMapping::new());
    let consumer = Arc::new(
        SoapConsumer::new(config, Arc::new(echo)).with_endpoint_mapping(mapping.clone()),
    );
    consumer.start().context("Failed to register consumer")?;

    // The pipeline is synchronous, keep it off the async workers
    let outcome = tokio::task::spawn_blocking(move || {
        let endpoint = mapping.resolve(&request, &context).ok_or_else(|| {
            SoapError::Mapping("no endpoint registered for request".to_string())
        })?;
        let mut response = WireResponse::new(version);
        endpoint.invoke(request, &mut response, &context)?;
        Ok::<_, SoapError>(response)
    })
    .await
    .context("Consumer task failed")?;

    match outcome.and_then(|response| response.to_envelope()) {
        Ok(envelope) => {
            println!("{}", String::from_utf8_lossy(&envelope));
        }
        Err(e) => {
            warn!(error = %e, client_fault = e.is_client_fault(), "Request failed");
            println!("{}", soap_fault_response(&e, version));
        }
    }

    let metrics = consumer.metrics();
    info!(
        invocations = metrics.invocations,
        failures = metrics.failures,
        "Consumer finished"
    );
    consumer.stop().context("Failed to unregister consumer")?;
    Ok(())
}

/// Echo pipeline: returns the request payload as the response body.
fn echo(exchange: &mut Exchange) {
    let body = match exchange.inbound().map(|m| m.body_document()) {
        Some(Ok(body)) => body,
        Some(Err(e)) => {
            exchange.set_failure(e);
            return;
        }
        None => None,
    };
    debug!(exchange_id = %exchange.id(), has_body = body.is_some(), "Echoing request");

    let outbound = exchange.outbound_mut();
    outbound.set_header("echoed", "true");
    if let Some(body) = body {
        outbound.set_body(Body::Document(body));
    }
}

/// Parse `content-id=path[:content-type]` and load the file.
async fn load_attachment(arg: &str) -> Result<Attachment> {
    let (content_id, rest) = arg
        .split_once('=')
        .with_context(|| format!("Invalid attachment '{}', expected id=path", arg))?;
    let (path, content_type) = match rest.rsplit_once(':') {
        Some((path, content_type)) if content_type.contains('/') => (path, content_type),
        _ => (rest, "application/octet-stream"),
    };
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read attachment {}", path))?;
    Ok(Attachment::new(content_id, DataHandle::new(content_type, data)))
}
