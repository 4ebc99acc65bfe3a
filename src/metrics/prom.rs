use prometheus::{Encoder, Registry, TextEncoder};

use crate::error::ExporterError;

/// Content type of the text exposition format.
pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}

/// Gathers every collector in `registry` and renders the text exposition format.
pub fn render_metrics(registry: &Registry) -> Result<String, ExporterError> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
