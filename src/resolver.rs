//! Picks the API port out of a candidate set by probing each one in order.

use crate::api::QuotaTransport;

/// Probe `candidates` strictly in order and return the first port that
/// answers HTTP 200. Sequential on purpose: parallel speculative connections
/// would hammer the server and make test behavior nondeterministic.
///
/// When every probe fails, `fallback` (the `--extension_server_port` value)
/// is returned unprobed as a best-effort degraded path.
pub async fn resolve(
    transport: &dyn QuotaTransport,
    candidates: &[u16],
    fallback: Option<u16>,
    csrf_token: &str,
) -> Option<u16> {
    for &port in candidates {
        if transport.probe(port, csrf_token).await {
            tracing::info!("working API port found: {port}");
            return Some(port);
        }
        tracing::debug!("port {port} did not answer the probe");
    }

    if let Some(port) = fallback {
        tracing::info!("all probes failed; falling back to extension port {port}");
        return Some(port);
    }

    None
}
