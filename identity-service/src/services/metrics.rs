use prometheus::{Encoder, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Metrics
pub static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static OUTBOX_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static INBOX_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static AUTH_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Registers every collector once. Later calls are no-ops.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "path", "status"],
    )?;
    let request_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        ),
        &["method", "path", "status"],
    )?;
    let outbox_events = IntCounterVec::new(
        Opts::new("outbox_events_total", "Outbox rows settled by the relay"),
        &["topic", "outcome"],
    )?;
    let inbox_events = IntCounterVec::new(
        Opts::new("inbox_events_total", "Inbox rows settled by the projector"),
        &["event_type", "outcome"],
    )?;
    let auth_operations = IntCounterVec::new(
        Opts::new("auth_operations_total", "Session authority operations"),
        &["operation", "outcome"],
    )?;

    registry.register(Box::new(requests_total.clone()))?;
    registry.register(Box::new(request_duration.clone()))?;
    registry.register(Box::new(outbox_events.clone()))?;
    registry.register(Box::new(inbox_events.clone()))?;
    registry.register(Box::new(auth_operations.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = HTTP_REQUESTS_TOTAL.set(requests_total);
    let _ = HTTP_REQUEST_DURATION_SECONDS.set(request_duration);
    let _ = OUTBOX_EVENTS_TOTAL.set(outbox_events);
    let _ = INBOX_EVENTS_TOTAL.set(inbox_events);
    let _ = AUTH_OPERATIONS_TOTAL.set(auth_operations);

    Ok(())
}

pub fn record_outbox_event(topic: &str, outcome: &str) {
    if let Some(counter) = OUTBOX_EVENTS_TOTAL.get() {
        counter.with_label_values(&[topic, outcome]).inc();
    }
}

pub fn record_inbox_event(event_type: &str, outcome: &str) {
    if let Some(counter) = INBOX_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type, outcome]).inc();
    }
}

pub fn record_auth_operation<T, E>(operation: &str, result: &Result<T, E>) {
    if let Some(counter) = AUTH_OPERATIONS_TOTAL.get() {
        let outcome = if result.is_ok() { "success" } else { "failure" };
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() -> Result<(), prometheus::Error> {
        init_metrics()?;
        init_metrics()?;

        record_outbox_event("accounts.v1", "published");
        record_inbox_event("organization_member.created", "done");
        record_auth_operation::<(), ()>("login", &Ok(()));

        let text = get_metrics();
        assert!(text.contains("outbox_events_total"));
        assert!(text.contains("inbox_events_total"));
        assert!(text.contains("auth_operations_total"));
        Ok(())
    }
}
