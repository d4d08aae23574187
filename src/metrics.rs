use prometheus::{
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use lazy_static::lazy_static;
use actix_web::{HttpResponse, Responder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Request metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "module", "status"]
    ).unwrap();

    pub static ref HTTP_REQUEST_DURATION: HistogramVec = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        ),
        &["method", "module"]
    ).unwrap();

    // Authentication metrics
    pub static ref AUTH_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("auth_attempts_total", "Total authentication attempts"),
        &["result"] // "success", "failure" or "locked"
    ).unwrap();

    // Outbound integrations
    pub static ref OPENEMR_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("openemr_requests_total", "Requests sent to OpenEMR"),
        &["resource", "result"]
    ).unwrap();

    pub static ref ZOOM_MEETINGS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("zoom_meetings_total", "Zoom meeting creation attempts"),
        &["result"]
    ).unwrap();

    // Telehealth
    pub static ref TELEHEALTH_SESSIONS_CREATED: IntCounterVec = IntCounterVec::new(
        Opts::new("telehealth_sessions_created_total", "Telehealth sessions created"),
        &["platform"]
    ).unwrap();

    pub static ref TELEHEALTH_FALLBACKS: IntCounter = IntCounter::new(
        "telehealth_fallbacks_total",
        "Sessions that fell back from Zoom to WebRTC"
    ).unwrap();

    // Background jobs
    pub static ref JOBS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("jobs_processed_total", "Background jobs processed"),
        &["job", "result"]
    ).unwrap();

    pub static ref JOBS_QUEUED: IntGauge = IntGauge::new(
        "jobs_queued",
        "Background jobs waiting for the worker"
    ).unwrap();

    // Journal NLP
    pub static ref JOURNAL_CLINICAL_FLAGS: IntCounterVec = IntCounterVec::new(
        Opts::new("journal_clinical_flags_total", "Clinical flags raised by journal analysis"),
        &["category"]
    ).unwrap();

    // Cache metrics
    pub static ref CACHE_HITS: IntCounter = IntCounter::new(
        "cache_hits_total",
        "Total cache hits"
    ).unwrap();

    pub static ref CACHE_MISSES: IntCounter = IntCounter::new(
        "cache_misses_total",
        "Total cache misses"
    ).unwrap();

    // SSE metrics
    pub static ref SSE_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "sse_connections_active",
        "Number of active SSE connections"
    ).unwrap();

    pub static ref SSE_EVENTS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("sse_events_sent_total", "Total SSE events sent"),
        &["event_type"]
    ).unwrap();
}

/// Initialize Prometheus metrics
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(HTTP_REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(AUTH_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(OPENEMR_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ZOOM_MEETINGS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TELEHEALTH_SESSIONS_CREATED.clone()))?;
    REGISTRY.register(Box::new(TELEHEALTH_FALLBACKS.clone()))?;
    REGISTRY.register(Box::new(JOBS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(JOBS_QUEUED.clone()))?;
    REGISTRY.register(Box::new(JOURNAL_CLINICAL_FLAGS.clone()))?;
    REGISTRY.register(Box::new(CACHE_HITS.clone()))?;
    REGISTRY.register(Box::new(CACHE_MISSES.clone()))?;
    REGISTRY.register(Box::new(SSE_CONNECTIONS_ACTIVE.clone()))?;
    REGISTRY.register(Box::new(SSE_EVENTS_SENT.clone()))?;

    Ok(())
}

/// Map a request path to the module label so metric cardinality stays bounded.
pub fn module_label(path: &str) -> &'static str {
    let mut parts = path.trim_start_matches('/').split('/');
    match (parts.next(), parts.next()) {
        (Some("api"), Some("auth")) => "accounts",
        (Some("api"), Some("emr")) => "emr",
        (Some("api"), Some("journal")) => "journal",
        (Some("api"), Some("messaging")) => "messaging",
        (Some("api"), Some("telehealth")) => "telehealth",
        (Some("health"), _) | (Some("metrics"), _) => "ops",
        _ => "other",
    }
}

/// Prometheus metrics endpoint handler
pub async fn metrics_handler() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(format!("Failed to encode metrics: {}", e));
    }

    match String::from_utf8(buffer) {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(metrics),
        Err(e) => HttpResponse::InternalServerError().body(format!("Failed to convert metrics: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        // Registration is global; a second call from another test reports AlreadyReg.
        match init_metrics() {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_http_requests_counter() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "journal", "200"])
            .inc();

        let metric = HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "journal", "200"])
            .get();

        assert!(metric >= 1);
    }

    #[test]
    fn test_module_label() {
        assert_eq!(module_label("/api/telehealth/sessions/"), "telehealth");
        assert_eq!(module_label("/api/auth/login"), "accounts");
        assert_eq!(module_label("/health"), "ops");
        assert_eq!(module_label("/favicon.ico"), "other");
    }
}
