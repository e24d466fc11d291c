use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "terrace_push_http_requests_total",
            "Total HTTP requests handled by terrace-push",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create terrace_push_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register terrace_push_http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "terrace_push_http_request_duration_seconds",
            "HTTP request latency for terrace-push",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("failed to create terrace_push_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register terrace_push_http_request_duration_seconds");
    histogram
});

static SSE_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "terrace_push_sse_connections_active",
        "Currently attached SSE connections",
    )
    .expect("failed to create terrace_push_sse_connections_active");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register terrace_push_sse_connections_active");
    gauge
});

static NOTIFICATIONS_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "terrace_push_notifications_delivered_total",
        "Envelopes written to live connections by dispatches",
    )
    .expect("failed to create terrace_push_notifications_delivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register terrace_push_notifications_delivered_total");
    counter
});

static DELIVERY_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "terrace_push_delivery_failures_total",
        "Sink writes that failed during a dispatch",
    )
    .expect("failed to create terrace_push_delivery_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register terrace_push_delivery_failures_total");
    counter
});

static BACKLOG_SAVED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "terrace_push_backlog_saved_total",
        "Pending notifications persisted for offline users",
    )
    .expect("failed to create terrace_push_backlog_saved_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register terrace_push_backlog_saved_total");
    counter
});

static BACKLOG_REDELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "terrace_push_backlog_redelivered_total",
        "Pending notifications redelivered after a reconnect",
    )
    .expect("failed to create terrace_push_backlog_redelivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register terrace_push_backlog_redelivered_total");
    counter
});

static BACKLOG_PURGED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "terrace_push_backlog_purged_total",
        "Expired pending notifications removed by the sweep",
    )
    .expect("failed to create terrace_push_backlog_purged_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register terrace_push_backlog_purged_total");
    counter
});

static REDELIVERY_TICKS_SKIPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "terrace_push_redelivery_ticks_skipped_total",
        "Reconciliation ticks skipped because a pass was still running",
    )
    .expect("failed to create terrace_push_redelivery_ticks_skipped_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register terrace_push_redelivery_ticks_skipped_total");
    counter
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub fn client_connected() {
    SSE_CONNECTIONS_ACTIVE.inc();
}

pub fn client_disconnected() {
    SSE_CONNECTIONS_ACTIVE.dec();
}

pub fn record_delivered(count: u64) {
    NOTIFICATIONS_DELIVERED_TOTAL.inc_by(count);
}

pub fn record_delivery_failures(count: u64) {
    DELIVERY_FAILURES_TOTAL.inc_by(count);
}

pub fn record_backlog_saved(count: u64) {
    BACKLOG_SAVED_TOTAL.inc_by(count);
}

pub fn record_backlog_redelivered(count: u64) {
    BACKLOG_REDELIVERED_TOTAL.inc_by(count);
}

pub fn record_backlog_purged(count: u64) {
    BACKLOG_PURGED_TOTAL.inc_by(count);
}

pub fn record_skipped_tick() {
    REDELIVERY_TICKS_SKIPPED_TOTAL.inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::time::Instant;

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let path = req.path().to_string();
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let elapsed = start.elapsed();
            match &result {
                Ok(response) => {
                    observe_http_request(&method, &path, response.status().as_u16(), elapsed);
                }
                Err(_) => {
                    observe_http_request(&method, &path, 500, elapsed);
                }
            }
            result
        })
    }
}
