use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::StatusCode;

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    requests_total: AtomicU64,
    forwarded_total: AtomicU64,
    enforced_total: AtomicU64,
    unauthenticated_total: AtomicU64,
    unknown_agent_total: AtomicU64,
    bad_request_total: AtomicU64,
    no_backend_total: AtomicU64,
    upstream_error_total: AtomicU64,
    internal_error_total: AtomicU64,
}

impl GatewayMetrics {
    pub fn observe_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_forwarded(&self, enforced: bool) {
        self.forwarded_total.fetch_add(1, Ordering::Relaxed);
        if enforced {
            self.enforced_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn observe_rejected(&self, status: StatusCode) {
        let counter = match status {
            StatusCode::UNAUTHORIZED => &self.unauthenticated_total,
            StatusCode::NOT_FOUND => &self.unknown_agent_total,
            StatusCode::BAD_REQUEST => &self.bad_request_total,
            StatusCode::NOT_ACCEPTABLE => &self.no_backend_total,
            StatusCode::BAD_GATEWAY => &self.upstream_error_total,
            _ => &self.internal_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics_text(&self) -> String {
        let counters = [
            ("tenancy_gateway_requests_total", &self.requests_total),
            ("tenancy_gateway_forwarded_total", &self.forwarded_total),
            ("tenancy_gateway_enforced_total", &self.enforced_total),
            ("tenancy_gateway_unauthenticated_total", &self.unauthenticated_total),
            ("tenancy_gateway_unknown_agent_total", &self.unknown_agent_total),
            ("tenancy_gateway_bad_request_total", &self.bad_request_total),
            ("tenancy_gateway_no_backend_total", &self.no_backend_total),
            ("tenancy_gateway_upstream_error_total", &self.upstream_error_total),
            ("tenancy_gateway_internal_error_total", &self.internal_error_total),
        ];
        let mut out = String::new();
        for (name, value) in counters {
            out.push_str(&format!(
                "# TYPE {name} counter\n{name} {}\n",
                value.load(Ordering::Relaxed)
            ));
        }
        out
    }
}
