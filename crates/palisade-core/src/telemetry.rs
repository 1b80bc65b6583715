//! Prometheus metrics plumbing.
//!
//! Counters and histograms are emitted through the `metrics` facade at the
//! call sites; this module owns the recorder and renders the text
//! exposition for `GET /metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Telemetry {
    handle: PrometheusHandle,
}

impl Telemetry {
    /// Install the global Prometheus recorder.  Call once at boot; a
    /// second install (tests, embedded setups) falls back to a detached
    /// recorder handle so rendering still works.
    pub fn install() -> Self {
        let builder = PrometheusBuilder::new();
        let handle = match builder.install_recorder() {
            Ok(handle) => handle,
            Err(_) => PrometheusBuilder::new()
                .build_recorder()
                .handle(),
        };
        Self { handle }
    }

    /// Prometheus text exposition (version 0.0.4).
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent_and_renders() {
        let a = Telemetry::install();
        let b = Telemetry::install();
        metrics::counter!("palisade_test_counter_total").increment(1);
        // Either the first or the fallback handle must render without panic.
        let _ = a.render();
        let _ = b.render();
    }
}
