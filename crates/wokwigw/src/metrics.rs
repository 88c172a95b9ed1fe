use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Sessions
    sessions_active: AtomicU64,
    sessions_total: AtomicU64,
    sessions_failed_total: AtomicU64,

    // Admission
    admission_denied_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.inner.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self, failed: bool) {
        self.inner.sessions_active.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.inner
                .sessions_failed_total
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn admission_denied(&self) {
        self.inner
            .admission_denied_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_active(&self) -> u64 {
        self.inner.sessions_active.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        let sessions_active = self.inner.sessions_active.load(Ordering::Relaxed);
        let sessions_total = self.inner.sessions_total.load(Ordering::Relaxed);
        let sessions_failed_total = self.inner.sessions_failed_total.load(Ordering::Relaxed);
        let admission_denied_total = self.inner.admission_denied_total.load(Ordering::Relaxed);

        let mut out = String::new();

        push_gauge(&mut out, "wokwigw_sessions_active", sessions_active);
        push_counter(&mut out, "wokwigw_sessions_total", sessions_total);
        push_counter(&mut out, "wokwigw_sessions_failed_total", sessions_failed_total);

        push_counter(&mut out, "wokwigw_admission_denied_total", admission_denied_total);

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "gauge", val);
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    push_metric(out, name, "counter", val);
}

fn push_metric(out: &mut String, name: &str, kind: &str, val: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push(' ');
    out.push_str(kind);
    out.push('\n');
    out.push_str(name);
    out.push(' ');
    out.push_str(&val.to_string());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prometheus_text() {
        let metrics = Metrics::new();
        metrics.session_opened();
        metrics.session_opened();
        metrics.session_closed(true);
        metrics.admission_denied();

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE wokwigw_sessions_active gauge\nwokwigw_sessions_active 1\n"));
        assert!(text.contains("wokwigw_sessions_total 2\n"));
        assert!(text.contains("wokwigw_sessions_failed_total 1\n"));
        assert!(text.contains("# TYPE wokwigw_admission_denied_total counter\n"));
        assert_eq!(metrics.sessions_active(), 1);
    }
}
