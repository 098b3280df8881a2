use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static JOBS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static STAGE_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static FALLBACKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static JOBS_IN_FLIGHT: OnceLock<IntGauge> = OnceLock::new();

/// Register the pipeline metrics. Safe to call more than once.
pub fn init_metrics() -> prometheus::Result<()> {
    if JOBS_TOTAL.get().is_none() {
        let counter = IntCounterVec::new(
            prometheus::opts!("analysis_jobs_total", "Analysis job attempts by outcome"),
            &["outcome"],
        )?;
        if JOBS_TOTAL.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter)).ok();
        }
    }

    if STAGE_SECONDS.get().is_none() {
        let histogram = HistogramVec::new(
            HistogramOpts::new("analysis_stage_seconds", "Wall time spent per pipeline stage")
                .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0]),
            &["stage"],
        )?;
        if STAGE_SECONDS.set(histogram.clone()).is_ok() {
            REGISTRY.register(Box::new(histogram)).ok();
        }
    }

    if FALLBACKS_TOTAL.get().is_none() {
        let counter = IntCounterVec::new(
            prometheus::opts!("analysis_fallbacks_total", "Per-unit provider failures replaced by fallbacks"),
            &["stage"],
        )?;
        if FALLBACKS_TOTAL.set(counter.clone()).is_ok() {
            REGISTRY.register(Box::new(counter)).ok();
        }
    }

    if JOBS_IN_FLIGHT.get().is_none() {
        let gauge = IntGauge::new("analysis_jobs_in_flight", "Jobs currently held by a worker")?;
        if JOBS_IN_FLIGHT.set(gauge.clone()).is_ok() {
            REGISTRY.register(Box::new(gauge)).ok();
        }
    }

    Ok(())
}

pub fn inc_job(outcome: &str) {
    if let Some(counter) = JOBS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn observe_stage(stage: &str, seconds: f64) {
    if let Some(histogram) = STAGE_SECONDS.get() {
        histogram.with_label_values(&[stage]).observe(seconds);
    }
}

pub fn inc_fallback(stage: &str) {
    if let Some(counter) = FALLBACKS_TOTAL.get() {
        counter.with_label_values(&[stage]).inc();
    }
}

pub fn inc_in_flight() {
    if let Some(gauge) = JOBS_IN_FLIGHT.get() {
        gauge.inc();
    }
}

pub fn dec_in_flight() {
    if let Some(gauge) = JOBS_IN_FLIGHT.get() {
        gauge.dec();
    }
}

/// Render the registry in the Prometheus text exposition format.
pub fn render() -> prometheus::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_registry_contains_job_counter() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        inc_job("succeeded");
        observe_stage("embedding", 0.3);
        let text = render().unwrap();
        assert!(text.contains("analysis_jobs_total"));
        assert!(text.contains("analysis_stage_seconds"));
    }
}
