//! Synthetic trace generator for demos, benchmarks and tests.
//!
//! Produces a realistic mix of metric types for a handful of services so
//! the engine can be exercised without real collectors.

use crate::core::{MetricId, MetricType, Result, Trace};
use chrono::{Duration as ChronoDuration, Utc};
use rand::{thread_rng, Rng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time;

/// Metric identities and load profile of one synthetic service.
#[derive(Debug)]
struct ServiceProfile {
    weight: f64,
    error_rate: f64,
    base_latency_ms: i64,
    latency: MetricId,
    connections: MetricId,
    requests: MetricId,
    errors: MetricId,
    status: MetricId,
    events: MetricId,
    last_deploy: MetricId,
    bytes: MetricId,
    request_total: AtomicU64,
}

impl ServiceProfile {
    fn new(host: &str, service: &str, weight: f64, error_rate: f64, base_latency_ms: i64) -> Result<Self> {
        let ns = [host, service];
        Ok(Self {
            weight,
            error_rate,
            base_latency_ms,
            latency: MetricId::new(MetricType::LongAvg, ns, "latency-ms")?,
            connections: MetricId::new(MetricType::StickyIntAvg, ns, "active-connections")?,
            requests: MetricId::new(MetricType::DeltaLongAvg, ns, "requests")?,
            errors: MetricId::new(MetricType::IntervalIncident, ns, "errors")?,
            status: MetricId::new(MetricType::String, ns, "status")?,
            events: MetricId::new(MetricType::Strings, ns, "events")?,
            last_deploy: MetricId::new(MetricType::Timestamp, ns, "last-deploy")?,
            bytes: MetricId::new(MetricType::Bytes, ns, "payload-sample")?,
            request_total: AtomicU64::new(0),
        })
    }

    fn latency_ms(&self) -> i64 {
        let mut rng = thread_rng();
        let percentile: f64 = rng.gen();
        let base = self.base_latency_ms as f64;
        let ms = if percentile < 0.5 {
            base * percentile * 2.0
        } else if percentile < 0.95 {
            base * (1.0 + (percentile - 0.5) * 3.0)
        } else {
            // Tail, with occasional outliers
            let tail = base * 3.0 * (1.0 + (percentile - 0.95) * 20.0);
            if rng.gen::<f64>() < 0.01 {
                tail * 2.0
            } else {
                tail
            }
        };
        ms as i64
    }

    fn trace(&self) -> Trace {
        let mut rng = thread_rng();
        match rng.gen_range(0..100) {
            0..=49 => {
                let trace = Trace::long(self.latency.clone(), self.latency_ms());
                if rng.gen::<f64>() < self.error_rate {
                    trace.urgent()
                } else {
                    trace
                }
            }
            50..=64 => {
                let total = self
                    .request_total
                    .fetch_add(rng.gen_range(1..50), Ordering::Relaxed);
                Trace::long(self.requests.clone(), total as i64)
            }
            65..=74 => Trace::int(self.connections.clone(), rng.gen_range(0..500)),
            75..=84 => Trace::incident(self.errors.clone(), rng.gen_range(1..=3)),
            85..=89 => {
                let status = if rng.gen::<f64>() < self.error_rate * 10.0 {
                    "degraded"
                } else {
                    "ok"
                };
                Trace::text(self.status.clone(), status)
            }
            90..=94 => {
                const EVENTS: [&str; 5] = ["gc", "cache-miss", "retry", "reconnect", "rebalance"];
                Trace::text(self.events.clone(), EVENTS[rng.gen_range(0..EVENTS.len())])
            }
            95..=97 => {
                let ago = ChronoDuration::minutes(rng.gen_range(0..600));
                Trace::timestamp(self.last_deploy.clone(), Utc::now() - ago)
            }
            _ => {
                let payload: Vec<u8> = (0..rng.gen_range(4..32)).map(|_| rng.gen()).collect();
                Trace::bytes(self.bytes.clone(), payload)
            }
        }
    }
}

/// Generator of synthetic traces.
pub struct TraceGenerator {
    services: Vec<ServiceProfile>,
    running: Arc<RwLock<bool>>,
}

impl TraceGenerator {
    /// Create a generator with the default service mix.
    pub fn new() -> Result<Self> {
        let services = vec![
            ServiceProfile::new("web-01", "api-gateway", 50.0, 0.001, 20)?,
            ServiceProfile::new("web-01", "user-service", 30.0, 0.002, 15)?,
            ServiceProfile::new("app-01", "order-service", 25.0, 0.005, 30)?,
            ServiceProfile::new("app-02", "payment-service", 15.0, 0.02, 100)?,
            ServiceProfile::new("db-01", "inventory-service", 40.0, 0.003, 10)?,
        ];

        Ok(Self {
            services,
            running: Arc::new(RwLock::new(false)),
        })
    }

    /// Select a service weighted by its load share.
    fn select_service(&self) -> &ServiceProfile {
        let total: f64 = self.services.iter().map(|s| s.weight).sum();
        let mut selection = thread_rng().gen::<f64>() * total;

        for service in &self.services {
            selection -= service.weight;
            if selection <= 0.0 {
                return service;
            }
        }
        &self.services[0]
    }

    /// Generate one trace
    pub fn generate_trace(&self) -> Trace {
        self.select_service().trace()
    }

    /// Generate a batch of traces.
    pub fn generate_batch(&self, count: usize) -> Vec<Trace> {
        (0..count).map(|_| self.generate_trace()).collect()
    }

    /// Every metric id this generator can produce
    pub fn metric_ids(&self) -> Vec<MetricId> {
        self.services
            .iter()
            .flat_map(|s| {
                [
                    s.latency.clone(),
                    s.connections.clone(),
                    s.requests.clone(),
                    s.errors.clone(),
                    s.status.clone(),
                    s.events.clone(),
                    s.last_deploy.clone(),
                    s.bytes.clone(),
                ]
            })
            .collect()
    }

    /// Generate traces at `rate` per second until [`stop`](Self::stop) is called.
    pub async fn run<F>(&self, rate: u32, mut callback: F)
    where
        F: FnMut(Trace) + Send,
    {
        *self.running.write().await = true;

        // Emit in ticks of at most 10ms so high rates do not need tiny intervals
        let ticks_per_second = rate.clamp(1, 100);
        let per_tick = (rate / ticks_per_second).max(1) as usize;
        let mut interval = time::interval(Duration::from_secs(1) / ticks_per_second);

        while *self.running.read().await {
            interval.tick().await;
            for _ in 0..per_tick {
                callback(self.generate_trace());
            }
        }
    }

    /// Stop continuous generation.
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    /// Check if the generator is running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}
