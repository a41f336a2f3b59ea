//! In-memory stand-ins for Cloud Monitoring and the cluster

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use metrics_export_e2e::config::METRIC_TYPE_PREFIX;
use metrics_export_e2e::monitoring::{
    Clock, MetricSample, MetricSeries, MetricsBackend, TimeSeriesQuery,
};
use metrics_export_e2e::workload::{ResourceConsumerSpec, WorkloadHandle, WorkloadLifecycle};
use metrics_export_e2e::{Error, Result};

/// Fixed reference instant for fake samples
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Clock frozen at one instant
pub struct FrozenClock(pub DateTime<Utc>);

impl Clock for FrozenClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Clock that moves one second forward on every read
#[derive(Default)]
pub struct SteppingClock {
    next: AtomicI64,
}

impl SteppingClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Jump to `secs` past the reference instant
    pub fn advance_to(&self, secs: i64) {
        self.next.store(secs, Ordering::SeqCst);
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        at(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Monitoring backend whose contents tests mutate between polls
///
/// Series are keyed by metric name (without the type prefix). The filter of
/// each query is parsed back into a metric name, the way the real backend
/// would resolve `metric.type`.
#[derive(Default)]
pub struct FakeMonitoring {
    series: Mutex<HashMap<String, Vec<MetricSeries>>>,
    failure: Mutex<Option<String>>,
    queries: AtomicU32,
    windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    /// Number of queries after which `pending` is published
    publish_after: Mutex<Option<(u32, HashMap<String, Vec<MetricSeries>>)>>,
}

impl FakeMonitoring {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish one gauge series for `metric`
    pub fn publish(&self, metric: &str, points: &[(i64, f64)]) {
        self.series
            .lock()
            .unwrap()
            .entry(metric.to_string())
            .or_default()
            .push(gauge_series(metric, points));
    }

    /// Publish every metric in `names` with a single healthy sample
    pub fn publish_all(&self, names: &[&str], utilization: f64) {
        for name in names {
            let value = if *name == "cpu/utilization" {
                utilization
            } else {
                1.0
            };
            self.publish(name, &[(60, value)]);
        }
    }

    /// Make the data visible only after `queries` queries have been served
    pub fn publish_later(&self, queries: u32, names: &[&str], utilization: f64) {
        let staged = FakeMonitoring::default();
        staged.publish_all(names, utilization);
        let data = staged.series.into_inner().unwrap();
        *self.publish_after.lock().unwrap() = Some((queries, data));
    }

    /// Fail every query from now on
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn queries(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }

    /// `(start, end)` of every query served, in order
    pub fn windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.windows.lock().unwrap().clone()
    }
}

fn gauge_series(metric: &str, points: &[(i64, f64)]) -> MetricSeries {
    MetricSeries {
        metric_type: format!("{}{}", METRIC_TYPE_PREFIX, metric),
        resource_type: "gke_container".to_string(),
        resource_labels: [(
            "container_name".to_string(),
            "resource-consumer".to_string(),
        )]
        .into_iter()
        .collect(),
        points: points
            .iter()
            .map(|&(t, v)| MetricSample::gauge(at(t), v))
            .collect(),
        ..Default::default()
    }
}

/// Pull the metric name out of `metric.type="<prefix><name>" AND ...`
fn metric_name(filter: &str) -> Option<&str> {
    let rest = filter.strip_prefix(r#"metric.type=""#)?;
    let metric_type = &rest[..rest.find('"')?];
    metric_type.strip_prefix(METRIC_TYPE_PREFIX)
}

#[async_trait]
impl MetricsBackend for FakeMonitoring {
    async fn list_time_series(&self, query: &TimeSeriesQuery) -> Result<Vec<MetricSeries>> {
        let served = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
        self.windows.lock().unwrap().push((query.start, query.end));

        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(Error::monitoring_api(503, message));
        }

        {
            let mut staged = self.publish_after.lock().unwrap();
            if staged.as_ref().is_some_and(|(after, _)| served > *after) {
                if let Some((_, data)) = staged.take() {
                    self.series.lock().unwrap().extend(data);
                }
            }
        }

        let name = metric_name(&query.filter)
            .ok_or_else(|| Error::monitoring_api(400, format!("bad filter: {}", query.filter)))?;
        if !query.filter.contains(r#"resource.label.container_name="resource-consumer""#) {
            return Ok(vec![]);
        }

        Ok(self
            .series
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Records what the scenario did with its workload
#[derive(Default)]
pub struct WorkloadRecord {
    pub created: Mutex<Vec<ResourceConsumerSpec>>,
    pub waited_for: Mutex<Vec<i32>>,
    pub cleaned_up: AtomicBool,
}

/// Workload lifecycle that never talks to a cluster
pub struct FakeWorkloads {
    pub record: Arc<WorkloadRecord>,
    pub ready: bool,
    /// Clock moved forward while waiting for replicas
    pub wait_advances: Option<(Arc<SteppingClock>, i64)>,
}

impl FakeWorkloads {
    pub fn ready() -> (Arc<Self>, Arc<WorkloadRecord>) {
        let record = Arc::new(WorkloadRecord::default());
        let workloads = Arc::new(Self {
            record: record.clone(),
            ready: true,
            wait_advances: None,
        });
        (workloads, record)
    }

    /// Ready once `clock` has reached `secs`, as if the rollout took that long
    pub fn ready_at(clock: Arc<SteppingClock>, secs: i64) -> (Arc<Self>, Arc<WorkloadRecord>) {
        let record = Arc::new(WorkloadRecord::default());
        let workloads = Arc::new(Self {
            record: record.clone(),
            ready: true,
            wait_advances: Some((clock, secs)),
        });
        (workloads, record)
    }

    pub fn never_ready() -> (Arc<Self>, Arc<WorkloadRecord>) {
        let record = Arc::new(WorkloadRecord::default());
        let workloads = Arc::new(Self {
            record: record.clone(),
            ready: false,
            wait_advances: None,
        });
        (workloads, record)
    }
}

struct FakeHandle {
    record: Arc<WorkloadRecord>,
    ready: bool,
    wait_advances: Option<(Arc<SteppingClock>, i64)>,
}

#[async_trait]
impl WorkloadLifecycle for FakeWorkloads {
    async fn create(&self, spec: &ResourceConsumerSpec) -> Result<Box<dyn WorkloadHandle>> {
        self.record.created.lock().unwrap().push(spec.clone());
        Ok(Box::new(FakeHandle {
            record: self.record.clone(),
            ready: self.ready,
            wait_advances: self.wait_advances.clone(),
        }))
    }
}

#[async_trait]
impl WorkloadHandle for FakeHandle {
    async fn wait_for_replicas(&self, replicas: i32) -> Result<()> {
        self.record.waited_for.lock().unwrap().push(replicas);
        if let Some((clock, secs)) = &self.wait_advances {
            clock.advance_to(*secs);
        }
        if self.ready {
            Ok(())
        } else {
            Err(Error::workload("replicas never became ready"))
        }
    }

    async fn clean_up(&self) -> Result<()> {
        self.record.cleaned_up.store(true, Ordering::SeqCst);
        Ok(())
    }
}
