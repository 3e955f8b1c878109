use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::StreamExt;
use kube::{Api, Client, ResourceExt};
use kube_runtime::{
    controller::{Action, Controller},
    reflector::ObjectRef,
    watcher,
};
use metrics_operator_apis::{DEFAULT_DATA_SINK, ObjectReference};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};

use crate::{
    access::{AccessError, AccessResolver},
    cluster::KubeCluster,
    errors::ControllerError,
    flavors::{Access, Monitored, Query},
    handlers::{
        MonitorResult, Phase,
        reason::{INVALID_SPEC, SEND_METRIC_FAILED},
    },
    orchestrator::{ClusterFailure, FederatedTarget, Orchestrator, QueryConfig, Targets},
    sink::{CredentialsError, SinkError, SinkPool, resolve_credentials},
    status::MetricModifications,
    target_watcher::TargetWatchers,
    utils::{io_deadline, metric_name, parse_interval},
};

const METRIC_CONTROLLER: &str = "metric_controller";

/// Metrics with an unusable interval are looked at again after this delay.
const INVALID_INTERVAL_REQUEUE: Duration = Duration::from_secs(600);

const MIN_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// State shared by the controllers of all metric kinds.
pub(crate) struct Context {
    pub client: Client,
    /// Namespace of default DataSinks.
    pub namespace: String,
    pub access: AccessResolver,
    pub sinks: SinkPool,
}

/// Exponential requeue delays of failing metrics.
#[derive(Default)]
struct Backoff {
    delays: Mutex<HashMap<String, Duration>>,
}

impl Backoff {
    fn next(&self, id: &str) -> Duration {
        match self.delays.lock() {
            Ok(mut guard) => {
                let delay = guard
                    .get(id)
                    .map_or(MIN_BACKOFF, |d| d.saturating_mul(2).min(MAX_BACKOFF));
                guard.insert(id.to_string(), delay);
                delay
            }
            Err(_) => MAX_BACKOFF,
        }
    }

    fn reset(&self, id: &str) {
        if let Ok(mut guard) = self.delays.lock() {
            guard.remove(id);
        }
    }
}

/// Reconciles the metrics of kind `K`.
pub(crate) struct MetricController<K: Monitored> {
    context: Arc<Context>,
    kind: String,
    /// Target watches, if reconciliations are event driven.
    watchers: Option<TargetWatchers<K>>,
    backoff: Backoff,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    reconcile_errors: Counter<u64>,
}

fn id_of<K: Monitored>(metric: &K) -> String {
    format!("{}/{}", metric.namespace().unwrap_or_default(), metric.name_any())
}

fn outcome(phase: Phase) -> &'static str {
    match phase {
        Phase::Ready => "ready",
        Phase::Failed => "failed",
        Phase::Pending => "pending",
    }
}

impl<K: Monitored> MetricController<K> {
    pub fn new(context: Arc<Context>) -> Self {
        let meter: Meter = global::meter(METRIC_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of metric reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of metric objects in milliseconds")
            .with_unit("ms")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of metric reconcile invocation errors")
            .build();
        Self {
            context,
            kind: K::kind(&()).to_string(),
            watchers: None,
            backoff: Default::default(),
            reconcile_count,
            reconcile_duration,
            reconcile_errors,
        }
    }

    fn client(&self) -> Client {
        self.context.client.clone()
    }

    fn deregister(&self, id: &str) {
        if let Some(watchers) = &self.watchers {
            watchers.deregister(id);
        }
    }

    /// Resolve the cluster(s) `metric` is measured in.
    async fn targets(
        &self,
        metric: &K,
        deadline: Duration,
    ) -> Result<Targets<KubeCluster>, AccessError> {
        let namespace = metric.namespace().unwrap_or_default();
        let reference = |r: &ObjectReference| ObjectReference {
            name: r.name.clone(),
            namespace: if r.namespace.is_empty() {
                namespace.clone()
            } else {
                r.namespace.clone()
            },
        };
        let access = &self.context.access;
        Ok(match metric.access() {
            Access::Local => Targets::Single(QueryConfig {
                cluster: access.local(deadline),
                cluster_name: None,
            }),
            Access::Remote(r) => Targets::Single(QueryConfig {
                cluster: access.remote_cluster_access(&reference(r), deadline).await?,
                cluster_name: Some(r.name.clone()),
            }),
            Access::Cluster(r) => Targets::Single(QueryConfig {
                cluster: access.cluster_access(&reference(r), deadline).await?,
                cluster_name: Some(r.name.clone()),
            }),
            Access::Federated(r) => Targets::Federated(
                access
                    .federated_clusters(&reference(r), deadline)
                    .await?
                    .into_iter()
                    .map(|c| FederatedTarget {
                        name: c.name,
                        cluster: c.cluster.map_err(|e| ClusterFailure {
                            reason: e.reason(),
                            message: e.to_string(),
                        }),
                    })
                    .collect(),
            ),
        })
    }

    /// Measure `metric` and export its data points. Problems with the
    /// metric's configuration or targets are returned as failed result.
    async fn measure(
        &self,
        metric: &MetricModifications<K>,
        interval: Duration,
    ) -> Result<MonitorResult, ControllerError> {
        if let Err(e) = metric.validate() {
            return Ok(MonitorResult::failed(INVALID_SPEC, "invalid spec", e));
        }
        let deadline = io_deadline(interval);
        let sink_name = metric
            .data_sink_ref()
            .map(|r| r.name.trim())
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_DATA_SINK);
        let (uid, credentials) = match resolve_credentials(
            self.client(),
            &self.context.namespace,
            sink_name,
            deadline,
        )
        .await
        {
            Ok(v) => v,
            Err(CredentialsError::Timeout(what, d)) => {
                return Err(ControllerError::DeadlineExceeded(what, d));
            }
            Err(e) => {
                return Ok(MonitorResult::failed(
                    e.reason(),
                    "failed to resolve DataSink",
                    e,
                ));
            }
        };
        let targets = match self.targets(metric, deadline).await {
            Ok(targets) => targets,
            Err(e) => {
                if let Some((what, d)) = e.deadline_exceeded() {
                    return Err(ControllerError::DeadlineExceeded(what, d));
                }
                return Ok(MonitorResult::failed(
                    e.reason(),
                    "failed to access target cluster",
                    e,
                ));
            }
        };
        let orchestrator = Orchestrator::new(credentials, targets);
        let sink = match orchestrator.sink(&self.context.sinks, &uid).await {
            Ok(sink) => sink,
            Err(e) => {
                return Ok(MonitorResult::failed(
                    SEND_METRIC_FAILED,
                    "failed to create exporter",
                    e,
                ));
            }
        };
        let name = metric.exported_name();
        let gauge = sink.meter(&name).new_metric(&name);
        let query = metric.query();
        let handler = match &query {
            Query::Resources(q) => orchestrator.with_metric(*q, &gauge),
            Query::Managed(q) => orchestrator.with_managed(q.clone(), &gauge),
        };
        let mut result = handler.monitor().await?;
        if result.phase == Phase::Ready {
            match sink.export(deadline).await {
                Ok(()) => {}
                Err(SinkError::Timeout(d)) => {
                    return Err(ControllerError::DeadlineExceeded("export", d));
                }
                Err(e) => {
                    result = MonitorResult::failed(
                        SEND_METRIC_FAILED,
                        &format!("failed to export to {}", sink.endpoint()),
                        e,
                    );
                }
            }
        }
        if let (Some(watchers), Query::Resources(q)) = (&self.watchers, &query) {
            watchers
                .register(
                    &metric.id(),
                    ObjectRef::from_obj(&**metric),
                    q.target,
                    orchestrator.targets(),
                )
                .await;
        }
        Ok(result)
    }

    /// Controller triggers this whenever a metric changed, is due or one of
    /// its targets changed.
    async fn reconcile(object: Arc<K>, me: Arc<Self>) -> Result<Action, ControllerError> {
        let start = Instant::now();
        let id = id_of(object.as_ref());
        let api: Api<K> = Api::namespaced(me.client(), &object.namespace().unwrap_or_default());
        // The cached object may lag behind, measure the latest version.
        let current = match api.get_opt(&object.name_any()).await? {
            Some(current) => current,
            None => {
                debug!("{} {} is gone", me.kind, id);
                me.deregister(&id);
                me.backoff.reset(&id);
                return Ok(Action::await_change());
            }
        };
        let mut metric = MetricModifications::new(current);
        let (result, requeue) = match parse_interval(metric.interval()) {
            Ok(interval) => (me.measure(&metric, interval).await?, interval),
            Err(e) => (
                MonitorResult::failed(INVALID_SPEC, "invalid interval", e),
                INVALID_INTERVAL_REQUEUE,
            ),
        };
        match result.phase {
            Phase::Ready => debug!("{} {}: {}", me.kind, id, result.message),
            Phase::Pending => info!("{} {}: {}", me.kind, id, result.message),
            Phase::Failed => warn!("{} {} failed ({}): {}", me.kind, id, result.reason, result.message),
        }
        metric.apply(&result);
        metric.patch_status(me.client()).await?;
        me.backoff.reset(&id);
        let labels = [
            KeyValue::new("kind", me.kind.clone()),
            KeyValue::new("outcome", outcome(result.phase)),
        ];
        me.reconcile_count.add(1, &labels);
        me.reconcile_duration
            .record(start.elapsed().as_millis() as u64, &labels);
        Ok(Action::requeue(requeue))
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(object: Arc<K>, error: &ControllerError, me: Arc<Self>) -> Action {
        let id = id_of(object.as_ref());
        let delay = if error.is_temporary() {
            me.backoff.next(&id)
        } else {
            MAX_BACKOFF
        };
        warn!(
            "reconcile of {} {} failed, retrying in {}: {}",
            me.kind,
            id,
            humantime::format_duration(delay),
            error
        );
        Action::requeue(delay)
    }

    /// Run the controller until shutdown. If `event_driven`, metrics are
    /// also re-measured when their target resources change.
    pub fn start(mut self, event_driven: bool) -> impl Future<Output = ()> {
        let api: Api<K> = Api::all(self.client());
        let mut controller = Controller::new(api, watcher::Config::default()).shutdown_on_signal();
        if event_driven && K::WATCH_TARGETS {
            let (watchers, triggers) = TargetWatchers::new();
            self.watchers = Some(watchers);
            controller = controller.reconcile_on(triggers);
        }
        info!("starting {} controller", self.kind);
        let me = Arc::new(self);
        let errors = me.reconcile_errors.clone();
        let kind = me.kind.clone();
        let watchers = me.watchers.clone();
        controller
            .run(Self::reconcile, Self::error_policy, me)
            .for_each(move |res| {
                let errors = errors.clone();
                let labels = [KeyValue::new("kind", kind.clone())];
                let watchers = watchers.clone();
                async move {
                    match res {
                        Ok(_) => {}
                        Err(e) => match e {
                            kube_runtime::controller::Error::ObjectNotFound(object) => {
                                debug!("reconcile failed: {} is gone", object);
                                if let Some(watchers) = &watchers {
                                    let id = format!(
                                        "{}/{}",
                                        object.namespace.clone().unwrap_or_default(),
                                        object.name
                                    );
                                    watchers.deregister(&id);
                                }
                            }
                            a @ kube_runtime::controller::Error::QueueError(..) => {
                                debug!("reconcile failed: {:?}", a);
                                errors.add(1, &labels);
                                // Slow down on errors caused by missing CRDs or permissions.
                                tokio::time::sleep(Duration::from_secs(30)).await;
                            }
                            e => {
                                debug!("reconcile failed: {}", e);
                                errors.add(1, &labels);
                            }
                        },
                    }
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_reset() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..9).map(|_| backoff.next("ops/a").as_secs()).collect();
        assert_eq!(vec![5, 10, 20, 40, 80, 160, 300, 300, 300], delays);
        assert_eq!(5, backoff.next("ops/b").as_secs());
        backoff.reset("ops/a");
        assert_eq!(5, backoff.next("ops/a").as_secs());
    }

    #[test]
    fn outcomes() {
        assert_eq!("ready", outcome(Phase::Ready));
        assert_eq!("failed", outcome(Phase::Failed));
        assert_eq!("pending", outcome(Phase::Pending));
    }
}
