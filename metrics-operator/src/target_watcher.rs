//! Event-driven re-measurement: watches the target resources of metrics and
//! triggers a reconciliation of every metric counting them.
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use futures::{
    StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
};
use kube::{
    Api, Resource,
    api::{ApiResource, DynamicObject, GroupVersionKind},
};
use kube_runtime::{WatchStreamExt, reflector::ObjectRef, watcher};
use metrics_operator_apis::TargetResource;
use opentelemetry::{KeyValue, global, metrics::Counter};
use tokio::task::JoinHandle;

use crate::{
    cluster::{KubeCluster, TargetCluster},
    errors::ExtKubeApiError,
    orchestrator::Targets,
    utils::metric_name,
};

/// A metric is triggered at most once per throttle period by target changes.
const TRIGGER_THROTTLE: Duration = Duration::from_secs(10);

const TARGET_WATCHER: &str = "target_watcher";

/// Distinguishes successive subscriptions of the same metric.
static SUBSCRIPTION_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifies a watch of one kind in one cluster with one set of credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct WatchKey {
    pub cluster: String,
    /// Rotated credentials start a new watch.
    pub credentials: u64,
    pub gvk: (String, String, String),
}

impl WatchKey {
    fn new(cluster: &KubeCluster, gvk: &GroupVersionKind) -> Self {
        Self {
            cluster: cluster.key().to_string(),
            credentials: cluster.credentials(),
            gvk: (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone()),
        }
    }
}

impl std::fmt::Display for WatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (group, version, kind) = &self.gvk;
        let cluster = if self.cluster.is_empty() {
            "local"
        } else {
            self.cluster.as_str()
        };
        write!(f, "{}/{}/{} in {}", group, version, kind, cluster)
    }
}

struct Subscriber<K: Resource> {
    sequence: u64,
    object_ref: ObjectRef<K>,
    last_triggered: Instant,
}

type Subscribers<K> = Arc<Mutex<HashMap<String, Subscriber<K>>>>;

/// The subscribers due for a trigger at `now`.
fn due<K: Resource>(
    subscribers: &mut HashMap<String, Subscriber<K>>,
    now: Instant,
) -> Vec<ObjectRef<K>>
where
    K::DynamicType: Clone,
{
    subscribers
        .values_mut()
        .filter(|s| now.saturating_duration_since(s.last_triggered) >= TRIGGER_THROTTLE)
        .map(|s| {
            s.last_triggered = now;
            s.object_ref.clone()
        })
        .collect()
}

/// Whether the watch was rejected for invalid or expired credentials.
fn is_unauthorized(error: &watcher::Error) -> bool {
    match error {
        watcher::Error::InitialListFailed(e)
        | watcher::Error::WatchStartFailed(e)
        | watcher::Error::WatchFailed(e) => e.is_unauthorized(),
        watcher::Error::WatchError(e) => e.code == 401,
        _ => false,
    }
}

/// A watch on the target resources of one kind in one cluster, shared by
/// all metrics counting them. The watch stops when the last
/// [`Registration`] using it is dropped.
pub(crate) struct TargetWatcher<K: Resource> {
    key: WatchKey,
    subscribers: Subscribers<K>,
    task: JoinHandle<()>,
}

impl<K> TargetWatcher<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    fn spawn(
        key: WatchKey,
        cluster: &KubeCluster,
        resource: &ApiResource,
        sender: UnboundedSender<ObjectRef<K>>,
        triggers: Counter<u64>,
    ) -> Self {
        let subscribers: Subscribers<K> = Default::default();
        let api: Api<DynamicObject> = Api::all_with(cluster.client(), resource);
        let task_subscribers = subscribers.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let labels = [KeyValue::new("kind", task_key.gvk.2.clone())];
            let mut events = watcher(api, watcher::Config::default())
                .default_backoff()
                .touched_objects()
                .boxed();
            while let Some(event) = events.next().await {
                match &event {
                    Ok(_) => {}
                    Err(e) if is_unauthorized(e) => {
                        // Reconciling the subscribers refreshes their
                        // credentials, which replaces this watch.
                        warn!("watch of {} is no longer authorized: {}", task_key, e);
                    }
                    Err(e) => {
                        warn!("watch of {} failed: {}", task_key, e);
                        continue;
                    }
                }
                let triggered = match task_subscribers.lock() {
                    Ok(mut guard) => due(&mut guard, Instant::now()),
                    Err(_) => break,
                };
                for object_ref in triggered {
                    triggers.add(1, &labels);
                    if sender.unbounded_send(object_ref).is_err() {
                        return;
                    }
                }
            }
        });
        info!("started watching {}", key);
        Self {
            key,
            subscribers,
            task,
        }
    }

    fn subscribe(&self, id: &str, object_ref: ObjectRef<K>) -> Subscription<K> {
        let sequence = SUBSCRIPTION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.subscribers.lock() {
            // The initial listing of a new watch follows a measurement.
            guard.insert(
                id.to_string(),
                Subscriber {
                    sequence,
                    object_ref,
                    last_triggered: Instant::now(),
                },
            );
        }
        Subscription {
            id: id.to_string(),
            sequence,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }
}

impl<K: Resource> Drop for TargetWatcher<K> {
    fn drop(&mut self) {
        self.task.abort();
        info!("stopped watching {}", self.key);
    }
}

/// Removes a metric from a [`TargetWatcher`] when dropped, unless it
/// subscribed again in the meantime.
struct Subscription<K: Resource> {
    id: String,
    sequence: u64,
    subscribers: Weak<Mutex<HashMap<String, Subscriber<K>>>>,
}

impl<K: Resource> Drop for Subscription<K> {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            if let Ok(mut guard) = subscribers.lock() {
                if guard.get(&self.id).map_or(false, |s| s.sequence == self.sequence) {
                    guard.remove(&self.id);
                }
            }
        }
    }
}

/// The watches of one metric.
struct Registration<K: Resource> {
    /// Dropped before the watchers they belong to.
    _subscriptions: Vec<Subscription<K>>,
    /// Strong references keeping the watches alive.
    _watchers: Vec<Arc<TargetWatcher<K>>>,
    keys: Vec<WatchKey>,
}

/// All target watches of one metric kind `K`.
pub(crate) struct TargetWatchers<K: Resource> {
    /// Weak references so that watches nobody uses anymore are stopped.
    watchers: Arc<Mutex<HashMap<WatchKey, Weak<TargetWatcher<K>>>>>,
    /// Metric `namespace/name` to its watches.
    registrations: Arc<Mutex<HashMap<String, Registration<K>>>>,
    sender: UnboundedSender<ObjectRef<K>>,
    triggers: Counter<u64>,
}

impl<K> TargetWatchers<K>
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    /// The watchers and the stream of metrics to reconcile.
    pub(crate) fn new() -> (Self, UnboundedReceiver<ObjectRef<K>>) {
        let (sender, receiver) = unbounded();
        let triggers = global::meter(TARGET_WATCHER)
            .u64_counter(metric_name("target_triggers"))
            .with_description("Count of reconciliations triggered by target resource changes")
            .build();
        (
            Self {
                watchers: Default::default(),
                registrations: Default::default(),
                sender,
                triggers,
            },
            receiver,
        )
    }

    /// Watch `target` in all reachable clusters of `targets` on behalf of the
    /// metric `id`. Watches the metric no longer needs are released.
    pub(crate) async fn register(
        &self,
        id: &str,
        object_ref: ObjectRef<K>,
        target: &TargetResource,
        targets: &Targets<KubeCluster>,
    ) {
        let gvk = GroupVersionKind::gvk(&target.group, &target.version, &target.kind);
        let mut resolved = Vec::new();
        for cluster in targets.clusters() {
            match cluster.resolve(&gvk).await {
                Ok(Some(resource)) => resolved.push((WatchKey::new(cluster, &gvk), cluster, resource)),
                Ok(None) => {}
                Err(e) => debug!("cannot watch {} for {}: {}", WatchKey::new(cluster, &gvk), id, e),
            }
        }
        resolved.sort_by(|a, b| a.0.cmp(&b.0));
        let keys: Vec<WatchKey> = resolved.iter().map(|(key, ..)| key.clone()).collect();
        if let Ok(guard) = self.registrations.lock() {
            if guard.get(id).map_or(false, |r| r.keys == keys) {
                return;
            }
        }
        let mut subscriptions = Vec::with_capacity(resolved.len());
        let mut watchers = Vec::with_capacity(resolved.len());
        if let Ok(mut guard) = self.watchers.lock() {
            guard.retain(|_, w| w.strong_count() > 0);
            for (key, cluster, resource) in resolved {
                let watcher = match guard.get(&key).and_then(Weak::upgrade) {
                    Some(watcher) => watcher,
                    None => {
                        let watcher = Arc::new(TargetWatcher::spawn(
                            key.clone(),
                            cluster,
                            &resource,
                            self.sender.clone(),
                            self.triggers.clone(),
                        ));
                        guard.insert(key, Arc::downgrade(&watcher));
                        watcher
                    }
                };
                subscriptions.push(watcher.subscribe(id, object_ref.clone()));
                watchers.push(watcher);
            }
        }
        debug!("{} watches {} target kind(s)", id, keys.len());
        let previous = match self.registrations.lock() {
            Ok(mut guard) => guard.insert(
                id.to_string(),
                Registration {
                    _subscriptions: subscriptions,
                    _watchers: watchers,
                    keys,
                },
            ),
            Err(_) => None,
        };
        // Released after the new registration holds the watches it shares.
        drop(previous);
    }

    /// Release all watches of the metric `id`.
    pub(crate) fn deregister(&self, id: &str) {
        let removed = match self.registrations.lock() {
            Ok(mut guard) => guard.remove(id),
            Err(_) => None,
        };
        if removed.is_some() {
            debug!("released target watches of {}", id);
        }
    }

    #[cfg(test)]
    fn watched(&self) -> Vec<WatchKey> {
        let mut keys: Vec<WatchKey> = self
            .watchers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, w)| w.strong_count() > 0)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl<K: Resource> Clone for TargetWatchers<K> {
    fn clone(&self) -> Self {
        Self {
            watchers: self.watchers.clone(),
            registrations: self.registrations.clone(),
            sender: self.sender.clone(),
            triggers: self.triggers.clone(),
        }
    }
}
