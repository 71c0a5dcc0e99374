//! Reconciled list+watch for a single Kubernetes resource kind.
//!
//! A [`ResourceWatcher`] drives an [`EventSource`] (normally a `kube` watcher
//! over an `Api<K>`) and turns its raw list/watch events into typed
//! [`ResourceEvent`]s, delivered synchronously to an [`EventHandler`].
//!
//! # How It Works
//!
//! 1. Opens the event source, which lists every object and then watches for changes
//! 2. Tracks the last observed state of every object by namespace and name
//! 3. Emits `Added`, `Updated` or `Deleted` for each change
//! 4. On re-list, deletes objects that were not seen again
//! 5. Flags the sync barrier once the first full list has been applied
//!
//! Once a list has completed, the source is re-opened every resync interval so
//! a dropped event is healed by the next list. A resync never interrupts a
//! list that is still in progress. Watch errors are retried by the source
//! itself, which backs off and re-lists from `Init`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use kube::Resource;
use kube::runtime::watcher::{self, Event};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::error::{Error, Result};

/// A reconciled change to one watched object.
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceEvent<K> {
    /// The object was observed for the first time.
    Added(K),
    /// A known object was observed again.
    Updated {
        /// Previously observed state.
        old: K,
        /// Newly observed state.
        new: K,
    },
    /// The object was deleted, or vanished between two lists.
    Deleted(K),
}

/// Receives reconciled events from a [`ResourceWatcher`].
///
/// Handlers run on the watcher task and must not block on I/O.
pub trait EventHandler<K>: Send + Sync {
    /// Applies a single event.
    fn handle(&self, event: ResourceEvent<K>);
}

impl<K, H> EventHandler<K> for Arc<H>
where
    H: EventHandler<K> + ?Sized,
{
    fn handle(&self, event: ResourceEvent<K>) {
        (**self).handle(event);
    }
}

/// Produces a fresh list+watch stream each time it is opened.
///
/// Every stream must start with an initial list (`Init`, `InitApply`*, `InitDone`)
/// before any live `Apply` or `Delete` events. After yielding an error the
/// stream must keep going, backing off and re-listing on its own.
pub trait EventSource<K>: Send + Sync + 'static {
    /// Opens a new stream, starting with a full list.
    fn watch(&self) -> BoxStream<'static, watcher::Result<Event<K>>>;
}

/// Identity of a watched object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ObjectKey {
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone()?,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{namespace}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Turns raw watcher events into typed changes against the last known state.
struct Reconciler<K> {
    known: HashMap<ObjectKey, K>,
    // Keys seen since the last `Init`, while a list is in progress.
    listed: Option<HashSet<ObjectKey>>,
}

impl<K> Default for Reconciler<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            listed: None,
        }
    }
}

impl<K: Resource + Clone> Reconciler<K> {
    fn listing(&self) -> bool {
        self.listed.is_some()
    }

    fn reconcile(&mut self, event: Event<K>) -> Vec<ResourceEvent<K>> {
        match event {
            Event::Init => {
                tracing::debug!("re-listing {} known objects", self.known.len());
                self.listed = Some(HashSet::new());
                Vec::new()
            }

            Event::InitApply(obj) => {
                let Some(key) = ObjectKey::of(&obj) else {
                    tracing::warn!("dropping listed object without a name");
                    return Vec::new();
                };

                if let Some(listed) = self.listed.as_mut() {
                    listed.insert(key.clone());
                }

                vec![self.upsert(key, obj)]
            }

            Event::Apply(obj) => {
                let Some(key) = ObjectKey::of(&obj) else {
                    tracing::warn!("dropping applied object without a name");
                    return Vec::new();
                };

                vec![self.upsert(key, obj)]
            }

            Event::Delete(obj) => {
                let Some(key) = ObjectKey::of(&obj) else {
                    tracing::warn!("dropping deleted object without a name");
                    return Vec::new();
                };

                tracing::debug!("deleted: {key}");
                self.known.remove(&key);
                vec![ResourceEvent::Deleted(obj)]
            }

            Event::InitDone => {
                let Some(listed) = self.listed.take() else {
                    return Vec::new();
                };

                let stale: Vec<ObjectKey> = self
                    .known
                    .keys()
                    .filter(|key| !listed.contains(key))
                    .cloned()
                    .collect();

                stale
                    .into_iter()
                    .filter_map(|key| {
                        tracing::debug!("not seen in re-list, deleting: {key}");
                        self.known.remove(&key)
                    })
                    .map(ResourceEvent::Deleted)
                    .collect()
            }
        }
    }

    fn upsert(&mut self, key: ObjectKey, obj: K) -> ResourceEvent<K> {
        match self.known.insert(key, obj.clone()) {
            Some(old) => ResourceEvent::Updated { old, new: obj },
            None => ResourceEvent::Added(obj),
        }
    }
}

enum Step<K> {
    Stop,
    Resync,
    Next(Option<watcher::Result<Event<K>>>),
}

/// Watches one resource kind and feeds reconciled events to a handler.
pub struct ResourceWatcher<K, S> {
    source: S,
    kind: String,
    resync_interval: Duration,
    max_failures: u32,
    synced: watch::Sender<bool>,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K, S> ResourceWatcher<K, S>
where
    K: Resource<DynamicType = ()> + Clone + Send + 'static,
    S: EventSource<K>,
{
    /// Creates a watcher over the given source using the configured timings.
    #[must_use]
    pub fn new(source: S, config: &ControllerConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            source,
            kind: K::kind(&()).into_owned(),
            resync_interval: config.resync_interval,
            max_failures: config.max_watch_failures,
            synced,
            _kind: std::marker::PhantomData,
        }
    }

    /// The Kubernetes kind being watched.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the sync barrier, which becomes `true` once the initial list
    /// has been delivered to the handler.
    #[must_use]
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Runs the watch loop until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Fails if the initial list fails, if the watch keeps failing for more than
    /// the configured number of consecutive attempts, or if the source ends on
    /// its own.
    pub async fn run<H>(self, handler: H, shutdown: CancellationToken) -> Result<()>
    where
        H: EventHandler<K>,
    {
        let mut reconciler = Reconciler::default();
        let mut stream = self.source.watch();
        let mut synced = false;
        let mut failures = 0_u32;

        let mut resync = time::interval_at(Instant::now() + self.resync_interval, self.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!("starting {} watch", self.kind);

        loop {
            let step = tokio::select! {
                biased;
                () = shutdown.cancelled() => Step::Stop,
                _ = resync.tick(), if synced && !reconciler.listing() => Step::Resync,
                event = stream.next() => Step::Next(event),
            };

            match step {
                Step::Stop => {
                    // Deliver what the stream already holds, without waiting for more.
                    while let Some(Some(Ok(event))) = stream.next().now_or_never() {
                        for change in reconciler.reconcile(event) {
                            handler.handle(change);
                        }
                    }

                    tracing::debug!("stopping {} watch", self.kind);
                    return Ok(());
                }

                Step::Resync => {
                    tracing::debug!("resyncing {} watch", self.kind);
                    stream = self.source.watch();
                    resync.reset();
                }

                Step::Next(Some(Ok(event))) => {
                    // `Init` is emitted before the list request, so it proves nothing
                    // about the connection.
                    if !matches!(event, Event::Init) {
                        failures = 0;
                    }

                    let init_done = matches!(event, Event::InitDone);
                    for change in reconciler.reconcile(event) {
                        handler.handle(change);
                    }

                    // The resync period counts from the end of the last list.
                    if init_done {
                        resync.reset();
                    }

                    if init_done && !synced {
                        synced = true;
                        self.synced.send_replace(true);
                        tracing::info!("{} watch initial sync complete", self.kind);
                    }
                }

                Step::Next(Some(Err(error))) => {
                    if !synced {
                        return Err(Error::InitialList {
                            kind: self.kind,
                            source: error,
                        });
                    }

                    failures += 1;
                    if failures > self.max_failures {
                        return Err(Error::WatchStalled {
                            kind: self.kind,
                            attempts: failures,
                            source: error,
                        });
                    }

                    tracing::warn!("{} watch failed (attempt {failures}), re-listing: {error}", self.kind);
                }

                Step::Next(None) => {
                    return Err(Error::WatcherExited { kind: self.kind });
                }
            }
        }
    }
}
