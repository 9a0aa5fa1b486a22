//! Resource watcher
//!
//! Keeps one logical subscription per (kind, scope) alive across stream
//! drops. The watcher lists first (every object becomes an `Added` event),
//! then watches from the list's version. When the stream ends it reconnects
//! immediately from the last observed version; when the store rejects that
//! resume point it re-lists and diffs the snapshot against its cache to
//! synthesize `Added`/`Modified`/`Deleted` events. Only one reconnect in a
//! row is immediate: until a stream delivers an event again, further ends
//! wait out the backoff. Failures are reported to the error sink and retried
//! with backoff, forever, until cancelled.
//!
//! Every subscriber receives the full unfiltered event sequence. A
//! subscriber that joins late first receives the cached state as `Added`.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::Resource;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::config::WatcherConfig;
use crate::object::{Object, ObjectKey, ResourceVersion, WatchScope};
use crate::retry::Backoff;
use crate::sink::{ErrorSink, Failure, Phase};
use crate::store::{EventStream, WatchEvent};
use crate::{Error, Result};

/// Event stream handed to one subscriber
pub type Subscription<K> = UnboundedReceiverStream<WatchEvent<K>>;

/// Why a watch stream stopped being consumed
enum StreamEnd {
    /// The store ended the stream
    Closed,
    /// The stream yielded an error
    Failed(Error),
    /// The resync interval elapsed
    Resync,
    /// Shutdown was requested
    Cancelled,
}

struct Shared<K> {
    cache: BTreeMap<ObjectKey, K>,
    subscribers: Vec<mpsc::UnboundedSender<WatchEvent<K>>>,
    closed: bool,
}

impl<K: Object> Shared<K> {
    /// Apply an event to the cache and hand it to every live subscriber
    fn fan_out(&mut self, event: WatchEvent<K>) {
        let key = event.key();
        match &event {
            WatchEvent::Deleted(_) => {
                self.cache.remove(&key);
            }
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                self.cache.insert(key, obj.clone());
            }
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Events that bring a cache in line with a fresh list (pure function)
///
/// New identities become `Added`, changed versions `Modified`, vanished
/// identities `Deleted` with their last known state. With `present_unchanged`
/// (periodic resync) unchanged objects are re-presented as `Modified` too.
fn diff_snapshot<K: Object>(
    cache: &BTreeMap<ObjectKey, K>,
    fresh: &BTreeMap<ObjectKey, K>,
    present_unchanged: bool,
) -> Vec<WatchEvent<K>> {
    let mut events: Vec<WatchEvent<K>> = fresh
        .iter()
        .filter_map(|(key, obj)| match cache.get(key) {
            None => Some(WatchEvent::Added(obj.clone())),
            Some(known)
                if present_unchanged || ResourceVersion::of(known) != ResourceVersion::of(obj) =>
            {
                Some(WatchEvent::Modified(obj.clone()))
            }
            Some(_) => None,
        })
        .collect();

    events.extend(
        cache
            .iter()
            .filter(|(key, _)| !fresh.contains_key(key))
            .map(|(_, obj)| WatchEvent::Deleted(obj.clone())),
    );
    events
}

/// Long-lived list/watch subscription for one kind and scope
pub struct Watcher<K: Object> {
    client: Client<K>,
    scope: WatchScope,
    config: WatcherConfig,
    sink: Arc<dyn ErrorSink>,
    shared: Mutex<Shared<K>>,
}

impl<K: Object> Watcher<K> {
    /// Create a watcher; nothing happens until [`run`](Self::run)
    pub fn new(
        client: Client<K>,
        scope: WatchScope,
        config: WatcherConfig,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            client,
            scope,
            config,
            sink,
            shared: Mutex::new(Shared {
                cache: BTreeMap::new(),
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Register a subscriber
    ///
    /// The stream starts with the currently cached objects as `Added`
    /// events, followed by every live event. It ends when the watcher stops.
    pub fn subscribe(&self) -> Subscription<K> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut shared = self.shared.lock();
        if !shared.closed {
            for obj in shared.cache.values() {
                let _ = tx.send(WatchEvent::Added(obj.clone()));
            }
            shared.subscribers.push(tx);
        }
        UnboundedReceiverStream::new(rx)
    }

    /// Run until `shutdown` is cancelled, then end every subscription
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(kind = %K::kind(&()), scope = %self.scope, "starting watcher");

        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut resume: Option<ResourceVersion> = None;
        let mut resync_pending = false;
        let mut next_resync = self.next_resync();
        let mut reconnect = Reconnect::default();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let version = match resume.take() {
                Some(version) => version,
                None => {
                    let relisted = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        relisted = self.relist(resync_pending) => relisted,
                    };
                    match relisted {
                        Ok(version) => {
                            resync_pending = false;
                            version
                        }
                        Err(e) => {
                            self.sink.report(&Failure::for_stream(Phase::List, e));
                            if !pause(&mut backoff, &shutdown).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            let opened = tokio::select! {
                _ = shutdown.cancelled() => break,
                opened = self.client.watch(&self.scope, &version) => opened,
            };
            let stream = match opened {
                Ok(stream) => stream,
                Err(Error::Expired { .. }) => {
                    info!(version = %version, "resume point expired, relisting");
                    if !reconnect.after(false, &mut backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    self.sink.report(&Failure::for_stream(Phase::Watch, e));
                    resume = Some(version);
                    if !pause(&mut backoff, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let mut last = version;
            let mut delivered = false;
            match self
                .consume(
                    stream,
                    &mut last,
                    &mut delivered,
                    &mut backoff,
                    next_resync,
                    &shutdown,
                )
                .await
            {
                StreamEnd::Cancelled => break,
                StreamEnd::Closed => {
                    debug!(version = %last, delivered, "watch stream ended, reconnecting");
                    resume = Some(last);
                    if !reconnect.after(delivered, &mut backoff, &shutdown).await {
                        break;
                    }
                }
                StreamEnd::Resync => {
                    debug!("resync interval elapsed, relisting");
                    resync_pending = true;
                    next_resync = self.next_resync();
                }
                StreamEnd::Failed(Error::Expired { .. }) => {
                    info!(version = %last, "watch expired, relisting");
                    if !reconnect.after(delivered, &mut backoff, &shutdown).await {
                        break;
                    }
                }
                StreamEnd::Failed(e) => {
                    warn!(version = %last, error = %e, "watch stream failed");
                    self.sink.report(&Failure::for_stream(Phase::Watch, e));
                    resume = Some(last);
                    if !pause(&mut backoff, &shutdown).await {
                        break;
                    }
                }
            }
        }

        self.close();
        info!(kind = %K::kind(&()), scope = %self.scope, "watcher stopped");
    }

    fn next_resync(&self) -> Option<Instant> {
        self.config
            .resync_interval
            .map(|interval| Instant::now() + interval)
    }

    /// Full list, diffed against the cache; returns the snapshot version
    async fn relist(&self, present_unchanged: bool) -> Result<ResourceVersion> {
        let list = self.client.list(&self.scope).await?;
        let fresh: BTreeMap<ObjectKey, K> = list
            .items
            .into_iter()
            .map(|obj| (ObjectKey::of(&obj), obj))
            .collect();

        let mut shared = self.shared.lock();
        let events = diff_snapshot(&shared.cache, &fresh, present_unchanged);
        debug!(
            objects = fresh.len(),
            synthesized = events.len(),
            version = %list.version,
            "relisted"
        );
        for event in events {
            shared.fan_out(event);
        }
        Ok(list.version)
    }

    async fn consume(
        &self,
        mut stream: EventStream<K>,
        last: &mut ResourceVersion,
        delivered: &mut bool,
        backoff: &mut Backoff,
        resync_at: Option<Instant>,
        shutdown: &CancellationToken,
    ) -> StreamEnd {
        let resync = async {
            match resync_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(resync);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return StreamEnd::Cancelled,
                _ = &mut resync => return StreamEnd::Resync,
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        *delivered = true;
                        backoff.reset();
                        if let Some(version) = event.version() {
                            *last = version;
                        }
                        self.shared.lock().fan_out(event);
                    }
                    Some(Err(e)) => return StreamEnd::Failed(e),
                    None => return StreamEnd::Closed,
                },
            }
        }
    }

    fn close(&self) {
        let mut shared = self.shared.lock();
        shared.closed = true;
        shared.subscribers.clear();
    }
}

/// Pacing of reconnects after a stream ended or expired
///
/// The first reconnect after a stream that delivered events is immediate.
/// Every further end without an event in between backs off.
#[derive(Debug, Default)]
struct Reconnect {
    immediate_used: bool,
}

impl Reconnect {
    /// Wait as needed before reconnecting; false if shutdown came first
    async fn after(
        &mut self,
        delivered: bool,
        backoff: &mut Backoff,
        shutdown: &CancellationToken,
    ) -> bool {
        if delivered {
            self.immediate_used = false;
        }
        if !self.immediate_used {
            self.immediate_used = true;
            return true;
        }
        pause(backoff, shutdown).await
    }
}

/// Wait out the next backoff delay; false if shutdown came first
async fn pause(backoff: &mut Backoff, shutdown: &CancellationToken) -> bool {
    let delay = backoff.next_delay();
    debug!(attempt = backoff.attempt(), delay_ms = delay.as_millis(), "backing off");
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
