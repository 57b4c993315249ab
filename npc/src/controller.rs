//! The worker loop.
//!
//! Three reflector-backed watches feed a deduplicating queue of (kind, key)
//! items; a single loop drains it, applying each item against the index and
//! committing the resulting transaction. Each watch remembers the keys it
//! has reported so that a relist after a disconnect also enqueues deletions
//! for objects that vanished in the meantime. The first commit is withheld
//! until all three watches have delivered their initial state, so the
//! initial ruleset appears atomically; afterwards every item ends with a
//! commit and a failed commit re-queues the item with backoff.

use ahash::AHashSet as HashSet;
use anyhow::Result;
use futures::stream::{BoxStream, Stream, StreamExt};
use k8s_nft_npc_index::{queue::WorkQueue, Index};
use k8s_nft_npc_k8s::{self as k8s, watcher, ObjectName};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Kind {
    Pod,
    Namespace,
    NetworkPolicy,
}

type Item = (Kind, ObjectName);

/// One resource watch: the event stream, its readiness, and the set of
/// keys it has reported as existing.
struct ResourceWatch<K> {
    kind: Kind,
    rx: BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>,
    ready: bool,
    known: HashSet<ObjectName>,
}

// === impl ResourceWatch ===

impl<K> ResourceWatch<K>
where
    K: k8s::Resource<DynamicType = ()>,
{
    fn new(
        kind: Kind,
        stream: impl Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send + 'static,
    ) -> Self {
        Self {
            kind,
            rx: stream.boxed(),
            ready: false,
            known: HashSet::new(),
        }
    }

    fn ready(&self) -> bool {
        self.ready
    }

    /// Waits for the next event, backing off over stream errors.
    async fn recv(&mut self) -> watcher::Event<K> {
        loop {
            match self
                .rx
                .next()
                .await
                .expect("watch stream never terminates")
            {
                Ok(event) => {
                    self.ready = true;
                    return event;
                }
                Err(error) => {
                    self.ready = false;
                    warn!(kind = ?self.kind, %error, "Watch disconnected, retrying");
                    time::sleep(time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Translates an event into work items.
    ///
    /// A relist enqueues every object it reported plus one deletion for
    /// every previously-known key it no longer contains: objects deleted
    /// while the watch was disconnected produce no event of their own, and
    /// would otherwise leak their ruleset artifacts.
    fn enqueue(&mut self, event: watcher::Event<K>, queue: &mut WorkQueue<Item>) {
        match event {
            watcher::Event::Applied(obj) => {
                let name = ObjectName::from_resource(&obj);
                self.known.insert(name.clone());
                queue.add((self.kind, name));
            }
            watcher::Event::Deleted(obj) => {
                let name = ObjectName::from_resource(&obj);
                self.known.remove(&name);
                queue.add((self.kind, name));
            }
            watcher::Event::Restarted(objs) => {
                let current: HashSet<ObjectName> =
                    objs.iter().map(ObjectName::from_resource).collect();
                for defunct in self.known.difference(&current) {
                    queue.add((self.kind, defunct.clone()));
                }
                for name in &current {
                    queue.add((self.kind, name.clone()));
                }
                self.known = current;
            }
        }
    }
}

pub(crate) async fn run(client: k8s::Client, mut index: Index) -> Result<()> {
    let (pod_store, pod_writer) = k8s::reflector::store::<k8s::Pod>();
    let mut pods = ResourceWatch::new(
        Kind::Pod,
        k8s::reflector::reflector(
            pod_writer,
            k8s::watcher(k8s::Api::all(client.clone()), watcher::Config::default()),
        ),
    );

    let (namespace_store, namespace_writer) = k8s::reflector::store::<k8s::Namespace>();
    let mut namespaces = ResourceWatch::new(
        Kind::Namespace,
        k8s::reflector::reflector(
            namespace_writer,
            k8s::watcher(k8s::Api::all(client.clone()), watcher::Config::default()),
        ),
    );

    let (policy_store, policy_writer) = k8s::reflector::store::<k8s::NetworkPolicy>();
    let mut policies = ResourceWatch::new(
        Kind::NetworkPolicy,
        k8s::reflector::reflector(
            policy_writer,
            k8s::watcher(k8s::Api::all(client), watcher::Config::default()),
        ),
    );

    let mut queue: WorkQueue<Item> = WorkQueue::new();
    let mut synced = false;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            ev = pods.recv() => pods.enqueue(ev, &mut queue),
            ev = namespaces.recv() => namespaces.enqueue(ev, &mut queue),
            ev = policies.recv() => policies.enqueue(ev, &mut queue),
            _ = queue.wait() => {
                if let Some(item) = queue.try_next() {
                    process(
                        &mut index,
                        &pod_store,
                        &namespace_store,
                        &policy_store,
                        &mut queue,
                        item,
                        synced,
                    );
                }
            }
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
        }

        if !synced && pods.ready() && namespaces.ready() && policies.ready() && queue.is_empty() {
            // All informers have reported their initial state; commit the
            // whole ruleset in one transaction.
            match index.flush() {
                Ok(()) => info!("Initial sync complete"),
                Err(error) => {
                    // The stage is retained; the next per-item commit
                    // re-emits it.
                    warn!(%error, "Initial commit failed");
                }
            }
            synced = true;
        }
    }

    info!("Received signal, shutting down");
    Ok(())
}

fn process(
    index: &mut Index,
    pod_store: &k8s::Store<k8s::Pod>,
    namespace_store: &k8s::Store<k8s::Namespace>,
    policy_store: &k8s::Store<k8s::NetworkPolicy>,
    queue: &mut WorkQueue<Item>,
    item: Item,
    synced: bool,
) {
    let (kind, name) = &item;
    match kind {
        Kind::Pod => {
            let obj = pod_store.get(&k8s::ObjectRef::new(&name.name).within(&name.namespace));
            debug!(%name, "Syncing pod");
            index.set_pod(name, obj.as_deref());
        }
        Kind::Namespace => {
            let obj = namespace_store.get(&k8s::ObjectRef::new(&name.name));
            debug!(name = %name.name, "Syncing namespace");
            index.set_namespace(&name.name, obj.as_deref());
        }
        Kind::NetworkPolicy => {
            let obj = policy_store.get(&k8s::ObjectRef::new(&name.name).within(&name.namespace));
            debug!(%name, "Syncing network policy");
            index.set_network_policy(name, obj.as_deref());
        }
    }

    if synced {
        match index.flush() {
            Ok(()) => queue.forget(&item),
            Err(error) => {
                warn!(%name, %error, "Commit failed, requeuing");
                queue.add_rate_limited(item.clone());
            }
        }
    }
}
