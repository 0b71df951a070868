//! The registry actor.
//!
//! A [`Registry`] owns the in-memory map of target groups, the entry store and
//! the discovery file. After [`Registry::spawn`] it lives on a dedicated
//! thread and is reachable only through [`RegistryHandle`], which queues
//! mutations and waits for their outcome. Mutations are applied one at a time
//! in queue order.
//!
//! Persistence and publication are best effort: the outcome returned to the
//! caller reflects the in-memory registry only. A failed store write or file
//! regeneration is logged and left for the next accepted mutation to repair,
//! so the store and the discovery file can lag behind memory until then.
//! Records whose write failed are remembered and written again, from the
//! current in-memory state, after every later accepted mutation.

use std::{
    collections::{hash_map::Entry, BTreeSet},
    thread,
    time::{Duration, Instant},
};

use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    sd_file::SdFile,
    store::EntryStore,
    target_group::{Signature, TargetGroup},
    Error, Result,
};

#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Mutation {
    /// Adds `group` under `id` unless an equivalent group is already
    /// registered or `id` is taken.
    Register { id: Uuid, group: TargetGroup },
    Unregister { id: Uuid },
    /// Overwrites the endpoints of an existing group; labels are kept.
    ReplaceTargets { id: Uuid, targets: BTreeSet<String> },
}

impl Mutation {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Register { id, .. } | Self::Unregister { id } | Self::ReplaceTargets { id, .. } => {
                *id
            }
        }
    }
}

/// What happened to a submitted [`Mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    Accepted,
    /// An equivalent group is already registered.
    Duplicate,
    /// A group is already registered under the requested id.
    IdInUse,
    NotFound,
    /// The change would leave the group without targets.
    Invalid,
}

impl Outcome {
    pub fn is_accepted(self) -> bool {
        self == Self::Accepted
    }
}

#[derive(Debug)]
struct Request {
    mutation: Mutation,
    reply: oneshot::Sender<Outcome>,
}

pub struct Registry<S> {
    groups: FxHashMap<Uuid, TargetGroup>,
    /// group signature -> ids of the groups having it
    index: FxHashMap<Signature, FxHashSet<Uuid>>,
    /// ids whose record in the store is behind `groups`
    unsynced: FxHashSet<Uuid>,
    store: S,
    sd_file: SdFile,
}

impl<S: EntryStore> Registry<S> {
    /// Rebuilds the registry from every record in `store`.
    ///
    /// A record whose key is not a UUID or whose value is not a valid target
    /// group is reported as [`Error::CorruptRecord`].
    pub fn load(store: S, sd_file: SdFile) -> Result<Self> {
        let mut registry = Self {
            groups: FxHashMap::default(),
            index: FxHashMap::default(),
            unsynced: FxHashSet::default(),
            store,
            sd_file,
        };
        for (key, value) in registry.store.scan_all()? {
            let id = Uuid::parse_str(&key).map_err(|e| Error::CorruptRecord {
                key: key.clone(),
                reason: e.to_string(),
            })?;
            let group = serde_json::from_slice::<TargetGroup>(&value).map_err(|e| {
                Error::CorruptRecord {
                    key: key.clone(),
                    reason: e.to_string(),
                }
            })?;
            tracing::debug!(%id, "loaded previously stored target group");
            registry.insert(id, group);
        }
        tracing::info!(count = registry.len(), "loaded persisted target groups");
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&TargetGroup> {
        self.groups.get(id)
    }

    /// Registered groups ordered by id.
    pub fn snapshot(&self) -> impl Iterator<Item = (&Uuid, &TargetGroup)> {
        self.groups.iter().sorted_by_key(|(id, _)| **id)
    }

    /// Applies one mutation.
    ///
    /// An accepted mutation is persisted and the discovery file regenerated
    /// before returning; a rejected one has no side effects.
    pub fn apply(&mut self, mutation: Mutation) -> Outcome {
        let kind: &'static str = (&mutation).into();
        let id = mutation.id();
        let outcome = match mutation {
            Mutation::Register { id, group } => self.register(id, group),
            Mutation::Unregister { id } => self.unregister(id),
            Mutation::ReplaceTargets { id, targets } => self.replace_targets(id, targets),
        };
        let outcome_name: &'static str = outcome.into();
        tracing::debug!(%id, kind, outcome = outcome_name, "applied mutation");
        if outcome.is_accepted() {
            self.persist(id);
            self.publish();
        }
        outcome
    }

    /// Publishes the discovery file once, then moves the registry onto its
    /// own thread. The worker exits once every [`RegistryHandle`] is dropped.
    pub fn spawn(self, queue_depth: usize) -> Result<(RegistryHandle, thread::JoinHandle<()>)>
    where
        S: Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        self.publish();
        let worker = thread::Builder::new()
            .name("registry".to_owned())
            .spawn(move || self.run(rx))
            .map_err(Error::Spawn)?;
        Ok((RegistryHandle { tx }, worker))
    }

    fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(Request { mutation, reply }) = rx.blocking_recv() {
            if reply.is_closed() {
                // The submitter stopped waiting before the request was admitted.
                tracing::debug!(id = %mutation.id(), "dropping abandoned mutation");
                continue;
            }
            let outcome = self.apply(mutation);
            if reply.send(outcome).is_err() {
                tracing::debug!(?outcome, "submitter went away before the outcome was ready");
            }
        }
        tracing::info!("registry worker stopped");
    }

    fn register(&mut self, id: Uuid, group: TargetGroup) -> Outcome {
        if self.groups.contains_key(&id) {
            tracing::warn!(%id, "attempted to register an id that is already in use, skipped");
            return Outcome::IdInUse;
        }
        if let Some(duplicate) = self.find_equivalent(&group) {
            tracing::warn!(%id, %duplicate, "attempted to register duplicate, skipped");
            return Outcome::Duplicate;
        }
        tracing::debug!(%id, ?group, "registered new target group");
        self.insert(id, group);
        Outcome::Accepted
    }

    fn unregister(&mut self, id: Uuid) -> Outcome {
        match self.remove(id) {
            Some(_) => Outcome::Accepted,
            None => Outcome::NotFound,
        }
    }

    fn replace_targets(&mut self, id: Uuid, targets: BTreeSet<String>) -> Outcome {
        let Some(current) = self.groups.get(&id) else {
            return Outcome::NotFound;
        };
        let mut group = current.clone();
        if let Err(error) = group.replace_targets(targets) {
            tracing::warn!(%id, %error, "refusing to replace targets");
            return Outcome::Invalid;
        }
        tracing::debug!(%id, "replacing targets");
        self.insert(id, group);
        Outcome::Accepted
    }

    fn find_equivalent(&self, group: &TargetGroup) -> Option<Uuid> {
        self.index
            .get(&group.signature())?
            .iter()
            .copied()
            .find(|id| self.groups.get(id).is_some_and(|g| g.is_equivalent(group)))
    }

    fn insert(&mut self, id: Uuid, group: TargetGroup) {
        self.remove(id);
        self.index.entry(group.signature()).or_default().insert(id);
        self.groups.insert(id, group);
    }

    fn remove(&mut self, id: Uuid) -> Option<TargetGroup> {
        let group = self.groups.remove(&id)?;
        if let Entry::Occupied(mut ids) = self.index.entry(group.signature()) {
            ids.get_mut().remove(&id);
            if ids.get().is_empty() {
                ids.remove();
            }
        }
        Some(group)
    }

    /// Writes the record of `id`, and of every id whose earlier write failed,
    /// from the in-memory state.
    fn persist(&mut self, id: Uuid) {
        self.unsynced.insert(id);
        let pending = self.unsynced.iter().copied().sorted().collect::<Vec<_>>();
        for pending_id in pending {
            match self.sync_record(pending_id) {
                Ok(()) => {
                    self.unsynced.remove(&pending_id);
                    if pending_id != id {
                        tracing::info!(id = %pending_id, "caught up previously failed store write");
                    }
                }
                Err(error) => {
                    tracing::error!(id = %pending_id, %error, "failed to persist target group")
                }
            }
        }
    }

    fn sync_record(&self, id: Uuid) -> Result<()> {
        let key = id.to_string();
        match self.groups.get(&id) {
            Some(group) => self.store.put(&key, &serde_json::to_vec(group)?),
            None => self.store.delete(&key),
        }
    }

    fn publish(&self) {
        let start_time = Instant::now();
        let path = self.sd_file.path().display();
        match self.sd_file.write(self.snapshot().map(|(_, group)| group)) {
            Ok(()) => tracing::debug!(%path, elapsed = ?start_time.elapsed(), "generated new sd file"),
            Err(error) => tracing::error!(%path, %error, "failed to generate new sd file"),
        }
    }
}

/// Submits mutations to a spawned [`Registry`].
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Request>,
}

impl RegistryHandle {
    /// Queues `mutation` and waits up to `timeout` for its outcome.
    ///
    /// The timeout covers both waiting for room in the queue and waiting for
    /// the worker. Giving up (on timeout, or by dropping the future) prevents
    /// the mutation from being applied only if the worker has not picked it up
    /// yet; an admitted mutation always runs to completion.
    pub async fn submit(&self, mutation: Mutation, timeout: Duration) -> Result<Outcome> {
        let (reply, outcome) = oneshot::channel();
        let request = Request { mutation, reply };
        let exchange = async {
            self.tx.send(request).await.map_err(|_| Error::WorkerGone)?;
            outcome.await.map_err(|_| Error::WorkerGone)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }
}
