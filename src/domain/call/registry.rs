//! Live-call directory
//!
//! Four independent indices over the same set of legs: by dialog identity
//! (set-valued, retries and forks share a call-id), by unique id, by
//! resolved identity URI and by realm. The identity indices only hold
//! legs whose authentication has completed. No business logic lives here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::entity::CallLeg;
use super::state::DerivedStatus;
use crate::domain::shared::value_objects::DialogId;

#[derive(Default)]
struct Indexes {
    by_call_id: HashMap<String, HashSet<Uuid>>,
    by_id: HashMap<Uuid, Arc<CallLeg>>,
    by_identity_uri: HashMap<String, HashSet<Uuid>>,
    by_realm: HashMap<String, HashSet<Uuid>>,
}

/// Snapshot of directory contents for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    /// Number of call-id buckets
    pub dialogs: usize,
    /// Number of legs across all buckets
    pub legs: usize,
    pub confirmed: usize,
    pub early: usize,
    pub proceeding: usize,
}

#[derive(Default)]
pub struct CallRegistry {
    inner: RwLock<Indexes>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a leg in every applicable index. Returns false
    /// without touching the indices when the leg has no valid dialog
    /// identity; a leg whose teardown has completed is removed instead.
    pub fn upsert(&self, leg: &Arc<CallLeg>) -> bool {
        let dialog_id = leg.dialog_id();
        if !dialog_id.is_valid() {
            debug!(leg = %leg.id(), "upsert refused: missing dialog identity");
            return false;
        }
        if leg.state().destroyed {
            self.remove(leg);
            return false;
        }

        let mut inner = self.inner.write().unwrap();
        inner
            .by_call_id
            .entry(dialog_id.call_id.clone())
            .or_default()
            .insert(leg.id());
        inner.by_id.insert(leg.id(), leg.clone());

        if let Some(identity) = leg.identity() {
            inner
                .by_identity_uri
                .entry(identity.uri.clone())
                .or_default()
                .insert(leg.id());
            inner
                .by_realm
                .entry(identity.realm.clone())
                .or_default()
                .insert(leg.id());
        }
        true
    }

    /// Find the dialog whose stored tags each match the queried tag
    /// exactly or are still unset
    pub fn find_by_dialog(&self, query: &DialogId) -> Option<Arc<CallLeg>> {
        let inner = self.inner.read().unwrap();
        let bucket = inner.by_call_id.get(&query.call_id)?;
        bucket
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .find(|leg| leg.dialog_id().matches(query))
            .cloned()
    }

    pub fn find_by_id(&self, id: Uuid) -> Option<Arc<CallLeg>> {
        self.inner.read().unwrap().by_id.get(&id).cloned()
    }

    pub fn find_by_identity_uri(&self, uri: &str) -> Vec<Arc<CallLeg>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_identity_uri
            .get(uri)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn find_by_realm(&self, realm: &str) -> Vec<Arc<CallLeg>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_realm
            .get(realm)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Delete a leg from all four indices, pruning empty buckets
    pub fn remove(&self, leg: &Arc<CallLeg>) {
        let mut inner = self.inner.write().unwrap();
        let id = leg.id();
        inner.by_id.remove(&id);

        let call_id = leg.dialog_id().call_id;
        prune(&mut inner.by_call_id, &call_id, id);
        if let Some(identity) = leg.identity() {
            prune(&mut inner.by_identity_uri, &identity.uri, id);
            prune(&mut inner.by_realm, &identity.realm, id);
        }
        debug!(leg = %id, "removed from directory");
    }

    pub fn stats(&self) -> DirectoryStats {
        let inner = self.inner.read().unwrap();
        let mut stats = DirectoryStats {
            dialogs: inner.by_call_id.len(),
            legs: inner.by_id.len(),
            ..Default::default()
        };
        for leg in inner.by_id.values() {
            match leg.state().derived_status() {
                DerivedStatus::Confirmed => stats.confirmed += 1,
                DerivedStatus::Early => stats.early += 1,
                DerivedStatus::Proceeding => stats.proceeding += 1,
                _ => {}
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn prune(index: &mut HashMap<String, HashSet<Uuid>>, key: &str, id: Uuid) {
    if let Some(bucket) = index.get_mut(key) {
        bucket.remove(&id);
        if bucket.is_empty() {
            index.remove(key);
        }
    }
}
