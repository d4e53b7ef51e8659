//! Shared template state: the current mining job, its derived Stratum
//! parameters, and the set of sessions waiting for / already receiving it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use ruint::aliases::U256;
use tokio::sync::mpsc;

use crate::coinbase::Coinbase;
use crate::stratum::messages::Notification;

/// A handle sessions register with the template store so it can push
/// notifications without holding a reference to the session task itself.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub worker_name: String,
    pub sender: mpsc::Sender<Notification>,
}

/// The current mining job, as derived by the template updater.
#[derive(Debug, Clone)]
pub struct Template {
    pub height: i64,
    pub version: i32,
    pub bits_hex: String,
    pub bits: u32,
    pub target: U256,
    pub prev_hash_be: [u8; 32],
    pub prev_hash_header_le: [u8; 32],
    pub prev_hash_notify: [u8; 32],
    pub timestamp: u32,
    pub job_id: u64,
    pub merkle_branch: Vec<[u8; 32]>,
    pub external_txs: Vec<Vec<u8>>,
    pub coinbase: Coinbase,
    pub advertised_diff: f64,
}

impl Template {
    /// Stratum v1 positional `mining.notify` parameters.
    pub fn job_params(&self, clean: bool) -> serde_json::Value {
        let merkle_hex: Vec<String> = self.merkle_branch.iter().map(hex::encode).collect();
        serde_json::json!([
            format!("{:x}", self.job_id),
            hex::encode(self.prev_hash_notify),
            hex::encode(&self.coinbase.coinbase1),
            hex::encode(&self.coinbase.coinbase2),
            merkle_hex,
            hex::encode(self.version.to_be_bytes()),
            self.bits_hex,
            hex::encode(self.timestamp.to_be_bytes()),
            clean,
        ])
    }
}

#[derive(Default)]
struct Inner {
    template: Option<Template>,
    payout_h160: Option<[u8; 20]>,
    new_sessions: HashMap<u64, SessionHandle>,
    all_sessions: HashMap<u64, SessionHandle>,
}

/// The shared template object: one writer (the updater), many readers
/// (sessions and the validator).
#[derive(Clone)]
pub struct TemplateStore {
    inner: Arc<RwLock<Inner>>,
}

impl Default for TemplateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// A read-locked snapshot of the current template, if any.
    pub fn current(&self) -> Option<Template> {
        self.inner.read().template.clone()
    }

    pub fn height(&self) -> i64 {
        self.inner.read().template.as_ref().map(|t| t.height).unwrap_or(-1)
    }

    pub fn payout_h160(&self) -> Option<[u8; 20]> {
        self.inner.read().payout_h160
    }

    /// Set the payout address if unset; returns whether it was just claimed.
    pub fn claim_payout(&self, h160: [u8; 20]) -> bool {
        let mut inner = self.inner.write();
        if inner.payout_h160.is_none() {
            inner.payout_h160 = Some(h160);
            true
        } else {
            false
        }
    }

    /// Clear the payout once the last session disconnects.
    pub fn clear_payout_if_empty(&self) {
        let mut inner = self.inner.write();
        if inner.new_sessions.is_empty() && inner.all_sessions.is_empty() {
            inner.payout_h160 = None;
            inner.template = None;
        }
    }

    pub fn replace_template(&self, template: Template) {
        self.inner.write().template = Some(template);
    }

    pub fn add_new_session(&self, handle: SessionHandle) {
        self.inner.write().new_sessions.insert(handle.id, handle);
    }

    pub fn remove_session(&self, id: u64) {
        let mut inner = self.inner.write();
        inner.new_sessions.remove(&id);
        inner.all_sessions.remove(&id);
    }

    /// Snapshot both sets for a fan-out pass. Returns `(new_sessions,
    /// all_sessions)`; the caller promotes/prunes and calls
    /// [`TemplateStore::commit_fanout`] afterwards.
    pub fn snapshot_sessions(&self) -> (Vec<SessionHandle>, Vec<SessionHandle>) {
        let inner = self.inner.read();
        (
            inner.new_sessions.values().cloned().collect(),
            inner.all_sessions.values().cloned().collect(),
        )
    }

    /// After a fan-out pass: move every session that received its first job
    /// into `all_sessions`, and drop any session whose send failed.
    pub fn commit_fanout(&self, promoted_new_ids: &[u64], dead_all_ids: &[u64], dead_new_ids: &[u64]) {
        let mut inner = self.inner.write();
        for id in dead_all_ids {
            inner.all_sessions.remove(id);
        }
        for id in promoted_new_ids {
            if let Some(handle) = inner.new_sessions.remove(id) {
                inner.all_sessions.insert(*id, handle);
            }
        }
        for id in dead_new_ids {
            inner.new_sessions.remove(id);
        }
    }

    /// Promote a single session out of `new_sessions` into `all_sessions`,
    /// used by `mining.authorize` when a template is already available.
    pub fn promote_session(&self, id: u64) {
        let mut inner = self.inner.write();
        if let Some(handle) = inner.new_sessions.remove(&id) {
            inner.all_sessions.insert(id, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_payout_only_succeeds_once() {
        let store = TemplateStore::new();
        assert!(store.claim_payout([1; 20]));
        assert!(!store.claim_payout([2; 20]));
        assert_eq!(store.payout_h160(), Some([1; 20]));
    }

    #[test]
    fn clear_payout_only_when_no_sessions_remain() {
        let store = TemplateStore::new();
        store.claim_payout([1; 20]);
        let (tx, _rx) = mpsc::channel(1);
        store.add_new_session(SessionHandle {
            id: 1,
            worker_name: "w".into(),
            sender: tx,
        });
        store.clear_payout_if_empty();
        assert_eq!(store.payout_h160(), Some([1; 20]));
        store.remove_session(1);
        store.clear_payout_if_empty();
        assert_eq!(store.payout_h160(), None);
    }
}
