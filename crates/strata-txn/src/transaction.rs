use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

/// Identifier of one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(Uuid);

impl TransactionId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0.simple())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    /// Still open, but can only end in a rollback.
    MarkedRollback,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }
}

/// Completion hook registered with a [`Transaction`].
pub trait Synchronization: Send + Sync {
    /// Called exactly once, after the outcome is final. `status` is either
    /// `Committed` or `RolledBack`.
    fn after_completion(&self, tx: TransactionId, status: TransactionStatus);
}

struct State {
    status: TransactionStatus,
    synchronizations: Vec<Arc<dyn Synchronization>>,
}

/// An open unit of work.
///
/// `commit` and `rollback` consume the handle, so a finished transaction
/// cannot be used again. Dropping an open handle rolls it back. Every
/// registered [`Synchronization`] runs once the outcome is decided, in
/// registration order, before `commit`/`rollback` return.
pub struct Transaction {
    handle: TransactionHandle,
}

/// Shared reference to a transaction's state, held by transactional views.
#[derive(Clone)]
pub(crate) struct TransactionHandle {
    id: TransactionId,
    state: Arc<Mutex<State>>,
}

impl TransactionHandle {
    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn status(&self) -> TransactionStatus {
        self.state.lock().expect("lock poisoned").status
    }

    /// Run `f` under the state lock, so the transaction cannot complete
    /// until `f` returns. `f` may push synchronizations. Returns `None`
    /// without calling `f` once the transaction has completed.
    pub(crate) fn while_open<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Vec<Arc<dyn Synchronization>>) -> R,
    {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.status.is_open() {
            return None;
        }
        Some(f(&mut state.synchronizations))
    }

    /// Register `sync` unless the transaction already completed.
    pub(crate) fn register(&self, sync: Arc<dyn Synchronization>) -> bool {
        self.while_open(|synchronizations| synchronizations.push(sync)).is_some()
    }

    fn complete(&self, outcome: TransactionStatus) -> TransactionStatus {
        let synchronizations = {
            let mut state = self.state.lock().expect("lock poisoned");
            if !state.status.is_open() {
                return state.status;
            }
            state.status = outcome;
            std::mem::take(&mut state.synchronizations)
        };
        debug!(tx = %self.id, status = ?outcome, hooks = synchronizations.len(), "transaction completed");
        for sync in synchronizations {
            sync.after_completion(self.id, outcome);
        }
        outcome
    }
}

impl Transaction {
    pub fn begin() -> Self {
        let id = TransactionId::new();
        debug!(tx = %id, "transaction started");
        Self {
            handle: TransactionHandle {
                id,
                state: Arc::new(Mutex::new(State {
                    status: TransactionStatus::Active,
                    synchronizations: Vec::new(),
                })),
            },
        }
    }

    pub fn id(&self) -> TransactionId {
        self.handle.id
    }

    pub fn status(&self) -> TransactionStatus {
        self.handle.status()
    }

    /// Force the transaction to end in a rollback.
    pub fn set_rollback_only(&self) {
        let mut state = self.handle.state.lock().expect("lock poisoned");
        if state.status == TransactionStatus::Active {
            state.status = TransactionStatus::MarkedRollback;
        }
    }

    pub fn register_synchronization(&self, sync: Arc<dyn Synchronization>) {
        self.handle.register(sync);
    }

    /// Commit, or roll back if the transaction was marked rollback-only.
    /// Returns the final status.
    pub fn commit(self) -> TransactionStatus {
        let outcome = match self.status() {
            TransactionStatus::Active => TransactionStatus::Committed,
            _ => TransactionStatus::RolledBack,
        };
        self.handle.complete(outcome)
    }

    pub fn rollback(self) -> TransactionStatus {
        self.handle.complete(TransactionStatus::RolledBack)
    }

    pub(crate) fn handle(&self) -> TransactionHandle {
        self.handle.clone()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.handle.complete(TransactionStatus::RolledBack);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(TransactionId, TransactionStatus)>>,
    }

    impl Synchronization for Recorder {
        fn after_completion(&self, tx: TransactionId, status: TransactionStatus) {
            self.calls.lock().unwrap().push((tx, status));
        }
    }

    fn recorded(tx: &Transaction) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        tx.register_synchronization(recorder.clone());
        recorder
    }

    #[test]
    fn commit_notifies_once() {
        let tx = Transaction::begin();
        let id = tx.id();
        let recorder = recorded(&tx);
        assert_eq!(tx.status(), TransactionStatus::Active);
        assert_eq!(tx.commit(), TransactionStatus::Committed);
        assert_eq!(*recorder.calls.lock().unwrap(), vec![(id, TransactionStatus::Committed)]);
    }

    #[test]
    fn rollback_notifies_once() {
        let tx = Transaction::begin();
        let recorder = recorded(&tx);
        assert_eq!(tx.rollback(), TransactionStatus::RolledBack);
        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, TransactionStatus::RolledBack);
    }

    #[test]
    fn rollback_only_commit_rolls_back() {
        let tx = Transaction::begin();
        let recorder = recorded(&tx);
        tx.set_rollback_only();
        assert_eq!(tx.status(), TransactionStatus::MarkedRollback);
        assert_eq!(tx.commit(), TransactionStatus::RolledBack);
        assert_eq!(recorder.calls.lock().unwrap()[0].1, TransactionStatus::RolledBack);
    }

    #[test]
    fn drop_rolls_back() {
        let recorder;
        {
            let tx = Transaction::begin();
            recorder = recorded(&tx);
        }
        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, TransactionStatus::RolledBack);
    }

    #[test]
    fn every_hook_runs() {
        let tx = Transaction::begin();
        let first = recorded(&tx);
        let second = recorded(&tx);
        tx.commit();
        assert_eq!(first.calls.lock().unwrap().len(), 1);
        assert_eq!(second.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn completed_transaction_refuses_hooks() {
        let tx = Transaction::begin();
        let handle = tx.handle();
        assert!(handle.while_open(|_| ()).is_some());
        tx.commit();
        assert!(handle.while_open(|_| ()).is_none());
        assert!(!handle.register(Arc::new(Recorder::default())));
    }

    #[test]
    fn ids_are_unique() {
        let a = Transaction::begin();
        let b = Transaction::begin();
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("tx-"));
    }
}
