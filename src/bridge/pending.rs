//! Pending-call table
//!
//! Maps request ids to the oneshot sender of the caller awaiting that id.
//! Id allocation and insertion happen under the same lock, so two concurrent
//! calls can never share an id. Entries are tagged with the process
//! generation they were written to, which lets a dying reader fail only its
//! own calls.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::{Error, Result};

type Reply = Result<JsonValue>;

struct Entry {
    generation: u64,
    method: String,
    tx: oneshot::Sender<Reply>,
}

struct Table {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

/// Outcome of routing a response to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// No entry for that id (duplicate, late, or never issued)
    Unknown,
    /// The id belongs to a call written to a different process
    ForeignGeneration,
}

pub(crate) struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: u64) -> Self {
        Self {
            table: Mutex::new(Table {
                next_id: first_id,
                entries: HashMap::new(),
            }),
        }
    }

    /// Allocate the next id and register a waiter for it.
    pub fn register(self: &Arc<Self>, generation: u64, method: &str) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut table = self.table.lock();
            let id = table.next_id;
            table.next_id += 1;
            table.entries.insert(
                id,
                Entry {
                    generation,
                    method: method.to_string(),
                    tx,
                },
            );
            id
        };

        PendingCall {
            id,
            rx,
            _guard: PendingGuard {
                calls: Arc::clone(self),
                id,
            },
        }
    }

    /// Remove the entry for `id` and hand it `reply`.
    pub fn complete(&self, generation: u64, id: u64, reply: Reply) -> Delivery {
        let entry = {
            let mut table = self.table.lock();
            match table.entries.get(&id) {
                Some(entry) if entry.generation == generation => table.entries.remove(&id),
                Some(_) => return Delivery::ForeignGeneration,
                None => return Delivery::Unknown,
            }
        };

        match entry {
            Some(entry) => {
                tracing::trace!(id, method = %entry.method, "Completing pending call");
                // The caller may have given up in the meantime
                let _ = entry.tx.send(reply);
                Delivery::Delivered
            }
            None => Delivery::Unknown,
        }
    }

    /// Drop the entry for `id` without notifying anyone.
    pub fn forget(&self, id: u64) -> bool {
        self.table.lock().entries.remove(&id).is_some()
    }

    /// Reject every call written to `generation`.
    pub fn fail_generation(&self, generation: u64, make_error: impl Fn() -> Error) -> usize {
        self.drain_matching(|entry| entry.generation == generation, make_error)
    }

    /// Reject every outstanding call.
    pub fn fail_all(&self, make_error: impl Fn() -> Error) -> usize {
        self.drain_matching(|_| true, make_error)
    }

    fn drain_matching(
        &self,
        matches: impl Fn(&Entry) -> bool,
        make_error: impl Fn() -> Error,
    ) -> usize {
        let drained: Vec<Entry> = {
            let mut table = self.table.lock();
            let ids: Vec<u64> = table
                .entries
                .iter()
                .filter(|(_, entry)| matches(entry))
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| table.entries.remove(id))
                .collect()
        };

        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(make_error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }
}

/// Removes a call's entry when its waiter goes away (timeout or cancellation).
struct PendingGuard {
    calls: Arc<PendingCalls>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.calls.forget(self.id) {
            tracing::debug!(id = self.id, "Abandoned pending call removed");
        }
    }
}

/// A registered call awaiting its response
pub(crate) struct PendingCall {
    pub id: u64,
    rx: oneshot::Receiver<Reply>,
    _guard: PendingGuard,
}

impl PendingCall {
    pub async fn wait(self) -> Result<JsonValue> {
        let PendingCall { rx, _guard, .. } = self;
        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(Error::ProcessExited("response channel closed".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_concurrent_registration_never_reuses_ids() {
        let calls = Arc::new(PendingCalls::new());
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    let call = calls.register(1, "tools/call");
                    let id = call.id;
                    std::mem::forget(call);
                    id
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for task in tasks {
            assert!(ids.insert(task.await.unwrap()));
        }
        assert_eq!(ids.len(), 64);
    }

    #[tokio::test]
    async fn test_complete_resolves_once() {
        let calls = Arc::new(PendingCalls::new());
        let call = calls.register(1, "tools/list");
        let id = call.id;

        assert_eq!(calls.complete(1, id, Ok(json!(1))), Delivery::Delivered);
        assert_eq!(calls.complete(1, id, Ok(json!(2))), Delivery::Unknown);
        assert_eq!(call.wait().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_other_generation_cannot_complete() {
        let calls = Arc::new(PendingCalls::new());
        let call = calls.register(2, "tools/list");
        assert_eq!(
            calls.complete(1, call.id, Ok(json!(null))),
            Delivery::ForeignGeneration
        );
        assert_eq!(calls.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_generation_leaves_other_generations() {
        let calls = Arc::new(PendingCalls::new());
        let old = calls.register(1, "a");
        let new = calls.register(2, "b");

        assert_eq!(
            calls.fail_generation(1, || Error::ProcessExited("gone".into())),
            1
        );
        assert!(matches!(old.wait().await, Err(Error::ProcessExited(_))));
        assert_eq!(calls.len(), 1);

        calls.complete(2, new.id, Ok(json!("ok")));
        assert_eq!(new.wait().await.unwrap(), json!("ok"));
    }

    #[test]
    fn test_dropped_call_removes_entry() {
        let calls = Arc::new(PendingCalls::new());
        let call = calls.register(1, "tools/call");
        let id = call.id;
        drop(call);

        assert_eq!(calls.len(), 0);
        assert_eq!(calls.complete(1, id, Ok(json!(1))), Delivery::Unknown);
    }
}
