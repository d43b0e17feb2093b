use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::transport::{ExchangeHandle, PublishMeta};

/// One publish staged inside a transaction. The exchange is resolved at
/// publish time, so flushing is just a send per entry.
pub struct PendingPublish {
    pub exchange: Arc<dyn ExchangeHandle>,
    pub payload: Vec<u8>,
    pub meta: PublishMeta,
}

#[derive(Default)]
struct TxState {
    depth: u32,
    entries: Vec<PendingPublish>,
}

/// Scoped staging area for transactional publishes. While a transaction is
/// active, publishes land here instead of the transport; the outermost exit
/// flushes (on success) or discards (on error). Nested transactions share
/// the one buffer; there is no partial rollback.
#[derive(Default)]
pub struct TransactionBuffer {
    state: Arc<Mutex<TxState>>,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        TransactionBuffer::default()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().expect("transaction state poisoned").depth > 0
    }

    /// Enter a transaction scope. The returned guard tracks nesting depth
    /// and guarantees the buffer is cleared when the outermost scope exits,
    /// success or failure.
    pub fn begin(&self) -> TransactionGuard {
        let mut state = self.state.lock().expect("transaction state poisoned");
        state.depth += 1;
        let outermost = state.depth == 1;
        debug!("Entering transaction (depth {})", state.depth);
        TransactionGuard {
            state: self.state.clone(),
            outermost,
        }
    }

    /// Stage an entry if a transaction is active. Returns false when no
    /// transaction is open, in which case the caller publishes directly.
    pub fn try_buffer(&self, entry: PendingPublish) -> bool {
        let mut state = self.state.lock().expect("transaction state poisoned");
        if state.depth == 0 {
            return false;
        }
        state.entries.push(entry);
        true
    }

    /// Drain staged entries in insertion order for the outermost flush.
    pub fn take_entries(&self) -> Vec<PendingPublish> {
        let mut state = self.state.lock().expect("transaction state poisoned");
        std::mem::take(&mut state.entries)
    }

    /// Encoded payloads staged so far, for nested scopes reporting the outer
    /// buffer's contents.
    pub fn staged_payloads(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .expect("transaction state poisoned")
            .entries
            .iter()
            .map(|e| e.payload.clone())
            .collect()
    }
}

/// Depth marker for one transaction scope. Dropping it unconditionally
/// closes the scope; when the outermost scope closes, any entries still in
/// the buffer (the error path) are discarded so the next transaction starts
/// clean.
pub struct TransactionGuard {
    state: Arc<Mutex<TxState>>,
    outermost: bool,
}

impl TransactionGuard {
    pub fn is_outermost(&self) -> bool {
        self.outermost
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("transaction state poisoned");
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 && !state.entries.is_empty() {
            debug!("Discarding {} unflushed transaction entries", state.entries.len());
            state.entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::Result;

    struct NullExchange;

    #[async_trait]
    impl ExchangeHandle for NullExchange {
        fn name(&self) -> &str {
            "null"
        }

        async fn publish(&self, _payload: &[u8], _meta: &PublishMeta) -> Result<()> {
            Ok(())
        }
    }

    fn entry(payload: &[u8]) -> PendingPublish {
        PendingPublish {
            exchange: Arc::new(NullExchange),
            payload: payload.to_vec(),
            meta: PublishMeta::default(),
        }
    }

    #[test]
    fn inactive_buffer_refuses_entries() {
        let buffer = TransactionBuffer::new();
        assert!(!buffer.is_active());
        assert!(!buffer.try_buffer(entry(b"x")));
    }

    #[test]
    fn entries_survive_until_outermost_exit() {
        let buffer = TransactionBuffer::new();
        let outer = buffer.begin();
        assert!(outer.is_outermost());
        assert!(buffer.try_buffer(entry(b"one")));

        {
            let inner = buffer.begin();
            assert!(!inner.is_outermost());
            assert!(buffer.try_buffer(entry(b"two")));
            // Inner exit must not clear the shared buffer.
        }
        assert_eq!(buffer.staged_payloads(), vec![b"one".to_vec(), b"two".to_vec()]);

        drop(outer);
        assert!(!buffer.is_active());
        assert!(buffer.staged_payloads().is_empty());
    }

    #[test]
    fn take_entries_preserves_insertion_order() {
        let buffer = TransactionBuffer::new();
        let guard = buffer.begin();
        buffer.try_buffer(entry(b"a"));
        buffer.try_buffer(entry(b"b"));
        buffer.try_buffer(entry(b"c"));

        let payloads: Vec<Vec<u8>> = buffer
            .take_entries()
            .into_iter()
            .map(|e| e.payload)
            .collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        drop(guard);
    }
}
