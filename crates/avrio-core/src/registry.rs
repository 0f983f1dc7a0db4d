//! Per-channel call registry.
//!
//! Maps the low bits of a wire id to the completion slot of an in-flight
//! call. Ids are assigned monotonically modulo [`ID_MASK`]; the high bits of
//! a wire id carry the channel scope prefix and are masked off on lookup.
//!
//! A slot resolves at most once: whichever of response, timeout or
//! interruption arrives first wins, and the others are no-ops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::RpcError;

/// Number of high bits of a wire id reserved for the channel scope prefix.
pub const PREFIX_LENGTH: u32 = 16;

/// Mask selecting the registry id bits of a wire id.
pub const ID_MASK: u32 = (1 << (32 - PREFIX_LENGTH)) - 1;

/// Outcome delivered to a registered call slot.
pub type CallResult = Result<Bytes, RpcError>;

type Slot = oneshot::Sender<CallResult>;

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    next_id: u32,
    pending: HashMap<u32, Slot>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                pending: HashMap::new(),
            })),
        }
    }

    /// Register a new call and return its id plus the completion receiver.
    ///
    /// With a non-zero timeout, a timer resolves the slot with a timeout
    /// error when it fires; a response arriving later is dropped.
    pub fn add(&self, timeout: Option<Duration>) -> (u32, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut inner = self.inner.lock();
            inner.next_id = inner.next_id.wrapping_add(1) & ID_MASK;
            let id = inner.next_id;
            if inner.pending.insert(id, tx).is_some() {
                warn!(id, "registry id wrapped onto a pending call");
            }
            id
        };

        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            let registry = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if registry.resolve(id, Err(RpcError::timeout())) {
                    warn!(id, "call timed out");
                }
            });
        }

        (id, rx)
    }

    /// Resolve the slot registered under the id bits of `wire_id`.
    ///
    /// Returns `false` if no slot is registered (already resolved, timed out,
    /// or never known) — the result is dropped in that case.
    pub fn resolve(&self, wire_id: u32, result: CallResult) -> bool {
        let slot = self.inner.lock().pending.remove(&(wire_id & ID_MASK));
        match slot {
            Some(tx) => {
                // The receiver may be gone if the caller stopped waiting.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Number of in-flight calls.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every pending slot with an interruption error and empty the
    /// table.
    pub fn clear(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.pending)
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::interrupted()));
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn add_assigns_monotonic_ids() {
        let registry = Registry::new();
        let (a, _ra) = registry.add(None);
        let (b, _rb) = registry.add(None);
        let (c, _rc) = registry.add(None);
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn resolve_masks_off_the_prefix() {
        let registry = Registry::new();
        let (id, rx) = registry.add(None);
        let wire_id = 0xabcd_0000 | id;
        assert!(registry.resolve(wire_id, Ok(Bytes::from_static(b"ok"))));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"ok"));
    }

    #[tokio::test]
    async fn slot_fires_at_most_once() {
        let registry = Registry::new();
        let (id, rx) = registry.add(None);
        assert!(registry.resolve(id, Ok(Bytes::from_static(b"first"))));
        assert!(!registry.resolve(id, Ok(Bytes::from_static(b"second"))));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn timeout_wins_over_late_response() {
        let registry = Registry::new();
        let (id, rx) = registry.add(Some(Duration::from_millis(20)));
        let result = rx.await.unwrap();
        assert_eq!(result.unwrap_err().code(), ErrorCode::Timeout);
        // The late response finds no slot.
        assert!(!registry.resolve(id, Ok(Bytes::from_static(b"late"))));
    }

    #[tokio::test]
    async fn response_wins_over_late_timer() {
        let registry = Registry::new();
        let (id, rx) = registry.add(Some(Duration::from_secs(30)));
        assert!(registry.resolve(id, Ok(Bytes::from_static(b"fast"))));
        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"fast"));
    }

    #[tokio::test]
    async fn clear_interrupts_everything() {
        let registry = Registry::new();
        let (_a, ra) = registry.add(None);
        let (_b, rb) = registry.add(None);
        registry.clear();
        assert_eq!(registry.len(), 0);
        assert_eq!(ra.await.unwrap().unwrap_err().code(), ErrorCode::Interrupted);
        assert_eq!(rb.await.unwrap().unwrap_err().code(), ErrorCode::Interrupted);
    }
}
