//! Idempotent request handling.
//!
//! Keys are scoped per operation and caller. The first request for a key is
//! admitted with a [`Ticket`]; concurrent requests for the same key wait on
//! the ticket and replay whatever it records. A ticket dropped without
//! recording frees the slot for the next waiter. Recorded responses are
//! replayed until the TTL runs out, after which the key is new again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vaultline_common::{is_expired, SharedClock, Timestamp};
use vaultline_protocol::{IdempotencyKey, OperationResponse};

/// SHA-256 of the serialized request, hex encoded.
pub fn fingerprint<T: Serialize>(request: &T) -> String {
    let bytes = serde_json::to_vec(request).unwrap_or_default();
    Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    scope: String,
    key: IdempotencyKey,
}

#[derive(Debug)]
enum Slot {
    InFlight {
        ticket: u64,
        done: watch::Receiver<Option<OperationResponse>>,
    },
    Completed {
        response: OperationResponse,
        fingerprint: String,
        expires_at: Timestamp,
    },
}

/// Result of asking to run a keyed request.
#[derive(Debug)]
pub enum Admission {
    /// Run the request, then record its response on the ticket.
    Proceed(Ticket),
    /// A response for this key already exists.
    Replay(OperationResponse),
}

/// Exclusive right to execute a keyed request.
pub struct Ticket {
    id: u64,
    slot: SlotKey,
    fingerprint: String,
    slots: Arc<DashMap<SlotKey, Slot>>,
    done: Option<watch::Sender<Option<OperationResponse>>>,
    clock: SharedClock,
    ttl: ChronoDuration,
}

impl Ticket {
    /// Store `response` for replay and wake waiters.
    ///
    /// Server-side failures and cancellations are not stored; the key is
    /// released so a retry runs again. The replay window starts now.
    pub fn record(mut self, response: &OperationResponse) {
        let Some(done) = self.done.take() else {
            return;
        };

        if response.is_retryable_failure() {
            debug!(
                scope = %self.slot.scope,
                status = response.status_code,
                "Not caching retryable failure, releasing key"
            );
            self.release();
            return;
        }

        self.slots.insert(
            self.slot.clone(),
            Slot::Completed {
                response: response.clone(),
                fingerprint: self.fingerprint.clone(),
                expires_at: self.clock.now() + self.ttl,
            },
        );
        let _ = done.send(Some(response.clone()));
    }

    fn release(&self) {
        let id = self.id;
        self.slots
            .remove_if(&self.slot, |_, slot| matches!(slot, Slot::InFlight { ticket, .. } if *ticket == id));
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("scope", &self.slot.scope)
            .field("key", &self.slot.key)
            .finish_non_exhaustive()
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.done.is_some() {
            self.release();
        }
    }
}

enum Seen {
    Expired,
    Replay(OperationResponse, String),
    Wait(watch::Receiver<Option<OperationResponse>>),
}

/// Key-based replay cache with block-and-replay for concurrent duplicates.
#[derive(Clone)]
pub struct IdempotencyGuard {
    slots: Arc<DashMap<SlotKey, Slot>>,
    clock: SharedClock,
    ttl: ChronoDuration,
    next_ticket: Arc<AtomicU64>,
}

impl IdempotencyGuard {
    pub fn new(clock: SharedClock, ttl: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            clock,
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(60)),
            next_ticket: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Admit a request or hand back the response recorded for its key.
    pub async fn admit(
        &self,
        scope: &str,
        key: &IdempotencyKey,
        fingerprint: String,
    ) -> Admission {
        let slot = SlotKey {
            scope: scope.to_string(),
            key: key.clone(),
        };

        loop {
            let now = self.clock.now();
            let mut waiter = match self.slots.entry(slot.clone()) {
                Entry::Vacant(vacant) => {
                    let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    vacant.insert(Slot::InFlight { ticket: id, done: rx });
                    return Admission::Proceed(Ticket {
                        id,
                        slot,
                        fingerprint,
                        slots: self.slots.clone(),
                        done: Some(tx),
                        clock: self.clock.clone(),
                        ttl: self.ttl,
                    });
                }
                Entry::Occupied(occupied) => {
                    let seen = match occupied.get() {
                        Slot::Completed { expires_at, .. } if is_expired(*expires_at, now) => {
                            Seen::Expired
                        }
                        Slot::Completed {
                            response,
                            fingerprint,
                            ..
                        } => Seen::Replay(response.clone(), fingerprint.clone()),
                        Slot::InFlight { done, .. } => Seen::Wait(done.clone()),
                    };
                    match seen {
                        Seen::Expired => {
                            occupied.remove();
                            debug!(scope, key = %key, "Idempotency key expired");
                            continue;
                        }
                        Seen::Replay(response, recorded) => {
                            if recorded != fingerprint {
                                warn!(scope, key = %key, "Idempotency key reused with a different request");
                            }
                            return Admission::Replay(response);
                        }
                        Seen::Wait(done) => done,
                    }
                }
            };

            debug!(scope, key = %key, "Waiting for in-flight request with the same key");
            if let Some(response) = waiter.borrow().as_ref().cloned() {
                return Admission::Replay(response);
            }
            if waiter.changed().await.is_ok() {
                if let Some(response) = waiter.borrow().as_ref().cloned() {
                    return Admission::Replay(response);
                }
            }
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Completed { expires_at, .. } => !is_expired(*expires_at, now),
            Slot::InFlight { .. } => true,
        });
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Run the eviction pass every `interval` until `shutdown` fires.
    pub async fn run_cleanup_loop(&self, interval: Duration, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let removed = self.purge_expired();
                    if removed > 0 {
                        debug!(removed, "Evicted expired idempotency keys");
                    }
                }
            }
        }
    }
}
