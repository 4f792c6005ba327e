use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::Notify;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an accepted connection.
///
/// Displayed as `conn-N` in log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[inline]
    pub fn new() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline(always)]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Slots {
    active: AtomicUsize,
    released: Notify,
}

/// Counts the HTTP connections currently holding a permit.
#[derive(Debug, Clone, Default)]
pub(crate) struct Admission {
    slots: Arc<Slots>,
}

impl Admission {
    #[inline]
    pub(crate) fn admit(&self) -> AdmissionPermit {
        self.slots.active.fetch_add(1, Ordering::AcqRel);

        AdmissionPermit {
            slots: Arc::clone(&self.slots),
            id: ConnectionId::new(),
        }
    }

    #[inline]
    pub(crate) fn active(&self) -> usize {
        self.slots.active.load(Ordering::Acquire)
    }

    /// Resolves once no permit is held.
    pub(crate) async fn drained(&self) {
        loop {
            let released = self.slots.released.notified();
            if self.active() == 0 {
                return;
            }
            released.await;
        }
    }
}

/// Admission stage of one connection. Dropping it releases the slot.
#[derive(Debug)]
pub(crate) struct AdmissionPermit {
    slots: Arc<Slots>,
    id: ConnectionId,
}

impl AdmissionPermit {
    #[inline(always)]
    pub(crate) const fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.slots.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.slots.released.notify_waiters();
        }
        tracing::trace!(conn = %self.id, "admission released");
    }
}
