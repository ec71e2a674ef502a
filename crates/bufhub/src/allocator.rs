//! Server-side data slot allocator.
//!
//! The authoritative free/in-use table lives in server memory behind a mutex;
//! the shared `state`, `owner_pid` and `lease` words are a mirror clients can
//! read but the server never trusts.
//!
//! Every allocation gets a fresh [`LeaseId`]. Events that refer to an older
//! lease (a late handshake EOF, say) are ignored, so they can never tear down
//! the slot's next owner.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{HubError, Violation};
use crate::layout::{NO_OWNER, SlotState};
use crate::region::SharedRegion;

/// Generation number of one slot lease. Never 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub u32);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a lease is being torn down without a Finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    /// The owner's handshake connection closed.
    HandshakeClosed,
    /// The owner never completed the handshake.
    HandshakeTimeout,
    /// The owner gave up waiting for a response.
    Abandoned,
}

/// Snapshot of a live lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseInfo {
    pub id: LeaseId,
    pub pid: u32,
    pub bound: bool,
}

#[derive(Debug)]
struct Lease {
    id: LeaseId,
    pid: u32,
    bound: bool,
    leased_at: Instant,
    revoked: Option<RevokeReason>,
}

#[derive(Debug)]
struct Table {
    entries: Vec<Option<Lease>>,
    last_lease: u32,
}

impl Table {
    fn next_lease(&mut self) -> LeaseId {
        self.last_lease = self.last_lease.wrapping_add(1).max(1);
        LeaseId(self.last_lease)
    }
}

/// Hands out data slots and reclaims them.
pub struct SlotAllocator {
    region: Arc<SharedRegion>,
    table: Mutex<Table>,
    handshake_timeout: Duration,
}

impl SlotAllocator {
    pub fn new(region: Arc<SharedRegion>, handshake_timeout: Duration) -> Self {
        let slots = region.slot_count() as usize;
        Self {
            region,
            table: Mutex::new(Table {
                entries: (0..slots).map(|_| None).collect(),
                last_lease: 0,
            }),
            handshake_timeout,
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.region.slot_count()
    }

    /// Lease the lowest free slot to `pid`.
    pub fn allocate(&self, pid: u32) -> Result<(u32, LeaseId), HubError> {
        let mut table = self.table.lock();
        let index = table
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(HubError::Exhausted)?;
        let id = table.next_lease();
        table.entries[index] = Some(Lease {
            id,
            pid,
            bound: false,
            leased_at: Instant::now(),
            revoked: None,
        });

        let index = index as u32;
        if let Some(slot) = self.region.data_slot(index) {
            slot.set_owner_pid(pid);
            slot.set_lease(id.0);
            // Last, so a client that sees Idle also sees the owner.
            slot.set_state(SlotState::Idle);
        }
        tracing::info!(slot = index, pid, lease = %id, "slot leased");
        Ok((index, id))
    }

    /// Return a slot to the pool. Freeing a free slot is a no-op.
    ///
    /// Resets both semaphores and the payloads, discarding whatever the
    /// previous owner left behind.
    pub fn free(&self, index: u32) {
        let mut table = self.table.lock();
        let Some(entry) = table.entries.get_mut(index as usize) else {
            return;
        };
        let Some(lease) = entry.take() else {
            return;
        };

        if let Some(slot) = self.region.data_slot(index) {
            slot.set_state(SlotState::Free);
            slot.clear();
            slot.set_owner_pid(NO_OWNER);
            slot.set_lease(0);
        }
        tracing::info!(slot = index, pid = lease.pid, lease = %lease.id, "slot freed");
    }

    /// Current lease on `index`, if any.
    pub fn lease(&self, index: u32) -> Option<LeaseInfo> {
        let table = self.table.lock();
        table
            .entries
            .get(index as usize)?
            .as_ref()
            .map(|lease| LeaseInfo {
                id: lease.id,
                pid: lease.pid,
                bound: lease.bound,
            })
    }

    /// Bind a handshake connection to the slot it announced.
    ///
    /// `peer_pid` is the connecting process, when the platform reports it.
    pub fn bind(&self, index: i32, peer_pid: Option<u32>) -> Result<LeaseId, Violation> {
        let mut table = self.table.lock();
        let entry = usize::try_from(index)
            .ok()
            .and_then(|i| table.entries.get_mut(i))
            .ok_or(Violation::HandshakeOutOfRange)?;

        let lease = match entry {
            Some(lease) if lease.revoked.is_none() => lease,
            _ => return Err(Violation::HandshakeInactive),
        };
        if peer_pid.is_some_and(|pid| pid != lease.pid) {
            return Err(Violation::HandshakeOwnerMismatch);
        }
        if lease.bound {
            return Err(Violation::HandshakeAlreadyBound);
        }
        lease.bound = true;
        Ok(lease.id)
    }

    /// Mark a lease for forced reclamation. Stale lease ids are ignored.
    ///
    /// Returns `true` if the lease was live and is now revoked.
    pub fn revoke(&self, index: u32, id: LeaseId, reason: RevokeReason) -> bool {
        let mut table = self.table.lock();
        match table.entries.get_mut(index as usize) {
            Some(Some(lease)) if lease.id == id && lease.revoked.is_none() => {
                lease.revoked = Some(reason);
                tracing::debug!(slot = index, pid = lease.pid, lease = %id, ?reason, "lease revoked");
                true
            }
            _ => false,
        }
    }

    /// Why the lease on `index` should be reclaimed now, if it should.
    pub fn reclaim_reason(&self, index: u32, now: Instant) -> Option<RevokeReason> {
        let table = self.table.lock();
        let lease = table.entries.get(index as usize)?.as_ref()?;
        if let Some(reason) = lease.revoked {
            return Some(reason);
        }
        if !lease.bound && now.saturating_duration_since(lease.leased_at) > self.handshake_timeout {
            return Some(RevokeReason::HandshakeTimeout);
        }
        None
    }

    /// Number of leased slots.
    pub fn leased(&self) -> usize {
        self.table.lock().entries.iter().flatten().count()
    }
}

impl std::fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("slots", &self.slot_count())
            .field("leased", &self.leased())
            .finish()
    }
}
