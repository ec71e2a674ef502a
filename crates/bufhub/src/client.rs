//! Client session: one leased data slot plus its handshake connection.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::HubConfig;
use crate::error::{HubError, Violation};
use crate::handshake;
use crate::layout::SlotRecord;
use crate::protocol::{NativeHandle, Request, Response};
use crate::region::SharedRegion;
use crate::rendezvous::{ClientEndpoint, SlotRole};

/// A freshly created buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub id: i32,
    /// Row pitch in bytes.
    pub stride: u32,
}

/// A connected client.
///
/// Dropping a client that has not called [`finish`](Self::finish) finishes
/// the session on a best-effort basis.
pub struct Client {
    region: SharedRegion,
    slot: u32,
    lease: u32,
    timeout: Option<Duration>,
    handshake: Option<UnixStream>,
    /// Set once a request went unanswered; the slot is no longer ours.
    poisoned: AtomicBool,
    finished: bool,
}

impl Client {
    /// Map the region, lease a data slot and complete the handshake.
    pub fn connect(config: &HubConfig) -> Result<Self, HubError> {
        let region = SharedRegion::open(&config.region_name, config.slot_count)?;
        let pid = std::process::id();

        let control = ClientEndpoint::new(region.control_slot(), SlotRole::Control, config.request_timeout);
        let slot = match control.submit(&Request::AllocateSlot { pid })? {
            Response::SlotAssigned { slot } => slot,
            Response::Exhausted => return Err(HubError::Exhausted),
            Response::Rejected(violation) => return Err(violation.into()),
            _ => return Err(Violation::UnexpectedResponse.into()),
        };
        let lease = region
            .data_slot(slot)
            .ok_or(Violation::UnexpectedResponse)?
            .lease();

        // Without a handshake the server reclaims the slot on its own.
        let handshake = handshake::announce(&config.socket_path, slot)?;
        tracing::debug!(slot, lease, pid, "connected");

        Ok(Self {
            region,
            slot,
            lease,
            timeout: config.request_timeout,
            handshake: Some(handshake),
            poisoned: AtomicBool::new(false),
            finished: false,
        })
    }

    /// Index of the leased data slot.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn create_buffer(&self, width: u32, height: u32) -> Result<BufferInfo, HubError> {
        match self.call(&Request::CreateBuffer { width, height })? {
            Response::BufferCreated { id, stride } => Ok(BufferInfo { id, stride }),
            Response::AllocationFailed => Err(HubError::AllocationFailure),
            _ => Err(Violation::UnexpectedResponse.into()),
        }
    }

    pub fn destroy_buffer(&self, id: i32) -> Result<(), HubError> {
        match self.call(&Request::DestroyBuffer { id })? {
            Response::Destroyed => Ok(()),
            Response::NotFound { id } => Err(HubError::NotFound { id }),
            _ => Err(Violation::UnexpectedResponse.into()),
        }
    }

    /// Native handle descriptor of a buffer.
    pub fn get_buffer(&self, id: i32) -> Result<NativeHandle, HubError> {
        match self.call(&Request::GetBuffer { id })? {
            Response::Buffer(handle) => Ok(handle),
            Response::NotFound { id } => Err(HubError::NotFound { id }),
            _ => Err(Violation::UnexpectedResponse.into()),
        }
    }

    /// End the session and give the slot back.
    pub fn finish(mut self) -> Result<(), HubError> {
        self.finish_session()
    }

    fn finish_session(&mut self) -> Result<(), HubError> {
        self.finished = true;
        let result = match self.call(&Request::Finish) {
            Ok(Response::Finished) => Ok(()),
            Ok(_) => Err(Violation::UnexpectedResponse.into()),
            Err(e) => Err(e),
        };
        self.handshake = None;
        tracing::debug!(slot = self.slot, ok = result.is_ok(), "finished");
        result
    }

    fn data_slot(&self) -> Result<&SlotRecord, HubError> {
        let slot = self
            .region
            .data_slot(self.slot)
            .ok_or(Violation::SlotNotLeased)?;
        // Reclaimed and handed to someone else.
        if slot.lease() != self.lease {
            return Err(Violation::SlotNotLeased.into());
        }
        Ok(slot)
    }

    fn call(&self, request: &Request) -> Result<Response, HubError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(HubError::PeerUnresponsive);
        }
        let slot = self.data_slot()?;
        let endpoint = ClientEndpoint::new(slot, SlotRole::Data(self.slot), self.timeout);

        match endpoint.submit(request) {
            Ok(Response::Rejected(violation)) => Err(violation.into()),
            Ok(response) => Ok(response),
            Err(HubError::PeerUnresponsive) => {
                self.poisoned.store(true, Ordering::Release);
                Err(HubError::PeerUnresponsive)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.finished || self.poisoned.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.finish_session() {
            tracing::debug!(slot = self.slot, error = %e, "best-effort finish failed");
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("slot", &self.slot)
            .field("lease", &self.lease)
            .field("poisoned", &self.poisoned.load(Ordering::Relaxed))
            .field("finished", &self.finished)
            .finish()
    }
}
