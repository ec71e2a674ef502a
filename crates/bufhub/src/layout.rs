//! Shared region memory layout.
//!
//! These `repr(C)` structures are the canonical layout of the region every
//! participant maps. A client built against a different layout is refused at
//! `open` time rather than misreading slots.
//!
//! # Memory Layout
//!
//! ```text
//! +---------------------------------------------------------------+
//! | REGION HEADER (64 bytes)                                      |
//! |   magic, version, slot count, slot size, ready, creator pid   |
//! +---------------------------------------------------------------+
//! | CONTROL SLOT (128 bytes)                                      |
//! |   request/response semaphores, state, owner, lease, payloads  |
//! +---------------------------------------------------------------+
//! | DATA SLOT 0 .. DATA SLOT N-1 (128 bytes each)                 |
//! +---------------------------------------------------------------+
//! ```

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use shm_primitives::Semaphore;

use crate::protocol::{NATIVE_HANDLE_INTS, RequestWire, ResponseWire};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes identifying a bufhub region.
pub const REGION_MAGIC: [u8; 8] = *b"BUFHUB\0\0";

/// Current protocol version (major.minor packed into u32).
pub const PROTOCOL_VERSION: u32 = 1 << 16; // v1.0

/// Default number of data slots.
pub const DEFAULT_SLOT_COUNT: u32 = 7;

/// Upper bound on data slots.
pub const MAX_SLOT_COUNT: u32 = 64;

/// Owner pid value meaning "nobody".
pub const NO_OWNER: u32 = 0;

// =============================================================================
// Region Header
// =============================================================================

/// Header at the start of the region (64 bytes).
#[repr(C, align(64))]
pub struct RegionHeader {
    /// Magic bytes: "BUFHUB\0\0".
    pub magic: [u8; 8],
    /// Protocol version (major.minor packed).
    pub version: u32,
    /// Number of data slots following the control slot.
    pub slot_count: u32,
    /// Size of one slot record, for layout drift detection.
    pub slot_size: u32,
    /// Set to 1 once the server finished initializing the region.
    pub ready: AtomicU32,
    /// Pid of the server that created the region.
    pub creator_pid: AtomicU32,
    pub _pad: [u8; 36],
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() == 64);

impl RegionHeader {
    /// Initialize a new header. The region is not ready until [`publish`](Self::publish).
    pub fn init(&mut self, slot_count: u32, creator_pid: u32) {
        self.magic = REGION_MAGIC;
        self.version = PROTOCOL_VERSION;
        self.slot_count = slot_count;
        self.slot_size = core::mem::size_of::<SlotRecord>() as u32;
        self.ready = AtomicU32::new(0);
        self.creator_pid = AtomicU32::new(creator_pid);
        self._pad = [0; 36];
    }

    /// Creator pid, once the region is published.
    pub fn creator(&self) -> Option<u32> {
        if self.magic != REGION_MAGIC || self.ready.load(Ordering::Acquire) == 0 {
            return None;
        }
        Some(self.creator_pid.load(Ordering::Acquire))
    }

    /// Mark the region as fully initialized.
    pub fn publish(&self) {
        self.ready.store(1, Ordering::Release);
    }

    /// Validate the header against the slot count this process was built for.
    pub fn validate(&self, expected_slots: u32) -> Result<(), LayoutError> {
        if self.magic != REGION_MAGIC {
            return Err(LayoutError::InvalidMagic);
        }
        if self.version >> 16 != PROTOCOL_VERSION >> 16 {
            return Err(LayoutError::IncompatibleVersion {
                expected: PROTOCOL_VERSION,
                found: self.version,
            });
        }
        if self.slot_size as usize != core::mem::size_of::<SlotRecord>() {
            return Err(LayoutError::SlotSizeMismatch {
                expected: core::mem::size_of::<SlotRecord>() as u32,
                found: self.slot_size,
            });
        }
        if self.slot_count != expected_slots {
            return Err(LayoutError::SlotCountMismatch {
                expected: expected_slots,
                found: self.slot_count,
            });
        }
        if self.ready.load(Ordering::Acquire) == 0 {
            return Err(LayoutError::NotReady);
        }
        Ok(())
    }
}

// =============================================================================
// Slot State
// =============================================================================

/// Client-visible state of a slot, stored in [`SlotRecord`]'s state word.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No owner; eligible for allocation.
    Free = 0,
    /// Owned, no request outstanding.
    Idle = 1,
    /// Claimed by the client, request not written yet.
    Busy = 2,
    /// Server posted the response, client has not consumed it yet.
    Answered = 3,
    /// Client stopped waiting; server must not post a response.
    Abandoned = 4,
    /// Request written and signalled, server has not answered.
    Posted = 5,
}

impl SlotState {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Free),
            1 => Some(Self::Idle),
            2 => Some(Self::Busy),
            3 => Some(Self::Answered),
            4 => Some(Self::Abandoned),
            5 => Some(Self::Posted),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        self != Self::Free
    }
}

// =============================================================================
// Payload Records
// =============================================================================

/// Request payload (16 bytes). Written only by the slot owner.
#[repr(C)]
pub struct RequestRecord {
    tag: AtomicU32,
    args: [AtomicU32; 3],
}

impl RequestRecord {
    const fn new() -> Self {
        Self {
            tag: AtomicU32::new(0),
            args: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    fn store(&self, wire: &RequestWire) {
        for (slot, value) in self.args.iter().zip(wire.args) {
            slot.store(value, Ordering::Relaxed);
        }
        self.tag.store(wire.tag, Ordering::Relaxed);
    }

    fn load(&self) -> RequestWire {
        RequestWire {
            tag: self.tag.load(Ordering::Relaxed),
            args: std::array::from_fn(|i| self.args[i].load(Ordering::Relaxed)),
        }
    }
}

/// Response payload (36 bytes). Written only by the server.
#[repr(C)]
pub struct ResponseRecord {
    tag: AtomicU32,
    status: AtomicI32,
    words: [AtomicI32; NATIVE_HANDLE_INTS],
}

impl ResponseRecord {
    const fn new() -> Self {
        Self {
            tag: AtomicU32::new(0),
            status: AtomicI32::new(0),
            words: [
                AtomicI32::new(0),
                AtomicI32::new(0),
                AtomicI32::new(0),
                AtomicI32::new(0),
                AtomicI32::new(0),
                AtomicI32::new(0),
                AtomicI32::new(0),
            ],
        }
    }

    fn store(&self, wire: &ResponseWire) {
        for (slot, value) in self.words.iter().zip(wire.words) {
            slot.store(value, Ordering::Relaxed);
        }
        self.status.store(wire.status, Ordering::Relaxed);
        self.tag.store(wire.tag, Ordering::Relaxed);
    }

    fn load(&self) -> ResponseWire {
        ResponseWire {
            tag: self.tag.load(Ordering::Relaxed),
            status: self.status.load(Ordering::Relaxed),
            words: std::array::from_fn(|i| self.words[i].load(Ordering::Relaxed)),
        }
    }
}

// =============================================================================
// Slot Record
// =============================================================================

/// One slot in the region (128 bytes).
///
/// Payload words are relaxed atomics; ordering between the writer and the
/// reader comes from the semaphore post/wait that separates them.
#[repr(C, align(64))]
pub struct SlotRecord {
    /// Posted by the client once the request payload is written.
    pub request_ready: Semaphore,
    /// Posted by the server once the response payload is written.
    pub response_ready: Semaphore,
    state: AtomicU32,
    owner_pid: AtomicU32,
    lease: AtomicU32,
    _reserved: AtomicU32,
    request: RequestRecord,
    response: ResponseRecord,
    _pad: [u8; 44],
}

const _: () = assert!(core::mem::size_of::<SlotRecord>() == 128);

impl SlotRecord {
    pub const fn new(state: SlotState) -> Self {
        Self {
            request_ready: Semaphore::new(0),
            response_ready: Semaphore::new(0),
            state: AtomicU32::new(state as u32),
            owner_pid: AtomicU32::new(NO_OWNER),
            lease: AtomicU32::new(0),
            _reserved: AtomicU32::new(0),
            request: RequestRecord::new(),
            response: ResponseRecord::new(),
            _pad: [0; 44],
        }
    }

    /// Initialize in place (region creation).
    pub fn init(&mut self, state: SlotState) {
        *self = Self::new(state);
    }

    /// Raw state word, also used as a futex.
    #[inline]
    pub fn state_word(&self) -> &AtomicU32 {
        &self.state
    }

    /// Decoded state; `None` if a peer scribbled an unknown value.
    #[inline]
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_u32(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state().is_some_and(SlotState::is_active)
    }

    /// Compare-and-swap the state. On failure returns the raw observed value.
    pub fn transition(&self, from: SlotState, to: SlotState) -> Result<(), u32> {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
    }

    pub fn set_state(&self, state: SlotState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid.load(Ordering::Acquire)
    }

    pub fn set_owner_pid(&self, pid: u32) {
        self.owner_pid.store(pid, Ordering::Release);
    }

    /// Lease generation of the current owner.
    pub fn lease(&self) -> u32 {
        self.lease.load(Ordering::Acquire)
    }

    pub fn set_lease(&self, lease: u32) {
        self.lease.store(lease, Ordering::Release);
    }

    pub fn write_request(&self, wire: &RequestWire) {
        self.request.store(wire);
    }

    pub fn read_request(&self) -> RequestWire {
        self.request.load()
    }

    pub fn write_response(&self, wire: &ResponseWire) {
        self.response.store(wire);
    }

    pub fn read_response(&self) -> ResponseWire {
        self.response.load()
    }

    /// Drop pending signals and payloads. Server-only, between leases.
    pub fn clear(&self) {
        self.request_ready.reset();
        self.response_ready.reset();
        self.request.store(&RequestWire::default());
        self.response.store(&ResponseWire::default());
    }
}

impl std::fmt::Debug for SlotRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRecord")
            .field("state", &self.state())
            .field("owner_pid", &self.owner_pid())
            .field("lease", &self.lease())
            .field("request_ready", &self.request_ready)
            .field("response_ready", &self.response_ready)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Layout Calculations
// =============================================================================

/// Offset of the control slot.
pub const fn control_slot_offset() -> usize {
    core::mem::size_of::<RegionHeader>()
}

/// Offset of data slot `index`.
pub const fn data_slot_offset(index: u32) -> usize {
    control_slot_offset() + (index as usize + 1) * core::mem::size_of::<SlotRecord>()
}

/// Total region size for `slot_count` data slots.
pub fn region_size(slot_count: u32) -> Result<usize, LayoutError> {
    if slot_count == 0 || slot_count > MAX_SLOT_COUNT {
        return Err(LayoutError::InvalidSlotCount(slot_count));
    }
    Ok(data_slot_offset(slot_count))
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from region layout validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    InvalidMagic,
    IncompatibleVersion { expected: u32, found: u32 },
    SlotSizeMismatch { expected: u32, found: u32 },
    SlotCountMismatch { expected: u32, found: u32 },
    SizeMismatch { required: usize, found: usize },
    InvalidSlotCount(u32),
    /// Header present but the server has not finished initializing.
    NotReady,
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic => write!(f, "invalid region magic bytes (expected BUFHUB)"),
            Self::IncompatibleVersion { expected, found } => write!(
                f,
                "incompatible region version: expected {}.{}, found {}.{}",
                expected >> 16,
                expected & 0xFFFF,
                found >> 16,
                found & 0xFFFF
            ),
            Self::SlotSizeMismatch { expected, found } => {
                write!(f, "slot record is {} bytes, region has {}", expected, found)
            }
            Self::SlotCountMismatch { expected, found } => {
                write!(f, "expected {} data slots, region has {}", expected, found)
            }
            Self::SizeMismatch { required, found } => {
                write!(f, "region size mismatch: need {} bytes, got {}", required, found)
            }
            Self::InvalidSlotCount(n) => {
                write!(f, "slot count {} outside 1..={}", n, MAX_SLOT_COUNT)
            }
            Self::NotReady => write!(f, "region not initialized yet"),
        }
    }
}

impl std::error::Error for LayoutError {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Request, Response};

    #[test]
    fn test_struct_sizes() {
        assert_eq!(core::mem::size_of::<RegionHeader>(), 64);
        assert_eq!(core::mem::size_of::<SlotRecord>(), 128);
        assert_eq!(core::mem::size_of::<RequestRecord>(), 16);
        assert_eq!(core::mem::size_of::<ResponseRecord>(), 36);
    }

    #[test]
    fn test_offsets() {
        assert_eq!(control_slot_offset(), 64);
        assert_eq!(data_slot_offset(0), 64 + 128);
        assert_eq!(region_size(DEFAULT_SLOT_COUNT).unwrap(), 64 + 8 * 128);
        assert_eq!(region_size(0), Err(LayoutError::InvalidSlotCount(0)));
        assert!(region_size(MAX_SLOT_COUNT + 1).is_err());
    }

    #[test]
    fn test_header_validation() {
        let mut header: RegionHeader = unsafe { core::mem::zeroed() };
        assert_eq!(header.validate(7), Err(LayoutError::InvalidMagic));

        header.init(7, 1234);
        assert_eq!(header.validate(7), Err(LayoutError::NotReady));
        assert_eq!(header.creator(), None);

        header.publish();
        assert_eq!(header.validate(7), Ok(()));
        assert_eq!(header.creator(), Some(1234));
        assert_eq!(
            header.validate(3),
            Err(LayoutError::SlotCountMismatch {
                expected: 3,
                found: 7
            })
        );

        header.version = 2 << 16;
        assert!(matches!(
            header.validate(7),
            Err(LayoutError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn test_state_transitions() {
        let slot = SlotRecord::new(SlotState::Idle);
        assert!(slot.transition(SlotState::Idle, SlotState::Busy).is_ok());
        assert_eq!(
            slot.transition(SlotState::Idle, SlotState::Busy),
            Err(SlotState::Busy as u32)
        );
        assert_eq!(slot.state(), Some(SlotState::Busy));

        slot.state_word().store(77, Ordering::Release);
        assert_eq!(slot.state(), None);
        assert!(!slot.is_active());
    }

    #[test]
    fn test_payload_records() {
        let slot = SlotRecord::new(SlotState::Idle);
        let req = Request::CreateBuffer {
            width: 64,
            height: 32,
        };
        slot.write_request(&req.encode());
        assert_eq!(Request::decode(slot.read_request()), Ok(req));

        let resp = Response::BufferCreated { id: 3, stride: 256 };
        slot.write_response(&resp.encode(req.kind().tag()));
        assert_eq!(
            Response::decode(slot.read_response(), req.kind()),
            Ok(resp)
        );

        slot.request_ready.post();
        slot.clear();
        assert_eq!(slot.request_ready.value(), 0);
        assert_eq!(slot.read_request(), RequestWire::default());
    }
}
