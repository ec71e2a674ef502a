//! Error types shared by the server and the client.

use std::io;

use crate::layout::LayoutError;

/// Which piece of infrastructure failed to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// The shared memory region.
    Region,
    /// The handshake socket.
    Endpoint,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Region => write!(f, "shared region"),
            Self::Endpoint => write!(f, "handshake endpoint"),
        }
    }
}

/// Underlying reason a resource is unavailable.
#[derive(Debug)]
pub enum ResourceCause {
    /// The OS refused to create, open, map or bind it.
    Io(io::Error),
    /// It exists but its layout does not match ours.
    Layout(LayoutError),
}

impl std::fmt::Display for ResourceCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Layout(e) => write!(f, "layout error: {}", e),
        }
    }
}

/// Kinds of protocol violation.
///
/// The discriminant is the code carried in a rejection response, so it must
/// stay stable across protocol versions.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Request tag outside the known set.
    UnknownTag = 1,
    /// Request kind not allowed on this slot (e.g. AllocateSlot on a data slot).
    WrongSlotKind = 2,
    /// Data slot has no current owner.
    SlotNotLeased = 3,
    /// A request is already outstanding on this slot.
    RequestOutstanding = 4,
    /// Request signal arrived without the slot having been claimed.
    UnclaimedSignal = 5,
    /// Response does not match the request it answers.
    UnexpectedResponse = 6,
    /// `serve_once`/`reply` called out of order.
    UnbalancedExchange = 7,
    /// Handshake index outside `[0, N)`.
    HandshakeOutOfRange = 8,
    /// Handshake names a slot that is not active.
    HandshakeInactive = 9,
    /// Handshake peer is not the slot owner.
    HandshakeOwnerMismatch = 10,
    /// Handshake for a slot that already has a connection.
    HandshakeAlreadyBound = 11,
    /// Handshake stream ended before a full index was read.
    HandshakeTruncated = 12,
}

impl Violation {
    /// Wire code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Parse a wire code.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => Self::UnknownTag,
            2 => Self::WrongSlotKind,
            3 => Self::SlotNotLeased,
            4 => Self::RequestOutstanding,
            5 => Self::UnclaimedSignal,
            6 => Self::UnexpectedResponse,
            7 => Self::UnbalancedExchange,
            8 => Self::HandshakeOutOfRange,
            9 => Self::HandshakeInactive,
            10 => Self::HandshakeOwnerMismatch,
            11 => Self::HandshakeAlreadyBound,
            12 => Self::HandshakeTruncated,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::UnknownTag => "unknown request tag",
            Self::WrongSlotKind => "request kind not valid on this slot",
            Self::SlotNotLeased => "slot is not leased",
            Self::RequestOutstanding => "a request is already outstanding on this slot",
            Self::UnclaimedSignal => "request signalled on an unclaimed slot",
            Self::UnexpectedResponse => "response does not match request",
            Self::UnbalancedExchange => "serve/reply called out of order",
            Self::HandshakeOutOfRange => "handshake slot index out of range",
            Self::HandshakeInactive => "handshake names an inactive slot",
            Self::HandshakeOwnerMismatch => "handshake peer does not own the slot",
            Self::HandshakeAlreadyBound => "slot already has a handshake connection",
            Self::HandshakeTruncated => "handshake ended before the slot index",
        };
        f.write_str(msg)
    }
}

/// Errors surfaced by bufhub operations.
#[derive(Debug)]
pub enum HubError {
    /// Region or handshake endpoint cannot be created, opened or mapped.
    ResourceUnavailable {
        resource: Resource,
        cause: ResourceCause,
    },
    /// Every data slot is leased.
    Exhausted,
    /// A participant broke the protocol.
    ProtocolViolation(Violation),
    /// Unknown or already destroyed buffer id.
    NotFound { id: i32 },
    /// The native allocation call failed.
    AllocationFailure,
    /// The other side did not answer within the deadline.
    PeerUnresponsive,
}

impl HubError {
    pub(crate) fn region_io(e: io::Error) -> Self {
        Self::ResourceUnavailable {
            resource: Resource::Region,
            cause: ResourceCause::Io(e),
        }
    }

    pub(crate) fn region_layout(e: LayoutError) -> Self {
        Self::ResourceUnavailable {
            resource: Resource::Region,
            cause: ResourceCause::Layout(e),
        }
    }

    pub(crate) fn endpoint_io(e: io::Error) -> Self {
        Self::ResourceUnavailable {
            resource: Resource::Endpoint,
            cause: ResourceCause::Io(e),
        }
    }

    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Exhausted | Self::PeerUnresponsive)
    }
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceUnavailable { resource, cause } => {
                write!(f, "{} unavailable: {}", resource, cause)
            }
            Self::Exhausted => write!(f, "no free slot"),
            Self::ProtocolViolation(v) => write!(f, "protocol violation: {}", v),
            Self::NotFound { id } => write!(f, "buffer {} not found", id),
            Self::AllocationFailure => write!(f, "native buffer allocation failed"),
            Self::PeerUnresponsive => write!(f, "peer unresponsive"),
        }
    }
}

impl std::error::Error for HubError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ResourceUnavailable {
                cause: ResourceCause::Io(e),
                ..
            } => Some(e),
            Self::ResourceUnavailable {
                cause: ResourceCause::Layout(e),
                ..
            } => Some(e),
            _ => None,
        }
    }
}

impl From<Violation> for HubError {
    fn from(v: Violation) -> Self {
        Self::ProtocolViolation(v)
    }
}
