//! Typed requests and responses, and their fixed-width wire form.
//!
//! The shared slot stores a request as `tag + 3 words` and a response as
//! `tag + status + 7 words`. Decoding always goes through the tag, so payload
//! words are never interpreted under the wrong variant.

use crate::error::Violation;

/// Number of integers in a native handle descriptor.
pub const NATIVE_HANDLE_INTS: usize = 7;

/// Slot index sentinel meaning "no free slot".
pub const SLOT_EXHAUSTED: i32 = -1;

/// Buffer id sentinel meaning "native allocation failed".
pub const INVALID_BUFFER_ID: i32 = -1;

/// Response status: request succeeded.
pub const STATUS_OK: i32 = 0;
/// Response status: buffer id not found.
pub const STATUS_NOT_FOUND: i32 = 1;
/// Response status: request rejected, `words[0]` is a [`Violation`] code.
pub const STATUS_REJECTED: i32 = 2;

/// Request kind, i.e. the wire tag.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    AllocateSlot = 0,
    CreateBuffer = 1,
    DestroyBuffer = 2,
    GetBuffer = 3,
    Finish = 4,
}

impl RequestKind {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::AllocateSlot),
            1 => Some(Self::CreateBuffer),
            2 => Some(Self::DestroyBuffer),
            3 => Some(Self::GetBuffer),
            4 => Some(Self::Finish),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// Raw request words as stored in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestWire {
    pub tag: u32,
    pub args: [u32; 3],
}

/// Raw response words as stored in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseWire {
    pub tag: u32,
    pub status: i32,
    pub words: [i32; NATIVE_HANDLE_INTS],
}

/// A request from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Ask for a data slot. Only valid on the control slot.
    AllocateSlot { pid: u32 },
    CreateBuffer { width: u32, height: u32 },
    DestroyBuffer { id: i32 },
    GetBuffer { id: i32 },
    /// End the session; the slot is reclaimed afterwards.
    Finish,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::AllocateSlot { .. } => RequestKind::AllocateSlot,
            Self::CreateBuffer { .. } => RequestKind::CreateBuffer,
            Self::DestroyBuffer { .. } => RequestKind::DestroyBuffer,
            Self::GetBuffer { .. } => RequestKind::GetBuffer,
            Self::Finish => RequestKind::Finish,
        }
    }

    pub fn encode(&self) -> RequestWire {
        let args = match *self {
            Self::AllocateSlot { pid } => [pid, 0, 0],
            Self::CreateBuffer { width, height } => [width, height, 0],
            Self::DestroyBuffer { id } | Self::GetBuffer { id } => [id as u32, 0, 0],
            Self::Finish => [0; 3],
        };
        RequestWire {
            tag: self.kind().tag(),
            args,
        }
    }

    pub fn decode(wire: RequestWire) -> Result<Self, Violation> {
        let kind = RequestKind::from_tag(wire.tag).ok_or(Violation::UnknownTag)?;
        let [a, b, _] = wire.args;
        Ok(match kind {
            RequestKind::AllocateSlot => Self::AllocateSlot { pid: a },
            RequestKind::CreateBuffer => Self::CreateBuffer {
                width: a,
                height: b,
            },
            RequestKind::DestroyBuffer => Self::DestroyBuffer { id: a as i32 },
            RequestKind::GetBuffer => Self::GetBuffer { id: a as i32 },
            RequestKind::Finish => Self::Finish,
        })
    }
}

/// Native handle descriptor returned by GetBuffer.
///
/// Layout is defined by the native allocator; see [`crate::native`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeHandle(pub [i32; NATIVE_HANDLE_INTS]);

/// A response from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    SlotAssigned { slot: u32 },
    Exhausted,
    BufferCreated { id: i32, stride: u32 },
    AllocationFailed,
    Destroyed,
    Buffer(NativeHandle),
    NotFound { id: i32 },
    Finished,
    Rejected(Violation),
}

impl Response {
    /// Encode as the answer to a request with wire tag `answering`.
    pub fn encode(&self, answering: u32) -> ResponseWire {
        let mut wire = ResponseWire {
            tag: answering,
            status: STATUS_OK,
            words: [0; NATIVE_HANDLE_INTS],
        };
        match *self {
            Self::SlotAssigned { slot } => wire.words[0] = slot as i32,
            Self::Exhausted => wire.words[0] = SLOT_EXHAUSTED,
            Self::BufferCreated { id, stride } => {
                wire.words[0] = id;
                wire.words[1] = stride as i32;
            }
            Self::AllocationFailed => wire.words[0] = INVALID_BUFFER_ID,
            Self::Destroyed | Self::Finished => {}
            Self::Buffer(handle) => wire.words = handle.0,
            Self::NotFound { id } => {
                wire.status = STATUS_NOT_FOUND;
                wire.words[0] = id;
            }
            Self::Rejected(v) => {
                wire.status = STATUS_REJECTED;
                wire.words[0] = v.code();
            }
        }
        wire
    }

    /// Decode a response that must answer a request of kind `expected`.
    pub fn decode(wire: ResponseWire, expected: RequestKind) -> Result<Self, Violation> {
        if wire.status == STATUS_REJECTED {
            let v = Violation::from_code(wire.words[0]).ok_or(Violation::UnexpectedResponse)?;
            return Ok(Self::Rejected(v));
        }
        if wire.tag != expected.tag() {
            return Err(Violation::UnexpectedResponse);
        }
        if wire.status == STATUS_NOT_FOUND {
            return match expected {
                RequestKind::DestroyBuffer | RequestKind::GetBuffer => {
                    Ok(Self::NotFound { id: wire.words[0] })
                }
                _ => Err(Violation::UnexpectedResponse),
            };
        }
        if wire.status != STATUS_OK {
            return Err(Violation::UnexpectedResponse);
        }

        Ok(match expected {
            RequestKind::AllocateSlot => match wire.words[0] {
                slot if slot >= 0 => Self::SlotAssigned { slot: slot as u32 },
                _ => Self::Exhausted,
            },
            RequestKind::CreateBuffer => match wire.words[0] {
                id if id > 0 => Self::BufferCreated {
                    id,
                    stride: wire.words[1] as u32,
                },
                _ => Self::AllocationFailed,
            },
            RequestKind::DestroyBuffer => Self::Destroyed,
            RequestKind::GetBuffer => Self::Buffer(NativeHandle(wire.words)),
            RequestKind::Finish => Self::Finished,
        })
    }
}
