//! Server-side buffer registry: allocation id → native buffer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::LeaseId;
use crate::error::HubError;
use crate::native::{NativeAllocator, NativeBuffer};
use crate::protocol::NativeHandle;

/// One live buffer.
#[derive(Debug)]
pub struct BufferRecord {
    pub id: i32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// Lease of the client that created it.
    pub owner: LeaseId,
    buffer: NativeBuffer,
}

#[derive(Debug)]
struct Inner {
    next_id: i32,
    buffers: HashMap<i32, BufferRecord>,
}

impl Inner {
    /// Next id not held by a live record. Ids are always positive.
    fn fresh_id(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.buffers.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Maps allocation ids to native buffers. Shared by all slot workers.
pub struct BufferRegistry {
    native: Arc<dyn NativeAllocator>,
    inner: Mutex<Inner>,
}

impl BufferRegistry {
    pub fn new(native: Arc<dyn NativeAllocator>) -> Self {
        Self {
            native,
            inner: Mutex::new(Inner {
                next_id: 1,
                buffers: HashMap::new(),
            }),
        }
    }

    /// Allocate a buffer and register it. Returns `(id, stride)`.
    pub fn create(&self, width: u32, height: u32, owner: LeaseId) -> Result<(i32, u32), HubError> {
        let buffer = self.native.allocate(width, height)?;
        let stride = buffer.stride;

        let mut inner = self.inner.lock();
        let id = inner.fresh_id();
        inner.buffers.insert(
            id,
            BufferRecord {
                id,
                width,
                height,
                stride,
                owner,
                buffer,
            },
        );
        drop(inner);

        tracing::debug!(id, width, height, stride, lease = %owner, "buffer created");
        Ok((id, stride))
    }

    /// Remove a buffer and release its memory.
    pub fn destroy(&self, id: i32) -> Result<(), HubError> {
        let record = self
            .inner
            .lock()
            .buffers
            .remove(&id)
            .ok_or(HubError::NotFound { id })?;
        self.native.release(record.buffer);
        tracing::debug!(id, "buffer destroyed");
        Ok(())
    }

    /// Descriptor of a live buffer.
    pub fn get(&self, id: i32) -> Result<NativeHandle, HubError> {
        self.inner
            .lock()
            .buffers
            .get(&id)
            .map(|record| record.buffer.handle())
            .ok_or(HubError::NotFound { id })
    }

    /// Release every buffer created under `owner`. Returns how many.
    pub fn release_owned_by(&self, owner: LeaseId) -> usize {
        let orphaned: Vec<BufferRecord> = {
            let mut inner = self.inner.lock();
            let ids: Vec<i32> = inner
                .buffers
                .values()
                .filter(|record| record.owner == owner)
                .map(|record| record.id)
                .collect();
            ids.iter()
                .filter_map(|id| inner.buffers.remove(id))
                .collect()
        };

        let count = orphaned.len();
        for record in orphaned {
            self.native.release(record.buffer);
        }
        if count > 0 {
            tracing::info!(lease = %owner, count, "released orphaned buffers");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegistry")
            .field("buffers", &self.len())
            .finish_non_exhaustive()
    }
}
