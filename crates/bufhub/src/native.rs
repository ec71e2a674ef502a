//! Native buffer allocation.
//!
//! The server delegates the actual allocation to a [`NativeAllocator`]. The
//! default [`MemfdAllocator`] backs every buffer with a size-sealed memfd.
//!
//! Descriptor layout (seven integers, see [`NativeHandle`]):
//!
//! ```text
//! [fd, width, height, stride, format, offset, size]
//! ```

use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::HubError;
use crate::protocol::NativeHandle;

/// Bytes per pixel of the only format we allocate.
pub const BYTES_PER_PIXEL: u32 = 4;

/// Format code for 8-bit RGBA.
pub const FORMAT_RGBA8888: i32 = 1;

/// An allocated native buffer. Dropping it releases the backing memory.
#[derive(Debug)]
pub struct NativeBuffer {
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: u32,
    pub format: i32,
    pub size: usize,
    memory: OwnedFd,
}

impl NativeBuffer {
    /// Wrap an already allocated descriptor.
    pub fn new(memory: OwnedFd, width: u32, height: u32, stride: u32, format: i32, size: usize) -> Self {
        Self {
            width,
            height,
            stride,
            format,
            size,
            memory,
        }
    }

    /// The seven-integer descriptor handed to clients.
    pub fn handle(&self) -> NativeHandle {
        NativeHandle([
            self.memory.as_raw_fd(),
            self.width as i32,
            self.height as i32,
            self.stride as i32,
            self.format,
            0,
            i32::try_from(self.size).unwrap_or(i32::MAX),
        ])
    }
}

/// The external allocation call.
pub trait NativeAllocator: Send + Sync + 'static {
    /// Allocate a `width x height` buffer.
    fn allocate(&self, width: u32, height: u32) -> Result<NativeBuffer, HubError>;

    /// Release a buffer returned by `allocate`.
    fn release(&self, buffer: NativeBuffer) {
        drop(buffer);
    }
}

/// Allocates RGBA buffers in anonymous memfds.
#[derive(Debug, Default)]
pub struct MemfdAllocator;

const MEMFD_NAME: &CStr = c"bufhub-buffer";

impl NativeAllocator for MemfdAllocator {
    fn allocate(&self, width: u32, height: u32) -> Result<NativeBuffer, HubError> {
        let (stride, size) = buffer_geometry(width, height).ok_or(HubError::AllocationFailure)?;

        let memory = memfd(size).map_err(|e| {
            tracing::warn!(width, height, error = %e, "memfd allocation failed");
            HubError::AllocationFailure
        })?;

        Ok(NativeBuffer::new(
            memory,
            width,
            height,
            stride,
            FORMAT_RGBA8888,
            size,
        ))
    }
}

/// Stride and byte size for a buffer, or `None` if empty or too large to
/// describe in the descriptor's 32-bit fields.
pub fn buffer_geometry(width: u32, height: u32) -> Option<(u32, usize)> {
    if width == 0 || height == 0 {
        return None;
    }
    let stride = width.checked_mul(BYTES_PER_PIXEL)?;
    let size = stride.checked_mul(height)?;
    if size > i32::MAX as u32 {
        return None;
    }
    Some((stride, size as usize))
}

fn memfd(size: usize) -> io::Result<OwnedFd> {
    // SAFETY: MEMFD_NAME is a valid NUL-terminated string.
    let fd = unsafe {
        libc::memfd_create(
            MEMFD_NAME.as_ptr(),
            libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor we now own.
    let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
    file.set_len(size as u64)?;

    // SAFETY: fd is a valid memfd created with MFD_ALLOW_SEALING.
    let sealed = unsafe {
        libc::fcntl(
            file.as_raw_fd(),
            libc::F_ADD_SEALS,
            libc::F_SEAL_SHRINK | libc::F_SEAL_GROW,
        )
    };
    if sealed < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(OwnedFd::from(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_four_bytes_per_pixel() {
        assert_eq!(buffer_geometry(1920, 1080), Some((7680, 7680 * 1080)));
    }

    #[test]
    fn degenerate_sizes_fail() {
        assert_eq!(buffer_geometry(0, 10), None);
        assert_eq!(buffer_geometry(10, 0), None);
        assert_eq!(buffer_geometry(u32::MAX, 2), None);
        assert_eq!(buffer_geometry(65536, 65536), None);
    }

    #[test]
    fn memfd_buffer_descriptor() {
        let buffer = MemfdAllocator.allocate(64, 16).unwrap();
        let NativeHandle(words) = buffer.handle();
        assert!(words[0] >= 0);
        assert_eq!(&words[1..], &[64, 16, 256, FORMAT_RGBA8888, 0, 256 * 16]);

        // The size is sealed.
        let file = File::from(buffer.memory.try_clone().unwrap());
        assert!(file.set_len(1).is_err());
        assert_eq!(file.metadata().unwrap().len(), 256 * 16);
        MemfdAllocator.release(buffer);
    }

    #[test]
    fn memfd_rejects_zero_size() {
        assert!(matches!(
            MemfdAllocator.allocate(0, 0),
            Err(HubError::AllocationFailure)
        ));
    }
}
