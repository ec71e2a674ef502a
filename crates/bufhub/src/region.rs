//! Mapping of the named shared region.
//!
//! The server creates (and eventually unlinks) the POSIX shared memory object;
//! clients only open and map it. Mapping is all-or-nothing: a region is
//! either mapped at its full, validated size or not at all.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use crate::error::HubError;
use crate::layout::{
    LayoutError, RegionHeader, SlotRecord, SlotState, control_slot_offset, data_slot_offset,
    region_size,
};

/// Permission bits for a newly created region.
const REGION_MODE: libc::mode_t = 0o660;

/// A mapped shared region.
pub struct SharedRegion {
    base: NonNull<u8>,
    size: usize,
    slot_count: u32,
    name: CString,
    /// The creator unlinks the backing object on drop.
    owner: bool,
}

// SAFETY: everything reachable through the mapping is atomics; the pointer
// itself is only freed on drop.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create the region (server side).
    ///
    /// An object left behind by a server that is gone is replaced. One whose
    /// creator is still running is refused. A region this process created
    /// earlier counts as left behind.
    pub fn create(name: &str, slot_count: u32) -> Result<Self, HubError> {
        let c_name = region_name(name).map_err(HubError::region_io)?;
        let size = region_size(slot_count).map_err(HubError::region_layout)?;

        if let Some(pid) = live_creator(&c_name) {
            return Err(HubError::region_io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("region {} is held by running server pid {}", name, pid),
            )));
        }
        // SAFETY: c_name is a valid NUL-terminated string.
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } == 0 {
            tracing::debug!(name, "removed stale region");
        }

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR | libc::O_CLOEXEC,
                REGION_MODE,
            )
        };
        if fd < 0 {
            return Err(HubError::region_io(io::Error::last_os_error()));
        }
        // SAFETY: shm_open returned a fresh descriptor we now own.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

        let mapped = file
            .set_len(size as u64)
            .and_then(|()| map_shared(&file, size));
        let base = match mapped {
            Ok(base) => base,
            Err(e) => {
                // SAFETY: c_name is a valid NUL-terminated string.
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(HubError::region_io(e));
            }
        };

        let region = Self {
            base,
            size,
            slot_count,
            name: c_name,
            owner: true,
        };

        // SAFETY: freshly mapped, zero-filled, and not yet visible to anyone
        // who could have validated it (ready is still 0).
        unsafe {
            let header = &mut *(region.base.as_ptr() as *mut RegionHeader);
            header.init(slot_count, std::process::id());

            let control = &mut *(region.base.as_ptr().add(control_slot_offset()) as *mut SlotRecord);
            control.init(SlotState::Idle);

            for index in 0..slot_count {
                let slot =
                    &mut *(region.base.as_ptr().add(data_slot_offset(index)) as *mut SlotRecord);
                slot.init(SlotState::Free);
            }
        }
        region.header().publish();

        tracing::info!(name, slot_count, size, "created shared region");
        Ok(region)
    }

    /// Open and map an existing region (client side).
    pub fn open(name: &str, slot_count: u32) -> Result<Self, HubError> {
        let c_name = region_name(name).map_err(HubError::region_io)?;
        let required = region_size(slot_count).map_err(HubError::region_layout)?;

        // SAFETY: c_name is a valid NUL-terminated string.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC, 0) };
        if fd < 0 {
            return Err(HubError::region_io(io::Error::last_os_error()));
        }
        // SAFETY: shm_open returned a fresh descriptor we now own.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

        let found = file.metadata().map_err(HubError::region_io)?.len() as usize;
        if found != required {
            return Err(HubError::region_layout(LayoutError::SizeMismatch {
                required,
                found,
            }));
        }

        let base = map_shared(&file, required).map_err(HubError::region_io)?;
        let region = Self {
            base,
            size: required,
            slot_count,
            name: c_name,
            owner: false,
        };

        // On failure `region` drops here and unmaps.
        region
            .header()
            .validate(slot_count)
            .map_err(HubError::region_layout)?;

        tracing::debug!(name, slot_count, "opened shared region");
        Ok(region)
    }

    /// Unmap (and, for the creator, unlink) the region.
    pub fn release(self) {
        drop(self);
    }

    pub fn header(&self) -> &RegionHeader {
        // SAFETY: the header is at offset 0 of a mapping at least this large.
        unsafe { &*(self.base.as_ptr() as *const RegionHeader) }
    }

    pub fn control_slot(&self) -> &SlotRecord {
        // SAFETY: offset is inside the mapping and 64-byte aligned.
        unsafe { &*(self.base.as_ptr().add(control_slot_offset()) as *const SlotRecord) }
    }

    /// Data slot `index`, or `None` if out of range.
    pub fn data_slot(&self, index: u32) -> Option<&SlotRecord> {
        if index >= self.slot_count {
            return None;
        }
        // SAFETY: bounds checked above; offset is inside the mapping.
        Some(unsafe { &*(self.base.as_ptr().add(data_slot_offset(index)) as *const SlotRecord) })
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: base and size describe the mapping created in create/open.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.size);
        }
        if self.owner {
            // SAFETY: name is a valid NUL-terminated string.
            unsafe { libc::shm_unlink(self.name.as_ptr()) };
            tracing::info!(name = self.name(), "unlinked shared region");
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("slot_count", &self.slot_count)
            .field("owner", &self.owner)
            .finish()
    }
}

fn region_name(name: &str) -> io::Result<CString> {
    let valid = name.len() > 1
        && name.len() <= 255
        && name.starts_with('/')
        && !name[1..].contains('/');
    if !valid {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid region name {:?}", name),
        ));
    }
    CString::new(name).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "region name contains NUL byte")
    })
}

/// Pid of another running process that created and published `c_name`.
fn live_creator(c_name: &CString) -> Option<u32> {
    // SAFETY: c_name is a valid NUL-terminated string.
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC, 0) };
    if fd < 0 {
        return None;
    }
    // SAFETY: shm_open returned a fresh descriptor we now own.
    let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

    let len = size_of::<RegionHeader>();
    if file.metadata().ok()?.len() < len as u64 {
        return None;
    }
    // SAFETY: fd is valid and the object is at least `len` bytes.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return None;
    }
    // SAFETY: the header sits at offset 0 of the mapping just created.
    let creator = unsafe { (*(addr as *const RegionHeader)).creator() };
    // SAFETY: addr and len describe the mapping just created.
    unsafe { libc::munmap(addr, len) };

    creator.filter(|&pid| pid != std::process::id() && process_alive(pid))
}

fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 only probes for existence.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn map_shared(file: &File, size: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: fd is valid for the duration of the call; the mapping outlives it.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr as *mut u8)
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Resource, ResourceCause};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!(
            "/bufhub-region-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_create_and_open() {
        let name = unique_name("open");
        let server = SharedRegion::create(&name, 3).unwrap();
        assert!(server.is_owner());
        assert_eq!(server.control_slot().state(), Some(SlotState::Idle));
        assert_eq!(server.data_slot(2).unwrap().state(), Some(SlotState::Free));
        assert!(server.data_slot(3).is_none());

        let client = SharedRegion::open(&name, 3).unwrap();
        assert!(!client.is_owner());

        // Both mappings see the same memory.
        server.data_slot(1).unwrap().set_owner_pid(4242);
        assert_eq!(client.data_slot(1).unwrap().owner_pid(), 4242);
    }

    #[test]
    fn test_open_missing_region() {
        let err = SharedRegion::open(&unique_name("missing"), 7).unwrap_err();
        assert!(matches!(
            err,
            HubError::ResourceUnavailable {
                resource: Resource::Region,
                cause: ResourceCause::Io(_)
            }
        ));
    }

    #[test]
    fn test_open_with_wrong_slot_count() {
        let name = unique_name("mismatch");
        let _server = SharedRegion::create(&name, 4).unwrap();
        let err = SharedRegion::open(&name, 7).unwrap_err();
        assert!(matches!(
            err,
            HubError::ResourceUnavailable {
                cause: ResourceCause::Layout(LayoutError::SizeMismatch { .. }),
                ..
            }
        ));
    }

    #[test]
    fn test_server_drop_unlinks() {
        let name = unique_name("unlink");
        let server = SharedRegion::create(&name, 1).unwrap();
        server.release();
        assert!(SharedRegion::open(&name, 1).is_err());
    }

    #[test]
    fn test_running_creator_is_not_displaced() {
        let name = unique_name("live");
        let first = SharedRegion::create(&name, 2).unwrap();

        // Pretend another process that is still alive created it.
        first.header().creator_pid.store(1, Ordering::Release);
        let err = SharedRegion::create(&name, 2).unwrap_err();
        assert!(matches!(
            err,
            HubError::ResourceUnavailable {
                resource: Resource::Region,
                cause: ResourceCause::Io(ref e),
            } if e.kind() == io::ErrorKind::AlreadyExists
        ));
        // Still intact for its clients.
        assert!(SharedRegion::open(&name, 2).is_ok());

        // A region of our own is left over from an earlier run and is replaced.
        first.header().creator_pid.store(std::process::id(), Ordering::Release);
        let second = SharedRegion::create(&name, 2).unwrap();
        assert_eq!(second.header().creator(), Some(std::process::id()));
        drop(first);
    }

    #[test]
    fn test_invalid_names() {
        assert!(SharedRegion::create("no-slash", 1).is_err());
        assert!(SharedRegion::create("/a/b", 1).is_err());
        assert!(SharedRegion::create("/", 1).is_err());
    }
}
