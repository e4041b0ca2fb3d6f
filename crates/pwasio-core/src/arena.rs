//! Shared buffer arena: one sealed memfd mapping carved into page-aligned slots.
//!
//! The arena is sized for the worst case (`MAX_PORTS` channels per direction,
//! two slots each) so it never grows while realtime threads hold pointers
//! into it. Slot `b` of input `i` lives at `(2i + b) * slot`; slot `b` of
//! output `i` at `(2(i + n_inputs) + b) * slot`.

use crate::config::MAX_PORTS;
use crate::error::ArenaStage;
use crate::ports::Direction;
use crate::{Error, Result};
use memmap2::MmapMut;
use std::cell::UnsafeCell;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;
use tracing::debug;

/// Bytes per sample. Only 32-bit float is supported.
pub const SAMPLE_BYTES: usize = std::mem::size_of::<f32>();

/// Slots per channel.
pub const SLOTS: usize = 2;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// OS page size in bytes.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        FALLBACK_PAGE_SIZE
    }
}

/// Pure slot arithmetic, separated from the mapping for testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    /// Slot stride in bytes, a whole number of pages.
    pub slot_bytes: usize,
    pub n_inputs: usize,
}

impl ArenaLayout {
    pub fn new(buffer_size: usize, n_inputs: usize, page: usize) -> Self {
        let wanted = (buffer_size * SAMPLE_BYTES).max(1);
        let slot_bytes = wanted.div_ceil(page) * page;
        Self {
            slot_bytes,
            n_inputs,
        }
    }

    /// Total mapping size.
    pub fn total_bytes(&self) -> usize {
        2 * SLOTS * MAX_PORTS * self.slot_bytes
    }

    /// Byte offset of a slot from the start of the arena.
    pub fn offset(&self, direction: Direction, index: usize, slot: usize) -> usize {
        let channel = match direction {
            Direction::Input => index,
            Direction::Output => index + self.n_inputs,
        };
        (SLOTS * channel + slot) * self.slot_bytes
    }
}

/// Pointer into the arena handed to the backend and the client.
///
/// The memory is externally aliased: the backend and the client both hold
/// it, and exclusive access is governed by slot ownership, not the type
/// system. It stays valid until the owning [`Arena`] is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasedSlot {
    ptr: NonNull<f32>,
    len: usize,
}

// SAFETY: the pointer targets a MAP_SHARED mapping owned by an `Arena` that
// outlives every handed-out slot; concurrent access is serialized by the
// swap protocol's slot ownership.
unsafe impl Send for AliasedSlot {}
unsafe impl Sync for AliasedSlot {}

impl AliasedSlot {
    /// # Safety
    /// `ptr` must be valid for `len` f32 reads and writes for the lifetime of
    /// every copy of the returned value.
    pub unsafe fn from_raw(ptr: NonNull<f32>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut f32 {
        self.ptr.as_ptr()
    }

    /// Samples in the slot (one cycle of frames).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The arena must still be mapped and the caller must own the slot.
    pub unsafe fn as_slice<'a>(&self) -> &'a [f32] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    /// The arena must still be mapped and the caller must own the slot
    /// exclusively for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [f32] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

/// The mapped region plus the descriptor backing it.
///
/// Fields drop in declaration order: unmap, then close.
pub struct Arena {
    mmap: UnsafeCell<MmapMut>,
    file: File,
    layout: ArenaLayout,
    buffer_size: usize,
}

// SAFETY: the mapping is only written through `AliasedSlot`s whose access is
// serialized by slot ownership; the arena itself never mutates after creation.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create, size, map and seal the shared region.
    ///
    /// On any failure everything acquired so far is released before the
    /// error is returned.
    pub fn create(buffer_size: usize, n_inputs: usize) -> Result<Self> {
        let layout = ArenaLayout::new(buffer_size, n_inputs, page_size());
        let size = layout.total_bytes();

        let file = memfd("pwasio-buf").map_err(|source| Error::Arena {
            stage: ArenaStage::Descriptor,
            source,
        })?;

        file.set_len(size as u64).map_err(|source| Error::Arena {
            stage: ArenaStage::Truncate,
            source,
        })?;

        // SAFETY: the file is private to this process until its descriptor is
        // handed to the backend, and it is sealed against resizing below.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|source| Error::Arena {
            stage: ArenaStage::Map,
            source,
        })?;

        seal(&file).map_err(|source| Error::Arena {
            stage: ArenaStage::Seal,
            source,
        })?;

        debug!(
            "arena mapped: fd {} size {} slot {} bytes",
            file.as_raw_fd(),
            size,
            layout.slot_bytes
        );

        Ok(Self {
            mmap: UnsafeCell::new(mmap),
            file,
            layout,
            buffer_size,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn len(&self) -> usize {
        self.layout.total_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layout(&self) -> ArenaLayout {
        self.layout
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Slot pointer for a channel. `len` is one cycle of frames.
    pub fn slot(&self, direction: Direction, index: usize, slot: usize) -> AliasedSlot {
        let offset = self.layout.offset(direction, index, slot);
        debug_assert!(offset + self.layout.slot_bytes <= self.len());
        // SAFETY: offset is within the mapping, checked above in debug builds
        // and guaranteed by MAX_PORTS bounds validation in the registry.
        unsafe {
            let base = (*self.mmap.get()).as_mut_ptr();
            let ptr = base.add(offset) as *mut f32;
            AliasedSlot::from_raw(NonNull::new_unchecked(ptr), self.buffer_size)
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        debug!("arena unmapped: fd {}", self.file.as_raw_fd());
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("fd", &self.fd())
            .field("layout", &self.layout)
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn memfd(name: &str) -> std::io::Result<File> {
    use std::ffi::CString;
    use std::os::fd::FromRawFd;

    let name = CString::new(name).map_err(std::io::Error::other)?;
    // SAFETY: name is a valid NUL-terminated string.
    let fd =
        unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd was just created and is owned by nobody else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(target_os = "linux")]
fn seal(file: &File) -> std::io::Result<()> {
    let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL;
    // SAFETY: fcntl on a valid descriptor we own.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, seals) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn memfd(name: &str) -> std::io::Result<File> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT: AtomicU64 = AtomicU64::new(0);
    let path = std::env::temp_dir().join(format!(
        "{name}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    std::fs::remove_file(&path)?;
    Ok(file)
}

#[cfg(not(target_os = "linux"))]
fn seal(_file: &File) -> std::io::Result<()> {
    Ok(())
}
