// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Memory regions that back a transport.
//!
//! [`SharedMemoryRegion`] maps a file under the segment directory so that
//! independent processes share it by name. [`HeapRegion`] is a private
//! allocation with the same interface, used for in-process transports and
//! for the reconciler's outbound message arena.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use crate::error::SharedMemoryError;
use crate::shm::MemoryAccessor;

/// Anything a transport can be placed into.
pub trait MemoryRegion: Send + Sync {
    fn size(&self) -> usize;

    /// View over the whole region.
    fn accessor(&self) -> MemoryAccessor<'_>;
}

/// Alignment of region bases; keeps the header's atomic fields aligned.
const REGION_ALIGNMENT: usize = 64;

/// A file-backed shared memory mapping.
///
/// The backing file outlives this handle on purpose: a peer that restarts
/// must find the same segment again. Abandoned segments are healed by the
/// transport's heartbeat-expiry check rather than by unlinking.
pub struct SharedMemoryRegion {
    /// Name of the segment file.
    name: String,
    /// Full path of the backing file.
    path: PathBuf,
    /// Pointer to the mapped memory.
    ptr: NonNull<u8>,
    /// Size of the mapped region in bytes.
    size: usize,
    /// Keeps the descriptor open for the lifetime of the mapping.
    _file: File,
    /// Whether this handle created the backing file.
    created: bool,
}

// SAFETY: SharedMemoryRegion owns its mapping; all access goes through
// accessors, and cross-process exclusion is provided by the transport mutex.
unsafe impl Send for SharedMemoryRegion {}

// SAFETY: see above. Lock-free readers only touch the header through atomics.
unsafe impl Sync for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Minimum size for a shared memory region.
    pub const MIN_SIZE: usize = 128;

    /// Maximum size for a shared memory region (1 GB).
    pub const MAX_SIZE: usize = 1024 * 1024 * 1024;

    /// Open the segment `name` in `dir`, creating it if it does not exist.
    ///
    /// An existing file shorter than `size` is extended; a longer one is
    /// mapped only up to `size`.
    ///
    /// # Errors
    /// Returns SharedMemoryError if the file cannot be created, opened,
    /// resized or mapped.
    pub fn open_or_create(dir: &Path, name: &str, size: usize) -> Result<Self, SharedMemoryError> {
        if !(Self::MIN_SIZE..=Self::MAX_SIZE).contains(&size) {
            return Err(SharedMemoryError::SizeOutOfBounds {
                size,
                min: Self::MIN_SIZE,
                max: Self::MAX_SIZE,
            });
        }

        if name.is_empty() || name.contains('/') {
            return Err(SharedMemoryError::CreateFailed {
                name: name.to_string(),
                reason: "Name must be non-empty and must not contain '/'".to_string(),
            });
        }

        std::fs::create_dir_all(dir).map_err(|e| SharedMemoryError::CreateFailed {
            name: name.to_string(),
            reason: format!("Failed to create {}: {}", dir.display(), e),
        })?;

        let path = dir.join(name);

        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o666)
            .open(&path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .map_err(|e| SharedMemoryError::OpenFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    })?;
                (file, false)
            }
            Err(e) => {
                return Err(SharedMemoryError::CreateFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let current_len = file
            .metadata()
            .map_err(|e| SharedMemoryError::OpenFailed {
                name: name.to_string(),
                reason: format!("stat failed: {}", e),
            })?
            .len();

        // set_len zero-fills the extension
        if current_len < size as u64 {
            file.set_len(size as u64)
                .map_err(|e| SharedMemoryError::CreateFailed {
                    name: name.to_string(),
                    reason: format!("ftruncate failed: {}", e),
                })?;
        }

        // Map the memory
        // SAFETY: fd is valid and the file is at least `size` bytes long
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(SharedMemoryError::MapFailed {
                reason: format!("mmap failed: {}", std::io::Error::last_os_error()),
            });
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| SharedMemoryError::MapFailed {
            reason: "mmap returned null".to_string(),
        })?;

        tracing::debug!(
            name = %name,
            path = %path.display(),
            size = size,
            created = created,
            "Mapped shared memory segment"
        );

        Ok(Self {
            name: name.to_string(),
            path,
            ptr,
            size,
            _file: file,
            created,
        })
    }

    /// Get the name of this shared memory region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle created the backing file.
    pub fn created(&self) -> bool {
        self.created
    }
}

impl MemoryRegion for SharedMemoryRegion {
    fn size(&self) -> usize {
        self.size
    }

    fn accessor(&self) -> MemoryAccessor<'_> {
        // SAFETY: the mapping is valid for `size` bytes while self is alive
        unsafe { MemoryAccessor::from_raw(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size were set by a successful mmap
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) };
        if result < 0 {
            tracing::error!(
                name = %self.name,
                error = %std::io::Error::last_os_error(),
                "Failed to unmap shared memory"
            );
        }
    }
}

/// Zeroed heap allocation usable wherever a shared region is.
pub struct HeapRegion {
    base: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: HeapRegion owns its allocation; see SharedMemoryRegion.
unsafe impl Send for HeapRegion {}

// SAFETY: see SharedMemoryRegion.
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// Allocate `size` zeroed bytes aligned to 64.
    pub fn new_zeroed(size: usize) -> Self {
        let layout = Layout::from_size_align(size.max(1), REGION_ALIGNMENT)
            .unwrap_or_else(|e| panic!("invalid heap region layout for {} bytes: {}", size, e));
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = match NonNull::new(ptr) {
            Some(base) => base,
            None => std::alloc::handle_alloc_error(layout),
        };
        Self { base, size, layout }
    }
}

impl MemoryRegion for HeapRegion {
    fn size(&self) -> usize {
        self.size
    }

    fn accessor(&self) -> MemoryAccessor<'_> {
        // SAFETY: the allocation is valid for `size` bytes while self is alive
        unsafe { MemoryAccessor::from_raw(self.base.as_ptr(), self.size) }
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with this layout
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
