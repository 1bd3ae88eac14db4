//! Executable memory management using mmap.
//!
//! The manager owns every region of code memory for the process. Regions
//! are reserved writable, filled during the finalize step, and flipped to
//! executable as one batch; after that no byte in any region is ever
//! written again. Region contents are only reachable through this module,
//! which the compiler keeps private to its finalize step.

use std::ptr::NonNull;
use thiserror::Error;

/// Error type for memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory allocation failed")]
    AllocationFailed,
    #[error("memory protection change failed")]
    ProtectionFailed,
    #[error("invalid memory size")]
    InvalidSize,
    #[error("address does not correspond to a reserved region")]
    UnknownRegion,
    #[error("memory has already been marked executable")]
    Sealed,
}

/// One reserved region: base address and page-aligned size.
#[derive(Debug)]
struct Region {
    ptr: NonNull<u8>,
    size: usize,
}

/// Owns all code memory regions for the process.
///
/// Regions are allocated writable and not executable. `make_executable`
/// seals the manager: every outstanding region becomes read/execute in one
/// batch and no further allocation or write is accepted.
#[derive(Debug, Default)]
pub struct ExecutableMemoryManager {
    regions: Vec<Region>,
    executable: bool,
}

impl ExecutableMemoryManager {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            executable: false,
        }
    }

    /// Get the page size for the current system.
    fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    /// Reserve a writable region of at least `size` bytes and return its
    /// base address.
    pub fn allocate(&mut self, size: usize) -> Result<*mut u8, MemoryError> {
        if self.executable {
            return Err(MemoryError::Sealed);
        }
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);
        let ptr = Self::map_anonymous(aligned_size)?;

        log::trace!("reserved {} bytes at {:p}", aligned_size, ptr.as_ptr());
        self.regions.push(Region {
            ptr,
            size: aligned_size,
        });
        Ok(ptr.as_ptr())
    }

    /// Allocate memory using mmap.
    #[cfg(unix)]
    fn map_anonymous(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn map_anonymous(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Fallback for non-Unix systems: use regular allocation
        // Note: This won't actually be executable on most systems
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Copy `data` into the region that starts at `base`.
    ///
    /// Fails if the manager is sealed, `base` is not the base of a reserved
    /// region, or the data would overflow that region.
    pub fn write(&mut self, base: *const u8, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::Sealed);
        }

        let region = self
            .regions
            .iter()
            .find(|r| r.ptr.as_ptr() as *const u8 == base)
            .ok_or(MemoryError::UnknownRegion)?;
        if data.len() > region.size {
            return Err(MemoryError::InvalidSize);
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), region.ptr.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Make every outstanding region executable (and read-only), as a
    /// single batch. Idempotent; after the first success the manager is
    /// sealed and no region can be written again.
    #[cfg(unix)]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }

        for region in &self.regions {
            let result = unsafe {
                libc::mprotect(
                    region.ptr.as_ptr() as *mut libc::c_void,
                    region.size,
                    libc::PROT_READ | libc::PROT_EXEC,
                )
            };
            if result != 0 {
                return Err(MemoryError::ProtectionFailed);
            }
        }

        log::debug!("marked {} regions executable", self.regions.len());
        self.executable = true;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        // On non-Unix systems we cannot change protection; the memory may
        // or may not be executable depending on the system.
        self.executable = true;
        Ok(())
    }

    /// Check if the regions have been marked executable.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Number of reserved regions.
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}

impl Drop for ExecutableMemoryManager {
    fn drop(&mut self) {
        for region in &self.regions {
            #[cfg(unix)]
            {
                unsafe {
                    libc::munmap(region.ptr.as_ptr() as *mut libc::c_void, region.size);
                }
            }
            #[cfg(not(unix))]
            {
                let layout = std::alloc::Layout::from_size_align(region.size, Self::page_size())
                    .expect("invalid layout");
                unsafe {
                    std::alloc::dealloc(region.ptr.as_ptr(), layout);
                }
            }
        }
    }
}

// The manager is Send and Sync because it owns its regions and all
// mutation goes through &mut self
unsafe impl Send for ExecutableMemoryManager {}
unsafe impl Sync for ExecutableMemoryManager {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_region() {
        let mut mem = ExecutableMemoryManager::new();
        let base = mem.allocate(100).unwrap();
        assert!(!base.is_null());
        assert_eq!(mem.region_count(), 1);
        assert!(!mem.is_executable());
    }

    #[test]
    fn test_allocate_zero_fails() {
        let mut mem = ExecutableMemoryManager::new();
        assert!(matches!(mem.allocate(0), Err(MemoryError::InvalidSize)));
    }

    #[test]
    fn test_write_region() {
        let mut mem = ExecutableMemoryManager::new();
        let base = mem.allocate(16).unwrap();
        mem.write(base, &[0x90, 0x90, 0xC3]).unwrap();
        unsafe {
            assert_eq!(std::slice::from_raw_parts(base, 3), &[0x90, 0x90, 0xC3]);
        }
    }

    #[test]
    fn test_write_unknown_base_fails() {
        let mut mem = ExecutableMemoryManager::new();
        let base = mem.allocate(16).unwrap();
        let inside = unsafe { base.add(1) };
        assert!(matches!(
            mem.write(inside, &[0x90]),
            Err(MemoryError::UnknownRegion)
        ));
    }

    #[test]
    fn test_make_executable_is_idempotent() {
        let mut mem = ExecutableMemoryManager::new();
        mem.allocate(16).unwrap();
        mem.make_executable().unwrap();
        assert!(mem.is_executable());
        mem.make_executable().unwrap();
    }

    #[test]
    fn test_cannot_write_after_executable() {
        let mut mem = ExecutableMemoryManager::new();
        let base = mem.allocate(16).unwrap();
        mem.write(base, &[0xC3]).unwrap();
        mem.make_executable().unwrap();
        assert!(matches!(
            mem.write(base, &[0x90]),
            Err(MemoryError::Sealed)
        ));
    }

    #[test]
    fn test_cannot_allocate_after_executable() {
        let mut mem = ExecutableMemoryManager::new();
        mem.allocate(16).unwrap();
        mem.make_executable().unwrap();
        assert!(matches!(mem.allocate(16), Err(MemoryError::Sealed)));
    }

    #[test]
    fn test_drop_with_no_regions() {
        let mem = ExecutableMemoryManager::new();
        drop(mem);
    }
}
