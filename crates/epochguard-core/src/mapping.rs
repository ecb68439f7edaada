//! Anonymous memory mappings backing the tracked regions.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use crate::error::EngineError;

/// Owned anonymous `mmap` region, unmapped on drop.
pub struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain memory owned by this value; concurrent access
// is coordinated by the region that wraps it.
unsafe impl Send for Mapping {}
// SAFETY: as above; `Mapping` exposes only raw addresses, never references.
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Map `len` bytes of zeroed, private, read-write memory.
    pub fn anonymous(len: usize) -> Result<Self, EngineError> {
        if len == 0 {
            return Err(EngineError::InvalidConfig(
                "zero-length mapping".to_string(),
            ));
        }
        // SAFETY: anonymous mapping with a null hint; the kernel picks the address.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(EngineError::backing("mmap"));
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| EngineError::backing("mmap"))?;
        Ok(Self { base, len })
    }

    /// First byte of the mapping.
    #[must_use]
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Change protection of `[offset, offset + len)`; both must be page aligned.
    pub fn protect(&self, offset: usize, len: usize, writable: bool) -> Result<(), EngineError> {
        debug_assert!(offset + len <= self.len);
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: the range lies inside this mapping.
        let rc = unsafe { libc::mprotect(self.as_ptr().add(offset).cast(), len, prot) };
        if rc != 0 {
            return Err(EngineError::backing("mprotect"));
        }
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len came from a successful mmap owned by self.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_mapping_is_zeroed_and_writable() {
        let map = Mapping::anonymous(8192).expect("mmap");
        assert_eq!(map.len(), 8192);
        assert_eq!(map.base() % 4096, 0);
        // SAFETY: the mapping is 8192 bytes and read-write.
        unsafe {
            assert_eq!(*map.as_ptr().add(100), 0);
            *map.as_ptr().add(100) = 7;
            assert_eq!(*map.as_ptr().add(100), 7);
        }
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(Mapping::anonymous(0).is_err());
    }

    #[test]
    fn protect_round_trip() {
        let map = Mapping::anonymous(4096 * 2).expect("mmap");
        map.protect(0, 4096, false).expect("read-only");
        map.protect(0, 4096, true).expect("read-write");
        // SAFETY: page is writable again.
        unsafe { *map.as_ptr() = 1 };
    }
}
