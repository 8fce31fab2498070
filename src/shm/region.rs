//! Anonymous shared memory mappings.
//!
//! A region is one `MAP_SHARED | MAP_ANONYMOUS` mapping, inherited by forked
//! worker processes at the same address. The kernel hands it back zeroed and
//! page-aligned, so region offsets double as stable cross-process
//! references.

use std::ptr::NonNull;

use crate::error::CacheError;

/// The host page size.
pub fn page_size() -> usize {
    // SAFETY: sysconf reads a static configuration value.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Round `len` up to a whole number of pages.
pub fn page_align(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// One anonymous shared mapping, unmapped on drop.
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain shared memory; all synchronization happens above this
// type (process-shared mutex plus atomics in the mapped header).
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Map `len` bytes (rounded up to whole pages) of zeroed anonymous
    /// memory, shared with any process forked after the call.
    pub fn map_anon(len: usize) -> Result<Self, CacheError> {
        let len = page_align(len);
        if len == 0 {
            return Err(CacheError::Geometry("zero-length mapping"));
        }

        // SAFETY: fresh anonymous mapping with no backing fd; the result is
        // checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CacheError::Map(
                std::io::Error::last_os_error().to_string(),
            ));
        }

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| CacheError::Map("mmap returned a null mapping".to_string()))?;
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow `len` bytes starting at `off`.
    ///
    /// # Safety
    /// The span must not be concurrently mutated for the lifetime of the
    /// returned slice. Callers uphold this through the region's lock
    /// discipline and reader refcount.
    pub unsafe fn slice(&self, off: usize, len: usize) -> &[u8] {
        debug_assert!(off + len <= self.len);
        std::slice::from_raw_parts(self.ptr.as_ptr().add(off), len)
    }

    /// Mutably borrow `len` bytes starting at `off`.
    ///
    /// # Safety
    /// The caller must hold the region's lock and be the only writer of the
    /// span.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, off: usize, len: usize) -> &mut [u8] {
        debug_assert!(off + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(off), len)
    }

    /// Drop write access on a page-aligned span. Debug-build guard against
    /// mutation outside the lock; compiles to nothing in release builds.
    pub fn write_protect(&self, off: usize, len: usize) -> Result<(), CacheError> {
        self.set_protection(off, len, libc::PROT_READ)
    }

    /// Restore write access on a span previously protected with
    /// [`SharedRegion::write_protect`].
    pub fn write_unprotect(&self, off: usize, len: usize) -> Result<(), CacheError> {
        self.set_protection(off, len, libc::PROT_READ | libc::PROT_WRITE)
    }

    #[cfg(debug_assertions)]
    fn set_protection(&self, off: usize, len: usize, prot: libc::c_int) -> Result<(), CacheError> {
        debug_assert!(off % page_size() == 0 && off + len <= self.len);
        // SAFETY: the span lies inside this mapping and is page-aligned.
        let rc = unsafe { libc::mprotect(self.ptr.as_ptr().add(off).cast(), len, prot) };
        if rc != 0 {
            return Err(CacheError::Map(format!(
                "mprotect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(debug_assertions))]
    fn set_protection(
        &self,
        _off: usize,
        _len: usize,
        _prot: libc::c_int,
    ) -> Result<(), CacheError> {
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: the pointer and length come from our own mmap call.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        let page = page_size();
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
    }

    #[test]
    fn test_map_is_zeroed_and_writable() {
        let region = SharedRegion::map_anon(8192).unwrap();
        assert!(region.len() >= 8192);

        let bytes = unsafe { region.slice(0, 64) };
        assert!(bytes.iter().all(|&b| b == 0));

        let bytes = unsafe { region.slice_mut(100, 4) };
        bytes.copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(unsafe { region.slice(100, 4) }, &[1, 2, 3, 4]);
    }

    #[test]
    fn test_protect_round_trip() {
        let region = SharedRegion::map_anon(page_size() * 2).unwrap();
        region.write_protect(page_size(), page_size()).unwrap();
        region.write_unprotect(page_size(), page_size()).unwrap();
        let bytes = unsafe { region.slice_mut(page_size(), 1) };
        bytes[0] = 7;
    }
}
