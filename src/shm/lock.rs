//! Process-shared mutex embedded in a shared mapping.
//!
//! The mutex storage lives inside the region itself so every process that
//! inherits the mapping serializes on the same lock. Syscall failures here
//! are host problems, not cache conditions, and surface as hard errors.

use std::marker::PhantomData;
use std::mem::MaybeUninit;

use crate::error::CacheError;

/// Bytes a region must reserve for the mutex storage.
pub const MUTEX_SIZE: usize = std::mem::size_of::<libc::pthread_mutex_t>();

fn lock_err(call: &str, rc: i32) -> CacheError {
    CacheError::Lock(format!(
        "{call} failed: {}",
        std::io::Error::from_raw_os_error(rc)
    ))
}

/// Handle to a `PTHREAD_PROCESS_SHARED` mutex living in shared memory.
///
/// The handle is just a pointer; the storage belongs to the mapping and must
/// outlive every handle bound to it.
pub struct SharedMutex {
    mutex: *mut libc::pthread_mutex_t,
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialize a process-shared mutex in place at `ptr` and return a
    /// handle to it.
    ///
    /// # Safety
    /// `ptr` must point to at least [`MUTEX_SIZE`] writable bytes, suitably
    /// aligned for `pthread_mutex_t`, that stay mapped for the lifetime of
    /// every handle. The storage must not already hold a live mutex.
    pub unsafe fn init_at(ptr: *mut u8) -> Result<Self, CacheError> {
        let mutex = ptr.cast::<libc::pthread_mutex_t>();

        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
        if rc != 0 {
            return Err(lock_err("pthread_mutexattr_init", rc));
        }

        let mut rc = libc::pthread_mutexattr_setpshared(
            attr.as_mut_ptr(),
            libc::PTHREAD_PROCESS_SHARED,
        );
        if rc == 0 {
            rc = libc::pthread_mutex_init(mutex, attr.as_ptr());
        }
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());

        if rc != 0 {
            return Err(lock_err("pthread_mutex_init", rc));
        }
        Ok(Self { mutex })
    }

    /// Bind to a mutex previously initialized with [`SharedMutex::init_at`]
    /// (e.g. from a forked worker).
    ///
    /// # Safety
    /// `ptr` must point to storage initialized by `init_at` that outlives
    /// the handle.
    pub unsafe fn from_raw(ptr: *mut u8) -> Self {
        Self {
            mutex: ptr.cast::<libc::pthread_mutex_t>(),
        }
    }

    /// Block until the mutex is acquired.
    pub fn lock(&self) -> Result<SharedMutexGuard<'_>, CacheError> {
        // SAFETY: the mutex storage is initialized and mapped (init_at /
        // from_raw contract).
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex) };
        if rc != 0 {
            return Err(lock_err("pthread_mutex_lock", rc));
        }
        Ok(SharedMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }
}

/// RAII guard; unlocks on drop. Must be released on the locking thread.
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: this guard holds the lock it is releasing.
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.mutex) };
        if rc != 0 {
            tracing::error!(rc, "pthread_mutex_unlock failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::region::SharedRegion;

    #[test]
    fn test_lock_unlock_cycle() {
        let region = SharedRegion::map_anon(4096).unwrap();
        let mutex = unsafe { SharedMutex::init_at(region.as_ptr()) }.unwrap();

        for _ in 0..3 {
            let guard = mutex.lock().unwrap();
            drop(guard);
        }
    }

    #[test]
    fn test_mutex_fits_reservation() {
        assert!(MUTEX_SIZE <= 64);
    }
}
