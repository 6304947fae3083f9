//! Named mutex

use std::path::Path;

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE};
use windows_sys::Win32::System::Threading::{CreateMutexW, ReleaseMutex};

use crate::error::InstanceError;

/// Owned handle to `Global\<name>`
#[derive(Debug)]
pub(super) struct PlatformLock {
    handle: HANDLE,
}

// SAFETY: a mutex handle is a process-wide kernel object reference
unsafe impl Send for PlatformLock {}
unsafe impl Sync for PlatformLock {}

impl PlatformLock {
    /// Create the named mutex; `Ok(None)` if it already existed
    pub(super) fn acquire(_lock_dir: &Path, name: &str) -> Result<Option<Self>, InstanceError> {
        let wide: Vec<u16> = format!("Global\\{name}")
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: `wide` is NUL-terminated and outlives the call
        let handle = unsafe { CreateMutexW(std::ptr::null(), 1, wide.as_ptr()) };
        if handle == 0 {
            return Err(InstanceError::lock(
                name,
                std::io::Error::last_os_error().to_string(),
            ));
        }

        // SAFETY: reads the calling thread's last-error slot
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            // SAFETY: handle was returned by CreateMutexW above
            unsafe { CloseHandle(handle) };
            return Ok(None);
        }

        Ok(Some(Self { handle }))
    }

    pub(super) fn release(self) {
        // SAFETY: we own the handle and release it exactly once
        unsafe {
            ReleaseMutex(self.handle);
            CloseHandle(self.handle);
        }
    }
}
