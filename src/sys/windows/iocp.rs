use std::io;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use std::time::Duration;

use windows_sys::Win32::Foundation::{INVALID_HANDLE_VALUE, WAIT_TIMEOUT};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
};

/// Thin wrapper over one I/O completion port.
pub(crate) struct CompletionPort {
    handle: OwnedHandle,
}

/// One dequeued packet, or the end of the timeout.
pub(crate) enum Status {
    Dequeued {
        bytes: u32,
        key: usize,
        overlapped: *mut OVERLAPPED,
        /// Failure reported with the packet, if any.
        error: Option<io::Error>,
    },
    TimedOut,
}

impl CompletionPort {
    pub(crate) fn new() -> io::Result<CompletionPort> {
        let handle =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(CompletionPort {
            handle: unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) },
        })
    }

    /// Binds `handle` to the port under `key`.
    pub(crate) fn attach(&self, handle: RawHandle, key: usize) -> io::Result<()> {
        let port =
            unsafe { CreateIoCompletionPort(handle as _, self.handle.as_raw_handle() as _, key, 0) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Posts a user packet carrying only `key`.
    pub(crate) fn post(&self, key: usize) -> io::Result<()> {
        let ok = unsafe {
            PostQueuedCompletionStatus(self.handle.as_raw_handle() as _, 0, key, ptr::null_mut())
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Dequeues one packet, waiting up to `timeout`. `None` means no
    /// bound.
    pub(crate) fn dequeue(&self, timeout: Option<Duration>) -> io::Result<Status> {
        let millis = timeout.map_or(INFINITE, millis_from);
        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.handle.as_raw_handle() as _,
                &mut bytes,
                &mut key,
                &mut overlapped,
                millis,
            )
        };
        if ok != 0 {
            return Ok(Status::Dequeued {
                bytes,
                key,
                overlapped,
                error: None,
            });
        }
        let err = io::Error::last_os_error();
        if overlapped.is_null() {
            // No packet came out: timeout or port failure.
            return match err.raw_os_error() {
                Some(code) if code as u32 == WAIT_TIMEOUT => Ok(Status::TimedOut),
                _ => Err(err),
            };
        }
        // A packet for a failed operation; the error travels with it.
        Ok(Status::Dequeued {
            bytes,
            key,
            overlapped,
            error: Some(err),
        })
    }
}

/// Timeout in milliseconds, rounded up so sub-millisecond waits do not
/// collapse to a busy poll.
fn millis_from(timeout: Duration) -> u32 {
    let millis = timeout
        .checked_add(Duration::from_nanos(999_999))
        .unwrap_or(timeout)
        .as_millis();
    millis.min(u128::from(INFINITE - 1)) as u32
}
