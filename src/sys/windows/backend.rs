use std::fs::File;
use std::io;
use std::mem;
use std::os::windows::io::{AsRawHandle, RawHandle};
use std::ptr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;

use windows_sys::Win32::Foundation::{ERROR_HANDLE_EOF, ERROR_IO_PENDING};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{CancelIoEx, OVERLAPPED};

use crate::op;
use crate::service::Inner;
use crate::sys::{Dir, Wait};

use super::iocp::{CompletionPort, Status};

/// Key of the user packet posted to wake a blocked owner. File handles are
/// attached under `FILE_KEY`, so the two can never collide.
const WAKE_KEY: usize = usize::MAX;
const FILE_KEY: usize = 0;

/// One submitted kernel request.
///
/// The overlapped block leads the struct so the pointer the port hands
/// back is also the `RawOp` address. It must not move while the kernel
/// owns it; it lives in a `Box` owned by the operation's shared state.
#[repr(C)]
pub(crate) struct RawOp {
    overlapped: OVERLAPPED,
    handle: RawHandle,
    buf: *mut u8,
    len: u32,
}

// The control block is only touched by the owning thread and the kernel.
unsafe impl Send for RawOp {}
unsafe impl Sync for RawOp {}

impl RawOp {
    pub(crate) fn cb_ptr(&self) -> usize {
        &self.overlapped as *const OVERLAPPED as usize
    }
}

struct InFlight {
    /// Address of the overlapped block inside its `RawOp` box.
    cb: usize,
    op: Arc<op::Shared>,
}

/// I/O completion port backend.
///
/// One port per service; file handles are bound to it at attachment time,
/// and cross-thread wakes arrive as user packets under a sentinel key.
pub(crate) struct Backend {
    port: CompletionPort,
    /// Overlapped blocks the kernel currently owns. Insertion and removal
    /// happen on the owning thread only.
    inflight: Mutex<Vec<InFlight>>,
}

impl Backend {
    pub(crate) fn new() -> io::Result<Backend> {
        Ok(Backend {
            port: CompletionPort::new()?,
            inflight: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn register(&self, file: &File) -> io::Result<()> {
        self.port.attach(file.as_raw_handle(), FILE_KEY)
    }

    pub(crate) fn prepare(
        &self,
        file: &File,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> io::Result<RawOp> {
        let len = u32::try_from(len).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer larger than one overlapped transfer can carry",
            )
        })?;
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.Anonymous.Anonymous.Offset = offset as u32;
        overlapped.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
        Ok(RawOp {
            overlapped,
            handle: file.as_raw_handle(),
            buf,
            len,
        })
    }

    pub(crate) fn track(&self, cb: usize, op: Arc<op::Shared>) {
        self.inflight.lock().unwrap().push(InFlight { cb, op });
    }

    pub(crate) fn untrack(&self, cb: usize) {
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(index) = inflight.iter().position(|entry| entry.cb == cb) {
            inflight.remove(index);
        }
    }

    pub(crate) fn start(&self, cb: usize, dir: Dir) -> io::Result<()> {
        let raw = cb as *mut RawOp;
        let (handle, buf, len, overlapped) = unsafe {
            (
                (*raw).handle,
                (*raw).buf,
                (*raw).len,
                &mut (*raw).overlapped as *mut OVERLAPPED,
            )
        };
        let ok = match dir {
            Dir::Read => unsafe { ReadFile(handle as _, buf as _, len, ptr::null_mut(), overlapped) },
            Dir::Write => unsafe {
                WriteFile(handle as _, buf as _, len, ptr::null_mut(), overlapped)
            },
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                // The packet arrives through the port either way.
                Some(code) if code as u32 == ERROR_IO_PENDING => Ok(()),
                _ => Err(err),
            };
        }
        // Completed synchronously; the packet is still queued to the port.
        Ok(())
    }

    /// Best-effort cancellation of one operation's outstanding requests.
    pub(crate) fn cancel(&self, op: &op::Shared) {
        op.for_each_request(|raw| {
            // ERROR_NOT_FOUND just means the request already completed.
            unsafe { CancelIoEx(raw.handle as _, raw.cb_ptr() as *mut OVERLAPPED) };
        });
    }

    /// Best-effort cancellation of every request against `file`.
    pub(crate) fn cancel_file(&self, file: &File) {
        unsafe { CancelIoEx(file.as_raw_handle() as _, ptr::null_mut()) };
    }

    pub(crate) fn cancel_all(&self) {
        for entry in self.inflight.lock().unwrap().iter() {
            let raw = entry.cb as *mut RawOp;
            unsafe { CancelIoEx((*raw).handle as _, entry.cb as *mut OVERLAPPED) };
        }
    }

    pub(crate) fn has_inflight(&self) -> bool {
        !self.inflight.lock().unwrap().is_empty()
    }

    /// Abandons the in-flight table without freeing the operations behind
    /// it. Used when the service cannot be drained on its owning thread.
    pub(crate) fn leak_inflight(&self) -> usize {
        let entries = mem::take(&mut *self.inflight.lock().unwrap());
        let count = entries.len();
        mem::forget(entries);
        count
    }

    /// Interrupts the owner's blocking wait with a user packet.
    pub(crate) fn wake(&self) -> io::Result<()> {
        self.port.post(WAKE_KEY)
    }

    /// Waits for the next packet: one I/O completion (dispatched before
    /// returning), a wake, or the end of the timeout. `None` means no
    /// bound.
    pub(crate) fn wait_one(&self, inner: &Inner, timeout: Option<Duration>) -> io::Result<Wait> {
        match self.port.dequeue(timeout)? {
            Status::TimedOut => Ok(Wait::TimedOut),
            Status::Dequeued { key: WAKE_KEY, .. } => Ok(Wait::Woken),
            Status::Dequeued {
                bytes,
                overlapped,
                error,
                ..
            } => {
                let entry = {
                    let mut inflight = self.inflight.lock().unwrap();
                    let index = inflight
                        .iter()
                        .position(|entry| entry.cb == overlapped as usize);
                    index.map(|index| inflight.remove(index))
                };
                let Some(entry) = entry else {
                    // A packet for a request this service no longer tracks.
                    return Ok(Wait::Woken);
                };

                let result = match error {
                    None => Ok(bytes as usize),
                    // Reads at or past the end of file complete empty.
                    Some(err) if err.raw_os_error() == Some(ERROR_HANDLE_EOF as i32) => Ok(0),
                    Some(err) => Err(err),
                };

                inner.work_finished();
                trace!("overlapped request settled: {:?}", result.as_ref().map(|n| *n));
                entry.op.settle(result);
                Ok(Wait::Completed)
            }
        }
    }
}
