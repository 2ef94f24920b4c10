use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use libc::c_int;
use log::trace;

use crate::op;
use crate::service::Inner;
use crate::sys::{Dir, Wait};

use super::signal;

/// Longest single suspension slice.
///
/// A wake signal delivered in the window between unblocking it and
/// entering `aio_suspend` is swallowed by the no-op handler; bounding the
/// slice bounds the resulting stall to one slice instead of the full
/// deadline.
const SUSPEND_SLICE: Duration = Duration::from_millis(50);

/// One submitted kernel request.
///
/// The control block must not move while the kernel owns it; it lives in a
/// `Box` owned by the operation's shared state and is referenced from the
/// in-flight table by address only.
pub(crate) struct RawOp {
    cb: libc::aiocb,
    fd: c_int,
}

// The control block is only touched by the owning thread and the kernel.
unsafe impl Send for RawOp {}
unsafe impl Sync for RawOp {}

impl RawOp {
    pub(crate) fn cb_ptr(&self) -> usize {
        &self.cb as *const libc::aiocb as usize
    }
}

struct InFlight {
    /// Address of the control block inside its `RawOp` box.
    cb: usize,
    op: Arc<op::Shared>,
}

/// POSIX AIO completion backend.
///
/// Requests carry a signal notification naming the process-wide
/// interruption signal; the wait itself is `aio_suspend` over the
/// in-flight control blocks, interrupted by that signal when another
/// thread posts work.
pub(crate) struct Backend {
    /// pthread identity of the owning thread, target of wake signals.
    owner: libc::pthread_t,
    /// Signal carried by every control block submitted through this
    /// service.
    signo: c_int,
    /// Control blocks the kernel currently owns. Insertion and removal
    /// happen on the owning thread only.
    inflight: Mutex<Vec<InFlight>>,
    /// Reserved: drive completions through kqueue instead of the signal
    /// wait where the host supports it.
    kqueues: AtomicBool,
}

impl Backend {
    pub(crate) fn new() -> io::Result<Backend> {
        let signo = signal::ensure_installed()?;
        // Keep the wake signal out of normal delivery; only the blocking
        // wait observes it.
        signal::block(signo)?;
        Ok(Backend {
            owner: unsafe { libc::pthread_self() },
            signo,
            inflight: Mutex::new(Vec::new()),
            kqueues: AtomicBool::new(false),
        })
    }

    pub(crate) fn using_kqueues(&self) -> bool {
        self.kqueues.load(Ordering::Relaxed)
    }

    pub(crate) fn disable_kqueues(&self) {
        assert!(
            self.inflight.lock().unwrap().is_empty(),
            "disable_kqueues called after I/O was submitted"
        );
        self.kqueues.store(false, Ordering::Relaxed);
    }

    /// Attaching a file is purely logical on POSIX.
    pub(crate) fn register(&self, _file: &File) -> io::Result<()> {
        Ok(())
    }

    pub(crate) fn prepare(
        &self,
        file: &File,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) -> io::Result<RawOp> {
        if offset > i64::MAX as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "offset beyond what the kernel control block can carry",
            ));
        }
        let fd = file.as_raw_fd();
        let mut cb: libc::aiocb = unsafe { mem::zeroed() };
        cb.aio_fildes = fd;
        cb.aio_offset = offset as libc::off_t;
        cb.aio_buf = buf as *mut libc::c_void;
        cb.aio_nbytes = len;
        cb.aio_sigevent.sigev_notify = libc::SIGEV_SIGNAL;
        cb.aio_sigevent.sigev_signo = self.signo;
        cb.aio_sigevent.sigev_value = libc::sigval {
            sival_ptr: self as *const Backend as *mut libc::c_void,
        };
        Ok(RawOp { cb, fd })
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
        let cb = cb as *mut libc::aiocb;
        match dir {
            Dir::Read => syscall!(aio_read(cb)).map(|_| ()),
            Dir::Write => syscall!(aio_write(cb)).map(|_| ()),
        }
    }

    /// Best-effort cancellation of one operation's outstanding requests.
    pub(crate) fn cancel(&self, op: &op::Shared) {
        op.for_each_request(|raw| {
            // AIO_ALLDONE and friends are fine; the completion path reaps
            // whatever the kernel reports.
            unsafe { libc::aio_cancel(raw.fd, raw.cb_ptr() as *mut libc::aiocb) };
        });
    }

    /// Best-effort cancellation of every request against `file`.
    pub(crate) fn cancel_file(&self, file: &File) {
        unsafe { libc::aio_cancel(file.as_raw_fd(), ptr::null_mut()) };
    }

    pub(crate) fn cancel_all(&self) {
        for entry in self.inflight.lock().unwrap().iter() {
            let cb = entry.cb as *mut libc::aiocb;
            unsafe { libc::aio_cancel((*cb).aio_fildes, cb) };
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

    /// Interrupts the owner's blocking wait.
    pub(crate) fn wake(&self) -> io::Result<()> {
        signal::wake(self.owner, self.signo)
    }

    /// Waits for the next event: one I/O completion (dispatched before
    /// returning), a wake, or the end of the timeout. `None` means no
    /// bound.
    pub(crate) fn wait_one(&self, inner: &Inner, timeout: Option<Duration>) -> io::Result<Wait> {
        // Snapshot the suspend list. Entries are only removed on this
        // thread, so the control blocks stay valid across the wait.
        let list: Vec<*const libc::aiocb> = self
            .inflight
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.cb as *const libc::aiocb)
            .collect();

        if list.is_empty() {
            return self.wait_for_wake(timeout);
        }

        let slice = timeout.map_or(SUSPEND_SLICE, |t| t.min(SUSPEND_SLICE));
        let ts = timespec_from(slice);

        signal::unblock(self.signo)?;
        let rc = unsafe { libc::aio_suspend(list.as_ptr(), list.len() as c_int, &ts) };
        let err = io::Error::last_os_error();
        signal::block(self.signo)?;

        if rc == -1 {
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => Ok(Wait::TimedOut),
                Some(libc::EINTR) => Ok(Wait::Woken),
                _ => Err(err),
            };
        }

        self.reap(inner)
    }

    /// Reaps the first completed control block, in submission order.
    fn reap(&self, inner: &Inner) -> io::Result<Wait> {
        let entry = {
            let mut inflight = self.inflight.lock().unwrap();
            let index = inflight.iter().position(|entry| {
                let cb = entry.cb as *mut libc::aiocb;
                (unsafe { libc::aio_error(cb) }) != libc::EINPROGRESS
            });
            index.map(|index| inflight.remove(index))
        };
        let Some(entry) = entry else {
            // The wait returned without anything reapable.
            return Ok(Wait::Woken);
        };

        let cb = entry.cb as *mut libc::aiocb;
        let status = unsafe { libc::aio_error(cb) };
        let result = match status {
            0 => {
                let n = unsafe { libc::aio_return(cb) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }
            status => {
                // Consume the request so the kernel can retire it.
                unsafe { libc::aio_return(cb) };
                Err(io::Error::from_raw_os_error(status))
            }
        };

        inner.work_finished();
        trace!("aio request settled: {:?}", result.as_ref().map(|n| *n));
        entry.op.settle(result);
        Ok(Wait::Completed)
    }

    /// Waits for the wake signal alone; used when nothing is in flight.
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn wait_for_wake(&self, timeout: Option<Duration>) -> io::Result<Wait> {
        let set = signal::set_of(self.signo);
        let rc = match timeout {
            Some(timeout) => {
                let ts = timespec_from(timeout);
                unsafe { libc::sigtimedwait(&set, ptr::null_mut(), &ts) }
            }
            None => unsafe { libc::sigwaitinfo(&set, ptr::null_mut()) },
        };
        if rc == -1 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => Ok(Wait::TimedOut),
                Some(libc::EINTR) => Ok(Wait::Woken),
                _ => Err(err),
            };
        }
        Ok(Wait::Woken)
    }

    /// Darwin has no `sigtimedwait`; sleep in bounded slices with the
    /// signal unblocked so delivery interrupts `nanosleep`.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn wait_for_wake(&self, timeout: Option<Duration>) -> io::Result<Wait> {
        let slice = timeout.map_or(SUSPEND_SLICE, |t| t.min(SUSPEND_SLICE));
        let ts = timespec_from(slice);
        signal::unblock(self.signo)?;
        let rc = unsafe { libc::nanosleep(&ts, ptr::null_mut()) };
        let err = io::Error::last_os_error();
        signal::block(self.signo)?;
        if rc == -1 {
            return match err.raw_os_error() {
                Some(libc::EINTR) => Ok(Wait::Woken),
                _ => Err(err),
            };
        }
        Ok(Wait::TimedOut)
    }
}

fn timespec_from(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs().min(i64::MAX as u64) as libc::time_t,
        tv_nsec: duration.subsec_nanos() as _,
    }
}
