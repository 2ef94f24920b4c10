//! Process-global wake signal management.
//!
//! The interruption signal is shared by every service in the process; each
//! service targets its own owner with `pthread_kill`, so wakes stay
//! per-service even though the handler is global. The handler body is
//! empty and async-signal-safe: delivery alone interrupts `aio_suspend`
//! with `EINTR`, which is all the run loop needs.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use libc::c_int;
use log::trace;

/// Signal currently installed for wake-ups; `0` when none.
static INSTALLED: AtomicI32 = AtomicI32::new(0);

/// Disposition replaced by `install`, restored by `set(0)`.
static PREVIOUS: Mutex<Option<Previous>> = Mutex::new(None);

struct Previous {
    signo: c_int,
    action: libc::sigaction,
}

// The stored sigaction is plain data (handler address, mask, flags); it is
// never dereferenced here, only handed back to the kernel.
unsafe impl Send for Previous {}

extern "C" fn wake_handler(_: c_int) {
    // Nothing to do: delivery interrupts the owner's blocking wait.
}

/// The installed wake signal, `0` when none.
pub(crate) fn current() -> i32 {
    INSTALLED.load(Ordering::Acquire)
}

/// Installs the handler if none is installed yet and returns the signal in
/// use.
pub(crate) fn ensure_installed() -> io::Result<c_int> {
    let signo = INSTALLED.load(Ordering::Acquire);
    if signo != 0 {
        return Ok(signo);
    }
    set(-1)
}

/// Installs, replaces, or uninstalls the process-wide wake handler.
///
/// `0` uninstalls and restores the previous disposition; `-1` picks the
/// first free realtime signal, falling back to `SIGUSR1`; any other value
/// is used as given.
pub(crate) fn set(signo: i32) -> io::Result<i32> {
    match signo {
        0 => uninstall(),
        -1 => install(first_free_realtime().unwrap_or(libc::SIGUSR1)),
        signo => install(signo),
    }
}

fn install(signo: c_int) -> io::Result<i32> {
    let installed = INSTALLED.load(Ordering::Acquire);
    if installed == signo {
        return Ok(signo);
    }
    if installed != 0 {
        uninstall()?;
    }

    let handler: extern "C" fn(c_int) = wake_handler;
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handler as usize as libc::sighandler_t;
    // No SA_RESTART: the whole point is surfacing EINTR to the wait.
    action.sa_flags = 0;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    let mut old: libc::sigaction = unsafe { mem::zeroed() };
    syscall!(sigaction(signo, &action, &mut old))?;
    *PREVIOUS.lock().unwrap() = Some(Previous { signo, action: old });
    INSTALLED.store(signo, Ordering::Release);
    trace!("installed wake handler for signal {}", signo);
    Ok(signo)
}

fn uninstall() -> io::Result<i32> {
    if let Some(previous) = PREVIOUS.lock().unwrap().take() {
        syscall!(sigaction(previous.signo, &previous.action, ptr::null_mut()))?;
    }
    INSTALLED.store(0, Ordering::Release);
    Ok(0)
}

/// First realtime signal whose disposition is still the default.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn first_free_realtime() -> Option<c_int> {
    for signo in libc::SIGRTMIN()..=libc::SIGRTMAX() {
        let mut old: libc::sigaction = unsafe { mem::zeroed() };
        if unsafe { libc::sigaction(signo, ptr::null(), &mut old) } != 0 {
            continue;
        }
        if old.sa_sigaction == libc::SIG_DFL {
            return Some(signo);
        }
    }
    None
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn first_free_realtime() -> Option<c_int> {
    None
}

/// A one-signal set for masking and waiting.
pub(crate) fn set_of(signo: c_int) -> libc::sigset_t {
    let mut set: libc::sigset_t = unsafe { mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signo);
    }
    set
}

/// Blocks `signo` in the calling thread.
pub(crate) fn block(signo: c_int) -> io::Result<()> {
    mask(libc::SIG_BLOCK, signo)
}

/// Unblocks `signo` in the calling thread.
pub(crate) fn unblock(signo: c_int) -> io::Result<()> {
    mask(libc::SIG_UNBLOCK, signo)
}

fn mask(how: c_int, signo: c_int) -> io::Result<()> {
    let set = set_of(signo);
    let rc = unsafe { libc::pthread_sigmask(how, &set, ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Interrupts `thread`'s blocking wait.
pub(crate) fn wake(thread: libc::pthread_t, signo: c_int) -> io::Result<()> {
    let rc = unsafe { libc::pthread_kill(thread, signo) };
    match rc {
        0 => Ok(()),
        // A full signal queue means wakes are already pending.
        libc::EAGAIN => Ok(()),
        rc => Err(io::Error::from_raw_os_error(rc)),
    }
}
