//! Platform-specific completion backends.
//!
//! Each backend drives submitted file I/O to completion and supplies the
//! wake primitive used to interrupt a blocked owner: a realtime signal on
//! POSIX, a user packet posted to the completion port on Windows. Both
//! expose the same internal contract to the service: `prepare`/`start` to
//! submit a request, `cancel`, and `wait_one` to block for the next event
//! up to a deadline.

/// Outcome of one backend wait.
pub(crate) enum Wait {
    /// An I/O completion was delivered and its hook has run.
    Completed,
    /// The wait was interrupted, most likely for pending posts.
    Woken,
    /// The wait slice elapsed without an event.
    TimedOut,
}

/// Transfer direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use self::unix::{Backend, RawOp};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use self::windows::{Backend, RawOp};
