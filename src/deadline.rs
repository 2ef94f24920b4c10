use std::io;
use std::time::{Duration, Instant, SystemTime};

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// A time bound for [`Service::run_until`].
///
/// A deadline is either the distinguished [`NEVER`] value, a span relative
/// to the moment the wait begins (measured against the steady clock), or
/// an absolute wall-clock instant expressed as seconds and nanoseconds
/// since the Unix epoch.
///
/// Construction never fails; a malformed deadline (nanoseconds of a full
/// second or more, or seconds beyond what the kernel timeout types can
/// carry) is rejected by [`Service::run_until`] with
/// [`io::ErrorKind::InvalidInput`].
///
/// [`Service::run_until`]: crate::Service::run_until
/// [`NEVER`]: Deadline::NEVER
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use aiomux::Deadline;
///
/// let never = Deadline::NEVER;
/// assert!(never.is_never());
///
/// let relative = Deadline::after(Duration::from_millis(100));
/// assert!(relative.is_relative());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    repr: Repr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repr {
    Never,
    Relative { secs: u64, nanos: u32 },
    Absolute { secs: u64, nanos: u32 },
}

impl Deadline {
    /// The unbounded deadline: a wait with this deadline only ends when
    /// work is done.
    pub const NEVER: Deadline = Deadline { repr: Repr::Never };

    /// A deadline `secs` seconds and `nanos` nanoseconds after the wait
    /// begins.
    pub const fn relative(secs: u64, nanos: u32) -> Deadline {
        Deadline {
            repr: Repr::Relative { secs, nanos },
        }
    }

    /// An absolute wall-clock deadline, in seconds and nanoseconds since
    /// the Unix epoch.
    pub const fn absolute(secs: u64, nanos: u32) -> Deadline {
        Deadline {
            repr: Repr::Absolute { secs, nanos },
        }
    }

    /// A relative deadline the length of `duration`.
    pub fn after(duration: Duration) -> Deadline {
        Deadline::relative(duration.as_secs(), duration.subsec_nanos())
    }

    /// An absolute deadline at `when`. Instants before the epoch collapse
    /// to the epoch itself, which is always in the past.
    pub fn at(when: SystemTime) -> Deadline {
        let since_epoch = when
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Deadline::absolute(since_epoch.as_secs(), since_epoch.subsec_nanos())
    }

    /// Returns `true` for [`Deadline::NEVER`].
    pub fn is_never(&self) -> bool {
        matches!(self.repr, Repr::Never)
    }

    /// Returns `true` for deadlines measured from the start of the wait.
    pub fn is_relative(&self) -> bool {
        matches!(self.repr, Repr::Relative { .. })
    }

    pub(crate) fn validate(&self) -> io::Result<()> {
        let (secs, nanos) = match self.repr {
            Repr::Never => return Ok(()),
            Repr::Relative { secs, nanos } | Repr::Absolute { secs, nanos } => (secs, nanos),
        };
        if nanos >= NANOS_PER_SEC || secs > i64::MAX as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "malformed deadline",
            ));
        }
        Ok(())
    }

    /// Time left until the deadline, measured from `started` for relative
    /// deadlines and against the wall clock for absolute ones. `None`
    /// means there is no bound.
    pub(crate) fn remaining(&self, started: Instant) -> Option<Duration> {
        match self.repr {
            Repr::Never => None,
            Repr::Relative { secs, nanos } => {
                let total = Duration::new(secs, nanos);
                Some(total.saturating_sub(started.elapsed()))
            }
            Repr::Absolute { secs, nanos } => {
                let target = SystemTime::UNIX_EPOCH + Duration::new(secs, nanos);
                Some(
                    target
                        .duration_since(SystemTime::now())
                        .unwrap_or(Duration::ZERO),
                )
            }
        }
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Deadline {
        Deadline::after(duration)
    }
}

impl From<SystemTime> for Deadline {
    fn from(when: SystemTime) -> Deadline {
        Deadline::at(when)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_is_unbounded() {
        assert!(Deadline::NEVER.is_never());
        assert!(Deadline::NEVER.validate().is_ok());
        assert_eq!(Deadline::NEVER.remaining(Instant::now()), None);
    }

    #[test]
    fn malformed_nanos_rejected() {
        let deadline = Deadline::relative(0, NANOS_PER_SEC);
        assert_eq!(
            deadline.validate().unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn unrepresentable_secs_rejected() {
        let deadline = Deadline::absolute(u64::MAX, 0);
        assert_eq!(
            deadline.validate().unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn relative_counts_down() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let started = Instant::now();
        let remaining = deadline.remaining(started).unwrap();
        assert!(remaining <= Duration::from_millis(100));
    }

    #[test]
    fn absolute_in_the_past_is_zero() {
        let deadline = Deadline::absolute(0, 0);
        assert_eq!(deadline.remaining(Instant::now()), Some(Duration::ZERO));
    }
}
