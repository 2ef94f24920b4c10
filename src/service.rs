use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Instant;

use log::{error, trace};

use crate::sys::{self, Wait};
use crate::Deadline;

type Post = Box<dyn FnOnce(&Remote) + Send + 'static>;

/// A per-thread multiplexer of asynchronous file I/O and posted work.
///
/// The thread that calls [`Service::new`] becomes the *owning thread*:
/// the only one allowed to drain the service with [`run`] or
/// [`run_until`], and the thread on which every posted callable and every
/// I/O completion callback executes. Calling `run_until` from any other
/// thread fails with [`io::ErrorKind::Unsupported`] and mutates nothing.
///
/// Any thread may hand work to the owning thread with [`post`], directly
/// or through a cloned [`Remote`]. If the owner is blocked waiting for
/// completions, the post wakes it.
///
/// Each `run_until` call performs at most one unit of work: it dispatches
/// a single pending post, or waits for and dispatches a single I/O
/// completion. Callers that want to drain the service call it in a loop
/// until it returns `Ok(false)`.
///
/// # Examples
///
/// ```
/// # fn main() -> std::io::Result<()> {
/// use aiomux::Service;
///
/// let mut service = Service::new()?;
///
/// // Nothing outstanding.
/// assert!(!service.run()?);
///
/// service.post(|_| println!("on the owning thread"));
/// assert!(service.run()?);
/// assert!(!service.run()?);
/// # Ok(())
/// # }
/// ```
///
/// [`run`]: Service::run
/// [`run_until`]: Service::run_until
/// [`post`]: Service::post
pub struct Service {
    inner: Arc<Inner>,
}

/// A cloneable handle for posting work to a [`Service`] from other
/// threads.
///
/// A `Remote` keeps the service's shared state alive but cannot drain it;
/// draining stays with the owning thread. Posted callables receive a
/// `&Remote` so they can re-post without capturing one.
#[derive(Clone)]
pub struct Remote {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    owner: ThreadId,
    posts: Mutex<VecDeque<Post>>,
    /// Outstanding units: pending posts plus in-flight kernel requests.
    work: AtomicUsize,
    /// True while the owner is (or is about to be) blocked and must be
    /// woken for new work.
    need_wake: AtomicBool,
    pub(crate) sys: sys::Backend,
}

/// Decrements the work counter when dropped, so a panicking post callable
/// still leaves the counter matching the queue.
struct WorkGuard<'a>(&'a AtomicUsize);

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Service {
    /// Creates a service bound to the calling thread.
    ///
    /// On POSIX targets the first construction in a process installs the
    /// process-wide interruption-signal handler (see
    /// [`set_interruption_signal`]) and blocks that signal in the calling
    /// thread. Failure to create the kernel completion facility or to
    /// install the handler is fatal to the instance and reported here.
    ///
    /// [`set_interruption_signal`]: Service::set_interruption_signal
    pub fn new() -> io::Result<Service> {
        is_send::<Service>();
        is_sync::<Service>();
        is_send::<Remote>();
        is_sync::<Remote>();

        let sys = sys::Backend::new()?;
        Ok(Service {
            inner: Arc::new(Inner {
                owner: thread::current().id(),
                posts: Mutex::new(VecDeque::new()),
                work: AtomicUsize::new(0),
                need_wake: AtomicBool::new(false),
                sys,
            }),
        })
    }

    /// Returns a cloneable posting handle for this service.
    pub fn remote(&self) -> Remote {
        Remote {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Enqueues `f` for execution on the owning thread.
    ///
    /// Thread-safe; never blocks on running callables. Callables dispatch
    /// in enqueue order, one per [`run_until`] tick.
    ///
    /// [`run_until`]: Service::run_until
    pub fn post(&self, f: impl FnOnce(&Remote) + Send + 'static) {
        post_to(&self.inner, f);
    }

    /// [`run_until`] with no deadline.
    ///
    /// [`run_until`]: Service::run_until
    pub fn run(&mut self) -> io::Result<bool> {
        self.run_until(Deadline::NEVER)
    }

    /// Performs one unit of work, waiting up to `deadline` for it.
    ///
    /// Returns `Ok(true)` when a post was dispatched or an I/O completion
    /// was delivered, and `Ok(false)` when nothing is outstanding. With a
    /// finite deadline and nothing ready, the call blocks until work
    /// arrives or fails with [`io::ErrorKind::TimedOut`] once the deadline
    /// passes; with [`Deadline::NEVER`] and nothing outstanding it returns
    /// `Ok(false)` immediately.
    ///
    /// Pending posts are dispatched before the blocking wait begins. A
    /// panic in a posted callable propagates out of this call after the
    /// entry has been consumed; the service stays consistent and may be
    /// run again.
    ///
    /// # Errors
    ///
    /// * [`io::ErrorKind::Unsupported`] when called off the owning thread.
    /// * [`io::ErrorKind::InvalidInput`] for a malformed deadline.
    /// * [`io::ErrorKind::TimedOut`] when the deadline passes first.
    /// * Any operating system error surfaced by the backend wait.
    pub fn run_until(&mut self, deadline: Deadline) -> io::Result<bool> {
        if thread::current().id() != self.inner.owner {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "run_until called off the owning thread",
            ));
        }
        deadline.validate()?;
        let started = Instant::now();

        loop {
            if deadline.is_never() && self.inner.work.load(Ordering::Acquire) == 0 {
                return Ok(false);
            }

            if self.dispatch_post() {
                return Ok(true);
            }

            self.inner.need_wake.store(true, Ordering::SeqCst);
            // A post enqueued between the drain above and raising the flag
            // fired no wake; look again before committing to the wait.
            if !self.inner.posts.lock().unwrap().is_empty() {
                self.inner.need_wake.store(false, Ordering::SeqCst);
                continue;
            }

            let timeout = deadline.remaining(started);
            if matches!(timeout, Some(t) if t.is_zero()) {
                self.inner.need_wake.store(false, Ordering::SeqCst);
                return Err(timed_out());
            }

            let wait = self.inner.sys.wait_one(&self.inner, timeout);
            self.inner.need_wake.store(false, Ordering::SeqCst);

            match wait? {
                Wait::Completed => return Ok(true),
                Wait::Woken => continue,
                Wait::TimedOut => {
                    // The backend waits in bounded slices; only fail once
                    // the deadline itself has passed.
                    if matches!(deadline.remaining(started), Some(t) if t.is_zero()) {
                        return Err(timed_out());
                    }
                }
            }
        }
    }

    fn dispatch_post(&self) -> bool {
        let post = self.inner.posts.lock().unwrap().pop_front();
        let Some(post) = post else { return false };
        let _guard = WorkGuard(&self.inner.work);
        let remote = Remote {
            inner: Arc::clone(&self.inner),
        };
        trace!("dispatching post");
        post(&remote);
        true
    }
}

#[cfg(unix)]
#[cfg_attr(docsrs, doc(cfg(unix)))]
impl Service {
    /// Whether this service drives completions through kqueue.
    ///
    /// The kqueue path is reserved; the signal-driven wait is always used,
    /// so this currently returns `false`.
    pub fn using_kqueues(&self) -> bool {
        self.inner.sys.using_kqueues()
    }

    /// Forces the signal-driven wait even where kqueue is available.
    ///
    /// # Panics
    ///
    /// Panics if any I/O has already been submitted through this service.
    pub fn disable_kqueues(&mut self) {
        self.inner.sys.disable_kqueues();
    }

    /// The signal currently used to interrupt blocked owners, or `0` when
    /// no handler is installed.
    pub fn interruption_signal() -> i32 {
        sys::unix::signal::current()
    }

    /// Installs or replaces the process-wide interruption signal and
    /// returns the signal now in use.
    ///
    /// `0` uninstalls the handler and restores the disposition it
    /// replaced. `-1` picks the first free realtime signal, falling back
    /// to `SIGUSR1`. The choice applies to services constructed
    /// afterwards; in-flight requests keep the signal they were submitted
    /// with.
    pub fn set_interruption_signal(signo: i32) -> io::Result<i32> {
        sys::unix::signal::set(signo)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if thread::current().id() != self.inner.owner {
            // In-flight buffers may still be written by the kernel and
            // cannot be reaped off-thread; leak them instead of freeing.
            let leaked = self.inner.sys.leak_inflight();
            if leaked != 0 {
                error!(
                    "service dropped off its owning thread with {} in-flight requests; leaking them",
                    leaked
                );
            }
            return;
        }
        self.inner.sys.cancel_all();
        while self.inner.sys.has_inflight() {
            match self.inner.sys.wait_one(&self.inner, None) {
                Ok(_) => {}
                Err(err) => {
                    let leaked = self.inner.sys.leak_inflight();
                    error!(
                        "draining service on drop failed ({}); leaking {} in-flight requests",
                        err, leaked
                    );
                    break;
                }
            }
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Service")
            .field("owner", &self.inner.owner)
            .field("work", &self.inner.work.load(Ordering::Relaxed))
            .finish()
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Remote").finish()
    }
}

impl Remote {
    /// Enqueues `f` for execution on the service's owning thread.
    ///
    /// See [`Service::post`].
    pub fn post(&self, f: impl FnOnce(&Remote) + Send + 'static) {
        post_to(&self.inner, f);
    }
}

impl Inner {
    /// Registers one unit of work before the run loop can observe it.
    pub(crate) fn work_started(&self) {
        self.work.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn work_finished(&self) {
        self.work.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }
}

fn post_to(inner: &Arc<Inner>, f: impl FnOnce(&Remote) + Send + 'static) {
    inner.work_started();
    inner.posts.lock().unwrap().push_back(Box::new(f));
    // Fire the wake only when the owner declared itself blocked; if it is
    // running user code it will drain the queue on its own.
    if inner.need_wake.swap(false, Ordering::SeqCst) {
        if let Err(err) = inner.sys.wake() {
            error!("failed to wake service owner: {}", err);
        }
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline passed before any work")
}

// ===== Accessors for internal usage =====

pub(crate) fn inner(service: &Service) -> &Arc<Inner> {
    &service.inner
}

fn is_send<T: Send>() {}
fn is_sync<T: Sync>() {}
