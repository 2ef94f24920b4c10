use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use log::trace;

use crate::op::{self, Shared};
use crate::service::{self, Inner};
use crate::sys::Dir;
use crate::Service;

/// A regular file attached to a [`Service`] for asynchronous I/O.
///
/// Opening the file attaches it to the service: on Windows its handle is
/// bound to the service's completion port, on POSIX the association is
/// logical. All reads and writes are positional, never touch a file
/// cursor, and complete on the service's owning thread during
/// [`Service::run_until`].
///
/// Submission is owner-thread-only; submitting from another thread fails
/// with [`io::ErrorKind::Unsupported`]. The buffers travel with the
/// operation and come back through the completion callback.
///
/// Dropping the file cancels its outstanding requests best-effort before
/// the descriptor closes; their completions still drain through the
/// service exactly once each.
pub struct AsyncFile {
    file: File,
    inner: Arc<Inner>,
}

/// A submitted asynchronous operation.
///
/// Dropping an `Operation` does not cancel it; the completion callback
/// fires regardless, exactly once. Use [`cancel`] for a best-effort
/// cancellation, after which the callback observes either the operation's
/// result or the OS cancellation error.
///
/// [`cancel`]: Operation::cancel
pub struct Operation {
    shared: Arc<Shared>,
    inner: Arc<Inner>,
}

impl AsyncFile {
    /// Opens an existing file for reading and writing.
    pub fn open<P: AsRef<Path>>(service: &Service, path: P) -> io::Result<AsyncFile> {
        AsyncFile::open_with(service, OpenOptions::new().read(true).write(true), path)
    }

    /// Creates a file, truncating it if it exists, open for reading and
    /// writing.
    pub fn create<P: AsRef<Path>>(service: &Service, path: P) -> io::Result<AsyncFile> {
        AsyncFile::open_with(
            service,
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true),
            path,
        )
    }

    /// Opens a file with caller-supplied options and attaches it to
    /// `service`.
    ///
    /// On Windows the options are extended with the flag required for
    /// overlapped I/O; everything else is taken as given.
    pub fn open_with<P: AsRef<Path>>(
        service: &Service,
        options: &mut OpenOptions,
        path: P,
    ) -> io::Result<AsyncFile> {
        #[cfg(windows)]
        {
            use std::os::windows::fs::OpenOptionsExt;
            use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_OVERLAPPED;
            options.custom_flags(FILE_FLAG_OVERLAPPED);
        }
        let file = options.open(path)?;
        let inner = Arc::clone(service::inner(service));
        inner.sys.register(&file)?;
        trace!("attached file to service");
        Ok(AsyncFile { file, inner })
    }

    /// Current length of the file in bytes.
    pub fn len(&self) -> io::Result<u64> {
        self.file.metadata().map(|meta| meta.len())
    }

    /// Truncates or extends the file to `size` bytes.
    pub fn set_len(&self, size: u64) -> io::Result<()> {
        self.file.set_len(size)
    }

    /// Synchronously flushes file data and metadata to the device.
    pub fn sync_all(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Submits an asynchronous read of `buf.len()` bytes at `offset`.
    ///
    /// The callback receives the number of bytes read (possibly short, `0`
    /// at end of file) or the first error, along with the buffer.
    pub fn read_at<F>(&self, offset: u64, buf: Vec<u8>, f: F) -> io::Result<Operation>
    where
        F: FnOnce(io::Result<usize>, Vec<u8>) + Send + 'static,
    {
        self.submit(
            Dir::Read,
            offset,
            vec![buf],
            Box::new(move |result, mut buffers| f(result, buffers.pop().unwrap_or_default())),
        )
    }

    /// Submits an asynchronous write of `buf` at `offset`.
    pub fn write_at<F>(&self, offset: u64, buf: Vec<u8>, f: F) -> io::Result<Operation>
    where
        F: FnOnce(io::Result<usize>, Vec<u8>) + Send + 'static,
    {
        self.submit(
            Dir::Write,
            offset,
            vec![buf],
            Box::new(move |result, mut buffers| f(result, buffers.pop().unwrap_or_default())),
        )
    }

    /// Submits a scatter read into `buffers` at consecutive offsets
    /// starting at `offset`.
    ///
    /// One kernel request is issued per buffer; the callback fires once,
    /// after the last request settles, with the total byte count or the
    /// first error.
    pub fn read_vectored_at<F>(
        &self,
        offset: u64,
        buffers: Vec<Vec<u8>>,
        f: F,
    ) -> io::Result<Operation>
    where
        F: FnOnce(io::Result<usize>, Vec<Vec<u8>>) + Send + 'static,
    {
        self.submit(Dir::Read, offset, buffers, Box::new(f))
    }

    /// Submits a gather write of `buffers` at consecutive offsets starting
    /// at `offset`.
    pub fn write_vectored_at<F>(
        &self,
        offset: u64,
        buffers: Vec<Vec<u8>>,
        f: F,
    ) -> io::Result<Operation>
    where
        F: FnOnce(io::Result<usize>, Vec<Vec<u8>>) + Send + 'static,
    {
        self.submit(Dir::Write, offset, buffers, Box::new(f))
    }

    fn submit(
        &self,
        dir: Dir,
        offset: u64,
        buffers: Vec<Vec<u8>>,
        callback: op::Callback,
    ) -> io::Result<Operation> {
        if thread::current().id() != self.inner.owner() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "I/O submitted off the service's owning thread",
            ));
        }
        if buffers.is_empty() || buffers.iter().any(|buf| buf.is_empty()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "operation needs at least one non-empty buffer",
            ));
        }

        let shared = Shared::new(buffers, callback);
        let count = shared.buffer_count();
        let mut submitted = 0;
        let mut at = offset;

        for index in 0..count {
            let (ptr, len) = shared.buffer_raw(index);
            let raw = match self.inner.sys.prepare(&self.file, at, ptr, len) {
                Ok(raw) => Box::new(raw),
                Err(err) => return self.submit_failed(&shared, count, submitted, err),
            };
            let cb = raw.cb_ptr();
            shared.push_request(raw);
            self.inner.work_started();
            self.inner.sys.track(cb, Arc::clone(&shared));
            if let Err(err) = self.inner.sys.start(cb, dir) {
                self.inner.sys.untrack(cb);
                self.inner.work_finished();
                shared.pop_request();
                return self.submit_failed(&shared, count, submitted, err);
            }
            trace!("submitted {:?} request of {} bytes", dir, len);
            submitted += 1;
            at = at.saturating_add(len as u64);
        }

        Ok(Operation {
            shared,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Settles a partially submitted operation. With nothing in flight the
    /// error goes straight to the caller and no callback ever fires;
    /// otherwise the in-flight requests are cancelled best-effort, the
    /// remainder is charged with `err`, and the callback reports it once
    /// everything drains.
    fn submit_failed(
        &self,
        shared: &Arc<Shared>,
        count: usize,
        submitted: usize,
        err: io::Error,
    ) -> io::Result<Operation> {
        if submitted == 0 {
            return Err(err);
        }
        self.inner.sys.cancel(shared);
        shared.abandon(count - submitted, err);
        Ok(Operation {
            shared: Arc::clone(shared),
            inner: Arc::clone(&self.inner),
        })
    }
}

impl Drop for AsyncFile {
    fn drop(&mut self) {
        // Outstanding requests keep their buffers alive through the
        // service; cancel them before the descriptor goes away.
        self.inner.sys.cancel_file(&self.file);
    }
}

impl fmt::Debug for AsyncFile {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AsyncFile").field("file", &self.file).finish()
    }
}

impl Operation {
    /// Whether the completion callback has fired.
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// Requests cancellation of the operation's outstanding kernel
    /// requests.
    ///
    /// Best-effort: the kernel may complete the operation anyway. The
    /// completion callback still fires exactly once, with either the
    /// result or the OS cancellation error. Safe to call from any thread
    /// and after completion, when it does nothing.
    pub fn cancel(&self) -> io::Result<()> {
        if self.shared.is_finished() {
            return Ok(());
        }
        self.inner.sys.cancel(&self.shared);
        Ok(())
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Operation")
            .field("finished", &self.is_finished())
            .finish()
    }
}
