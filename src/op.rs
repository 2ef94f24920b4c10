use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::sys;

pub(crate) type Callback = Box<dyn FnOnce(io::Result<usize>, Vec<Vec<u8>>) + Send + 'static>;

/// Completion state of one submitted operation, shared between the
/// submitting handle, the service's in-flight table, and the user-facing
/// [`Operation`](crate::Operation).
///
/// An operation covers one kernel request per buffer. Each request settles
/// exactly once; when the last one settles the user callback fires with
/// the total byte count, or with the first error any request reported.
pub(crate) struct Shared {
    /// Kernel requests not yet settled.
    remaining: AtomicUsize,
    /// Bytes transferred by requests that settled successfully.
    transferred: AtomicUsize,
    /// First error reported by any request.
    error: Mutex<Option<io::Error>>,
    /// Readiness flag, set once just before the callback fires.
    finished: AtomicBool,
    callback: Mutex<Option<Callback>>,
    /// Buffers handed back to the callback. The inner allocations must not
    /// be resized while the kernel owns them.
    buffers: Mutex<Vec<Vec<u8>>>,
    /// Control blocks, boxed so their addresses survive for the kernel.
    requests: Mutex<Vec<Box<sys::RawOp>>>,
}

impl Shared {
    pub(crate) fn new(buffers: Vec<Vec<u8>>, callback: Callback) -> Arc<Shared> {
        Arc::new(Shared {
            remaining: AtomicUsize::new(buffers.len()),
            transferred: AtomicUsize::new(0),
            error: Mutex::new(None),
            finished: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
            buffers: Mutex::new(buffers),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub(crate) fn buffer_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    /// Address and length of buffer `index`. The pointer targets the
    /// buffer's heap allocation and stays valid while this state is alive.
    pub(crate) fn buffer_raw(&self, index: usize) -> (*mut u8, usize) {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = &mut buffers[index];
        (buf.as_mut_ptr(), buf.len())
    }

    pub(crate) fn push_request(&self, request: Box<sys::RawOp>) {
        self.requests.lock().unwrap().push(request);
    }

    pub(crate) fn pop_request(&self) {
        self.requests.lock().unwrap().pop();
    }

    pub(crate) fn for_each_request(&self, mut f: impl FnMut(&sys::RawOp)) {
        for request in self.requests.lock().unwrap().iter() {
            f(request);
        }
    }

    /// Settle one kernel request with its result.
    pub(crate) fn settle(&self, result: io::Result<usize>) {
        self.record(result);
        self.finish_one();
    }

    /// Settle `count` requests that never reached the kernel, charging the
    /// submission error to the whole operation.
    pub(crate) fn abandon(&self, count: usize, error: io::Error) {
        self.record(Err(error));
        for _ in 0..count {
            self.finish_one();
        }
    }

    fn record(&self, result: io::Result<usize>) {
        match result {
            Ok(n) => {
                self.transferred.fetch_add(n, Ordering::AcqRel);
            }
            Err(err) => {
                let mut error = self.error.lock().unwrap();
                if error.is_none() {
                    *error = Some(err);
                }
            }
        }
    }

    fn finish_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        // Last request settled; every kernel reference to the buffers is
        // gone, so they can travel to the callback.
        let callback = self.callback.lock().unwrap().take();
        let buffers = mem::take(&mut *self.buffers.lock().unwrap());
        let result = match self.error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(self.transferred.load(Ordering::Acquire)),
        };
        self.finished.store(true, Ordering::Release);
        if let Some(callback) = callback {
            callback(result, buffers);
        }
    }
}
