//! Asynchronous file I/O multiplexing for regular files.
//!
//! Aiomux provides a per-thread [`Service`] that owns a set of in-flight
//! file operations, drives them to completion with the host kernel's AIO
//! facility, and accepts one-shot callables posted from any thread. It is
//! the engine on which asynchronous file handles and algorithms built on
//! them run.
//!
//! A [`Service`] is bound to the thread that constructs it. Only that
//! thread may drain it with [`Service::run`] or [`Service::run_until`];
//! every completion callback and every posted callable executes there.
//! Other threads interact with the service through [`Remote`], a cloneable
//! posting handle, or by submitting I/O before the handle crosses threads.
//!
//! # Examples
//!
//! Posting work to the owning thread from elsewhere:
//!
//! ```
//! # fn main() -> std::io::Result<()> {
//! use std::sync::mpsc;
//! use std::thread;
//!
//! use aiomux::Service;
//!
//! let mut service = Service::new()?;
//! let remote = service.remote();
//!
//! let (tx, rx) = mpsc::channel();
//! let handle = thread::spawn(move || {
//!     remote.post(move |_| tx.send(42).unwrap());
//! });
//! handle.join().unwrap();
//!
//! // Dispatches the post on this thread, one unit of work per call.
//! while service.run()? {}
//!
//! assert_eq!(rx.recv().unwrap(), 42);
//! # Ok(())
//! # }
//! ```
//!
//! Reading a file asynchronously:
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! use std::sync::{Arc, Mutex};
//!
//! use aiomux::{AsyncFile, Service};
//!
//! let mut service = Service::new()?;
//! let file = AsyncFile::open(&service, "data.bin")?;
//!
//! let read = Arc::new(Mutex::new(None));
//! let slot = Arc::clone(&read);
//! let op = file.read_at(0, vec![0; 4096], move |result, buf| {
//!     *slot.lock().unwrap() = Some((result, buf));
//! })?;
//!
//! while !op.is_finished() {
//!     service.run()?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Implementation notes
//!
//! The service is backed by the kernel's completion facility:
//!
//! |      OS       |  Backend                     |
//! |---------------|------------------------------|
//! | Linux         | POSIX AIO + realtime signal  |
//! | FreeBSD       | POSIX AIO + realtime signal  |
//! | macOS         | POSIX AIO + `SIGUSR1`        |
//! | Windows       | I/O completion port          |
//!
//! On POSIX targets the wake-up path for cross-thread posts installs a
//! process-wide signal handler; see [`Service::set_interruption_signal`]
//! for how the signal is chosen and how to uninstall the handler.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod deadline;
mod file;
mod op;
mod service;
mod sys;

pub use crate::deadline::Deadline;
pub use crate::file::{AsyncFile, Operation};
pub use crate::service::{Remote, Service};
