use std::fs;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rand::RngCore;

use aiomux::{AsyncFile, Operation, Service};

mod util;

use util::{assert_send, assert_sync, init};

const FILE_SIZE: usize = 4096;

fn random_contents() -> Vec<u8> {
    let mut contents = vec![0u8; FILE_SIZE];
    rand::rng().fill_bytes(&mut contents);
    contents
}

/// Runs the service until the operation's callback has fired.
fn drain(service: &mut Service, op: &Operation) {
    while !op.is_finished() {
        service.run().expect("unable to run service");
    }
}

#[test]
fn is_send_and_sync() {
    assert_send::<AsyncFile>();
    assert_sync::<AsyncFile>();
    assert_send::<Operation>();
    assert_sync::<Operation>();
}

#[test]
fn read_whole_file() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let contents = random_contents();
    fs::write(&path, &contents).unwrap();

    let mut service = Service::new().expect("unable to create service");
    let file = AsyncFile::open(&service, &path).expect("unable to open file");

    let done = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&done);
    let op = file
        .read_at(0, vec![0u8; FILE_SIZE], move |result, buf| {
            *slot.lock().unwrap() = Some((result, buf));
        })
        .expect("unable to submit read");

    drain(&mut service, &op);

    let (result, buf) = done.lock().unwrap().take().expect("callback never fired");
    assert_eq!(result.unwrap(), FILE_SIZE);
    assert_eq!(buf, contents);

    // Quiescent again.
    assert!(!service.run().unwrap());
}

#[test]
fn vectored_read_reassembles_file() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let contents = random_contents();
    fs::write(&path, &contents).unwrap();

    let mut service = Service::new().expect("unable to create service");
    let file = AsyncFile::open(&service, &path).expect("unable to open file");

    let done = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&done);
    let halves = vec![vec![0u8; FILE_SIZE / 2], vec![0u8; FILE_SIZE / 2]];
    let op = file
        .read_vectored_at(0, halves, move |result, buffers| {
            *slot.lock().unwrap() = Some((result, buffers));
        })
        .expect("unable to submit read");

    drain(&mut service, &op);

    let (result, buffers) = done.lock().unwrap().take().expect("callback never fired");
    assert_eq!(result.unwrap(), FILE_SIZE);
    assert_eq!(buffers.len(), 2);
    assert_eq!(buffers[0], contents[..FILE_SIZE / 2]);
    assert_eq!(buffers[1], contents[FILE_SIZE / 2..]);
}

#[test]
fn write_then_read_back() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    let contents = random_contents();

    let mut service = Service::new().expect("unable to create service");
    let file = AsyncFile::create(&service, &path).expect("unable to create file");

    let done = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&done);
    let op = file
        .write_at(0, contents.clone(), move |result, _| {
            *slot.lock().unwrap() = Some(result);
        })
        .expect("unable to submit write");

    drain(&mut service, &op);

    let result = done.lock().unwrap().take().expect("callback never fired");
    assert_eq!(result.unwrap(), FILE_SIZE);

    file.sync_all().unwrap();
    assert_eq!(file.len().unwrap(), FILE_SIZE as u64);
    assert_eq!(fs::read(&path).unwrap(), contents);
}

#[test]
fn read_at_end_of_file_is_empty() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, random_contents()).unwrap();

    let mut service = Service::new().expect("unable to create service");
    let file = AsyncFile::open(&service, &path).expect("unable to open file");

    let done = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&done);
    let op = file
        .read_at(FILE_SIZE as u64, vec![0u8; 512], move |result, _| {
            *slot.lock().unwrap() = Some(result);
        })
        .expect("unable to submit read");

    drain(&mut service, &op);

    let result = done.lock().unwrap().take().expect("callback never fired");
    assert_eq!(result.unwrap(), 0);
}

#[test]
fn cancelled_read_completes_exactly_once() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, random_contents()).unwrap();

    let mut service = Service::new().expect("unable to create service");
    let file = AsyncFile::open(&service, &path).expect("unable to open file");

    let fired = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&fired);
    let op = file
        .read_at(0, vec![0u8; FILE_SIZE], move |_result, _buf| {
            // Either the read won the race or it was cancelled; both are
            // fine, firing twice is not.
            count.fetch_add(1, Ordering::SeqCst);
        })
        .expect("unable to submit read");

    op.cancel().expect("unable to cancel");
    drain(&mut service, &op);

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!service.run().unwrap());
}

#[test]
fn submission_off_the_owning_thread_is_unsupported() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, random_contents()).unwrap();

    let service = Service::new().expect("unable to create service");
    let file = AsyncFile::open(&service, &path).expect("unable to open file");

    thread::scope(|scope| {
        let file = &file;
        scope.spawn(move || {
            let err = file
                .read_at(0, vec![0u8; 16], |_, _| {})
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::Unsupported);
        });
    });
}

#[test]
fn empty_buffers_are_invalid() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    fs::write(&path, random_contents()).unwrap();

    let service = Service::new().expect("unable to create service");
    let file = AsyncFile::open(&service, &path).expect("unable to open file");

    let err = file.read_vectored_at(0, Vec::new(), |_, _| {}).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

    let err = file.read_at(0, Vec::new(), |_, _| {}).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
}
