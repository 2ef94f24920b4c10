// Not all functions are used by all tests.
#![allow(dead_code)]

use std::sync::Once;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

pub fn assert_sync<T: Sync>() {}
pub fn assert_send<T: Send>() {}
