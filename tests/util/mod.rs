// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Once;

use evio::{Feature, Hio, Ntime};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn init_with_hio() -> Hio {
    init();
    Hio::open(Feature::ALL, 64).expect("unable to create host context")
}

pub fn any_local_address() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn millis(t: Ntime) -> i64 {
    t.sec() * 1_000 + i64::from(t.nsec()) / 1_000_000
}
