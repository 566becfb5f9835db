#![cfg(unix)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{raise, Signal};
use ytfeed_engine::engine::cancel_on_termination;

// Own test binary: the handler is process-wide and can be installed only once.
#[test]
fn sigterm_raises_the_cancel_flag() {
    let cancel = Arc::new(AtomicBool::new(false));
    cancel_on_termination(cancel.clone()).expect("install handler");

    raise(Signal::SIGTERM).expect("raise");

    let deadline = Instant::now() + Duration::from_secs(2);
    while !cancel.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(cancel.load(Ordering::SeqCst), "SIGTERM did not reach the handler");
}
