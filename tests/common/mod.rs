// Each integration test binary compiles its own copy and uses what it needs.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use axon::Runtime;

/// Drives the runtime until `done` reports true or `deadline` passes,
/// returning the final verdict.
pub fn run_until(rt: &mut Runtime, deadline: Duration, mut done: impl FnMut(&mut Runtime) -> bool) -> bool {
    let start = Instant::now();

    loop {
        if done(rt) {
            return true;
        }

        if start.elapsed() >= deadline {
            return false;
        }

        rt.run_once(Some(Duration::from_millis(20))).expect("runtime iteration");
    }
}

/// Runs a fixed number of loop iterations, for "nothing further happens"
/// assertions.
pub fn run_ticks(rt: &mut Runtime, ticks: usize) {
    for _ in 0..ticks {
        rt.run_once(Some(Duration::from_millis(10))).expect("runtime iteration");
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
