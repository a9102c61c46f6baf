//! Time source for poll loops, so tests can run on virtual time.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::core::cancel::CancelToken;

pub trait Clock {
    fn now(&self) -> Instant;
    /// Sleep for `duration`, returning early with `Cancelled` when asked to stop.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()>;
}

pub struct SystemClock;

const SLEEP_SLICE: Duration = Duration::from_millis(250);

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
