// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic registration timer.
//!
//! Runs one tick every `refresh` on its own thread. The tick collects,
//! broadcasts and expires registrations; the provider only owns timing.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

pub struct RegistrationProvider {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl RegistrationProvider {
    /// Start ticking. The first tick fires immediately.
    pub fn start<F>(refresh: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let signal = Arc::new(StopSignal::default());
        let signal_clone = Arc::clone(&signal);

        let handle = thread::Builder::new()
            .name("meshbus-registration".to_string())
            .spawn(move || {
                let mut next = Instant::now();
                loop {
                    {
                        let mut stopped = signal_clone.stopped.lock();
                        while !*stopped {
                            if signal_clone.cv.wait_until(&mut stopped, next).timed_out() {
                                break;
                            }
                        }
                        if *stopped {
                            break;
                        }
                    }
                    tick();
                    next += refresh;
                    let now = Instant::now();
                    if next < now {
                        next = now;
                    }
                }
                log::debug!("[REG] registration timer stopped");
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for RegistrationProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}
