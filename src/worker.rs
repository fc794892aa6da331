use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::error::{PiIoError, Result};

pub const DEFAULT_LOOP_PERIOD: Duration = Duration::from_millis(25);

/// Cooperative stop signal handed to a worker body.
#[derive(Clone)]
pub struct StopToken {
    running: Arc<AtomicBool>,
}

impl StopToken {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// A named background thread with a cooperative stop flag.
///
/// The body polls [`StopToken::is_running`] at its own bounded interval;
/// [`Worker::stop`] clears the flag and joins. Dropping the worker stops it.
pub struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns `body`. An error returned by the body stops the worker and is
    /// handed to `on_error` on the worker thread.
    pub fn start<F, E>(&mut self, body: F, on_error: E) -> Result<()>
    where
        F: FnOnce(&StopToken) -> Result<()> + Send + 'static,
        E: FnOnce(PiIoError) + Send + 'static,
    {
        if self.is_running() && self.handle.is_some() {
            return Ok(());
        }
        self.join();

        self.running.store(true, Ordering::Release);
        let token = StopToken {
            running: self.running.clone(),
        };
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                if let Err(e) = body(&token) {
                    token.running.store(false, Ordering::Release);
                    warn!("worker {name} stopped: {e}");
                    on_error(e);
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                PiIoError::OperationFailed(format!("spawn worker {}: {e}", self.name))
            })?;

        self.handle = Some(handle);
        Ok(())
    }

    /// Runs `step` every `period` until stopped or until `step` fails.
    pub fn start_loop<F, E>(&mut self, period: Duration, mut step: F, on_error: E) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
        E: FnOnce(PiIoError) + Send + 'static,
    {
        self.start(
            move |token| {
                while token.is_running() {
                    step()?;
                    thread::sleep(period);
                }
                Ok(())
            },
            on_error,
        )
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.join();
    }

    fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // a worker tearing itself down cannot join its own thread
        if handle.thread().id() == thread::current().id() {
            debug!("worker {} detached from its own thread", self.name);
            return;
        }
        if handle.join().is_err() {
            warn!("worker {} panicked", self.name);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Best-effort switch of the calling thread to SCHED_FIFO at maximum
/// priority. Returns false (after logging) when the OS refuses.
#[cfg(target_os = "linux")]
pub fn make_realtime() -> bool {
    // SAFETY: plain syscalls on the calling thread with a zeroed, then
    // initialized, sched_param.
    let result = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        libc::sched_setscheduler(0, libc::SCHED_FIFO, &param)
    };
    if result != 0 {
        warn!(
            "Unable to set realtime priority for {}: {}",
            thread::current().name().unwrap_or("unnamed thread"),
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn make_realtime() -> bool {
    warn!("Realtime scheduling is not supported on this platform");
    false
}
