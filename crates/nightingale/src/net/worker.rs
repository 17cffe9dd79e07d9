use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

/// Handle to a background thread that can be told to stop.
///
/// Stopping only signals the thread; it never joins. A worker may stop
/// itself (a timeout watcher tearing down its own connection), and joining
/// from there would deadlock. Dropping the handle stops the worker.
#[derive(Debug)]
pub(crate) struct Worker {
    name: String,
    running: Arc<AtomicBool>,
    wake: Sender<()>,
}

/// The worker thread's view of its handle.
#[derive(Debug)]
pub(crate) struct StopSignal {
    running: Arc<AtomicBool>,
    wake: Receiver<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: &str, body: F) -> io::Result<Self>
    where
        F: FnOnce(StopSignal) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let (wake, wake_rx) = mpsc::channel();
        let signal = StopSignal {
            running: Arc::clone(&running),
            wake: wake_rx,
        };

        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(signal))?;

        Ok(Self {
            name: name.to_owned(),
            running,
            wake,
        })
    }

    pub(crate) fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            log::trace!("Stopping worker {}", self.name);
            let _ = self.wake.send(());
        }
    }

    #[cfg(test)]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl StopSignal {
    pub(crate) fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless stopped first. Returns whether the worker
    /// should keep going.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        match self.wake.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => !self.is_stopped(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}
