//! Background tickers and cancel tokens.
//!
//! A [`Ticker`] runs a closure on its own OS thread at a fixed interval until
//! its stop channel closes or the device exit flag is raised. Stopping closes
//! the channel exactly once and joins the thread, unless `stop` is called
//! from the ticker's own thread (a ticker tearing down its device).

use crate::error::{Error, Result};
use crate::state::ExitFlag;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Periodic background task.
pub struct Ticker {
    name: String,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker").field("name", &self.name).finish()
    }
}

impl Ticker {
    /// Spawn a ticker. `task` returns `false` to end the loop early.
    pub fn spawn<F>(name: &str, interval: Duration, exit: ExitFlag, mut task: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let tick = channel::tick(interval);
                loop {
                    crossbeam::select! {
                        recv(stop_rx) -> _ => break,
                        recv(tick) -> _ => {
                            if exit.is_set() {
                                break;
                            }
                            if !task() {
                                break;
                            }
                        }
                    }
                }
                trace!(ticker = %thread_name, "Ticker thread exiting");
            })
            .map_err(|e| Error::Fatal(format!("spawn ticker {name}: {e}")))?;

        debug!(ticker = name, interval_ms = interval.as_millis() as u64, "Ticker started");
        Ok(Self {
            name: name.to_string(),
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the stop channel (once) and wait for the thread.
    pub fn stop(&self) {
        if self.stop_tx.lock().take().is_none() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        debug!(ticker = %self.name, "Ticker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.lock().is_some()
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One-shot cancellation signal for a worker thread.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Self { tx, rx }
    }

    /// Signal cancellation. Repeated calls are no-ops.
    pub fn cancel(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn is_cancelled(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Sleep for `dur`, returning `true` early if cancelled.
    pub fn wait(&self, dur: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.rx.recv_timeout(dur) {
            Ok(()) => {
                // Keep the signal observable for other holders.
                let _ = self.tx.try_send(());
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn ticker_runs_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let ticker = Ticker::spawn("test", Duration::from_millis(5), ExitFlag::new(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        ticker.stop();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "ticked {seen} times");

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert!(!ticker.is_running());
    }

    #[test]
    fn ticker_observes_exit_flag() {
        let exit = ExitFlag::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let ticker = Ticker::spawn("exit", Duration::from_millis(5), exit.clone(), move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        exit.set();
        thread::sleep(Duration::from_millis(30));
        let seen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), seen);
        ticker.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let ticker =
            Ticker::spawn("idem", Duration::from_millis(5), ExitFlag::new(), || true).unwrap();
        ticker.stop();
        ticker.stop();
    }

    #[test]
    fn cancel_token_wakes_waiter() {
        let token = CancelToken::new();
        let t = token.clone();
        let waiter = thread::spawn(move || t.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        token.cancel();
        token.cancel();
        assert!(waiter.join().unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_token_times_out_quietly() {
        let token = CancelToken::new();
        assert!(!token.wait(Duration::from_millis(10)));
    }
}
