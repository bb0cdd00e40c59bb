//! Stall watchdog for the capture thread.
//!
//! `dequeue` blocks without a deadline. The watchdog runs on its own thread,
//! watches the heartbeat the session emits after every dequeued buffer, and
//! signals the cancel token once no beat has arrived within the stall timeout.
//! The session's cancel hook then wakes the driver out of the blocked dequeue.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Last-progress timestamp shared between the capture thread and the watchdog.
#[derive(Clone, Debug)]
pub struct Heartbeat {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn beat(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    pub fn since_last(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Watchdog {
    stop: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start watching. The timeout counts from the later of spawn and the last beat.
    pub fn spawn(token: CancelToken, heartbeat: Heartbeat, timeout: Duration) -> io::Result<Self> {
        heartbeat.beat();
        let stop = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicBool::new(false));
        let poll = (timeout / 4).clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);

        let thread_stop = stop.clone();
        let thread_fired = fired.clone();
        let handle = thread::Builder::new()
            .name("capture-watchdog".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) && !token.is_cancelled() {
                    thread::sleep(poll);
                    let stalled = heartbeat.since_last();
                    if stalled > timeout {
                        log::error!(
                            "Watchdog: no frame dequeued for {} ms (limit {} ms); cancelling capture",
                            stalled.as_millis(),
                            timeout.as_millis()
                        );
                        thread_fired.store(true, Ordering::Release);
                        token.cancel();
                        break;
                    }
                }
            })?;

        Ok(Self {
            stop,
            fired,
            handle: Some(handle),
        })
    }

    /// True once the watchdog has cancelled the session.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn stop(mut self) -> bool {
        self.shutdown();
        self.fired()
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Watchdog: thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_heartbeat_cancels_the_token() -> anyhow::Result<()> {
        let token = CancelToken::new();
        let watchdog = Watchdog::spawn(token.clone(), Heartbeat::new(), Duration::from_millis(40))?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while !token.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(token.is_cancelled());
        assert!(watchdog.stop());
        Ok(())
    }

    #[test]
    fn steady_heartbeat_keeps_the_session_alive() -> anyhow::Result<()> {
        let token = CancelToken::new();
        let heartbeat = Heartbeat::new();
        let watchdog = Watchdog::spawn(token.clone(), heartbeat.clone(), Duration::from_millis(500))?;

        for _ in 0..10 {
            heartbeat.beat();
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!token.is_cancelled());
        assert!(!watchdog.stop());
        Ok(())
    }
}
