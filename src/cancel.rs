use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type WakeFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
    next_hook: AtomicU64,
    hooks: Mutex<Vec<(u64, WakeFn)>>,
}

/// Cooperative cancellation flag shared between the capture thread and any controller.
///
/// The capture loop polls it once per iteration. A dequeue that is blocked in the
/// driver is ended through a hook registered with [`CancelToken::on_cancel`], which
/// every `cancel` runs on the cancelling thread.
#[derive(Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        let hooks: Vec<WakeFn> = self
            .shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, wake)| wake.clone())
            .collect();
        for wake in hooks {
            wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Run `wake` on every `cancel` until the returned hook is dropped.
    ///
    /// Runs immediately when the token is already cancelled.
    pub fn on_cancel<F>(&self, wake: F) -> CancelHook
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.shared.next_hook.fetch_add(1, Ordering::Relaxed);
        let wake: WakeFn = Arc::new(wake);
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, wake.clone()));
        if self.is_cancelled() {
            wake();
        }
        CancelHook {
            shared: self.shared.clone(),
            id,
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Registration returned by [`CancelToken::on_cancel`]; unregisters on drop.
#[must_use = "the hook is removed as soon as this is dropped"]
pub struct CancelHook {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for CancelHook {
    fn drop(&mut self) {
        self.shared
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn clones_observe_cancellation() {
        let token = CancelToken::new();
        let remote = token.clone();
        assert!(!token.is_cancelled());

        let handle = std::thread::spawn(move || remote.cancel());
        handle.join().expect("join canceller");

        assert!(token.is_cancelled());
    }

    #[test]
    fn hooks_run_on_cancel_until_dropped() {
        let token = CancelToken::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let hook = token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = fired.clone();
        drop(token.on_cancel(move || {
            counter.fetch_add(100, Ordering::SeqCst);
        }));

        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(hook);
        token.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_registration_runs_at_once() {
        let token = CancelToken::new();
        token.cancel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _hook = token.on_cancel(move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }
}
