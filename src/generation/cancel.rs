//! Cooperative cancellation shared between a caller and a running
//! generation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    hooks: Mutex<Vec<(u64, Hook)>>,
}

impl Inner {
    fn hooks(&self) -> MutexGuard<'_, Vec<(u64, Hook)>> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable cancellation flag with interrupt hooks.
///
/// The step loop polls [`is_cancelled`](Self::is_cancelled) before every
/// backend call. Hooks registered with [`on_cancel`](Self::on_cancel) run
/// once, on the cancelling thread, so a backend can abort a call that is
/// already in flight. A hook stays registered only while its
/// [`CancelRegistration`] is alive.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and runs registered hooks. Later calls do nothing.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.inner.hooks());
        for (_, hook) in hooks {
            hook();
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `hook` to run on cancellation, or runs it now if the token
    /// is already cancelled.
    ///
    /// Dropping the returned registration unregisters a hook that has not
    /// run yet.
    #[must_use = "the hook is unregistered when the registration is dropped"]
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> CancelRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut hooks = self.inner.hooks();
        if self.is_cancelled() {
            drop(hooks);
            hook();
        } else {
            hooks.push((id, Box::new(hook)));
        }
        CancelRegistration {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Hooks registered and not yet run or unregistered.
    #[must_use]
    pub fn registered_hooks(&self) -> usize {
        self.inner.hooks().len()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Keeps a hook registered with [`CancellationToken::on_cancel`].
pub struct CancelRegistration {
    inner: Arc<Inner>,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.inner.hooks().retain(|(id, _)| *id != self.id);
    }
}

impl fmt::Debug for CancelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelRegistration")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn hooks_run_once() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _registration = token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clone = token.clone();
        clone.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_hook_runs_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let _registration = token.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(token.registered_hooks(), 0);
    }

    #[test]
    fn dropped_registration_never_fires() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&calls);
            let registration = token.on_cancel(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            drop(registration);
        }
        assert_eq!(token.registered_hooks(), 0);
        token.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_one_registration_keeps_the_others() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&calls);
        let kept = token.on_cancel(move || {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = Arc::clone(&calls);
        drop(token.on_cancel(move || {
            second.fetch_add(10, Ordering::SeqCst);
        }));
        token.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(kept);
    }
}
