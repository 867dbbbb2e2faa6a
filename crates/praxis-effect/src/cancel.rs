use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

type Listener = Box<dyn FnOnce() + Send>;

/// Node in a parent→child cancellation tree.
///
/// Cancellation is monotonic and idempotent. Listeners fire exactly once, in
/// registration order, before `cancel` returns; a listener registered after
/// cancellation fires synchronously at registration. Cancelling a parent
/// cancels every descendant exactly once.
pub struct CancelToken {
    id: u64,
    notify: Notify,
    state: Mutex<TokenState>,
}

struct TokenState {
    cancelled: bool,
    reason: Option<String>,
    next_listener_id: u64,
    listeners: Vec<(u64, Listener)>,
    children: Vec<Weak<CancelToken>>,
    parent: Option<Weak<CancelToken>>,
}

impl CancelToken {
    pub fn root() -> Arc<Self> {
        Arc::new(Self::bare(None))
    }

    fn bare(parent: Option<Weak<CancelToken>>) -> Self {
        Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            notify: Notify::new(),
            state: Mutex::new(TokenState {
                cancelled: false,
                reason: None,
                next_listener_id: 1,
                listeners: Vec::new(),
                children: Vec::new(),
                parent,
            }),
        }
    }

    /// Create a child token. A child of an already-cancelled parent is born
    /// cancelled.
    pub fn child(self: &Arc<Self>) -> Arc<CancelToken> {
        let child = Arc::new(Self::bare(Some(Arc::downgrade(self))));
        let parent_cancelled = {
            let mut state = self.lock();
            if state.cancelled {
                true
            } else {
                state.children.push(Arc::downgrade(&child));
                false
            }
        };
        if parent_cancelled {
            child.cancel(Some("parent already cancelled"));
        }
        child
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    /// Cancel this token and all descendants.
    ///
    /// Idempotent. Listener panics are swallowed; the parent disconnect and
    /// child propagation happen regardless.
    pub fn cancel(&self, reason: Option<&str>) {
        let (listeners, children, parent) = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.reason = reason.map(str::to_string);
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.children),
                state.parent.take(),
            )
        };
        self.notify.notify_waiters();
        for (_, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(move || listener())).is_err() {
                tracing::warn!(token = self.id, "cancel listener panicked");
            }
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel(Some("parent cancelled"));
            }
        }
        if let Some(parent) = parent.and_then(|weak| weak.upgrade()) {
            parent.remove_child(self.id);
        }
    }

    /// Register a listener, returning an unsubscribe handle.
    ///
    /// On an already-cancelled token the listener runs synchronously here
    /// and the returned handle is inert.
    pub fn on_cancel(self: &Arc<Self>, listener: impl FnOnce() + Send + 'static) -> CancelListener {
        {
            let mut state = self.lock();
            if !state.cancelled {
                let id = state.next_listener_id;
                state.next_listener_id += 1;
                state.listeners.push((id, Box::new(listener)));
                return CancelListener {
                    token: Arc::downgrade(self),
                    id,
                };
            }
        }
        listener();
        CancelListener {
            token: Weak::new(),
            id: 0,
        }
    }

    /// Resolves once this token is cancelled; immediately if it already is.
    pub async fn cancelled(&self) {
        let mut notified = pin!(self.notify.notified());
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    fn remove_child(&self, child_id: u64) {
        self.lock()
            .children
            .retain(|weak| weak.upgrade().is_some_and(|c| c.id != child_id));
    }

    fn remove_listener(&self, listener_id: u64) {
        self.lock().listeners.retain(|(id, _)| *id != listener_id);
    }

    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CancelToken")
            .field("id", &self.id)
            .field("cancelled", &state.cancelled)
            .field("listeners", &state.listeners.len())
            .field("children", &state.children.len())
            .finish()
    }
}

/// Unsubscribe handle returned by [`CancelToken::on_cancel`].
#[derive(Debug)]
pub struct CancelListener {
    token: Weak<CancelToken>,
    id: u64,
}

impl CancelListener {
    /// Remove the listener if it has not fired yet.
    pub fn unsubscribe(self) {
        if let Some(token) = self.token.upgrade() {
            token.remove_listener(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_fire_once_in_registration_order() {
        let token = CancelToken::root();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let seen = Arc::clone(&order);
            token.on_cancel(move || seen.lock().unwrap().push(label));
        }

        token.cancel(Some("done"));
        token.cancel(Some("again"));

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(token.reason().as_deref(), Some("done"));
    }

    #[test]
    fn late_listener_fires_synchronously() {
        let token = CancelToken::root();
        token.cancel(None);

        let fired = Arc::new(Mutex::new(false));
        let seen = Arc::clone(&fired);
        let handle = token.on_cancel(move || *seen.lock().unwrap() = true);
        assert!(*fired.lock().unwrap());

        // Inert handle; must not panic.
        handle.unsubscribe();
    }

    #[test]
    fn unsubscribed_listener_never_fires() {
        let token = CancelToken::root();
        let fired = Arc::new(Mutex::new(false));
        let seen = Arc::clone(&fired);
        let handle = token.on_cancel(move || *seen.lock().unwrap() = true);

        handle.unsubscribe();
        token.cancel(None);

        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn parent_cancel_reaches_all_descendants_once() {
        let parent = CancelToken::root();
        let child = parent.child();
        let grandchild = child.child();

        let count = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&count);
        grandchild.on_cancel(move || *seen.lock().unwrap() += 1);

        parent.cancel(Some("shutdown"));

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn siblings_are_independent() {
        let parent = CancelToken::root();
        let left = parent.child();
        let right = parent.child();

        left.cancel(None);

        assert!(left.is_cancelled());
        assert!(!right.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_is_born_cancelled() {
        let parent = CancelToken::root();
        parent.cancel(None);
        let child = parent.child();
        assert!(child.is_cancelled());
    }

    #[test]
    fn listener_panic_is_swallowed_and_the_rest_still_run() {
        let parent = CancelToken::root();
        let child = parent.child();

        let after = Arc::new(Mutex::new(false));
        parent.on_cancel(|| panic!("bad listener"));
        let seen = Arc::clone(&after);
        parent.on_cancel(move || *seen.lock().unwrap() = true);

        parent.cancel(None);

        assert!(*after.lock().unwrap());
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_cancel() {
        let token = CancelToken::root();
        let waiter = {
            let token = Arc::clone(&token);
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        token.cancel(None);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_future_resolves_immediately_when_already_cancelled() {
        let token = CancelToken::root();
        token.cancel(None);
        token.cancelled().await;
    }
}
