//! Focus and connectivity signals.
//!
//! The cache never detects these conditions itself. An embedding application
//! reports them through [`FocusManager::set_focused`] /
//! [`OnlineManager::set_online`] (or the `on_*` hooks), and a mounted
//! [`QueryClient`](crate::QueryClient) turns them into refetches and resumes
//! paused retries.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::subscribable::{subscribe_to, Listeners, Subscription};

type SignalListener = dyn Fn(bool) + Send + Sync;

/// Tracks whether the application is focused. Focused until told otherwise.
#[derive(Default)]
pub struct FocusManager {
    focused: Mutex<Option<bool>>,
    listeners: Arc<Listeners<SignalListener>>,
}

impl FocusManager {
    /// A manager that reports focus until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for focus changes. The listener receives the new focus state.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        subscribe_to(&self.listeners, Arc::new(listener))
    }

    /// Set an explicit focus state, or `None` to go back to the default.
    ///
    /// Listeners fire only when the effective state changes.
    pub fn set_focused(&self, focused: Option<bool>) {
        let changed = {
            let mut current = self.focused.lock();
            let before = current.unwrap_or(true);
            *current = focused;
            before != focused.unwrap_or(true)
        };
        if changed {
            self.emit(self.is_focused());
        }
    }

    /// Report that focus was (re)gained.
    pub fn on_focus(&self) {
        self.emit(self.is_focused());
    }

    /// Current focus state; `true` unless set otherwise.
    pub fn is_focused(&self) -> bool {
        self.focused.lock().unwrap_or(true)
    }

    fn emit(&self, focused: bool) {
        tracing::trace!(focused, "focus changed");
        for listener in self.listeners.snapshot() {
            listener(focused);
        }
    }
}

/// Tracks network connectivity. Online until told otherwise.
#[derive(Default)]
pub struct OnlineManager {
    online: Mutex<Option<bool>>,
    listeners: Arc<Listeners<SignalListener>>,
}

impl OnlineManager {
    /// A manager that reports online until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for connectivity changes. The listener receives the new state.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Subscription {
        subscribe_to(&self.listeners, Arc::new(listener))
    }

    /// Set an explicit connectivity state, or `None` to go back to online.
    pub fn set_online(&self, online: Option<bool>) {
        let changed = {
            let mut current = self.online.lock();
            let before = current.unwrap_or(true);
            *current = online;
            before != online.unwrap_or(true)
        };
        if changed {
            self.emit(self.is_online());
        }
    }

    /// Report that connectivity was restored.
    pub fn on_online(&self) {
        self.set_online(Some(true));
    }

    /// Report that connectivity was lost.
    pub fn on_offline(&self) {
        self.set_online(Some(false));
    }

    /// Current connectivity; `true` unless set otherwise.
    pub fn is_online(&self) -> bool {
        self.online.lock().unwrap_or(true)
    }

    fn emit(&self, online: bool) {
        tracing::debug!(online, "connectivity changed");
        for listener in self.listeners.snapshot() {
            listener(online);
        }
    }
}
