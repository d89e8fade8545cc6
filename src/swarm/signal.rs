//! Single-slot asynchronous notifiers.
//!
//! A [`Signal`] is the coordination primitive the turn engine and the swarm
//! controller are built on: one slot, many waiters, no replay. Publishing
//! stores the value and wakes every waiter that subscribed *before* the
//! publish; a value published with nobody subscribed is dropped. Waiters
//! never observe values from before their subscription, which is exactly
//! the property the tool dispatcher's five-way race depends on.
//!
//! Built on `tokio::sync::watch`: the slot keeps only the latest value, so
//! two publishes between polls coalesce — acceptable for notifiers whose
//! protocol fires at most once per awaited step.

use tokio::sync::watch;

/// Single-slot notifier carrying values of type `T`.
pub struct Signal<T: Clone + Send + Sync + 'static> {
    tx: watch::Sender<(u64, Option<T>)>,
}

impl<T: Clone + Send + Sync + 'static> Signal<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel((0, None));
        Self { tx }
    }

    /// Store `value` and wake every current waiter.
    pub fn publish(&self, value: T) {
        self.tx.send_modify(|slot| {
            slot.0 = slot.0.wrapping_add(1);
            slot.1 = Some(value);
        });
    }

    /// Register interest in the *next* published value.
    ///
    /// Subscribe before triggering whatever may publish: the waiter only
    /// sees publishes that happen after this call.
    pub fn subscribe(&self) -> SignalWaiter<T> {
        SignalWaiter {
            rx: self.tx.subscribe(),
        }
    }

    /// Convenience: subscribe and wait in one step.
    pub async fn wait(&self) -> T {
        self.subscribe().recv().await
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered waiter for one [`Signal`].
pub struct SignalWaiter<T> {
    rx: watch::Receiver<(u64, Option<T>)>,
}

impl<T: Clone> SignalWaiter<T> {
    /// Wait for the next value published after this waiter subscribed.
    ///
    /// If the signal's owner is dropped the waiter parks forever — the
    /// callers that race signals always pair them with a cancellation or
    /// timeout arm, and a resolved-by-drop branch would corrupt those
    /// races.
    pub async fn recv(&mut self) -> T {
        loop {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            let value = self.rx.borrow_and_update().1.clone();
            if let Some(value) = value {
                return value;
            }
        }
    }
}
