//! Capacity-one, replace-on-send queue.
//!
//! Stages of the agent hand full state snapshots to each other. A snapshot
//! supersedes every earlier one, so the queue keeps only the most recent
//! undelivered value: a fast producer never waits for a slow consumer and
//! nothing piles up in between.
//!
//! Built on [`tokio::sync::watch`], which already has last-value-wins
//! delivery. The slot holds `Option<T>` so "nothing sent yet" is
//! distinguishable from a sent value.

use tokio::sync::watch;

/// Create a coalescing queue with one producer and one consumer.
pub fn channel<T>() -> (CoalescingSender<T>, CoalescingReceiver<T>)
where
    T: Clone + Send + Sync,
{
    let (tx, rx) = watch::channel(None);
    (CoalescingSender { tx }, CoalescingReceiver { rx })
}

/// Producer half of a coalescing queue.
#[derive(Debug)]
pub struct CoalescingSender<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T> CoalescingSender<T> {
    /// Install `value`, discarding any value the consumer has not taken yet.
    ///
    /// Never blocks, and succeeds even when the consumer is gone.
    pub fn send(&self, value: T) {
        self.tx.send_replace(Some(value));
    }

    /// Returns true once the consumer has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a coalescing queue.
#[derive(Debug)]
pub struct CoalescingReceiver<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> CoalescingReceiver<T> {
    /// Wait for a value that has not been received yet.
    ///
    /// Returns `None` once the sender is dropped and nothing is pending.
    /// Cancel-safe: dropping the future loses no value, so it can sit in a
    /// `tokio::select!` arm.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }

    /// Take the pending value, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        let slot = self.rx.borrow_and_update();
        if slot.has_changed() {
            (*slot).clone()
        } else {
            None
        }
    }
}
