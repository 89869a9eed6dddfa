//! Single-slot completion channel.
//!
//! Bridges a radio callback thread to the task waiting on it: the task holds
//! the `Completion` and awaits exactly one value, the callback side holds the
//! `Completer` and delivers it. Only the first `complete` counts. Dropping the
//! completer without completing marks the operation abandoned.

use std::sync::Mutex;

use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation abandoned before completion")]
pub struct Abandoned;

pub struct Completer<T> {
    slot: Mutex<Option<oneshot::Sender<T>>>,
}

pub struct Completion<T> {
    rx: oneshot::Receiver<T>,
}

pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { slot: Mutex::new(Some(tx)) }, Completion { rx })
}

impl<T> Completer<T> {
    /// Deliver the result. Returns false if already completed or the waiter
    /// has gone away.
    pub fn complete(&self, value: T) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

impl<T> Completion<T> {
    pub async fn wait(self) -> Result<T, Abandoned> {
        self.rx.await.map_err(|_| Abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn first_completion_wins() {
        let (completer, waiter) = completion::<i32>();
        let completer = Arc::new(completer);
        let remote = completer.clone();
        std::thread::spawn(move || {
            assert!(remote.complete(1));
            assert!(!remote.complete(2));
        })
        .join()
        .unwrap();
        assert!(!completer.complete(3));
        assert_eq!(waiter.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn dropped_completer_is_abandonment() {
        let (completer, waiter) = completion::<()>();
        drop(completer);
        assert_eq!(waiter.wait().await, Err(Abandoned));
    }

    #[tokio::test]
    async fn completing_after_the_waiter_left_reports_false() {
        let (completer, waiter) = completion::<u8>();
        drop(waiter);
        assert!(!completer.complete(7));
    }
}
