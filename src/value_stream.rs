//! Observable value with late-joining, coalescing watchers
//!
//! A [`ValueStream`] holds one current value. Observers call
//! [`ValueStream::watch`] to get a [`Stream`] that yields the value as it is
//! now and then again after every change, until the owner closes it.
//! Changes made while a watcher is not polling are coalesced: the watcher
//! resumes with the latest value and never sees an older one.

use crate::error::{Result, VpnError};
use futures::channel::oneshot;
use futures::stream::{self, Stream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Inner<T> {
    value: T,
    /// Bumped on every `set`, lets a watcher tell whether it has seen the
    /// current value.
    version: u64,
    /// Pending wake-ups. `None` once the stream is closed.
    waiters: Option<Vec<oneshot::Sender<()>>>,
}

/// Shared handle to an observable value.
///
/// Cloning the handle does not clone the value; all clones observe and
/// mutate the same stream.
pub struct ValueStream<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for ValueStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for ValueStream<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ValueStream")
            .field("value", &inner.value)
            .field("version", &inner.version)
            .field("closed", &inner.waiters.is_none())
            .finish()
    }
}

struct WatchState<T> {
    inner: Arc<Mutex<Inner<T>>>,
    seen: Option<u64>,
    done: bool,
}

impl<T> ValueStream<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value: initial,
                version: 0,
                waiters: Some(Vec::new()),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        lock_inner(&self.inner)
    }

    /// Replace the value and wake every suspended watcher.
    ///
    /// # Errors
    /// Returns `IllegalState` once the stream has been closed.
    pub fn set(&self, value: T) -> Result<()> {
        let waiters = {
            let mut inner = self.lock();
            let Some(waiters) = inner.waiters.as_mut() else {
                return Err(VpnError::IllegalState(
                    "cannot set a closed value stream".to_string(),
                ));
            };
            let waiters = std::mem::take(waiters);
            inner.value = value;
            inner.version = inner.version.wrapping_add(1);
            waiters
        };

        for waiter in waiters {
            // The watcher may have been dropped; nothing to wake then.
            let _ = waiter.send(());
        }
        Ok(())
    }

    /// Close the stream. Later calls are no-ops.
    pub fn close(&self) {
        let waiters = self.lock().waiters.take();
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().waiters.is_none()
    }
}

impl<T: Clone> ValueStream<T> {
    /// Current value; still available after close
    pub fn get(&self) -> T {
        self.lock().value.clone()
    }
}

impl<T> ValueStream<T>
where
    T: Clone + Send + 'static,
{
    /// Watch the value.
    ///
    /// Every call starts an independent walk. The first item is the current
    /// value; each later item is produced after the next `set`. Once the
    /// stream is closed the walk yields the final value one more time and
    /// ends.
    pub fn watch(&self) -> impl Stream<Item = T> + Send + 'static {
        let state = WatchState {
            inner: Arc::clone(&self.inner),
            seen: None,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }

            if let Some(seen) = state.seen {
                wait_for_change(&state.inner, seen).await;
            }

            let inner = lock_inner(&state.inner);
            let value = inner.value.clone();
            state.seen = Some(inner.version);
            state.done = inner.waiters.is_none();
            drop(inner);

            Some((value, state))
        })
    }
}

fn lock_inner<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Suspend until the version moves past `seen` or the stream closes.
async fn wait_for_change<T>(inner: &Mutex<Inner<T>>, seen: u64) {
    loop {
        let rx = {
            let mut guard = lock_inner(inner);
            if guard.version != seen {
                return;
            }
            let Some(waiters) = guard.waiters.as_mut() else {
                return;
            };
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            rx
        };

        // A cancelled sender only happens if the stream itself is dropped,
        // in which case the re-check above ends the wait.
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_get_set_close() {
        let stream = ValueStream::new(1);
        assert_eq!(stream.get(), 1);
        assert!(!stream.is_closed());

        stream.set(2).expect("set");
        assert_eq!(stream.get(), 2);

        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert_eq!(stream.get(), 2);
        assert!(matches!(stream.set(3), Err(VpnError::IllegalState(_))));
        assert_eq!(stream.get(), 2);
    }

    #[tokio::test]
    async fn test_watch_yields_current_value_first() {
        let stream = ValueStream::new("now");
        let mut watch = Box::pin(stream.watch());
        assert_eq!(watch.next().await, Some("now"));
    }

    #[tokio::test]
    async fn test_watch_after_close_yields_once() {
        let stream = ValueStream::new(0);
        stream.set(42).expect("set");
        stream.close();

        let values: Vec<i32> = stream.watch().collect().await;
        assert_eq!(values, vec![42]);
    }

    #[tokio::test]
    async fn test_suspended_watcher_sees_latest_value() {
        let stream = ValueStream::new(0);
        let mut watch = Box::pin(stream.watch());
        assert_eq!(watch.next().await, Some(0));

        let next = tokio::spawn(async move { watch.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        for v in 1..=5 {
            stream.set(v).expect("set");
        }
        let seen = tokio::time::timeout(Duration::from_secs(1), next)
            .await
            .expect("watcher resumed")
            .expect("join");
        assert_eq!(seen, Some(5));
    }

    #[tokio::test]
    async fn test_close_wakes_watcher_and_ends_walk() {
        let stream = ValueStream::new(1);
        let watcher = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.watch().collect::<Vec<_>>().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        stream.set(2).expect("set");
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.close();

        let values = tokio::time::timeout(Duration::from_secs(1), watcher)
            .await
            .expect("watcher finished")
            .expect("join");
        assert_eq!(values.first(), Some(&1));
        assert_eq!(values.last(), Some(&2));
        assert!(values.len() <= 3);
    }

    #[tokio::test]
    async fn test_set_from_inside_watch_loop() {
        let stream = ValueStream::new(0);
        let mut seen = Vec::new();
        let mut watch = Box::pin(stream.watch());
        while let Some(v) = watch.next().await {
            seen.push(v);
            if v < 3 {
                stream.set(v + 1).expect("set");
            } else {
                stream.close();
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 3]);
    }

    #[tokio::test]
    async fn test_independent_watchers() {
        let stream = ValueStream::new(10);
        let mut first = Box::pin(stream.watch());
        assert_eq!(first.next().await, Some(10));

        stream.set(11).expect("set");
        let mut second = Box::pin(stream.watch());
        assert_eq!(second.next().await, Some(11));
        assert_eq!(first.next().await, Some(11));
    }
}
