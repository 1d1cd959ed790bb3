//! Push-to-pull bridge between an imperative producer and a single consumer.
//!
//! A `Subject` buffers whatever the producer pushes (`publish`, `error`,
//! `complete`) until the consumer pulls it, through either a
//! [`SubjectCursor`] (callback or `ChangeCursor` pulls) or a
//! [`SubjectStream`] (`futures::Stream`).
//!
//! # Invariants
//!
//! - Entries reach the consumer in push order, whether they were handed to a
//!   waiting consumer directly or buffered first.
//! - The buffer and the waiter slot are never both occupied.
//! - The teardown hook runs at most once, on the first of: an error drained
//!   by a cursor, the end marker drained, the consumer closing or dropping
//!   its handle.
//! - Waiters and the teardown hook are always invoked with the state lock
//!   released, so either may call back into the subject.
//!
//! # Stream errors
//!
//! The stream runs teardown before raising an error only when no value has
//! been yielded yet. After the first value an error is raised without
//! teardown; teardown then runs when the stream is dropped.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::cursor::ChangeCursor;
use crate::error::JoinError;

/// One buffered item.
enum Entry<T> {
    Value(T),
    Error(JoinError),
    Complete,
}

/// The consumer parked on an empty buffer.
enum Waiter<T> {
    Callback(Box<dyn FnOnce(Entry<T>) + Send>),
    Channel(oneshot::Sender<Entry<T>>),
}

impl<T> Waiter<T> {
    /// A channel waiter whose receiving pull was dropped.
    fn is_cancelled(&self) -> bool {
        matches!(self, Self::Channel(tx) if tx.is_closed())
    }

    /// Hand `entry` over, or give it back if the pull went away.
    fn deliver(self, entry: Entry<T>) -> Result<(), Entry<T>> {
        match self {
            Self::Callback(callback) => {
                callback(entry);
                Ok(())
            }
            Self::Channel(tx) => tx.send(entry),
        }
    }
}

type Teardown = Box<dyn FnOnce() + Send>;
type MapFn<T, U> = Arc<dyn Fn(T) -> U + Send + Sync>;

struct State<T> {
    queue: VecDeque<Entry<T>>,
    waiter: Option<Waiter<T>>,
    /// No value has been yielded through a stream yet.
    first: bool,
    teardown: Option<Teardown>,
}

/// Producer handle. Cloning it shares the same buffer.
pub struct Subject<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Subject<T> {
    /// Create a subject whose `teardown` runs once when the stream ends.
    ///
    /// # Pre-conditions
    ///
    /// - At most one consumer handle (cursor or stream) is created from it
    /// - `teardown` may call back into the subject but must not block on the
    ///   consumer
    ///
    /// # Post-conditions
    ///
    /// - The buffer is empty and no consumer is waiting
    /// - `teardown` has not run
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                queue: VecDeque::new(),
                waiter: None,
                first: true,
                teardown: Some(Box::new(teardown)),
            })),
        }
    }

    pub fn publish(&self, value: T) {
        self.push(Entry::Value(value));
    }

    /// Push a terminal error.
    pub fn error(&self, error: JoinError) {
        self.push(Entry::Error(error));
    }

    /// Push the terminal end marker.
    pub fn complete(&self) {
        self.push(Entry::Complete);
    }

    /// Whether the teardown hook has already run.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.lock().teardown.is_none()
    }

    /// Number of entries waiting for the consumer.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.lock().queue.len()
    }

    /// Callback/cursor consumer yielding values unchanged.
    #[must_use]
    pub fn create_cursor(&self) -> SubjectCursor<T, T> {
        self.create_mapped_cursor(|value| value)
    }

    /// Callback/cursor consumer yielding `map(value)`.
    #[must_use]
    pub fn create_mapped_cursor<U: 'static>(
        &self,
        map: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> SubjectCursor<T, U> {
        SubjectCursor {
            subject: self.clone(),
            map: Arc::new(map),
            closed: false,
        }
    }

    /// Stream consumer yielding values unchanged.
    #[must_use]
    pub fn create_stream(&self) -> SubjectStream<T, T> {
        self.create_mapped_stream(|value| value)
    }

    /// Stream consumer yielding `map(value)`.
    #[must_use]
    pub fn create_mapped_stream<U: 'static>(
        &self,
        map: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> SubjectStream<T, U> {
        SubjectStream {
            subject: self.clone(),
            map: Arc::new(map),
            pending: None,
            done: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, entry: Entry<T>) {
        self.deliver(entry, false);
    }

    /// Hand `entry` to the live waiter, or buffer it at the back (or at the
    /// front when it was already dequeued once).
    fn deliver(&self, mut entry: Entry<T>, mut front: bool) {
        loop {
            let waiter = {
                let mut state = self.lock();
                match state.waiter.take() {
                    Some(waiter) if !waiter.is_cancelled() => waiter,
                    _ => {
                        if front {
                            state.queue.push_front(entry);
                        } else {
                            state.queue.push_back(entry);
                        }
                        return;
                    }
                }
            };
            match waiter.deliver(entry) {
                Ok(()) => return,
                // The pull was dropped after the check; the entry stays first.
                Err(returned) => {
                    entry = returned;
                    front = true;
                }
            }
        }
    }

    /// Hand the head entry to `waiter`, or park `waiter` until one arrives.
    fn pull(&self, waiter: Waiter<T>) {
        let entry = {
            let mut state = self.lock();
            match state.queue.pop_front() {
                Some(entry) => entry,
                None => {
                    if state.waiter.as_ref().is_some_and(|w| !w.is_cancelled()) {
                        tracing::debug!("replacing an outstanding waiter");
                    }
                    state.waiter = Some(waiter);
                    return;
                }
            }
        };
        if let Err(entry) = waiter.deliver(entry) {
            self.unpull(entry);
        }
    }

    /// Return an entry whose consumer went away before receiving it. A
    /// consumer that started waiting meanwhile gets it directly.
    fn unpull(&self, entry: Entry<T>) {
        self.deliver(entry, true);
    }

    fn teardown(&self) {
        let hook = self.lock().teardown.take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn mark_yielded(&self) {
        self.lock().first = false;
    }

    fn is_first(&self) -> bool {
        self.lock().first
    }
}

// =============================================================================
// Cursor consumer
// =============================================================================

/// Pull handle over a `Subject`.
///
/// Dropping the cursor counts as the consumer disconnecting and runs the
/// teardown hook if it has not run yet.
pub struct SubjectCursor<T: Send + 'static, U> {
    subject: Subject<T>,
    map: MapFn<T, U>,
    closed: bool,
}

impl<T: Send + 'static, U: 'static> SubjectCursor<T, U> {
    /// Pull one entry and hand it to `callback`.
    ///
    /// Runs synchronously when an entry is buffered, otherwise `callback` is
    /// parked until the producer pushes. An error runs teardown before the
    /// callback sees it. The end marker runs teardown and never reaches the
    /// callback.
    pub fn next_with<F>(&self, callback: F)
    where
        F: FnOnce(Result<U, JoinError>) + Send + 'static,
    {
        let subject = self.subject.clone();
        let map = Arc::clone(&self.map);
        self.subject.pull(Waiter::Callback(Box::new(move |entry| match entry {
            Entry::Value(value) => callback(Ok(map(value))),
            Entry::Error(error) => {
                subject.teardown();
                callback(Err(error));
            }
            Entry::Complete => subject.teardown(),
        })));
    }
}

impl<T: Send + 'static, U: Send + 'static> ChangeCursor<U> for SubjectCursor<T, U> {
    fn next(&mut self) -> BoxFuture<'_, Result<Option<U>, JoinError>> {
        let (tx, rx) = oneshot::channel();
        self.subject.pull(Waiter::Channel(tx));
        let mut pull = PendingPull {
            subject: self.subject.clone(),
            rx: Some(rx),
        };
        let map = Arc::clone(&self.map);
        Box::pin(async move {
            match pull.recv().await {
                Some(Entry::Value(value)) => Ok(Some(map(value))),
                Some(Entry::Error(error)) => {
                    pull.subject.teardown();
                    Err(error)
                }
                Some(Entry::Complete) => {
                    pull.subject.teardown();
                    Ok(None)
                }
                None => Err(JoinError::Disconnected),
            }
        })
    }

    /// Behaves like the producer calling `complete()`. Teardown runs now if a
    /// `next_with` callback is waiting, otherwise once the end marker is
    /// drained.
    fn close(&mut self) -> BoxFuture<'_, Result<(), JoinError>> {
        if !self.closed {
            self.closed = true;
            self.subject.complete();
        }
        Box::pin(async { Ok(()) })
    }
}

impl<T: Send + 'static, U> Drop for SubjectCursor<T, U> {
    fn drop(&mut self) {
        self.subject.teardown();
    }
}

/// An async pull in flight.
///
/// Dropping it before the entry was received puts a delivered entry back at
/// the head of the buffer, so a cancelled `next()` never loses a value.
struct PendingPull<T: Send + 'static> {
    subject: Subject<T>,
    rx: Option<oneshot::Receiver<Entry<T>>>,
}

impl<T: Send + 'static> PendingPull<T> {
    /// `None` when the waiter was replaced by a newer pull.
    async fn recv(&mut self) -> Option<Entry<T>> {
        let rx = self.rx.as_mut()?;
        let entry = rx.await.ok();
        self.rx = None;
        entry
    }
}

impl<T: Send + 'static> Drop for PendingPull<T> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            // After close() no further send can succeed, so an entry is
            // either already in the channel or handed back by the producer.
            rx.close();
            if let Ok(entry) = rx.try_recv() {
                self.subject.unpull(entry);
            }
        }
    }
}

// =============================================================================
// Stream consumer
// =============================================================================

/// `futures::Stream` over a `Subject`.
///
/// Ends with `None` after the end marker. Dropping the stream before it ends
/// runs the teardown hook.
pub struct SubjectStream<T: Send + 'static, U> {
    subject: Subject<T>,
    map: MapFn<T, U>,
    pending: Option<oneshot::Receiver<Entry<T>>>,
    done: bool,
}

impl<T: Send + 'static, U> SubjectStream<T, U> {
    fn yield_entry(&mut self, entry: Entry<T>) -> Option<Result<U, JoinError>> {
        match entry {
            Entry::Value(value) => {
                self.subject.mark_yielded();
                Some(Ok((self.map)(value)))
            }
            Entry::Error(error) => {
                self.done = true;
                if self.subject.is_first() {
                    self.subject.teardown();
                }
                Some(Err(error))
            }
            Entry::Complete => {
                self.done = true;
                self.subject.teardown();
                None
            }
        }
    }
}

impl<T: Send + 'static, U> Stream for SubjectStream<T, U> {
    type Item = Result<U, JoinError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        if this.pending.is_none() {
            let (tx, rx) = oneshot::channel();
            this.subject.pull(Waiter::Channel(tx));
            this.pending = Some(rx);
        }

        let Some(rx) = this.pending.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(Ok(entry)) => {
                this.pending = None;
                Poll::Ready(this.yield_entry(entry))
            }
            Poll::Ready(Err(_)) => {
                this.pending = None;
                this.done = true;
                Poll::Ready(Some(Err(JoinError::Disconnected)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: Send + 'static, U> Drop for SubjectStream<T, U> {
    fn drop(&mut self) {
        self.subject.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::StreamExt;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn counting_subject() -> (Subject<u32>, Arc<AtomicUsize>) {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&teardowns);
        let subject = Subject::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (subject, teardowns)
    }

    /// Publish `values` from a separate task, one per millisecond, then
    /// optionally push an error before index `error_at`, then complete.
    fn spawn_producer(subject: Subject<u32>, values: Vec<u32>, error_at: Option<usize>) {
        tokio::spawn(async move {
            for (i, value) in values.into_iter().enumerate() {
                if error_at == Some(i) {
                    subject.error(JoinError::feed_message("boom"));
                }
                subject.publish(value);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            subject.complete();
        });
    }

    #[tokio::test]
    async fn test_cursor_normal_behaviour() {
        let (subject, teardowns) = counting_subject();
        let mut cursor = subject.create_mapped_cursor(|v| v + 1);
        spawn_producer(subject.clone(), vec![123, 234, 123, 32, 1, 8], None);

        let mut received = Vec::new();
        while let Some(value) = cursor.next().await.expect("no error pushed") {
            received.push(value);
        }

        assert_eq!(received, vec![124, 235, 124, 33, 2, 9]);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cursor_exceptional_behaviour() {
        let (subject, teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();
        spawn_producer(subject.clone(), vec![123, 234, 123, 32, 1, 8], Some(2));

        let mut received = Vec::new();
        let error = loop {
            match cursor.next().await {
                Ok(Some(value)) => received.push(value),
                Ok(None) => panic!("stream ended without the pushed error"),
                Err(e) => break e,
            }
        };
        cursor.close().await.expect("close never fails");

        assert_eq!(error.to_string(), "boom");
        assert_eq!(received, vec![123, 234]);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cursor_closed_by_consumer_while_waiting() {
        let (subject, teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();

        cursor.next_with(|_| {});
        cursor.close().await.expect("close never fails");

        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(subject.is_torn_down());
    }

    #[tokio::test]
    async fn test_cursor_close_without_waiter_defers_teardown() {
        let (subject, teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();

        cursor.close().await.expect("close never fails");
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);

        assert_eq!(cursor.next().await.expect("end marker"), None);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cursor_close_twice_is_idempotent() {
        let (subject, teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();
        cursor.next_with(|_| {});

        cursor.close().await.expect("first close");
        cursor.close().await.expect("second close");
        drop(cursor);

        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(subject.buffered(), 0);
    }

    #[tokio::test]
    async fn test_cursor_close_after_completion() {
        let (subject, teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();
        subject.publish(1);
        subject.complete();

        assert_eq!(cursor.next().await.expect("value"), Some(1));
        assert_eq!(cursor.next().await.expect("end"), None);
        cursor.close().await.expect("close after completion");
        drop(cursor);

        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_runs_synchronously_for_buffered_entries() {
        let (subject, teardowns) = counting_subject();
        let cursor = subject.create_mapped_cursor(|v| v * 10);
        subject.publish(1);
        subject.error(JoinError::feed_message("late"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let sink = Arc::clone(&seen);
            cursor.next_with(move |result| {
                sink.lock()
                    .expect("test lock")
                    .push(result.map_err(|e| e.to_string()));
            });
        }

        let seen = seen.lock().expect("test lock").clone();
        assert_eq!(seen, vec![Ok(10), Err("late".to_string())]);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_end_marker_never_reaches_callback() {
        let (subject, teardowns) = counting_subject();
        let cursor = subject.create_cursor();
        subject.complete();

        let called = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&called);
        cursor.next_with(move |_| {
            flag.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_normal_behaviour() {
        let (subject, teardowns) = counting_subject();
        let stream = subject.create_mapped_stream(|v| v + 1);
        spawn_producer(subject.clone(), vec![123, 234, 123, 32, 1, 8], None);

        let received: Vec<u32> = stream
            .map(|item| item.expect("no error pushed"))
            .collect()
            .await;

        assert_eq!(received, vec![124, 235, 124, 33, 2, 9]);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_exceptional_behaviour() {
        let (subject, teardowns) = counting_subject();
        let mut stream = subject.create_stream();
        spawn_producer(subject.clone(), vec![123, 234, 123, 32, 1, 8], Some(2));

        let mut received = Vec::new();
        let mut error = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(value) => received.push(value),
                Err(e) => error = Some(e),
            }
        }

        assert_eq!(received, vec![123, 234]);
        assert_eq!(error.map(|e| e.to_string()), Some("boom".to_string()));
        // A value was yielded before the error, so teardown waits for drop.
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        drop(stream);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_error_as_first_item_tears_down_before_raising() {
        let (subject, teardowns) = counting_subject();
        let mut stream = subject.create_stream();
        subject.error(JoinError::feed_message("first"));

        let item = stream.next().await.expect("error item");
        assert!(item.is_err());
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(stream.next().await.is_none());

        drop(stream);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_abandoned_by_consumer() {
        let (subject, teardowns) = counting_subject();
        let mut stream = subject.create_stream();
        for value in [4, 234, 56, 3, 1, 8] {
            subject.publish(value);
        }

        let mut received = Vec::new();
        while let Some(item) = stream.next().await {
            received.push(item.expect("no error pushed"));
            if received.len() == 3 {
                break;
            }
        }
        assert_eq!(teardowns.load(Ordering::SeqCst), 0);
        drop(stream);

        assert_eq!(received, vec![4, 234, 56]);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    /// Random interleavings of pushes and pulls deliver values in push order.
    #[test]
    fn test_order_preserved_under_random_interleaving() {
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let (subject, teardowns) = counting_subject();
            let cursor = subject.create_cursor();
            let received = Arc::new(Mutex::new(Vec::new()));

            let mut pushed = 0;
            let mut pulls = 0;
            while pushed < 50 {
                if rng.random_bool(0.5) {
                    subject.publish(pushed);
                    pushed += 1;
                } else if pulls <= pushed {
                    // Only one outstanding pull at a time.
                    let sink = Arc::clone(&received);
                    cursor.next_with(move |result| {
                        sink.lock()
                            .expect("test lock")
                            .push(result.expect("no error pushed"));
                    });
                    pulls += 1;
                }
            }
            subject.complete();
            while pulls <= pushed {
                let sink = Arc::clone(&received);
                cursor.next_with(move |result| {
                    sink.lock()
                        .expect("test lock")
                        .push(result.expect("no error pushed"));
                });
                pulls += 1;
            }

            let received = received.lock().expect("test lock").clone();
            assert_eq!(received, (0..50).collect::<Vec<_>>(), "seed {seed}");
            assert_eq!(teardowns.load(Ordering::SeqCst), 1, "seed {seed}");
        }
    }

    #[tokio::test]
    async fn test_cancelled_pull_does_not_lose_values() {
        let (subject, _teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();

        let pending = tokio::time::timeout(Duration::from_millis(5), cursor.next()).await;
        assert!(pending.is_err(), "nothing was published yet");

        subject.publish(7);
        assert_eq!(cursor.next().await.expect("value"), Some(7));
    }

    #[tokio::test]
    async fn test_value_handed_to_dropped_pull_is_kept() {
        let (subject, _teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();

        let pending = cursor.next();
        subject.publish(1);
        drop(pending);
        subject.publish(2);

        assert_eq!(subject.buffered(), 2);
        assert_eq!(cursor.next().await.expect("value"), Some(1));
        assert_eq!(cursor.next().await.expect("value"), Some(2));
    }

    #[test]
    fn test_dropped_pull_is_skipped_by_producer() {
        let (subject, _teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();

        drop(cursor.next());
        subject.publish(1);
        assert_eq!(subject.buffered(), 1);
        assert!(subject.lock().waiter.is_none());
    }

    /// A producer took a live pull, the pull was dropped before delivery and
    /// a new consumer parked on the empty buffer in between.
    #[test]
    fn test_returned_entry_goes_to_consumer_parked_meanwhile() {
        let (subject, _teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();

        let pending = cursor.next();
        let taken = subject.lock().waiter.take().expect("parked pull");
        drop(pending);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cursor.next_with(move |result| {
            sink.lock().expect("test lock").push(result.expect("value"));
        });

        let Err(returned) = taken.deliver(Entry::Value(1)) else {
            panic!("the pull was dropped before delivery");
        };
        subject.unpull(returned);
        assert_eq!(subject.buffered(), 0);

        subject.publish(2);
        assert_eq!(subject.buffered(), 1);
        let sink = Arc::clone(&seen);
        cursor.next_with(move |result| {
            sink.lock().expect("test lock").push(result.expect("value"));
        });

        assert_eq!(*seen.lock().expect("test lock"), vec![1, 2]);
        assert_eq!(subject.buffered(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_pulls_keep_push_order_across_threads() {
        let (subject, _teardowns) = counting_subject();
        let mut cursor = subject.create_cursor();
        let producer = subject.clone();
        tokio::spawn(async move {
            for value in 0..500 {
                producer.publish(value);
                if value % 8 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });

        let received = tokio::time::timeout(Duration::from_secs(10), async {
            let mut received = Vec::new();
            while received.len() < 500 {
                if let Ok(pulled) =
                    tokio::time::timeout(Duration::from_micros(1), cursor.next()).await
                {
                    received.push(pulled.expect("no error pushed").expect("no end marker"));
                }
            }
            received
        })
        .await
        .expect("every value arrives");

        assert_eq!(received, (0..500).collect::<Vec<_>>());
    }
}
