use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Terminal failures a body can report to its producer or consumer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BodyError {
    /// `write` was called after `close`
    #[error("Write to a closed body")]
    Closed,
    /// The connection carrying this body went away while it was being written
    #[error("Connection closed while the body was streaming")]
    ConnectionClosed,
    /// The connection ended before the end-of-stream marker arrived
    #[error("Body ended before its end-of-stream marker")]
    Incomplete,
}

/// An HTTP message body that can be written and read concurrently
///
/// Handles are cheap to clone and all refer to the same chunk queue. The
/// intended use is one producer calling [`write`](Self::write) and
/// [`close`](Self::close), and one consumer calling
/// [`read_next`](Self::read_next) until it returns `Ok(None)`.
///
/// # Examples
///
/// ```
/// use duplexsrv::body::StreamableBody;
///
/// # tokio_test::block_on(async {
/// let body = StreamableBody::new();
/// let reader = body.clone();
///
/// body.write("hello, ").await.unwrap();
/// body.write("world").await.unwrap();
/// body.close();
///
/// assert_eq!(reader.drain_all().await.unwrap(), "hello, world");
/// # });
/// ```
#[derive(Clone)]
pub struct StreamableBody {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
    capacity: Option<usize>,
}

#[derive(Default)]
struct State {
    chunks: VecDeque<Bytes>,
    closed: bool,
    failure: Option<BodyError>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamableBody {
    /// Creates an open body with an unbounded chunk queue
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an open body whose writer suspends while `capacity` chunks
    /// are waiting to be read
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(Some(capacity.max(1)))
    }

    /// Creates a body that is already closed and holds `data` as its only chunk
    pub fn from_static(data: &'static [u8]) -> Self {
        let body = Self::new();
        {
            let mut state = body.shared.lock();
            if !data.is_empty() {
                state.chunks.push_back(Bytes::from_static(data));
            }
            state.closed = true;
        }
        body
    }

    /// Creates a body that is already closed and holds nothing
    pub fn empty() -> Self {
        Self::from_static(b"")
    }

    fn build(capacity: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                capacity,
            }),
        }
    }

    /// Appends a chunk, waking any reader waiting for one
    ///
    /// Empty chunks are accepted and dropped. Suspends while a bounded body
    /// is full.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<(), BodyError> {
        let chunk = chunk.into();
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(BodyError::Closed);
                }
                if let Some(failure) = &state.failure {
                    return Err(failure.clone());
                }
                if chunk.is_empty() {
                    return Ok(());
                }
                if self.shared.capacity.is_none_or(|cap| state.chunks.len() < cap) {
                    state.chunks.push_back(chunk);
                    drop(state);
                    self.shared.changed.notify_waiters();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    /// Marks end-of-stream. Calling it more than once is a no-op.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.shared.changed.notify_waiters();
    }

    /// Moves the body into a terminal failed state
    ///
    /// Pending chunks are discarded; the next `read_next` and the next
    /// `write` both return `error`. A body that was closed and fully drained
    /// already completed cleanly and is left untouched, as is a body that
    /// already failed.
    pub fn fail(&self, error: BodyError) {
        let mut state = self.shared.lock();
        if state.failure.is_some() || (state.closed && state.chunks.is_empty()) {
            return;
        }
        state.chunks.clear();
        state.failure = Some(error);
        drop(state);
        self.shared.changed.notify_waiters();
    }

    /// Waits for the next chunk
    ///
    /// Returns `Ok(None)` once the body is closed and every chunk written
    /// before the close has been returned.
    pub async fn read_next(&self) -> Result<Option<Bytes>, BodyError> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if let Some(failure) = &state.failure {
                    return Err(failure.clone());
                }
                if let Some(chunk) = state.chunks.pop_front() {
                    drop(state);
                    if self.shared.capacity.is_some() {
                        self.shared.changed.notify_waiters();
                    }
                    return Ok(Some(chunk));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    /// Reads every remaining chunk and concatenates them
    ///
    /// This gives up streaming; it exists for logging and verification.
    pub async fn drain_all(&self) -> Result<Bytes, BodyError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.read_next().await? {
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Returns true once `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Returns the failure the body ended with, if any
    pub fn failure(&self) -> Option<BodyError> {
        self.shared.lock().failure.clone()
    }

    /// Number of chunks written but not yet read
    pub fn pending(&self) -> usize {
        self.shared.lock().chunks.len()
    }
}

impl Default for StreamableBody {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamableBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("StreamableBody")
            .field("pending", &state.chunks.len())
            .field("closed", &state.closed)
            .field("failure", &state.failure)
            .field("capacity", &self.shared.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_reader_sees_writes_in_order() {
        let body = StreamableBody::new();
        for chunk in ["a", "bb", "ccc"] {
            body.write(chunk).await.unwrap();
        }
        body.close();

        assert_eq!(body.read_next().await.unwrap(), Some(Bytes::from("a")));
        assert_eq!(body.read_next().await.unwrap(), Some(Bytes::from("bb")));
        assert_eq!(body.read_next().await.unwrap(), Some(Bytes::from("ccc")));
        assert_eq!(body.read_next().await.unwrap(), None);
        assert_eq!(body.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_after_close_is_rejected() {
        let body = StreamableBody::new();
        body.write("!").await.unwrap();
        body.close();
        body.close();

        assert_eq!(body.write("?").await, Err(BodyError::Closed));
        assert_eq!(body.drain_all().await.unwrap(), "!");
    }

    #[test]
    fn test_read_next_suspends_until_write() {
        let body = StreamableBody::new();
        let reader = body.clone();
        let mut read = task::spawn(async move { reader.read_next().await });

        assert_pending!(read.poll());
        assert_pending!(read.poll());

        tokio_test::block_on(body.write("late")).unwrap();
        assert!(read.is_woken());
        let chunk = assert_ready!(read.poll());
        assert_eq!(chunk.unwrap(), Some(Bytes::from("late")));
    }

    #[test]
    fn test_close_wakes_pending_reader() {
        let body = StreamableBody::new();
        let reader = body.clone();
        let mut read = task::spawn(async move { reader.read_next().await });

        assert_pending!(read.poll());
        body.close();
        assert!(read.is_woken());
        assert_eq!(assert_ready!(read.poll()).unwrap(), None);
    }

    #[test]
    fn test_bounded_body_suspends_writer() {
        let body = StreamableBody::with_capacity(1);
        tokio_test::block_on(body.write("first")).unwrap();

        let writer = body.clone();
        let mut write = task::spawn(async move { writer.write("second").await });
        assert_pending!(write.poll());

        let chunk = tokio_test::block_on(body.read_next()).unwrap();
        assert_eq!(chunk, Some(Bytes::from("first")));
        assert!(write.is_woken());
        assert_ready!(write.poll()).unwrap();
        assert_eq!(body.pending(), 1);
    }

    #[tokio::test]
    async fn test_fail_reaches_reader_and_writer() {
        let body = StreamableBody::new();
        body.write("partial").await.unwrap();
        body.fail(BodyError::Incomplete);

        assert_eq!(body.read_next().await, Err(BodyError::Incomplete));
        assert_eq!(body.write("more").await, Err(BodyError::Incomplete));
        assert_eq!(body.drain_all().await, Err(BodyError::Incomplete));

        body.fail(BodyError::ConnectionClosed);
        assert_eq!(body.failure(), Some(BodyError::Incomplete));
    }

    #[tokio::test]
    async fn test_fail_after_clean_drain_is_ignored() {
        let body = StreamableBody::new();
        body.write("done").await.unwrap();
        body.close();
        assert_eq!(body.drain_all().await.unwrap(), "done");

        body.fail(BodyError::ConnectionClosed);
        assert_eq!(body.failure(), None);
        assert_eq!(body.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fail_wakes_blocked_writer() {
        let body = StreamableBody::with_capacity(1);
        body.write("fill").await.unwrap();

        let writer = body.clone();
        let handle = tokio::spawn(async move { writer.write("blocked").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        body.fail(BodyError::ConnectionClosed);

        assert_eq!(handle.await.unwrap(), Err(BodyError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_concurrent_producer_and_consumer() {
        let body = StreamableBody::with_capacity(4);
        let producer = body.clone();
        let handle = tokio::spawn(async move {
            for i in 0..100u32 {
                producer.write(i.to_string()).await.unwrap();
            }
            producer.close();
        });

        let mut seen = Vec::new();
        while let Some(chunk) = body.read_next().await.unwrap() {
            seen.push(String::from_utf8(chunk.to_vec()).unwrap());
        }
        handle.await.unwrap();

        let expected: Vec<String> = (0..100u32).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_from_static_is_closed() {
        let body = StreamableBody::from_static(b"Upload data received.");
        assert!(body.is_closed());
        assert_eq!(body.write("x").await, Err(BodyError::Closed));
        assert_eq!(body.drain_all().await.unwrap(), "Upload data received.");
        assert_eq!(StreamableBody::empty().drain_all().await.unwrap(), "");
    }
}
