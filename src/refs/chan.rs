use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use tokio::sync::Notify;

use crate::core::ClusterError;
use crate::core::RemoteResult;

/// Error returned by operations on a cell's backing channel.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChanError {
  /// The channel was closed and holds no further items.
  Closed,
  /// `fetch` was attempted on a rendezvous (capacity 0) channel, which
  /// never buffers an item to peek at.
  UnbufferedFetch,
}

impl Display for ChanError {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self {
      Self::Closed => f.write_str("channel is closed"),
      Self::UnbufferedFetch => f.write_str("fetch on an unbuffered channel"),
    }
  }
}

impl Error for ChanError {}

impl From<ChanError> for ClusterError {
  fn from(error: ChanError) -> Self {
    match error {
      ChanError::Closed => ClusterError::closed_channel(),
      ChanError::UnbufferedFetch => ClusterError::reference(error),
    }
  }
}

// -----------------------------------------------------------------------------
// Cell Channel
// -----------------------------------------------------------------------------

/// The capability set of a cell's backing channel.
///
/// Owner cells hold their payloads behind this interface so the reference
/// runtime never depends on a concrete queue: futures use a bounded(1)
/// instance, remote channels whatever capacity their creator chose.
#[async_trait]
pub(crate) trait CellChannel: Send + Sync {
  /// Appends an item, waiting for space on a bounded channel.
  async fn put(&self, item: RemoteResult) -> Result<(), ChanError>;

  /// Removes and returns the oldest item, waiting for one to arrive.
  async fn take(&self) -> Result<RemoteResult, ChanError>;

  /// Returns a copy of the oldest item without removing it, waiting for one
  /// to arrive.
  async fn fetch(&self) -> Result<RemoteResult, ChanError>;

  /// Returns `true` if a `take` or `fetch` would complete without waiting.
  fn is_ready(&self) -> bool;

  /// Returns `true` if the channel has not been closed.
  fn is_open(&self) -> bool;

  /// Returns `true` if no items are buffered.
  fn is_empty(&self) -> bool;

  /// Closes the channel; buffered items stay takeable, further puts fail.
  fn close(&self);

  /// Returns the channel capacity; `None` means unbounded.
  fn capacity(&self) -> Option<usize>;
}

// -----------------------------------------------------------------------------
// Queue Channel
// -----------------------------------------------------------------------------

/// Default [`CellChannel`] implementation: a notify-driven queue.
///
/// Capacity `None` is unbounded, `Some(n)` bounds the buffer to `n` items,
/// and `Some(0)` is a rendezvous: a put completes only once a taker has
/// consumed the handed-over item.
pub(crate) struct QueueChannel {
  state: Mutex<QueueState>,
  notify: Notify,
  capacity: Option<usize>,
}

struct QueueState {
  items: VecDeque<RemoteResult>,
  closed: bool,
  /// Number of `take` calls currently waiting; rendezvous puts require one.
  takers: usize,
  /// Count of completed pops; rendezvous puts watch it to learn their item
  /// was consumed.
  pops: u64,
}

impl QueueChannel {
  pub(crate) fn new(capacity: Option<usize>) -> Self {
    Self {
      state: Mutex::new(QueueState {
        items: VecDeque::new(),
        closed: false,
        takers: 0,
        pops: 0,
      }),
      notify: Notify::new(),
      capacity,
    }
  }

  #[inline]
  fn is_rendezvous(&self) -> bool {
    self.capacity == Some(0)
  }

  fn has_space(&self, state: &QueueState) -> bool {
    match self.capacity {
      None => true,
      Some(0) => state.takers > 0 && state.items.is_empty(),
      Some(bound) => state.items.len() < bound,
    }
  }
}

struct TakerGuard<'a> {
  chan: &'a QueueChannel,
}

impl Drop for TakerGuard<'_> {
  fn drop(&mut self) {
    self.chan.state.lock().takers -= 1;
  }
}

#[async_trait]
impl CellChannel for QueueChannel {
  async fn put(&self, item: RemoteResult) -> Result<(), ChanError> {
    // Phase 1: wait for space, then buffer the item.
    let mark: u64 = loop {
      let notified = self.notify.notified();

      {
        let mut state = self.state.lock();

        if state.closed {
          return Err(ChanError::Closed);
        }

        if self.has_space(&state) {
          state.items.push_back(item);
          break state.pops;
        }
      }

      notified.await;
    };

    self.notify.notify_waiters();

    if !self.is_rendezvous() {
      return Ok(());
    }

    // Phase 2: a rendezvous put completes only once its item was consumed.
    // The item was buffered into an empty queue, so the first pop past
    // `mark` is ours.
    loop {
      let notified = self.notify.notified();

      if self.state.lock().pops > mark {
        return Ok(());
      }

      notified.await;
    }
  }

  async fn take(&self) -> Result<RemoteResult, ChanError> {
    let _taker: Option<TakerGuard<'_>> = if self.is_rendezvous() {
      self.state.lock().takers += 1;
      self.notify.notify_waiters();
      Some(TakerGuard { chan: self })
    } else {
      None
    };

    loop {
      let notified = self.notify.notified();

      {
        let mut state = self.state.lock();

        if let Some(item) = state.items.pop_front() {
          state.pops += 1;
          drop(state);
          self.notify.notify_waiters();
          return Ok(item);
        }

        if state.closed {
          return Err(ChanError::Closed);
        }
      }

      notified.await;
    }
  }

  async fn fetch(&self) -> Result<RemoteResult, ChanError> {
    if self.is_rendezvous() {
      return Err(ChanError::UnbufferedFetch);
    }

    loop {
      let notified = self.notify.notified();

      {
        let state = self.state.lock();

        if let Some(item) = state.items.front() {
          return Ok(item.clone());
        }

        if state.closed {
          return Err(ChanError::Closed);
        }
      }

      notified.await;
    }
  }

  fn is_ready(&self) -> bool {
    !self.state.lock().items.is_empty()
  }

  fn is_open(&self) -> bool {
    !self.state.lock().closed
  }

  fn is_empty(&self) -> bool {
    self.state.lock().items.is_empty()
  }

  fn close(&self) {
    self.state.lock().closed = true;
    self.notify.notify_waiters();
  }

  fn capacity(&self) -> Option<usize> {
    self.capacity
  }
}

impl Debug for QueueChannel {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    let state = self.state.lock();

    write!(
      f,
      "QueueChannel(items: {}, closed: {})",
      state.items.len(),
      state.closed,
    )
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use crate::core::RemoteResult;
  use crate::core::Value;
  use crate::refs::chan::CellChannel;
  use crate::refs::chan::ChanError;
  use crate::refs::chan::QueueChannel;

  fn item(byte: u8) -> RemoteResult {
    Ok(Value::encode(&byte).unwrap())
  }

  #[tokio::test]
  async fn test_put_take_order() {
    let chan: QueueChannel = QueueChannel::new(None);

    chan.put(item(1)).await.unwrap();
    chan.put(item(2)).await.unwrap();

    assert_eq!(chan.take().await.unwrap(), item(1));
    assert_eq!(chan.take().await.unwrap(), item(2));
  }

  #[tokio::test]
  async fn test_fetch_leaves_item() {
    let chan: QueueChannel = QueueChannel::new(Some(1));

    chan.put(item(1)).await.unwrap();

    assert_eq!(chan.fetch().await.unwrap(), item(1));
    assert!(chan.is_ready());
    assert_eq!(chan.take().await.unwrap(), item(1));
    assert!(!chan.is_ready());
  }

  #[tokio::test]
  async fn test_close_drains_then_fails() {
    let chan: QueueChannel = QueueChannel::new(None);

    chan.put(item(1)).await.unwrap();
    chan.close();

    assert!(!chan.is_open());
    assert_eq!(chan.take().await.unwrap(), item(1));
    assert_eq!(chan.take().await.unwrap_err(), ChanError::Closed);
    assert_eq!(chan.put(item(2)).await.unwrap_err(), ChanError::Closed);
  }

  #[tokio::test]
  async fn test_bounded_put_waits_for_space() {
    let chan: std::sync::Arc<QueueChannel> = std::sync::Arc::new(QueueChannel::new(Some(1)));

    chan.put(item(1)).await.unwrap();

    let blocked = {
      let chan = std::sync::Arc::clone(&chan);
      tokio::spawn(async move { chan.put(item(2)).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());

    assert_eq!(chan.take().await.unwrap(), item(1));
    blocked.await.unwrap().unwrap();
    assert_eq!(chan.take().await.unwrap(), item(2));
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_rendezvous_pairs() {
    let chan: std::sync::Arc<QueueChannel> = std::sync::Arc::new(QueueChannel::new(Some(0)));

    let put = {
      let chan = std::sync::Arc::clone(&chan);
      tokio::spawn(async move { chan.put(item(9)).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!put.is_finished(), "rendezvous put must wait for a taker");

    assert_eq!(chan.take().await.unwrap(), item(9));
    put.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_rendezvous_fetch_unsupported() {
    let chan: QueueChannel = QueueChannel::new(Some(0));

    assert_eq!(
      chan.fetch().await.unwrap_err(),
      ChanError::UnbufferedFetch,
    );
  }
}
