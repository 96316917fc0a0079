use futures::SinkExt;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::watch;
use tokio_util::codec::FramedWrite;
use triomphe::Arc;

use crate::consts::CAP_GC_BUFFER;
use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::RefId;
use crate::core::Value;
use crate::net::frame::FrameCodec;
use crate::net::frame::Header;
use crate::net::frame::LinkCounters;
use crate::net::frame::RawFrame;
use crate::net::message::Message;
use crate::rpc::FN_ADD_CLIENTS;
use crate::rpc::FN_DEL_CLIENTS;

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type PeerRef = Arc<Peer>;

/// Connection state of a worker link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LinkState {
  /// Streams exist but the peer has not completed identification.
  Created,
  /// Identification acknowledged; all traffic allowed.
  Connected,
  /// The link is gone; every operation fails fast.
  Terminated,
}

// -----------------------------------------------------------------------------
// Peer
// -----------------------------------------------------------------------------

/// The local endpoint of the link to one remote peer.
///
/// Owns the write half (the read half is driven by the per-link reader task),
/// the deferred GC buffers, and the connection state machine.
pub(crate) struct Peer {
  id: NodeId,
  state: watch::Sender<LinkState>,
  writer: AsyncMutex<FramedWrite<BoxedWrite, FrameCodec>>,
  gc: Mutex<GcBuffers>,
  counters: Arc<LinkCounters>,
}

struct GcBuffers {
  add: Vec<(RefId, NodeId)>,
  del: Vec<(RefId, NodeId)>,
  flag: bool,
}

impl Peer {
  pub(crate) fn new(id: NodeId, write: BoxedWrite) -> Self {
    let counters: Arc<LinkCounters> = Arc::new(LinkCounters::default());
    let (state, _) = watch::channel(LinkState::Created);

    Self {
      id,
      state,
      writer: AsyncMutex::new(FramedWrite::new(
        write,
        FrameCodec::new(Arc::clone(&counters)),
      )),
      gc: Mutex::new(GcBuffers {
        add: Vec::with_capacity(CAP_GC_BUFFER),
        del: Vec::with_capacity(CAP_GC_BUFFER),
        flag: false,
      }),
      counters,
    }
  }

  /// Id of the remote peer this link reaches.
  #[inline]
  pub(crate) fn id(&self) -> NodeId {
    self.id
  }

  /// Traffic counters shared with this link's read-side codec.
  #[inline]
  pub(crate) fn counters(&self) -> &Arc<LinkCounters> {
    &self.counters
  }

  #[inline]
  pub(crate) fn state(&self) -> LinkState {
    *self.state.borrow()
  }

  pub(crate) fn mark_connected(&self) {
    self.state.send_if_modified(|state| {
      if *state == LinkState::Created {
        *state = LinkState::Connected;
        return true;
      }

      false
    });
  }

  pub(crate) fn mark_terminated(&self) {
    self.state.send_if_modified(|state| {
      if *state != LinkState::Terminated {
        *state = LinkState::Terminated;
        return true;
      }

      false
    });
  }

  /// Waits until the link is connected.
  ///
  /// Non-identity writers park here until the peer's identification round
  /// trip completes.
  pub(crate) async fn await_connected(&self) -> Result<(), ClusterError> {
    let mut rx: watch::Receiver<LinkState> = self.state.subscribe();

    loop {
      match *rx.borrow_and_update() {
        LinkState::Connected => return Ok(()),
        LinkState::Terminated => {
          return Err(ClusterError::transport(format_args!(
            "peer {} terminated",
            self.id,
          )));
        }
        LinkState::Created => {}
      }

      if rx.changed().await.is_err() {
        return Err(ClusterError::transport(format_args!(
          "peer {} terminated",
          self.id,
        )));
      }
    }
  }

  // ---------------------------------------------------------------------------
  // GC Buffers
  // ---------------------------------------------------------------------------

  /// Buffers an add-client pair for this peer. Returns `true` if the link
  /// was newly flagged for a GC flush.
  pub(crate) fn buffer_add(&self, rid: RefId, client: NodeId) -> bool {
    let mut gc = self.gc.lock();

    gc.add.push((rid, client));
    !std::mem::replace(&mut gc.flag, true)
  }

  /// Buffers a del-client pair for this peer. Returns `true` if the link
  /// was newly flagged for a GC flush.
  pub(crate) fn buffer_del(&self, rid: RefId, client: NodeId) -> bool {
    let mut gc = self.gc.lock();

    gc.del.push((rid, client));
    !std::mem::replace(&mut gc.flag, true)
  }

  #[inline]
  pub(crate) fn gc_flagged(&self) -> bool {
    self.gc.lock().flag
  }

  /// Atomically drains both buffers and clears the flag.
  fn drain_gc(&self) -> (Vec<(RefId, NodeId)>, Vec<(RefId, NodeId)>) {
    let mut gc = self.gc.lock();

    gc.flag = false;

    (std::mem::take(&mut gc.add), std::mem::take(&mut gc.del))
  }

  /// Builds the coalesced `remote_do` frames for drained GC buffers.
  fn gc_frames(
    add: Vec<(RefId, NodeId)>,
    del: Vec<(RefId, NodeId)>,
  ) -> Result<Vec<RawFrame>, ClusterError> {
    let mut frames: Vec<RawFrame> = Vec::with_capacity(2);

    for (name, pairs) in [(FN_ADD_CLIENTS, add), (FN_DEL_CLIENTS, del)] {
      if pairs.is_empty() {
        continue;
      }

      let message: Message = Message::RemoteDo {
        func: Callable::func(name),
        args: Value::encode(&pairs)?,
      };

      frames.push(RawFrame {
        header: Header::NULL,
        body: message.encode()?,
      });
    }

    Ok(frames)
  }

  // ---------------------------------------------------------------------------
  // Send Path
  // ---------------------------------------------------------------------------

  /// Writes a frame to the link.
  ///
  /// With `now` unset, any flagged GC buffers are piggy-backed onto the
  /// write before the flush, amortizing their cost into traffic the link
  /// was carrying anyway.
  pub(crate) async fn send_msg(
    &self,
    header: Header,
    msg: &Message,
    now: bool,
  ) -> Result<(), ClusterError> {
    if !msg.is_identity() {
      self.await_connected().await?;
    }

    let body = msg.encode()?;

    tracing::trace!(peer = %self.id, body = msg.name(), "send");

    let result: Result<(), ClusterError> = async {
      let mut writer = self.writer.lock().await;

      writer.feed(RawFrame { header, body }).await?;

      if !now && self.gc_flagged() {
        let (add, del) = self.drain_gc();

        for frame in Self::gc_frames(add, del)? {
          writer.feed(frame).await?;
        }
      }

      writer.flush().await
    }
    .await;

    if result.is_err() {
      self.mark_terminated();
    }

    result
  }

  /// Drains and sends the GC buffers immediately. Called by the GC pump.
  pub(crate) async fn flush_gc(&self) -> Result<(), ClusterError> {
    if self.state() != LinkState::Connected {
      return Ok(());
    }

    let (add, del) = self.drain_gc();
    let frames: Vec<RawFrame> = Self::gc_frames(add, del)?;

    if frames.is_empty() {
      return Ok(());
    }

    let result: Result<(), ClusterError> = async {
      let mut writer = self.writer.lock().await;

      for frame in frames {
        writer.feed(frame).await?;
      }

      writer.flush().await
    }
    .await;

    if result.is_err() {
      self.mark_terminated();
    }

    result
  }
}

impl Debug for Peer {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "Peer({}, {:?})", self.id, self.state())
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::NodeId;
  use crate::core::RefId;
  use crate::net::link::LinkState;
  use crate::net::link::Peer;

  fn peer() -> Peer {
    let (_, write) = tokio::io::duplex(256);
    let (_, write) = tokio::io::split(write);

    Peer::new(NodeId::new(2), Box::new(write))
  }

  #[tokio::test]
  async fn test_state_machine() {
    let peer: Peer = peer();

    assert_eq!(peer.state(), LinkState::Created);
    peer.mark_connected();
    assert_eq!(peer.state(), LinkState::Connected);
    peer.mark_terminated();
    assert_eq!(peer.state(), LinkState::Terminated);

    // Terminated is final.
    peer.mark_connected();
    assert_eq!(peer.state(), LinkState::Terminated);
  }

  #[tokio::test]
  async fn test_gc_flag_reports_first_buffer() {
    let peer: Peer = peer();
    let rid: RefId = RefId::new(NodeId::MASTER, 1);

    assert!(peer.buffer_del(rid, NodeId::MASTER));
    assert!(!peer.buffer_del(rid, NodeId::MASTER));
    assert!(peer.gc_flagged());
  }

  #[tokio::test]
  async fn test_await_connected_fails_on_terminated() {
    let peer: Peer = peer();

    peer.mark_terminated();
    assert!(peer.await_connected().await.is_err());
  }
}
