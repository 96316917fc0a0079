//! Owner-side message dispatch and thunk execution.

use futures::FutureExt;
use futures::StreamExt;
use std::panic::AssertUnwindSafe;
use tokio_util::codec::FramedRead;
use triomphe::Arc;

use crate::cluster::group::GroupRef;
use crate::cluster::node::scope_role;
use crate::cluster::view::ClusterView;
use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::FaultKind;
use crate::core::NodeId;
use crate::core::RefId;
use crate::core::RemoteException;
use crate::core::RemoteResult;
use crate::core::Value;
use crate::net::frame::FrameCodec;
use crate::net::frame::Header;
use crate::net::link::BoxedRead;
use crate::net::link::PeerRef;
use crate::net::message::Message;
use crate::refs::cell::CellAccess;
use crate::rpc::registry;
use crate::rpc::registry::CallCtx;
use crate::rpc::registry::Reply;
use crate::utils::available_cpus;
use crate::utils::panic_message;

/// Resolves and runs a callable, converting panics into user faults.
pub(crate) async fn run_thunk(
  group: &GroupRef,
  func: Callable,
  args: Value,
  caller: NodeId,
) -> Reply {
  let name: String = func.name().to_owned();

  let Some(fun) = registry::resolve(&name) else {
    return Reply::err(ClusterError::user(format_args!(
      "function '{name}' is not registered",
    )));
  };

  let ctx: CallCtx = CallCtx::new(
    ClusterView::new(Arc::clone(group)),
    caller,
    func.into_env(),
    args,
  );

  match AssertUnwindSafe(fun(ctx)).catch_unwind().await {
    Ok(reply) => reply,
    Err(payload) => Reply::err(ClusterError::user(format_args!(
      "function '{name}' panicked: {}",
      panic_message(&payload),
    ))),
  }
}

/// Converts a thunk outcome into a cell item, capturing failures.
pub(crate) fn reply_item(group: &GroupRef, result: Result<Value, ClusterError>) -> RemoteResult {
  match result {
    Ok(value) => Ok(value),
    Err(error) => Err(RemoteException::capture(group.my_id(), &error)),
  }
}

/// Creates the result cell at `rid` and schedules the thunk that fills it.
///
/// The cell is born with the reference's creator as its client; the spawned
/// task executes the thunk and puts the outcome (value or captured failure)
/// into the cell.
pub(crate) fn schedule_call(
  group: &GroupRef,
  rid: RefId,
  func: Callable,
  args: Value,
  caller: NodeId,
) -> CellAccess {
  let cell: CellAccess = group.lookup_or_create(rid);
  let group: GroupRef = Arc::clone(group);

  tokio::spawn(scope_role(group.tag(), async move {
    let reply: Reply = run_thunk(&group, func, args, caller).await;
    let item: RemoteResult = reply_item(&group, reply.result);
    let cell: CellAccess = group.lookup_or_create(rid);

    if cell.chan.put(item).await.is_err() {
      tracing::warn!(%rid, "result cell closed before delivery");
    }
  }));

  cell
}

/// Sends a thunk outcome back to the caller's cell at `oid`.
///
/// The synctake guard carried by a rendezvous take is released only after
/// the value has been written out, which is what guarantees the taken value
/// cannot be lost to a concurrent finalization of the putter's handle.
async fn deliver_result(group: &GroupRef, peer: &PeerRef, oid: RefId, reply: Reply) {
  let Reply { result, hold } = reply;
  let value: RemoteResult = reply_item(group, result);
  let message: Message = Message::Result { value };

  if let Err(error) = peer.send_msg(Header::response(oid), &message, true).await {
    tracing::error!(peer = %peer.id(), %error, "could not deliver result");
  }

  drop(hold);
}

// -----------------------------------------------------------------------------
// Link Service
// -----------------------------------------------------------------------------

/// Drives one link's read side until the peer goes away.
///
/// Frames are dispatched in arrival order; each message is handled on its
/// own task, so submission order fixes scheduling order but not completion
/// order.
pub(crate) async fn serve_link(
  group: GroupRef,
  peer: PeerRef,
  mut framed: FramedRead<BoxedRead, FrameCodec>,
) {
  while let Some(next) = framed.next().await {
    match next {
      Ok(frame) => match Message::decode(&frame.body) {
        Ok(message) => handle_msg(&group, &peer, frame.header, message),
        Err(error) => {
          tracing::warn!(peer = %peer.id(), %error, "message body failed to decode");

          // The header survived the broken body; report the failure to the
          // caller expecting a response.
          if !frame.header.response.is_null() {
            let value: RemoteResult =
              Err(RemoteException::capture(group.my_id(), &error));
            let message: Message = Message::Result { value };
            let header: Header = Header::response(frame.header.response);

            if let Err(error) = peer.send_msg(header, &message, true).await {
              tracing::error!(peer = %peer.id(), %error, "could not report decode failure");
            }
          }
        }
      },
      Err(error) if error.kind() == FaultKind::Protocol => {
        // Framing recovered at the next boundary; the broken frame is gone.
        tracing::warn!(peer = %peer.id(), %error, "corrupt frame skipped");
      }
      Err(error) => {
        tracing::debug!(peer = %peer.id(), %error, "link lost");
        break;
      }
    }
  }

  terminate_peer(&group, &peer).await;
}

/// Dispatches one decoded message.
fn handle_msg(group: &GroupRef, peer: &PeerRef, header: Header, message: Message) {
  tracing::trace!(peer = %peer.id(), body = message.name(), "recv");

  match message {
    Message::Call { func, args } => {
      schedule_call(group, header.response, func, args, peer.id());
    }
    Message::CallFetch { func, args } => {
      let group: GroupRef = Arc::clone(group);
      let peer: PeerRef = Arc::clone(peer);

      tokio::spawn(scope_role(group.tag(), async move {
        let reply: Reply = run_thunk(&group, func, args, peer.id()).await;

        deliver_result(&group, &peer, header.response, reply).await;
      }));
    }
    Message::CallWait { func, args } => {
      let group: GroupRef = Arc::clone(group);
      let peer: PeerRef = Arc::clone(peer);

      tokio::spawn(scope_role(group.tag(), async move {
        let cell: CellAccess =
          schedule_call(&group, header.response, func, args, peer.id());

        let value: RemoteResult = match cell.chan.fetch().await {
          Ok(Ok(_)) => Ok(Value::unit()),
          Ok(Err(exc)) => Err(exc),
          Err(error) => Err(RemoteException::capture(
            group.my_id(),
            &ClusterError::from(error),
          )),
        };

        let message: Message = Message::Result { value };
        let header: Header = Header::response(header.notify);

        if let Err(error) = peer.send_msg(header, &message, true).await {
          tracing::error!(peer = %peer.id(), %error, "could not notify call_wait");
        }
      }));
    }
    Message::RemoteDo { func, args } => {
      let group: GroupRef = Arc::clone(group);
      let caller: NodeId = peer.id();

      tokio::spawn(scope_role(group.tag(), async move {
        let reply: Reply = run_thunk(&group, func, args, caller).await;

        if let Err(error) = reply.result {
          tracing::error!(%caller, %error, "error in remote_do");
        }
      }));
    }
    Message::Result { value } => {
      let group: GroupRef = Arc::clone(group);

      tokio::spawn(async move {
        let cell: CellAccess = group.lookup_or_create(header.response);

        if cell.chan.put(value).await.is_err() {
          tracing::warn!(rid = %header.response, "response cell closed");
        }
      });
    }
    Message::JoinPgrp { self_id, peers } => {
      tracing::debug!(%self_id, peers = peers.len(), "joined process group");

      let peer: PeerRef = Arc::clone(peer);

      tokio::spawn(async move {
        let message: Message = Message::JoinComplete {
          cpus: available_cpus() as u64,
          ospid: std::process::id() as u64,
        };

        if let Err(error) = peer.send_msg(Header::NULL, &message, true).await {
          tracing::error!(%error, "could not acknowledge join");
        }
      });
    }
    Message::JoinComplete { cpus, ospid } => {
      tracing::debug!(peer = %peer.id(), cpus, ospid, "worker join complete");
    }
    Message::IdentifySocket { .. } | Message::IdentifySocketAck => {
      tracing::warn!(peer = %peer.id(), "stray identification message");
    }
  }
}

/// Local bookkeeping when a link dies.
///
/// The peer is removed so later operations fail fast, and every cell whose
/// creator was awaiting a response from it receives a transport failure.
pub(crate) async fn terminate_peer(group: &GroupRef, peer: &PeerRef) {
  peer.mark_terminated();
  group.remove_peer(peer.id());

  let error: ClusterError =
    ClusterError::transport(format_args!("worker {} terminated", peer.id()));
  let exc: RemoteException = RemoteException::capture(peer.id(), &error);

  for cell in group.take_waiting_for(peer.id()) {
    if cell.chan.is_ready() {
      continue;
    }

    let exc: RemoteException = exc.clone();

    tokio::spawn(async move {
      let _ = cell.chan.put(Err(exc)).await;
    });
  }

  tracing::debug!(peer = %peer.id(), "peer terminated");
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use bytes::Bytes;
  use bytes::BytesMut;
  use futures::StreamExt;
  use tokio::io::AsyncWriteExt;
  use tokio_util::codec::Encoder;
  use tokio_util::codec::FramedRead;
  use triomphe::Arc;

  use crate::cluster::group::GroupRef;
  use crate::cluster::group::ProcessGroup;
  use crate::core::FaultKind;
  use crate::core::NodeId;
  use crate::core::RefId;
  use crate::core::Role;
  use crate::core::Value;
  use crate::net::frame::FrameCodec;
  use crate::net::frame::Header;
  use crate::net::frame::LinkCounters;
  use crate::net::frame::RawFrame;
  use crate::net::link::BoxedRead;
  use crate::net::link::Peer;
  use crate::net::link::PeerRef;
  use crate::net::message::Message;
  use crate::rpc::exec::serve_link;

  fn raw_frame(header: Header, body: Bytes) -> BytesMut {
    let mut codec: FrameCodec = FrameCodec::new(Arc::new(LinkCounters::default()));
    let mut buffer: BytesMut = BytesMut::new();

    codec.encode(RawFrame { header, body }, &mut buffer).unwrap();
    buffer
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_decode_failure_is_reported_and_link_resyncs() {
    let group: GroupRef = ProcessGroup::spawn(NodeId::MASTER, Role::Master);

    let (node_io, peer_io) = tokio::io::duplex(64 * 1024);
    let (node_read, node_write) = tokio::io::split(node_io);
    let (peer_read, mut peer_write) = tokio::io::split(peer_io);

    let peer: PeerRef = group.insert_peer(Peer::new(NodeId::new(2), Box::new(node_write)));

    peer.mark_connected();

    let framed = FramedRead::new(
      Box::new(node_read) as BoxedRead,
      FrameCodec::new(Arc::clone(peer.counters())),
    );
    let serve = tokio::spawn(serve_link(
      GroupRef::clone(&group),
      Arc::clone(&peer),
      framed,
    ));

    let mut wire_in = FramedRead::new(
      peer_read,
      FrameCodec::new(Arc::new(LinkCounters::default())),
    );

    // A frame whose header is valid but whose body cannot decode.
    let rid: RefId = RefId::new(NodeId::new(2), 77);
    let broken: BytesMut = raw_frame(
      Header::response(rid),
      Bytes::from_static(&[0xFF, 0xEE, 0xDD]),
    );

    peer_write.write_all(&broken).await.unwrap();

    // The node reports the captured decode failure to the response cell.
    let frame: RawFrame = wire_in.next().await.unwrap().unwrap();

    assert_eq!(frame.header.response, rid);

    match Message::decode(&frame.body).unwrap() {
      Message::Result { value } => {
        let exc = value.unwrap_err();

        assert_eq!(exc.captured.kind, FaultKind::Protocol);
        assert_eq!(exc.pid, NodeId::MASTER);
      }
      other => panic!("expected a result, got {other:?}"),
    }

    // The boundary let the link resync: the next frame is handled
    // normally.
    let cell_rid: RefId = group.next_ref();
    let cell = group.lookup_or_create(cell_rid);
    let message: Message = Message::Result {
      value: Ok(Value::encode(&5u8).unwrap()),
    };
    let good: BytesMut = raw_frame(Header::response(cell_rid), message.encode().unwrap());

    peer_write.write_all(&good).await.unwrap();

    let item = cell.chan.take().await.unwrap().unwrap();

    assert_eq!(item.decode::<u8>().unwrap(), 5);

    serve.abort();
  }
}
