use bytes::Bytes;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::core::Callable;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::RemoteResult;
use crate::core::Value;

// Body tags are part of the wire protocol and must never be renumbered.
const TAG_CALL_WAIT: u8 = 1;
const TAG_IDENTIFY_ACK: u8 = 2;
const TAG_IDENTIFY: u8 = 3;
const TAG_JOIN_COMPLETE: u8 = 4;
const TAG_JOIN_PGRP: u8 = 5;
const TAG_REMOTE_DO: u8 = 6;
const TAG_RESULT: u8 = 7;
const TAG_CALL: u8 = 8;
const TAG_CALL_FETCH: u8 = 9;

/// A decoded message body.
///
/// Bodies travel as a one-byte tag followed by the bincode encoding of the
/// variant's fields in declaration order. User payloads inside call bodies
/// are pre-encoded [`Value`]s; the body encoding itself never touches
/// handle bookkeeping.
pub(crate) enum Message {
  /// Invoke and put the result into the owner-side cell at `response`,
  /// then notify the cell at `notify`.
  CallWait { func: Callable, args: Value },
  /// Second half of socket identification.
  IdentifySocketAck,
  /// First half of socket identification: the sending peer's id.
  IdentifySocket { from: NodeId },
  /// Worker-side acknowledgement of a completed join.
  JoinComplete { cpus: u64, ospid: u64 },
  /// Master-side group roster delivered to a joining worker.
  JoinPgrp { self_id: NodeId, peers: Vec<NodeId> },
  /// Invoke and discard; nothing is sent back.
  RemoteDo { func: Callable, args: Value },
  /// A value (or captured failure) addressed to the cell at `response`.
  Result { value: RemoteResult },
  /// Invoke and put the result into the owner-side cell at `response`.
  Call { func: Callable, args: Value },
  /// Invoke and send the raw result back to the caller's transient cell.
  CallFetch { func: Callable, args: Value },
}

impl Message {
  /// Returns `true` for the socket-identification messages, which are the
  /// only bodies allowed on a link before it reaches the connected state.
  #[inline]
  pub(crate) fn is_identity(&self) -> bool {
    matches!(self, Self::IdentifySocket { .. } | Self::IdentifySocketAck)
  }

  /// Short body name for log lines.
  pub(crate) fn name(&self) -> &'static str {
    match self {
      Self::CallWait { .. } => "call_wait",
      Self::IdentifySocketAck => "identify_ack",
      Self::IdentifySocket { .. } => "identify",
      Self::JoinComplete { .. } => "join_complete",
      Self::JoinPgrp { .. } => "join_pgrp",
      Self::RemoteDo { .. } => "remote_do",
      Self::Result { .. } => "result",
      Self::Call { .. } => "call",
      Self::CallFetch { .. } => "call_fetch",
    }
  }

  /// Encodes this body as tag plus fields.
  pub(crate) fn encode(&self) -> Result<Bytes, ClusterError> {
    fn body<T>(tag: u8, fields: &T) -> Result<Bytes, ClusterError>
    where
      T: serde::Serialize,
    {
      let mut bytes: Vec<u8> = vec![tag];

      bincode::serialize_into(&mut bytes, fields)
        .map_err(|error| ClusterError::protocol(format_args!("body encode failed: {error}")))?;

      Ok(Bytes::from(bytes))
    }

    match self {
      Self::CallWait { func, args } => body(TAG_CALL_WAIT, &(func, args)),
      Self::IdentifySocketAck => body(TAG_IDENTIFY_ACK, &()),
      Self::IdentifySocket { from } => body(TAG_IDENTIFY, from),
      Self::JoinComplete { cpus, ospid } => body(TAG_JOIN_COMPLETE, &(cpus, ospid)),
      Self::JoinPgrp { self_id, peers } => body(TAG_JOIN_PGRP, &(self_id, peers)),
      Self::RemoteDo { func, args } => body(TAG_REMOTE_DO, &(func, args)),
      Self::Result { value } => body(TAG_RESULT, value),
      Self::Call { func, args } => body(TAG_CALL, &(func, args)),
      Self::CallFetch { func, args } => body(TAG_CALL_FETCH, &(func, args)),
    }
  }

  /// Decodes a body from its tag plus fields encoding.
  pub(crate) fn decode(bytes: &[u8]) -> Result<Self, ClusterError> {
    fn fields<T>(bytes: &[u8]) -> Result<T, ClusterError>
    where
      T: serde::de::DeserializeOwned,
    {
      bincode::deserialize(bytes)
        .map_err(|error| ClusterError::protocol(format_args!("body decode failed: {error}")))
    }

    let Some((&tag, rest)) = bytes.split_first() else {
      return Err(ClusterError::protocol("empty message body"));
    };

    match tag {
      TAG_CALL_WAIT => {
        let (func, args): (Callable, Value) = fields(rest)?;
        Ok(Self::CallWait { func, args })
      }
      TAG_IDENTIFY_ACK => Ok(Self::IdentifySocketAck),
      TAG_IDENTIFY => Ok(Self::IdentifySocket { from: fields(rest)? }),
      TAG_JOIN_COMPLETE => {
        let (cpus, ospid): (u64, u64) = fields(rest)?;
        Ok(Self::JoinComplete { cpus, ospid })
      }
      TAG_JOIN_PGRP => {
        let (self_id, peers): (NodeId, Vec<NodeId>) = fields(rest)?;
        Ok(Self::JoinPgrp { self_id, peers })
      }
      TAG_REMOTE_DO => {
        let (func, args): (Callable, Value) = fields(rest)?;
        Ok(Self::RemoteDo { func, args })
      }
      TAG_RESULT => Ok(Self::Result { value: fields(rest)? }),
      TAG_CALL => {
        let (func, args): (Callable, Value) = fields(rest)?;
        Ok(Self::Call { func, args })
      }
      TAG_CALL_FETCH => {
        let (func, args): (Callable, Value) = fields(rest)?;
        Ok(Self::CallFetch { func, args })
      }
      tag => Err(ClusterError::protocol(format_args!(
        "unknown body tag {tag}",
      ))),
    }
  }
}

impl Debug for Message {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "Message({})", self.name())
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use bytes::Bytes;

  use crate::core::Callable;
  use crate::core::NodeId;
  use crate::core::Value;
  use crate::net::message::Message;

  #[test]
  fn test_tag_stability() {
    // The tag numbering is wire protocol; breaking it is a compatibility
    // break with every deployed peer.
    let cases: Vec<(Message, u8)> = vec![
      (
        Message::CallWait {
          func: Callable::func("f"),
          args: Value::unit(),
        },
        1,
      ),
      (Message::IdentifySocketAck, 2),
      (
        Message::IdentifySocket {
          from: NodeId::new(2),
        },
        3,
      ),
      (Message::JoinComplete { cpus: 4, ospid: 7 }, 4),
      (
        Message::JoinPgrp {
          self_id: NodeId::new(2),
          peers: vec![NodeId::new(3)],
        },
        5,
      ),
      (
        Message::RemoteDo {
          func: Callable::func("f"),
          args: Value::unit(),
        },
        6,
      ),
      (
        Message::Result {
          value: Ok(Value::unit()),
        },
        7,
      ),
      (
        Message::Call {
          func: Callable::func("f"),
          args: Value::unit(),
        },
        8,
      ),
      (
        Message::CallFetch {
          func: Callable::func("f"),
          args: Value::unit(),
        },
        9,
      ),
    ];

    for (message, tag) in cases {
      let bytes: Bytes = message.encode().unwrap();

      assert_eq!(bytes[0], tag, "tag for {}", message.name());
    }
  }

  #[test]
  fn test_round_trip() {
    let message: Message = Message::Call {
      func: Callable::func("scale"),
      args: Value::encode(&(1u8, 2u8)).unwrap(),
    };

    let bytes: Bytes = message.encode().unwrap();

    match Message::decode(&bytes).unwrap() {
      Message::Call { func, args } => {
        assert_eq!(func.name(), "scale");
        assert_eq!(args.decode::<(u8, u8)>().unwrap(), (1, 2));
      }
      other => panic!("decoded wrong variant: {other:?}"),
    }
  }

  #[test]
  fn test_decode_garbage() {
    assert!(Message::decode(&[]).is_err());
    assert!(Message::decode(&[42, 1, 2, 3]).is_err());
    assert!(Message::decode(&[8, 0xff]).is_err());
  }
}
