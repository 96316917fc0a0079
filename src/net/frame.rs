use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;
use triomphe::Arc;

use crate::consts::LEN_FRAME_HEADER;
use crate::consts::MSG_BOUNDARY;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::RefId;

/// Raw frame header: the response and notify reference identities.
///
/// Encoded as four little-endian 64-bit integers. The null identity in the
/// response slot means "no response expected".
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
  pub(crate) response: RefId,
  pub(crate) notify: RefId,
}

impl Header {
  /// Header of a message expecting no response.
  pub(crate) const NULL: Self = Self {
    response: RefId::NULL,
    notify: RefId::NULL,
  };

  #[inline]
  pub(crate) const fn new(response: RefId, notify: RefId) -> Self {
    Self { response, notify }
  }

  #[inline]
  pub(crate) const fn response(response: RefId) -> Self {
    Self {
      response,
      notify: RefId::NULL,
    }
  }

  fn write(&self, dst: &mut BytesMut) {
    dst.put_i64_le(self.response.whence.get() as i64);
    dst.put_i64_le(self.response.id as i64);
    dst.put_i64_le(self.notify.whence.get() as i64);
    dst.put_i64_le(self.notify.id as i64);
  }

  fn read(src: &mut BytesMut) -> Self {
    let response: RefId = RefId::new(
      NodeId::new(src.get_i64_le() as u64),
      src.get_i64_le() as u64,
    );
    let notify: RefId = RefId::new(
      NodeId::new(src.get_i64_le() as u64),
      src.get_i64_le() as u64,
    );

    Self { response, notify }
  }
}

impl Debug for Header {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "Header({}, {})", self.response, self.notify)
  }
}

// -----------------------------------------------------------------------------
// Raw Frame
// -----------------------------------------------------------------------------

/// A wire frame: header plus the still-encoded message body.
///
/// The body is opaque at this layer; decoding it (and reporting bodies that
/// fail to decode) is the reader loop's job, so that a corrupt body never
/// poisons the framing.
pub(crate) struct RawFrame {
  pub(crate) header: Header,
  pub(crate) body: Bytes,
}

impl Debug for RawFrame {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "RawFrame({:?}, {} bytes)", self.header, self.body.len())
  }
}

// -----------------------------------------------------------------------------
// Link Counters
// -----------------------------------------------------------------------------

/// Per-link traffic counters.
///
/// Frame counts let callers observe message traffic (e.g. that a cached
/// fetch sends nothing); byte counts expose payload volume.
#[derive(Default)]
pub struct LinkCounters {
  frames_tx: AtomicU64,
  frames_rx: AtomicU64,
  bytes_tx: AtomicU64,
  bytes_rx: AtomicU64,
}

impl LinkCounters {
  /// Number of frames written to the link.
  #[inline]
  pub fn frames_tx(&self) -> u64 {
    self.frames_tx.load(Ordering::Relaxed)
  }

  /// Number of frames read from the link.
  #[inline]
  pub fn frames_rx(&self) -> u64 {
    self.frames_rx.load(Ordering::Relaxed)
  }

  /// Number of body and framing bytes written to the link.
  #[inline]
  pub fn bytes_tx(&self) -> u64 {
    self.bytes_tx.load(Ordering::Relaxed)
  }

  /// Number of body and framing bytes read from the link.
  #[inline]
  pub fn bytes_rx(&self) -> u64 {
    self.bytes_rx.load(Ordering::Relaxed)
  }
}

impl Debug for LinkCounters {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(
      f,
      "LinkCounters(tx: {}/{}b, rx: {}/{}b)",
      self.frames_tx(),
      self.bytes_tx(),
      self.frames_rx(),
      self.bytes_rx(),
    )
  }
}

// -----------------------------------------------------------------------------
// Frame Codec
// -----------------------------------------------------------------------------

/// Boundary-delimited frame codec.
///
/// Frames carry no length prefix; the reader scans for [`MSG_BOUNDARY`] to
/// delimit them, which is what allows resynchronization after a body that
/// fails to deserialize.
pub(crate) struct FrameCodec {
  counters: Arc<LinkCounters>,
  /// Offset into the buffer already known to hold no boundary.
  scanned: usize,
}

impl FrameCodec {
  pub(crate) fn new(counters: Arc<LinkCounters>) -> Self {
    Self {
      counters,
      scanned: 0,
    }
  }
}

impl Decoder for FrameCodec {
  type Item = RawFrame;
  type Error = ClusterError;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, ClusterError> {
    let found: Option<usize> = src[self.scanned..]
      .windows(MSG_BOUNDARY.len())
      .position(|window| window == MSG_BOUNDARY)
      .map(|index| index + self.scanned);

    let Some(index) = found else {
      // Keep one boundary-length of overlap so a marker split across reads
      // is still found.
      self.scanned = src.len().saturating_sub(MSG_BOUNDARY.len() - 1);
      return Ok(None);
    };

    let mut frame: BytesMut = src.split_to(index);

    src.advance(MSG_BOUNDARY.len());
    self.scanned = 0;

    self.counters.frames_rx.fetch_add(1, Ordering::Relaxed);
    self
      .counters
      .bytes_rx
      .fetch_add((index + MSG_BOUNDARY.len()) as u64, Ordering::Relaxed);

    if frame.len() < LEN_FRAME_HEADER {
      return Err(ClusterError::protocol(format_args!(
        "frame of {} bytes is shorter than its header",
        frame.len(),
      )));
    }

    let header: Header = Header::read(&mut frame);

    Ok(Some(RawFrame {
      header,
      body: frame.freeze(),
    }))
  }
}

impl Encoder<RawFrame> for FrameCodec {
  type Error = ClusterError;

  fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> Result<(), ClusterError> {
    let total: usize = LEN_FRAME_HEADER + frame.body.len() + MSG_BOUNDARY.len();

    dst.reserve(total);
    frame.header.write(dst);
    dst.extend_from_slice(&frame.body);
    dst.extend_from_slice(&MSG_BOUNDARY);

    self.counters.frames_tx.fetch_add(1, Ordering::Relaxed);
    self
      .counters
      .bytes_tx
      .fetch_add(total as u64, Ordering::Relaxed);

    Ok(())
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use bytes::Bytes;
  use bytes::BytesMut;
  use tokio_util::codec::Decoder;
  use tokio_util::codec::Encoder;
  use triomphe::Arc;

  use crate::consts::MSG_BOUNDARY;
  use crate::core::NodeId;
  use crate::core::RefId;
  use crate::net::frame::FrameCodec;
  use crate::net::frame::Header;
  use crate::net::frame::LinkCounters;
  use crate::net::frame::RawFrame;

  fn codec() -> FrameCodec {
    FrameCodec::new(Arc::new(LinkCounters::default()))
  }

  #[test]
  fn test_round_trip() {
    let mut codec: FrameCodec = codec();
    let mut buffer: BytesMut = BytesMut::new();

    let header: Header = Header::response(RefId::new(NodeId::new(2), 17));
    let frame: RawFrame = RawFrame {
      header,
      body: Bytes::from_static(b"payload"),
    };

    codec.encode(frame, &mut buffer).unwrap();

    let out: RawFrame = codec.decode(&mut buffer).unwrap().unwrap();

    assert_eq!(out.header, header);
    assert_eq!(out.body.as_ref(), b"payload");
    assert!(buffer.is_empty());
  }

  #[test]
  fn test_partial_input_waits() {
    let mut codec: FrameCodec = codec();
    let mut buffer: BytesMut = BytesMut::new();

    codec
      .encode(
        RawFrame {
          header: Header::NULL,
          body: Bytes::from_static(b"abc"),
        },
        &mut buffer,
      )
      .unwrap();

    // Withhold the tail of the boundary.
    let tail: BytesMut = buffer.split_off(buffer.len() - 4);

    assert!(codec.decode(&mut buffer).unwrap().is_none());

    buffer.unsplit(tail);

    assert!(codec.decode(&mut buffer).unwrap().is_some());
  }

  #[test]
  fn test_resync_after_short_frame() {
    let mut codec: FrameCodec = codec();
    let mut buffer: BytesMut = BytesMut::new();

    // A garbage run shorter than a header, then a valid frame.
    buffer.extend_from_slice(b"garbage");
    buffer.extend_from_slice(&MSG_BOUNDARY);

    let header: Header = Header::response(RefId::new(NodeId::new(3), 5));

    codec
      .encode(
        RawFrame {
          header,
          body: Bytes::from_static(b"ok"),
        },
        &mut buffer,
      )
      .unwrap();

    assert!(codec.decode(&mut buffer).is_err());

    let out: RawFrame = codec.decode(&mut buffer).unwrap().unwrap();

    assert_eq!(out.header, header);
    assert_eq!(out.body.as_ref(), b"ok");
  }

  #[test]
  fn test_counters() {
    let counters: Arc<LinkCounters> = Arc::new(LinkCounters::default());
    let mut codec: FrameCodec = FrameCodec::new(Arc::clone(&counters));
    let mut buffer: BytesMut = BytesMut::new();

    codec
      .encode(
        RawFrame {
          header: Header::NULL,
          body: Bytes::from_static(b"xyz"),
        },
        &mut buffer,
      )
      .unwrap();

    assert_eq!(counters.frames_tx(), 1);
    assert_eq!(counters.bytes_tx(), (32 + 3 + 10) as u64);

    codec.decode(&mut buffer).unwrap().unwrap();

    assert_eq!(counters.frames_rx(), 1);
    assert_eq!(counters.bytes_rx(), (32 + 3 + 10) as u64);
  }
}
