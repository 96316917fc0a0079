//! Runtime configuration constants and default values.
//!
//! This module defines the wire-level framing constants, table sizing, and
//! tuning parameters for the weft runtime. These constants control everything
//! from handshake validation to GC batching to graceful teardown timing.

use std::time::Duration;

// -----------------------------------------------------------------------------
// Wire Framing
// -----------------------------------------------------------------------------

/// Length in bytes of the raw frame header.
///
/// The header is four little-endian 64-bit integers: the response reference
/// identity `(whence, id)` followed by the notify reference identity.
pub const LEN_FRAME_HEADER: usize = 32;

/// Frame boundary marker written after every message body.
///
/// Readers scan for this sequence to delimit frames, which lets a link resync
/// after a body that fails to deserialize: the header of the broken frame is
/// still usable for error reporting, and the next frame starts cleanly after
/// the boundary.
pub const MSG_BOUNDARY: [u8; 10] = [
  0x79, 0x8e, 0x8e, 0xf5, 0x6e, 0x9b, 0x2e, 0x97, 0xd5, 0x7d,
];

/// Length in bytes of the shared cluster cookie exchanged at connect time.
pub const LEN_COOKIE: usize = 16;

/// Length in bytes of the fixed-width wire version string.
pub const LEN_VERSION: usize = 16;

/// Wire protocol version, padded with spaces to [`LEN_VERSION`] on the wire.
pub const WIRE_VERSION: &str = "weft-0.1";

// -----------------------------------------------------------------------------
// Reference Runtime
// -----------------------------------------------------------------------------

/// Default capacity of the channel backing a freshly created owner cell.
///
/// Futures are single-assignment, so the default factory produces a bounded
/// queue holding exactly one item.
pub const DEF_CELL_CAPACITY: usize = 1;

/// Initial capacity of a group's owner-side cell table.
pub const CAP_GROUP_REFS: usize = 64;

/// Initial capacity of a group's client-side handle table.
pub const CAP_GROUP_HANDLES: usize = 64;

/// Initial capacity of a group's peer table.
pub const CAP_GROUP_PEERS: usize = 8;

/// Initial capacity of a link's deferred GC buffers.
pub const CAP_GC_BUFFER: usize = 16;

// -----------------------------------------------------------------------------
// Timeouts
// -----------------------------------------------------------------------------

/// Maximum duration allowed for the connect-time handshake.
///
/// Covers cookie validation, the version exchange, and socket identification.
/// A peer that stalls past this deadline is treated as a transport fault.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum duration allowed for draining GC buffers at teardown.
pub const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
