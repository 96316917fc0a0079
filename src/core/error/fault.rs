use serde::Deserialize;
use serde::Serialize;
use std::error::Error;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;

use crate::core::RemoteException;

/// Category of a cluster fault.
///
/// Mirrors the failure surfaces of the runtime: the link itself, the wire
/// encoding, the invoked user function, the reference lifecycle, and pooled
/// dispatch.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
  /// A link was lost or the peer terminated.
  Transport,
  /// A frame body failed to serialize or deserialize.
  Protocol,
  /// The invoked function raised or panicked.
  User,
  /// A reference was misused: double-set future, destroyed cell, closed
  /// channel.
  Reference,
  /// A pool operation could not be satisfied.
  Pool,
}

impl Display for FaultKind {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    match self {
      Self::Transport => f.write_str("transport"),
      Self::Protocol => f.write_str("protocol"),
      Self::User => f.write_str("user"),
      Self::Reference => f.write_str("reference"),
      Self::Pool => f.write_str("pool"),
    }
  }
}

// -----------------------------------------------------------------------------
// Cluster Error
// -----------------------------------------------------------------------------

/// A structured cluster fault with kind, message, and optional remote origin.
///
/// # Display Format
///
/// Errors format as: `{kind} fault - {message}`
///
/// Example: `reference fault - future can only be set once`
pub struct ClusterError {
  kind: FaultKind,
  closed: bool,
  error: String,
  remote: Option<Box<RemoteException>>,
}

impl ClusterError {
  #[inline]
  pub(crate) fn new<T>(kind: FaultKind, error: T) -> Self
  where
    T: Display,
  {
    Self {
      kind,
      closed: false,
      error: error.to_string(),
      remote: None,
    }
  }

  /// Creates a transport-kind fault.
  #[inline]
  pub fn transport<T: Display>(error: T) -> Self {
    Self::new(FaultKind::Transport, error)
  }

  /// Creates a protocol-kind fault.
  #[inline]
  pub fn protocol<T: Display>(error: T) -> Self {
    Self::new(FaultKind::Protocol, error)
  }

  /// Creates a user-kind fault.
  #[inline]
  pub fn user<T: Display>(error: T) -> Self {
    Self::new(FaultKind::User, error)
  }

  /// Creates a reference-kind fault.
  #[inline]
  pub fn reference<T: Display>(error: T) -> Self {
    Self::new(FaultKind::Reference, error)
  }

  /// Creates a pool-kind fault.
  #[inline]
  pub fn pool<T: Display>(error: T) -> Self {
    Self::new(FaultKind::Pool, error)
  }

  /// Creates the reference-kind fault raised by operations on a closed
  /// channel.
  #[inline]
  pub(crate) fn closed_channel() -> Self {
    Self {
      kind: FaultKind::Reference,
      closed: true,
      error: String::from("channel is closed"),
      remote: None,
    }
  }

  /// Wraps a fault delivered by a remote node.
  ///
  /// The local error inherits the captured kind and closed-state so callers
  /// can react to a remote closed-channel exactly as they would to a local
  /// one.
  pub(crate) fn from_remote(remote: RemoteException) -> Self {
    Self {
      kind: remote.captured.kind,
      closed: remote.captured.closed,
      error: remote.to_string(),
      remote: Some(Box::new(remote)),
    }
  }

  /// Returns the fault category.
  #[inline]
  pub const fn kind(&self) -> FaultKind {
    self.kind
  }

  /// Returns `true` if this fault reports a closed channel, local or remote.
  #[inline]
  pub const fn is_closed(&self) -> bool {
    self.closed
  }

  /// Returns the human-readable error message.
  #[inline]
  pub fn message(&self) -> &str {
    self.error.as_str()
  }

  /// Returns the remote exception this fault was delivered as, if any.
  #[inline]
  pub fn remote(&self) -> Option<&RemoteException> {
    self.remote.as_deref()
  }
}

impl Debug for ClusterError {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    Display::fmt(self, f)
  }
}

impl Display for ClusterError {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    write!(f, "{} fault - {}", self.kind, self.error)
  }
}

impl Error for ClusterError {}

impl From<std::io::Error> for ClusterError {
  fn from(error: std::io::Error) -> Self {
    Self::transport(error)
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
