use serde::Deserialize;
use serde::Serialize;
use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;

use crate::core::ClusterError;
use crate::core::FaultKind;
use crate::core::NodeId;
use crate::core::Value;

/// Outcome of an owner-side operation as it travels the wire.
///
/// Result messages and owner cells both carry this shape: a successful value
/// payload or the wrapped failure that produced it.
pub type RemoteResult = std::result::Result<Value, RemoteException>;

/// A failure raised on a remote node, delivered as the value of a result.
///
/// The exception names the node the failure occurred on and carries the
/// captured error in serialized form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteException {
  /// Id of the node the failure occurred on.
  pub pid: NodeId,
  /// The captured failure.
  pub captured: Captured,
}

/// Serialized form of a failure: its category, message, and backtrace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Captured {
  /// Category of the original fault.
  pub kind: FaultKind,
  /// Whether the original fault reported a closed channel.
  pub closed: bool,
  /// Display form of the original error.
  pub error: String,
  /// Backtrace captured where the failure was wrapped.
  ///
  /// Availability depends on the `RUST_BACKTRACE` environment variable on
  /// the remote node; empty otherwise.
  pub trace: String,
}

impl RemoteException {
  /// Captures a local fault for wire delivery.
  ///
  /// A fault that already wraps a remote exception is forwarded unchanged so
  /// relayed failures keep naming their true origin.
  pub(crate) fn capture(pid: NodeId, error: &ClusterError) -> Self {
    if let Some(remote) = error.remote() {
      return remote.clone();
    }

    Self {
      pid,
      captured: Captured {
        kind: error.kind(),
        closed: error.is_closed(),
        error: error.message().to_string(),
        trace: Backtrace::capture().to_string(),
      },
    }
  }
}

impl Display for RemoteException {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    write!(
      f,
      "on worker {}: {} fault - {}",
      self.pid, self.captured.kind, self.captured.error,
    )
  }
}

impl Error for RemoteException {}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::ClusterError;
  use crate::core::FaultKind;
  use crate::core::NodeId;
  use crate::core::RemoteException;

  #[test]
  fn test_capture() {
    let error: ClusterError = ClusterError::user("boom");
    let exc: RemoteException = RemoteException::capture(NodeId::new(2), &error);

    assert_eq!(exc.pid, NodeId::new(2));
    assert_eq!(exc.captured.kind, FaultKind::User);
    assert_eq!(exc.captured.error, "boom");
  }

  #[test]
  fn test_forward_keeps_origin() {
    let error: ClusterError = ClusterError::user("boom");
    let exc: RemoteException = RemoteException::capture(NodeId::new(2), &error);
    let wrap: ClusterError = ClusterError::from_remote(exc);
    let fwd: RemoteException = RemoteException::capture(NodeId::new(3), &wrap);

    assert_eq!(fwd.pid, NodeId::new(2));
  }

  #[test]
  fn test_display() {
    let error: ClusterError = ClusterError::user("boom");
    let exc: RemoteException = RemoteException::capture(NodeId::new(2), &error);
    let fmt: String = format!("{exc}");

    assert_eq!(fmt, "on worker 2: user fault - boom");
  }
}
