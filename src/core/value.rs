use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;

use crate::cluster::GroupRef;
use crate::core::ClusterError;
use crate::core::NodeId;

/// An opaque serialized payload.
///
/// Every user-visible value crossing the wire (call arguments, results,
/// channel items, closure environments) is carried as a `Value`: the bincode
/// encoding of the original object. Encoding happens at the call boundary,
/// where the destination node is known, so that remote-reference handles
/// embedded in the object can register their client bookkeeping; decoding
/// happens on the consuming node inside a decode scope, so embedded handles
/// canonicalize into the local group.
#[derive(Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Value {
  bytes: Vec<u8>,
}

impl Value {
  /// Encodes an object outside of any link scope.
  ///
  /// Remote-reference handles inside `value` are serialized without client
  /// bookkeeping; use this only for plain data. Runtime internals use
  /// [`Value::encode_to`] instead.
  pub fn encode<T>(value: &T) -> Result<Self, ClusterError>
  where
    T: Serialize + ?Sized,
  {
    let bytes: Vec<u8> = bincode::serialize(value)
      .map_err(|error| ClusterError::protocol(format_args!("encode failed: {error}")))?;

    Ok(Self { bytes })
  }

  /// Decodes an object outside of any group scope.
  ///
  /// Fails if the payload embeds remote-reference handles, which require a
  /// group to canonicalize into.
  pub fn decode<T>(&self) -> Result<T, ClusterError>
  where
    T: DeserializeOwned,
  {
    bincode::deserialize(&self.bytes)
      .map_err(|error| ClusterError::protocol(format_args!("decode failed: {error}")))
  }

  /// Encodes an object destined for `dest`, tracking embedded handles.
  pub(crate) fn encode_to<T>(group: &GroupRef, dest: NodeId, value: &T) -> Result<Self, ClusterError>
  where
    T: Serialize + ?Sized,
  {
    with_encode_scope(group, dest, || Self::encode(value))
  }

  /// Decodes an object within `group`, canonicalizing embedded handles.
  pub(crate) fn decode_in<T>(&self, group: &GroupRef) -> Result<T, ClusterError>
  where
    T: DeserializeOwned,
  {
    with_decode_scope(group, || self.decode())
  }

  /// The encoding of the unit value.
  #[inline]
  pub fn unit() -> Self {
    Self {
      bytes: Vec::new(),
    }
  }

  /// Returns the length of the encoded payload in bytes.
  #[inline]
  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  /// Returns `true` if the payload is empty (the unit encoding).
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

impl Debug for Value {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    write!(f, "Value({} bytes)", self.bytes.len())
  }
}

// -----------------------------------------------------------------------------
// Callable
// -----------------------------------------------------------------------------

/// A remotely invocable function, optionally closed over an environment.
///
/// The wire cannot carry native code, so callables name a function in the
/// process-wide registry (see [`register`]) and carry the captured
/// environment, if any, as a pre-encoded [`Value`]. Two callables compare
/// equal when both the name and the captured environment match, which is the
/// identity the caching pool keys its remote storage by.
///
/// [`register`]: crate::register
#[derive(Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callable {
  name: String,
  env: Option<Value>,
}

impl Callable {
  /// Creates a callable naming a registered function with no environment.
  #[inline]
  pub fn func<T>(name: T) -> Self
  where
    T: Into<String>,
  {
    Self {
      name: name.into(),
      env: None,
    }
  }

  /// Creates a callable closing a registered function over `env`.
  ///
  /// The environment is encoded eagerly and must be plain data; handles that
  /// need client bookkeeping belong in call arguments instead.
  pub fn closure<T>(name: impl Into<String>, env: &T) -> Result<Self, ClusterError>
  where
    T: Serialize,
  {
    Ok(Self {
      name: name.into(),
      env: Some(Value::encode(env)?),
    })
  }

  /// Returns the registered function name.
  #[inline]
  pub fn name(&self) -> &str {
    self.name.as_str()
  }

  /// Returns the captured environment, if any.
  #[inline]
  pub(crate) fn env(&self) -> Option<&Value> {
    self.env.as_ref()
  }

  /// Consumes the callable, yielding its captured environment.
  #[inline]
  pub(crate) fn into_env(self) -> Option<Value> {
    self.env
  }
}

impl Debug for Callable {
  fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
    match self.env {
      Some(ref env) => write!(f, "Callable({}, env {} bytes)", self.name, env.len()),
      None => write!(f, "Callable({})", self.name),
    }
  }
}

// -----------------------------------------------------------------------------
// Serializer Scopes
// -----------------------------------------------------------------------------

// Handle serialization needs to know the link a payload travels on, and
// handle deserialization the group it lands in. bincode runs synchronously,
// so a thread-local stack scoped around each encode/decode is sufficient;
// nested scopes occur when a handle's cached value is itself re-encoded.

thread_local! {
  static ENCODE_SCOPE: RefCell<Vec<EncodeScope>> = const { RefCell::new(Vec::new()) };
  static DECODE_SCOPE: RefCell<Vec<GroupRef>> = const { RefCell::new(Vec::new()) };
}

/// The link context active during an encode.
pub(crate) struct EncodeScope {
  /// The group the payload is sent from.
  pub(crate) group: GroupRef,
  /// The node the payload is destined for.
  pub(crate) dest: NodeId,
}

struct ScopeGuard<F: FnMut()> {
  pop: F,
}

impl<F: FnMut()> Drop for ScopeGuard<F> {
  fn drop(&mut self) {
    (self.pop)();
  }
}

pub(crate) fn with_encode_scope<R>(group: &GroupRef, dest: NodeId, f: impl FnOnce() -> R) -> R {
  ENCODE_SCOPE.with(|stack| {
    stack.borrow_mut().push(EncodeScope {
      group: GroupRef::clone(group),
      dest,
    });
  });

  let _guard: ScopeGuard<_> = ScopeGuard {
    pop: || {
      ENCODE_SCOPE.with(|stack| {
        stack.borrow_mut().pop();
      });
    },
  };

  f()
}

pub(crate) fn with_decode_scope<R>(group: &GroupRef, f: impl FnOnce() -> R) -> R {
  DECODE_SCOPE.with(|stack| {
    stack.borrow_mut().push(GroupRef::clone(group));
  });

  let _guard: ScopeGuard<_> = ScopeGuard {
    pop: || {
      DECODE_SCOPE.with(|stack| {
        stack.borrow_mut().pop();
      });
    },
  };

  f()
}

/// Returns the innermost active encode scope, if any.
pub(crate) fn encode_scope() -> Option<EncodeScope> {
  ENCODE_SCOPE.with(|stack| {
    stack.borrow().last().map(|scope| EncodeScope {
      group: GroupRef::clone(&scope.group),
      dest: scope.dest,
    })
  })
}

/// Returns the innermost active decode scope, if any.
pub(crate) fn decode_scope() -> Option<GroupRef> {
  DECODE_SCOPE.with(|stack| stack.borrow().last().cloned())
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::Callable;
  use crate::core::Value;

  #[test]
  fn test_round_trip() {
    let value: Value = Value::encode(&(7u32, String::from("seven"))).unwrap();
    let (num, name): (u32, String) = value.decode().unwrap();

    assert_eq!(num, 7);
    assert_eq!(name, "seven");
  }

  #[test]
  fn test_unit() {
    let value: Value = Value::unit();

    assert!(value.is_empty());
  }

  #[test]
  fn test_callable_identity() {
    let lhs: Callable = Callable::closure("scale", &2u64).unwrap();
    let rhs: Callable = Callable::closure("scale", &2u64).unwrap();
    let other: Callable = Callable::closure("scale", &3u64).unwrap();

    assert_eq!(lhs, rhs);
    assert_ne!(lhs, other);
  }

  #[test]
  fn test_decode_mismatch_is_protocol_fault() {
    let value: Value = Value::encode(&1u8).unwrap();
    let error = value.decode::<(u64, u64)>().unwrap_err();

    assert_eq!(error.kind(), crate::core::FaultKind::Protocol);
  }
}
