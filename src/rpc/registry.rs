use futures::future::BoxFuture;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::OwnedMutexGuard;

use crate::cluster::view::ClusterView;
use crate::core::ClusterError;
use crate::core::NodeId;
use crate::core::Value;

/// Invocation context handed to every registered function.
///
/// Exposes the group view the call arrived on, the calling node, and typed
/// access to the environment and arguments.
pub struct CallCtx {
  view: ClusterView,
  caller: NodeId,
  env: Option<Value>,
  args: Value,
}

impl CallCtx {
  pub(crate) fn new(view: ClusterView, caller: NodeId, env: Option<Value>, args: Value) -> Self {
    Self {
      view,
      caller,
      env,
      args,
    }
  }

  /// The cluster view this call executes in.
  #[inline]
  pub fn view(&self) -> &ClusterView {
    &self.view
  }

  /// Id of the node that submitted the call.
  #[inline]
  pub fn caller(&self) -> NodeId {
    self.caller
  }

  /// Decodes the call arguments.
  pub fn args<T>(&self) -> Result<T, ClusterError>
  where
    T: DeserializeOwned,
  {
    self.args.decode_in(self.view.group())
  }

  /// Decodes the captured closure environment.
  pub fn env<T>(&self) -> Result<T, ClusterError>
  where
    T: DeserializeOwned,
  {
    match self.env {
      Some(ref env) => env.decode_in(self.view.group()),
      None => Err(ClusterError::reference("callable has no environment")),
    }
  }

  /// Encodes a reply addressed to the caller, tracking embedded handles.
  pub fn reply<T>(&self, value: &T) -> Result<Value, ClusterError>
  where
    T: Serialize + ?Sized,
  {
    Value::encode_to(self.view.group(), self.caller, value)
  }
}

// -----------------------------------------------------------------------------
// Reply
// -----------------------------------------------------------------------------

/// Internal outcome of a thunk: the result plus an optional guard that must
/// stay held until the result has been serialized out (the synctake
/// discipline of rendezvous takes).
pub(crate) struct Reply {
  pub(crate) result: Result<Value, ClusterError>,
  pub(crate) hold: Option<OwnedMutexGuard<()>>,
}

impl Reply {
  #[inline]
  pub(crate) fn ok(value: Value) -> Self {
    Self {
      result: Ok(value),
      hold: None,
    }
  }

  #[inline]
  pub(crate) fn err(error: ClusterError) -> Self {
    Self {
      result: Err(error),
      hold: None,
    }
  }

  #[inline]
  pub(crate) fn with_hold(value: Value, hold: Option<OwnedMutexGuard<()>>) -> Self {
    Self {
      result: Ok(value),
      hold,
    }
  }
}

impl From<Result<Value, ClusterError>> for Reply {
  #[inline]
  fn from(result: Result<Value, ClusterError>) -> Self {
    Self { result, hold: None }
  }
}

// -----------------------------------------------------------------------------
// Registry
// -----------------------------------------------------------------------------

pub(crate) type SysFn = Arc<dyn Fn(CallCtx) -> BoxFuture<'static, Reply> + Send + Sync>;

static REGISTRY: LazyLock<RwLock<HashMap<String, SysFn>>> =
  LazyLock::new(|| RwLock::new(crate::rpc::sysfn::system_table()));

/// Installs a function under `name` in the process-wide registry.
///
/// Every node of an in-process cluster shares the registry, mirroring the
/// same-code-everywhere assumption of a spawned-worker deployment. A
/// previously registered name is replaced.
pub fn register<F, Fut>(name: impl Into<String>, func: F)
where
  F: Fn(CallCtx) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value, ClusterError>> + Send + 'static,
{
  register_raw(name.into(), wrap(func));
}

pub(crate) fn wrap<F, Fut>(func: F) -> SysFn
where
  F: Fn(CallCtx) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<Value, ClusterError>> + Send + 'static,
{
  Arc::new(move |ctx: CallCtx| -> BoxFuture<'static, Reply> {
    let fut = func(ctx);

    Box::pin(async move { Reply::from(fut.await) })
  })
}

pub(crate) fn wrap_reply<F, Fut>(func: F) -> SysFn
where
  F: Fn(CallCtx) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Reply> + Send + 'static,
{
  Arc::new(move |ctx: CallCtx| -> BoxFuture<'static, Reply> { Box::pin(func(ctx)) })
}

pub(crate) fn register_raw(name: String, func: SysFn) {
  tracing::debug!(%name, "function registered");
  REGISTRY.write().insert(name, func);
}

pub(crate) fn resolve(name: &str) -> Option<SysFn> {
  REGISTRY.read().get(name).map(Arc::clone)
}
