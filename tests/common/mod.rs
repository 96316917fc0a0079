//! Shared fixtures: tracing setup and the registered test functions.

use std::sync::LazyLock;
use std::time::Duration;

use weft::error::ClusterError;
use weft::types::RemoteChannel;
use weft::types::Value;

pub static SETUP: LazyLock<()> = LazyLock::new(|| {
  let _ = tracing_subscriber::fmt().try_init();

  weft::register("identity_u64", |ctx: weft::CallCtx| async move {
    let value: u64 = ctx.args()?;

    Value::encode(&value)
  });

  weft::register("identity_string", |ctx: weft::CallCtx| async move {
    let value: String = ctx.args()?;

    Value::encode(&value)
  });

  weft::register("identity_bytes", |ctx: weft::CallCtx| async move {
    let value: Vec<u8> = ctx.args()?;

    Value::encode(&value)
  });

  weft::register("add", |ctx: weft::CallCtx| async move {
    let (lhs, rhs): (u64, u64) = ctx.args()?;

    Value::encode(&(lhs + rhs))
  });

  weft::register("sleep_then_id", |ctx: weft::CallCtx| async move {
    let millis: u64 = ctx.args()?;

    tokio::time::sleep(Duration::from_millis(millis)).await;
    Value::encode(&ctx.view().my_id())
  });

  weft::register("boom", |ctx: weft::CallCtx| async move {
    let (): () = ctx.args()?;

    Err(ClusterError::user("boom"))
  });

  weft::register("panics", |_ctx: weft::CallCtx| async move {
    panic!("deliberate panic");

    #[allow(unreachable_code)]
    Ok(Value::unit())
  });

  weft::register("chan_put", |ctx: weft::CallCtx| async move {
    let (chan, value): (RemoteChannel<u64>, u64) = ctx.args()?;

    chan.put(&value).await?;
    Ok(Value::unit())
  });

  weft::register("chan_take", |ctx: weft::CallCtx| async move {
    let (chan,): (RemoteChannel<u64>,) = ctx.args()?;

    Value::encode(&chan.take().await?)
  });

  weft::register("len_plus", |ctx: weft::CallCtx| async move {
    let env: Vec<u8> = ctx.env()?;
    let index: u64 = ctx.args()?;

    Value::encode(&(env.len() as u64 + index))
  });
});

/// Polls `probe` until it returns `true` or the deadline expires.
#[allow(dead_code)]
pub async fn eventually<F>(limit: Duration, mut probe: F) -> bool
where
  F: FnMut() -> bool,
{
  let deadline = tokio::time::Instant::now() + limit;

  while tokio::time::Instant::now() < deadline {
    if probe() {
      return true;
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  probe()
}
