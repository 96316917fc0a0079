//! Wire framing, message bodies, and per-peer links.

pub(crate) mod frame;
pub(crate) mod link;
pub(crate) mod message;

pub use self::frame::LinkCounters;
