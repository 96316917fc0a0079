//! Misc. utilities.

mod panic;
mod sys;

pub(crate) use self::panic::panic_message;
pub(crate) use self::sys::available_cpus;
