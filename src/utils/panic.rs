use std::any::Any;

/// Extracts the human-readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    return message;
  }

  if let Some(message) = payload.downcast_ref::<String>() {
    return message.as_str();
  }

  "opaque panic payload"
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
