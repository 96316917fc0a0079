use std::thread;

/// Returns the number of available CPU cores, falling back to one when
/// detection fails.
pub(crate) fn available_cpus() -> usize {
  match thread::available_parallelism() {
    Ok(count) => count.get(),
    Err(_) => 1,
  }
}
