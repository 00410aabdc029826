//! Small helpers over the tokio runtime.

use std::future::Future;

// Leading :: so the extern crate is not shadowed by this module's own name.
use ::tokio::task::JoinHandle;

/// Spawn a named background task.
///
/// The name shows up in trace logs when the task starts and ends, which is
/// usually the only trace a finished background loop leaves behind.
pub fn spawn_task<F>(name: impl Into<String>, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name.into();
    ::tokio::spawn(async move {
        log::trace!("Task '{}' started", name);
        let output = future.await;
        log::trace!("Task '{}' ended", name);
        output
    })
}
