//! Starts the process's background subsystems: the buffer deleter sweep
//! and the run reconciler's event-folding/prune loops. Both follow the
//! same ticker/`CancellationToken` shape (`tyger_buffers::BufferDeleter`
//! was the template the reconciler's own `spawn` generalized).

use std::time::Duration;

use tokio::task::JoinHandle;
use tyger_buffers::BufferDeleter;

use crate::state::AppState;

pub fn spawn_background(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let deleter = BufferDeleter::new(
        state.buffers.clone(),
        Duration::from_secs(state.config.buffer.deleter_interval_secs),
    );
    handles.push(deleter.spawn(state.cancel.clone()));

    handles.extend(state.reconciler.clone().spawn(state.cancel.clone()));

    handles
}
