//! Batch progress rendering on stderr.

use std::io::Write;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;

use keysync_sync::BatchProgress;

/// Spawn a task that prints `completed/total` for every finished item.
///
/// The task ends once every sender clone is dropped.
pub fn spawn_renderer() -> (UnboundedSender<BatchProgress>, JoinHandle<()>) {
    let (tx, mut rx) = unbounded_channel::<BatchProgress>();
    let handle = tokio::spawn(async move {
        let mut failed = 0usize;
        let mut last = None;
        while let Some(event) = rx.recv().await {
            if !event.succeeded {
                failed += 1;
            }
            let mut stderr = std::io::stderr().lock();
            let _ = write!(stderr, "\r  {}/{}", event.completed, event.total);
            if failed > 0 {
                let _ = write!(stderr, " ({failed} failed)");
            }
            let _ = stderr.flush();
            last = Some(event);
        }
        if last.is_some() {
            eprintln!();
        }
    });
    (tx, handle)
}
