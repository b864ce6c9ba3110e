//! Fan-out/fan-in over per-resource tasks.

use crate::resource::ResourceInfo;
use std::future::Future;
use tokio::sync::mpsc;

/// Spawns one task per resource and returns the receiver of their results.
///
/// The channel holds one slot per task, so no task ever blocks on send even
/// if the caller stops receiving early. Every task sends exactly once.
pub(crate) fn fan_out<T, F, Fut>(resources: &[ResourceInfo], f: F) -> mpsc::Receiver<T>
where
    F: Fn(ResourceInfo) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(resources.len().max(1));
    for info in resources {
        let tx = tx.clone();
        let task = f(info.clone());
        tokio::spawn(async move {
            let _ = tx.send(task.await).await;
        });
    }
    rx
}
