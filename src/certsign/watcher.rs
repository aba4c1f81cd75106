use std::path::Path;

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::SignError;
use super::queue::SigningRequest;

pub type CsrEvents = mpsc::UnboundedReceiver<notify::Result<Event>>;

/// Watch `csr_dir` and forward every CSR write as a signing request.
pub(super) fn watch_dir(
    csr_dir: &Path,
    queue: mpsc::Sender<SigningRequest>,
    cancel: CancellationToken,
) -> Result<(), SignError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let to_err = |source| SignError::Watch {
        dir: csr_dir.to_path_buf(),
        source,
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })
    .map_err(to_err)?;
    watcher
        .watch(csr_dir, RecursiveMode::NonRecursive)
        .map_err(to_err)?;

    tracing::info!(dir = %csr_dir.display(), "watching for CSRs");
    tokio::spawn(forward(rx, queue, cancel, Some(watcher)));
    Ok(())
}

/// Forward from an already-established event stream.
pub(super) fn watch_events(
    events: CsrEvents,
    queue: mpsc::Sender<SigningRequest>,
    cancel: CancellationToken,
) {
    tokio::spawn(forward(events, queue, cancel, None));
}

async fn forward(
    mut events: CsrEvents,
    queue: mpsc::Sender<SigningRequest>,
    cancel: CancellationToken,
    // Held so the OS watch lives as long as this task.
    _watcher: Option<RecommendedWatcher>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                None => break,
                Some(Err(e)) => tracing::warn!(error = %e, "CSR watch error"),
                Some(Ok(event)) => {
                    for subject in csr_subjects(&event) {
                        tracing::debug!(%subject, "CSR written");
                        if queue.send(SigningRequest::CsrArrived { subject }).await.is_err() {
                            return;
                        }
                    }
                }
            },
        }
    }
    tracing::debug!("CSR watcher stopped");
}

/// Subjects of `.pem` files created or written by `event`.
pub(super) fn csr_subjects(event: &Event) -> Vec<String> {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    );
    if !relevant {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|path| path.extension().is_some_and(|ext| ext == "pem"))
        .filter_map(|path| path.file_stem()?.to_str().map(str::to_owned))
        .collect()
}
