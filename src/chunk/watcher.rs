//! Per-root filesystem watcher.
//!
//! Wraps `notify`'s OS-native watcher (inotify on Linux) and coalesces its
//! raw events into the small vocabulary the mirror understands. A watcher
//! that overflows its event buffer, or a root on a filesystem that can't be
//! watched at all, falls back to a periodic full rescan — the behavior the
//! original's `DirWatcher`/`DirWatcherWin` document for the same situations.

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use notify::{Event, EventKind, RecursiveMode, Watcher as NotifyWatcherTrait};
use tokio::sync::mpsc;

use crate::logging::{debug, warn};
use crate::types::RootId;

/// A coalesced filesystem change, translated from the underlying watcher's
/// native event kinds.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    New(PathBuf),
    Deleted(PathBuf),
    ContentChanged(PathBuf),
    Moved { from: PathBuf, to: PathBuf },
    /// Either a periodic wake for an unwatchable root, or the watcher's
    /// buffer overflowed and a full rescan is required.
    Rescan,
}

/// One root's watcher. Dropping this stops the background thread and task.
pub struct RootWatcher {
    _root: RootId,
    _inner: Option<notify::RecommendedWatcher>,
    stop: tokio::sync::watch::Sender<bool>,
}

impl RootWatcher {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Start watching `path`, forwarding translated events to `tx`. If the
/// native watcher can't be created (unsupported filesystem), falls back to
/// polling every `poll_period`.
pub fn watch_root(
    root: RootId,
    path: PathBuf,
    poll_period: Duration,
    tx: mpsc::UnboundedSender<(RootId, WatchEvent)>,
) -> RootWatcher {
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let (native_tx, native_rx) = std_mpsc::channel::<notify::Result<Event>>();

    let watcher = notify::recommended_watcher(move |res| {
        let _ = native_tx.send(res);
    })
    .ok()
    .and_then(|mut w| match w.watch(&path, RecursiveMode::Recursive) {
        Ok(()) => Some(w),
        Err(e) => {
            warn!("could not watch {}: {}", path.display(), e);
            None
        }
    });

    let has_native = watcher.is_some();

    if has_native {
        let tx = tx.clone();
        std::thread::spawn(move || {
            while let Ok(res) = native_rx.recv() {
                match res {
                    Ok(event) => {
                        if let Some(translated) = translate(event) {
                            if tx.send((root, translated)).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("watch error: {} — falling back to rescan", e);
                        let _ = tx.send((root, WatchEvent::Rescan));
                    }
                }
            }
        });
    } else {
        // No native watcher: poll on a schedule instead.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_period) => {
                        if tx.send((root, WatchEvent::Rescan)).is_err() {
                            break;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    RootWatcher { _root: root, _inner: watcher, stop: stop_tx }
}

fn translate(event: Event) -> Option<WatchEvent> {
    match event.kind {
        EventKind::Create(_) => event.paths.into_iter().next().map(WatchEvent::New),
        EventKind::Remove(_) => event.paths.into_iter().next().map(WatchEvent::Deleted),
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() == 2 {
                Some(WatchEvent::Moved { from: event.paths[0].clone(), to: event.paths[1].clone() })
            } else {
                event.paths.into_iter().next().map(WatchEvent::ContentChanged)
            }
        }
        EventKind::Modify(_) => event.paths.into_iter().next().map(WatchEvent::ContentChanged),
        EventKind::Other => {
            debug!("unhandled watch event: {:?}", event);
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_create_event() {
        let event = Event::new(EventKind::Create(notify::event::CreateKind::File))
            .add_path(PathBuf::from("/tmp/a"));
        match translate(event) {
            Some(WatchEvent::New(p)) => assert_eq!(p, PathBuf::from("/tmp/a")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn translate_remove_event() {
        let event = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("/tmp/b"));
        match translate(event) {
            Some(WatchEvent::Deleted(p)) => assert_eq!(p, PathBuf::from("/tmp/b")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unwatchable_root_falls_back_to_polling() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bogus = PathBuf::from("/proc/__definitely_not_watchable__");
        let watcher = watch_root(RootId::generate(), bogus, Duration::from_millis(20), tx);
        let event = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(matches!(event, Ok(Some((_, WatchEvent::Rescan)))));
        watcher.stop();
    }
}
