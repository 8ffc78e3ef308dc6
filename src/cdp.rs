//! Platform change monitoring: OS file-change notifications become
//! [`FileChangeEvent`]s fed through the manager's grey list, and a one-
//! second tick drives the periodic grey-list sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::*;

use crate::manager::{FileChangeEvent, SWEEP_INTERVAL, UploadManager};

/// Watches upload roots and feeds change events to the manager until
/// dropped.
pub struct DirMonitor {
    // Dropping the watcher stops the event stream.
    _watcher: RecommendedWatcher,
    quit: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DirMonitor {
    pub fn spawn(manager: Arc<UploadManager>, roots: &[Utf8PathBuf]) -> Result<DirMonitor> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // The receiver hanging up just means we're shutting down.
            let _ = tx.send(res);
        })
        .context("Couldn't create filesystem watcher")?;
        for root in roots {
            watcher
                .watch(root.as_std_path(), RecursiveMode::Recursive)
                .with_context(|| format!("Couldn't watch {root}"))?;
            info!("Watching {root}");
        }

        let quit = Arc::new(AtomicBool::new(false));
        let thread = {
            let roots = roots.to_vec();
            let quit = quit.clone();
            std::thread::Builder::new()
                .name("cdp-monitor".into())
                .spawn(move || monitor_loop(manager, roots, rx, quit))
                .context("Couldn't spawn monitor thread")?
        };

        Ok(DirMonitor {
            _watcher: watcher,
            quit,
            thread: Some(thread),
        })
    }
}

impl Drop for DirMonitor {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
        if let Some(h) = self.thread.take() {
            let _ = h.join();
        }
    }
}

fn monitor_loop(
    manager: Arc<UploadManager>,
    roots: Vec<Utf8PathBuf>,
    rx: mpsc::Receiver<notify::Result<notify::Event>>,
    quit: Arc<AtomicBool>,
) {
    let mut last_sweep = Instant::now();
    loop {
        if quit.load(Ordering::SeqCst) {
            return;
        }
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Ok(event)) => {
                for path in &event.paths {
                    let Some(path) = Utf8Path::from_path(path) else {
                        trace!("Ignoring change to non-UTF-8 path {path:?}");
                        continue;
                    };
                    let Some(ev) = event_for(&roots, path) else {
                        continue;
                    };
                    trace!("Changed: {} under {}", ev.file_name, ev.root);
                    manager.handle_change(ev);
                }
            }
            Ok(Err(e)) => warn!("Watch error: {e}"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            manager.sweep_grey_list();
            last_sweep = Instant::now();
        }
    }
}

/// Associate a changed path with the watched root containing it.
fn event_for(roots: &[Utf8PathBuf], path: &Utf8Path) -> Option<FileChangeEvent> {
    let root = roots.iter().find(|r| path.starts_with(r))?;
    let file_name = path.strip_prefix(root).ok()?.to_owned();
    Some(FileChangeEvent {
        root: root.clone(),
        file_name,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn events_map_to_their_root() {
        let roots = vec![
            Utf8PathBuf::from("/home/joe"),
            Utf8PathBuf::from("/srv/data"),
        ];
        let ev = event_for(&roots, Utf8Path::new("/srv/data/logs/app.log")).unwrap();
        assert_eq!(ev.root, Utf8PathBuf::from("/srv/data"));
        assert_eq!(ev.file_name, Utf8PathBuf::from("logs/app.log"));

        assert!(event_for(&roots, Utf8Path::new("/etc/passwd")).is_none());
    }
}
