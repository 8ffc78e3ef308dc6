//! Coordinates uploads across roots: change handling with grey-list
//! coalescing, the deadline-based backup scheduler, and the device-root
//! commit that publishes finished runs to the server's history.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::*;

use crate::counters::{self, Op};
use crate::error::Result;
use crate::hashing::{ObjSeq, ObjectId};
use crate::object::{self, DirEntry, Meta};
use crate::store::{HistoryEntry, ObjectStore, SnapshotKind};
use crate::walk::Upload;

/// Wait this long after the first change before starting a run.
pub const CDP_DELAY: Duration = Duration::from_secs(1);
/// Retry starting touched roots this often while a run blocks us.
const START_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Sweep the grey list this often.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(20);
/// Re-touch and expire grey-list entries older than this.
const GREY_MAX_AGE: Duration = Duration::from_secs(90);

/// A change reported by the platform monitor: the watched root and the
/// changed path relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileChangeEvent {
    pub root: Utf8PathBuf,
    pub file_name: Utf8PathBuf,
}

struct SchedState {
    deadline: Option<Instant>,
    quit: bool,
}

struct Shared {
    store: Arc<dyn ObjectStore>,
    uploads: Mutex<Vec<Arc<Upload>>>,
    /// Indices of uploads whose tree changed since the last scheduled run.
    touched: Mutex<FxHashSet<usize>>,
    /// Recently-seen change events, coalescing storms of writes to the
    /// same file into one touch.
    grey_list: Mutex<FxHashMap<FileChangeEvent, Instant>>,
    coalesce: bool,
    cdp_delay: Duration,
    sched: Mutex<SchedState>,
    sched_cv: Condvar,
    /// One device-root commit at a time.
    commit_lock: Mutex<()>,
}

/// Owns the uploads for every configured root and drives CDP-triggered
/// runs through its scheduler thread.
pub struct UploadManager {
    shared: Arc<Shared>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl UploadManager {
    /// `store` is used for device-root objects and history commits.
    /// Coalescing defaults to off on Linux (inotify already reports
    /// per-directory changes) and on elsewhere.
    pub fn new(store: Arc<dyn ObjectStore>) -> UploadManager {
        UploadManager::with_behavior(store, !cfg!(target_os = "linux"), CDP_DELAY)
    }

    pub fn with_behavior(
        store: Arc<dyn ObjectStore>,
        coalesce: bool,
        cdp_delay: Duration,
    ) -> UploadManager {
        UploadManager {
            shared: Arc::new(Shared {
                store,
                uploads: Mutex::new(Vec::new()),
                touched: Mutex::new(FxHashSet::default()),
                grey_list: Mutex::new(FxHashMap::default()),
                coalesce,
                cdp_delay,
                sched: Mutex::new(SchedState {
                    deadline: None,
                    quit: false,
                }),
                sched_cv: Condvar::new(),
                commit_lock: Mutex::new(()),
            }),
            scheduler: Mutex::new(None),
        }
    }

    pub fn add_upload_root(&self, upload: Arc<Upload>) {
        self.shared.uploads.lock().unwrap().push(upload);
    }

    pub fn uploads(&self) -> Vec<Arc<Upload>> {
        self.shared.uploads.lock().unwrap().clone()
    }

    pub fn is_working(&self) -> bool {
        self.uploads().iter().any(|u| u.is_working())
    }

    /// Kick off a run of every root, e.g. for a manual full backup.
    pub fn start_all(&self) {
        for up in self.uploads() {
            up.start();
        }
    }

    /// Block until no root is running.
    pub fn wait_all(&self) {
        for up in self.uploads() {
            up.wait();
        }
    }

    pub fn cancel_all(&self) {
        for up in self.uploads() {
            up.cancel();
        }
    }

    /// Start runs for roots with pending changes. True once none remain
    /// (all started, or nothing was touched).
    pub fn start_touched_roots(&self) -> bool {
        self.shared.start_touched_roots()
    }

    /// Feed one change event through the grey list into the watch trees,
    /// then nudge the scheduler.
    pub fn handle_change(&self, ev: FileChangeEvent) {
        if self.shared.coalesce {
            let now = Instant::now();
            let refresh_touch = {
                let mut glist = self.shared.grey_list.lock().unwrap();
                match glist.get_mut(&ev) {
                    None => {
                        glist.insert(ev.clone(), now);
                        true
                    }
                    Some(stamp) => {
                        // Seen recently: refresh the stamp and swallow the
                        // event, unless it's been held back too long.
                        let held_since = *stamp;
                        *stamp = now;
                        counters::bump(Op::GreyListRefresh);
                        trace!("Grey-listed change to {}", ev.file_name);
                        now.duration_since(held_since) > GREY_MAX_AGE
                    }
                }
            };
            if refresh_touch {
                self.shared.touch(&ev);
            }
        } else {
            self.shared.touch(&ev);
        }

        if !self.shared.touched.lock().unwrap().is_empty() {
            self.notify_change();
        }
    }

    /// Re-touch and drop grey-list entries older than the max age, so a
    /// file being written continuously still gets backed up.
    pub fn sweep_grey_list(&self) {
        if !self.shared.coalesce {
            return;
        }
        let expired: Vec<FileChangeEvent> = {
            let mut glist = self.shared.grey_list.lock().unwrap();
            let now = Instant::now();
            let expired = glist
                .iter()
                .filter(|(_ev, stamp)| now.duration_since(**stamp) > GREY_MAX_AGE)
                .map(|(ev, _stamp)| ev.clone())
                .collect::<Vec<_>>();
            for ev in &expired {
                glist.remove(ev);
            }
            expired
        };
        for ev in expired {
            counters::bump(Op::GreyListExpiry);
            debug!("Grey-list entry expired: {}", ev.file_name);
            self.shared.touch(&ev);
        }
        if !self.shared.touched.lock().unwrap().is_empty() {
            self.notify_change();
        }
    }

    /// Schedule a backup shortly, unless one is already scheduled.
    pub fn notify_change(&self) {
        let mut sched = self.shared.sched.lock().unwrap();
        if sched.deadline.is_none() {
            sched.deadline = Some(Instant::now() + self.shared.cdp_delay);
            debug!("Scheduled CDP backup in {:?}", self.shared.cdp_delay);
            self.shared.sched_cv.notify_one();
        } else {
            trace!("CDP backup already scheduled");
        }
    }

    /// Spawn the scheduler thread that sleeps on the deadline and starts
    /// touched roots when it expires.
    pub fn start_scheduler(&self) {
        let mut slot = self.scheduler.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let shared = self.shared.clone();
        *slot = Some(
            std::thread::Builder::new()
                .name("cdp-scheduler".into())
                .spawn(move || scheduler_loop(shared))
                .expect("Couldn't spawn scheduler thread"),
        );
    }

    /// Assemble the device root object - one directory entry per root,
    /// named after its path - and publish it to the device history.
    pub fn commit_device_root(&self) -> Result<()> {
        let _guard = self.shared.commit_lock.lock().unwrap();

        let now = Utc::now();
        let mut partial = false;
        let mut entries = Vec::new();
        for up in self.uploads() {
            let info = up.latest_snapshot();
            let Some(kind) = info.kind else {
                // This root has never finished; whatever we publish now is
                // at best a partial picture.
                partial = true;
                continue;
            };
            if kind == SnapshotKind::Partial {
                partial = true;
            }
            let meta = Meta::PosixDir {
                name: root_entry_name(up.root()),
                user: String::new(),
                group: String::new(),
                mode: 0o6666,
                mtime: now.timestamp() as u64,
                ctime: now.timestamp() as u64,
            }
            .encode();
            entries.push(DirEntry {
                refs: info.hash,
                meta,
                treesize: info.treesize,
            });
        }
        if entries.is_empty() {
            debug!("No publishable roots yet");
            return Ok(());
        }

        let mut root_seq = ObjSeq::new();
        let mut rest: &[DirEntry] = &entries;
        loop {
            let enc = object::encode_dir(rest, partial)?;
            rest = &rest[enc.consumed..];
            let id = ObjectId::hash(&enc.bytes);
            root_seq.push(id);
            if self.shared.store.test_object(&id)? {
                trace!("Device root object already on the server");
            } else {
                self.shared.store.upload_object(&enc.bytes)?;
            }
            if rest.is_empty() {
                break;
            }
        }

        let kind = if partial {
            SnapshotKind::Partial
        } else {
            SnapshotKind::Complete
        };
        info!("Uploading new device root {}", root_seq[0]);
        self.shared.store.commit_history(&HistoryEntry {
            tstamp: now,
            root: root_seq[0],
            kind,
        })
    }

    #[cfg(test)]
    fn grey_list_len(&self) -> usize {
        self.shared.grey_list.lock().unwrap().len()
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        {
            let mut sched = self.shared.sched.lock().unwrap();
            sched.quit = true;
            self.shared.sched_cv.notify_all();
        }
        if let Some(h) = self.scheduler.lock().unwrap().take() {
            let _ = h.join();
        }
    }
}

impl Shared {
    /// Route a change to the upload owning the watched root.
    fn touch(&self, ev: &FileChangeEvent) {
        let uploads = self.uploads.lock().unwrap().clone();
        for (i, up) in uploads.iter().enumerate() {
            if ev.root.starts_with(up.root()) {
                let abs = ev.root.join(&ev.file_name);
                if up.touch_path(&abs) {
                    self.touched.lock().unwrap().insert(i);
                }
                return;
            }
        }
        trace!("Change under {} matches no upload root", ev.root);
    }

    fn start_touched_roots(&self) -> bool {
        let uploads = self.uploads.lock().unwrap().clone();
        let mut touched = self.touched.lock().unwrap();
        // Keep the roots that refused to start (still running); the
        // scheduler will retry them.
        touched.retain(|i| !uploads[*i].start());
        touched.is_empty()
    }
}

fn scheduler_loop(shared: Arc<Shared>) {
    let mut sched = shared.sched.lock().unwrap();
    loop {
        if sched.quit {
            return;
        }
        match sched.deadline {
            None => {
                sched = shared.sched_cv.wait(sched).unwrap();
            }
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    let (guard, _timeout) = shared
                        .sched_cv
                        .wait_timeout(sched, deadline - now)
                        .unwrap();
                    sched = guard;
                    continue;
                }
                // Fire outside the lock; starting a run takes other locks.
                drop(sched);
                let done = shared.start_touched_roots();
                sched = shared.sched.lock().unwrap();
                if done {
                    debug!("Successfully initiated backup from CDP");
                    sched.deadline = None;
                } else {
                    debug!("Backup initiation from CDP failed - will retry");
                    sched.deadline = Some(Instant::now() + START_RETRY_DELAY);
                }
            }
        }
    }
}

fn root_entry_name(root: &Utf8Path) -> String {
    // Substitute separators (otherwise the web client breaks).
    root.as_str()
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}
