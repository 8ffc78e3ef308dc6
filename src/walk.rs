//! The parallel walker: scan directories, upload changed data, back-track
//! parents once every child finishes.
//!
//! Work items are (directory, phase) pairs in a queue ordered by depth,
//! greatest first, so all descendants of a directory finish before the
//! directory itself without unbounded recursion. A scan discovers child
//! directories; an upload serializes a directory's files and children into
//! directory objects. The worker that moves a parent's last incomplete
//! child observes it under the lock and schedules the parent's upload -
//! other workers just go back to the queue.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use tracing::*;

use crate::cache::{CObject, Cache, FsId};
use crate::counters::{self, Op};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::hashing::{ObjSeq, ObjectId};
use crate::object::{self, CHUNK_PAYLOAD, CHUNK_SIZE, DirEntry, Meta};
use crate::progress::{Event, EventSink, StatusBoard, WorkerState};
use crate::store::{ObjectStore, SnapshotKind};
use crate::watch::{WROOT, WatchTree, WnodeIx};

pub const DEFAULT_WORKERS: usize = 4;

/// Republish a partial snapshot this often during long runs.
const PARTIAL_INTERVAL: Duration = Duration::from_secs(60);

type DirIx = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scan,
    Upload,
}

/// Transient per-directory state for the current run.
///
/// Created when the parent scans the directory; freed when the parent's
/// upload has consumed it. The root frees itself on completion.
struct DirState {
    name: String,
    parent: Option<DirIx>,
    wnode: WnodeIx,
    depth: usize,
    /// Identity captured when the parent scanned us; its mtime/ctime feed
    /// our LoM record in the parent's listing.
    id: FsId,
    uid: u32,
    gid: u32,
    mode: u32,
    /// Object sequence and tree size, cached from the previous run until
    /// our own upload replaces them.
    hash: ObjSeq,
    treesize: u64,
    in_cache: bool,
    incomplete: FxHashSet<DirIx>,
    complete: Vec<DirIx>,
}

#[derive(Default)]
struct Arena {
    nodes: Vec<Option<DirState>>,
}

impl Arena {
    fn alloc(&mut self, d: DirState) -> DirIx {
        self.nodes.push(Some(d));
        self.nodes.len() - 1
    }

    fn get(&self, i: DirIx) -> &DirState {
        self.nodes[i].as_ref().expect("freed dirstate")
    }

    fn get_mut(&mut self, i: DirIx) -> &mut DirState {
        self.nodes[i].as_mut().expect("freed dirstate")
    }

    fn try_get(&self, i: DirIx) -> Option<&DirState> {
        self.nodes.get(i).and_then(|o| o.as_ref())
    }

    fn free(&mut self, i: DirIx) {
        self.nodes[i] = None;
    }

    fn abs_path(&self, i: DirIx) -> Utf8PathBuf {
        let mut names = Vec::new();
        let mut cur = Some(i);
        while let Some(c) = cur {
            let n = self.get(c);
            names.push(n.name.as_str());
            cur = n.parent;
        }
        let mut path = Utf8PathBuf::from(names.pop().unwrap());
        while let Some(n) = names.pop() {
            path.push(n);
        }
        path
    }
}

struct WorkQueue {
    /// Keyed by (depth, insertion order); popping the last entry picks the
    /// deepest pending item.
    items: BTreeMap<(usize, u64), (DirIx, Phase)>,
    seq: u64,
    /// How many workers currently hold an item. Bumped under this lock when
    /// an item is popped, so "queue empty and nobody busy" is exact.
    busy: usize,
    /// Set once the run is over; wakes idle workers so they exit.
    stopped: bool,
    completion_fired: bool,
}

/// Latest publishable root snapshot for an upload root.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub tstamp: DateTime<Utc>,
    /// None until the first run publishes something.
    pub kind: Option<SnapshotKind>,
    pub hash: ObjSeq,
    pub treesize: u64,
}

impl Default for SnapshotInfo {
    fn default() -> Self {
        Self {
            tstamp: DateTime::<Utc>::UNIX_EPOCH,
            kind: None,
            hash: ObjSeq::new(),
            treesize: 0,
        }
    }
}

struct Shared {
    root: Utf8PathBuf,
    cache: Arc<Cache>,
    store: Arc<dyn ObjectStore>,
    filter: Arc<Filter>,
    cancel: Arc<AtomicBool>,
    running: AtomicBool,
    queue: Mutex<WorkQueue>,
    queue_cv: Condvar,
    arena: Mutex<Arena>,
    wtree: Mutex<WatchTree>,
    status: StatusBoard,
    latest: Mutex<SnapshotInfo>,
    last_partial: Mutex<Instant>,
    events: EventSink,
}

/// One upload root and its walker machinery.
pub struct Upload {
    shared: Arc<Shared>,
    nworkers: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Upload {
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        cache: Arc<Cache>,
        store: Arc<dyn ObjectStore>,
        filter: Arc<Filter>,
        nworkers: usize,
        cancel: Arc<AtomicBool>,
        events: EventSink,
    ) -> Upload {
        let mut root = root.into();
        // Normalize away a trailing separator so prefix checks behave.
        if root.as_str().len() > 1 && root.as_str().ends_with(std::path::MAIN_SEPARATOR) {
            root = Utf8PathBuf::from(root.as_str().trim_end_matches(std::path::MAIN_SEPARATOR));
        }
        assert!(!root.as_str().is_empty(), "Empty backup root");
        Upload {
            shared: Arc::new(Shared {
                root,
                cache,
                store,
                filter,
                cancel,
                running: AtomicBool::new(false),
                queue: Mutex::new(WorkQueue {
                    items: BTreeMap::new(),
                    seq: 0,
                    busy: 0,
                    stopped: false,
                    completion_fired: false,
                }),
                queue_cv: Condvar::new(),
                arena: Mutex::new(Arena::default()),
                wtree: Mutex::new(WatchTree::new()),
                status: StatusBoard::default(),
                latest: Mutex::new(SnapshotInfo::default()),
                last_partial: Mutex::new(Instant::now()),
                events,
            }),
            nworkers: nworkers.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.shared.root
    }

    pub fn is_working(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn latest_snapshot(&self) -> SnapshotInfo {
        self.shared.latest.lock().unwrap().clone()
    }

    pub fn worker_status(&self) -> Vec<crate::progress::WorkerStatus> {
        self.shared.status.snapshot()
    }

    /// Ask the current run to stop. Pending work drains without executing;
    /// in-flight network retries raise [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);
    }

    /// Mark a changed absolute path in the watch tree.
    /// False if the path is filtered out or not under this root.
    pub fn touch_path(&self, abs: &Utf8Path) -> bool {
        if !self.shared.filter.admits(abs) {
            trace!("Touched path filtered - ignoring");
            return false;
        }
        let Ok(rel) = abs.strip_prefix(&self.shared.root) else {
            return false;
        };
        self.shared.wtree.lock().unwrap().touch_path(rel);
        true
    }

    /// Mark everything touched; the next run revisits the whole tree.
    pub fn touch_all(&self) {
        self.shared.wtree.lock().unwrap().touch_all();
    }

    /// Begin a run. Returns false if one is already active.
    pub fn start(&self) -> bool {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("Starting backup of {}", self.shared.root);

        // Collect workers from the previous run, if any.
        let mut workers = self.workers.lock().unwrap();
        for h in workers.drain(..) {
            let _ = h.join();
        }

        self.shared.cancel.store(false, Ordering::SeqCst);
        {
            let mut q = self.shared.queue.lock().unwrap();
            q.items.clear();
            q.busy = 0;
            q.stopped = false;
            q.completion_fired = false;
        }
        *self.shared.last_partial.lock().unwrap() = Instant::now();
        self.shared.wtree.lock().unwrap().queue_touched();

        let root_ix = {
            let mut arena = self.shared.arena.lock().unwrap();
            arena.nodes.clear();
            arena.alloc(DirState {
                name: self.shared.root.as_str().to_owned(),
                parent: None,
                wnode: WROOT,
                depth: 0,
                id: FsId::default(),
                uid: 0,
                gid: 0,
                mode: 0,
                hash: ObjSeq::new(),
                treesize: 0,
                in_cache: false,
                incomplete: FxHashSet::default(),
                complete: Vec::new(),
            })
        };
        enqueue(&self.shared, 0, root_ix, Phase::Scan);

        for i in 0..self.nworkers {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("walker-{i}"))
                .spawn(move || worker_loop(shared, i))
                .expect("Couldn't spawn worker thread");
            workers.push(handle);
        }
        true
    }

    /// Block until the current run finishes.
    pub fn wait(&self) {
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for h in handles {
            let _ = h.join();
        }
    }
}

fn enqueue(sh: &Shared, depth: usize, dir: DirIx, phase: Phase) {
    let mut q = sh.queue.lock().unwrap();
    let seq = q.seq;
    q.seq += 1;
    q.items.insert((depth, seq), (dir, phase));
    sh.queue_cv.notify_one();
}

fn get_work_item(sh: &Shared) -> Option<(DirIx, Phase)> {
    let mut q = sh.queue.lock().unwrap();
    loop {
        if let Some((_key, item)) = q.items.pop_last() {
            q.busy += 1;
            return Some(item);
        }
        if q.stopped {
            return None;
        }
        q = sh.queue_cv.wait(q).unwrap();
    }
}

/// Called by a worker after executing an item: if the queue is empty and
/// every worker is idle, the run is over. Exactly one worker fires the
/// completion notification.
fn finish_item(sh: &Shared) {
    let mut q = sh.queue.lock().unwrap();
    q.busy -= 1;
    if q.items.is_empty() && q.busy == 0 && !q.completion_fired {
        q.completion_fired = true;
        q.stopped = true;
        let cancelled = sh.cancel.load(Ordering::SeqCst);
        info!(
            "Backup of {} {}",
            sh.root,
            if cancelled { "cancelled" } else { "finished" }
        );
        sh.events.publish(Event::RunFinished { cancelled });
        sh.running.store(false, Ordering::SeqCst);
        sh.queue_cv.notify_all();
    }
}

fn worker_loop(sh: Arc<Shared>, ndx: usize) {
    let mut users = UserNames::default();
    loop {
        sh.status.set(ndx, WorkerState::Idle, "", None);
        let Some((dir, phase)) = get_work_item(&sh) else {
            debug!("Work queue empty, worker exit");
            return;
        };
        let res = match phase {
            Phase::Scan => process_scan(&sh, ndx, dir),
            Phase::Upload => process_upload(&sh, ndx, dir, &mut users),
        };
        if let Err(e) = res {
            match e {
                Error::Cancelled => debug!("Worker {ndx} unwound from cancellation"),
                e => warn!("Aborting backup: {e}"),
            }
            sh.cancel.store(true, Ordering::SeqCst);
        }
        finish_item(&sh);
    }
}

#[cfg(unix)]
fn ownership(meta: &fs::Metadata) -> (u32, u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid(), meta.mode())
}

/// Memoised uid/gid name lookups; files in one tree usually share owners.
#[derive(Default)]
struct UserNames {
    last_user: Option<(u32, String)>,
    last_group: Option<(u32, String)>,
}

#[cfg(unix)]
impl UserNames {
    fn user_name(&mut self, uid: u32) -> String {
        if let Some((u, n)) = &self.last_user {
            if *u == uid {
                return n.clone();
            }
        }
        let name = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| uid.to_string());
        self.last_user = Some((uid, name.clone()));
        name
    }

    fn group_name(&mut self, gid: u32) -> String {
        if let Some((g, n)) = &self.last_group {
            if *g == gid {
                return n.clone();
            }
        }
        let name = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.name)
            .unwrap_or_else(|| gid.to_string());
        self.last_group = Some((gid, name.clone()));
        name
    }
}

fn process_scan(sh: &Arc<Shared>, ndx: usize, dir: DirIx) -> Result<()> {
    if sh.cancel.load(Ordering::Relaxed) {
        return Ok(());
    }
    let (path, depth) = {
        let arena = sh.arena.lock().unwrap();
        (arena.abs_path(dir), arena.get(dir).depth)
    };
    sh.status.set(ndx, WorkerState::Scanning, path.as_str(), None);
    debug!("Scanning {path}");

    if scan(sh, dir, &path)? {
        // All children were registered as incomplete before any got
        // enqueued, so an early finisher can't conclude we're ready.
        let children: Vec<(usize, DirIx)> = {
            let arena = sh.arena.lock().unwrap();
            arena
                .get(dir)
                .incomplete
                .iter()
                .map(|c| (arena.get(*c).depth, *c))
                .collect()
        };
        for (d, c) in children {
            enqueue(sh, d, c, Phase::Scan);
        }
        trace!("{path} has incomplete children; a descendant will back-track");
        return Ok(());
    }

    enqueue(sh, depth, dir, Phase::Upload);
    Ok(())
}

/// List subdirectories, looking each up in the cache and the watch tree.
/// Returns true if the directory has incomplete children and will be
/// back-tracked to.
fn scan(sh: &Arc<Shared>, dir: DirIx, path: &Utf8Path) -> Result<bool> {
    let rd = match fs::read_dir(path) {
        Ok(rd) => rd,
        Err(e) => {
            info!("Skipping (couldn't open {path}: {e})");
            return Ok(false);
        }
    };
    let parent_wnode = sh.arena.lock().unwrap().get(dir).wnode;

    for entry in rd {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                info!("Scan skipping an entry under {path}: {e}");
                continue;
            }
        };
        let name = match entry.file_name().into_string() {
            Ok(n) => n,
            Err(n) => {
                info!("Scan skipping non-UTF-8 name {n:?} under {path}");
                continue;
            }
        };
        let abspath = path.join(&name);
        let meta = match fs::symlink_metadata(&abspath) {
            Ok(m) => m,
            Err(e) => {
                info!("Scan skipping (couldn't stat {abspath}: {e})");
                continue;
            }
        };
        // Files are handled during the upload pass.
        if !meta.file_type().is_dir() {
            continue;
        }
        if !sh.filter.admits(&abspath) {
            trace!("Filter skipping {abspath}");
            continue;
        }

        let id = FsId::of(&meta);
        let cached = match sh.cache.read_obj(&id) {
            Ok(c) => c,
            Err(e) => {
                warn!("Cache read failed for {abspath}: {e:#}");
                None
            }
        };
        let (cobj, unchanged) = match cached {
            Some((c, u)) => (Some(c), u),
            None => (None, false),
        };

        let (wnode, queued) = {
            let mut wt = sh.wtree.lock().unwrap();
            let w = wt.child(parent_wnode, &name);
            (w, wt.queued(w))
        };

        let (uid, gid, mode) = ownership(&meta);
        let mut arena = sh.arena.lock().unwrap();
        let depth = arena.get(dir).depth + 1;
        let in_cache = cobj.is_some();
        let (hash, treesize) = cobj.map(|c| (c.hash, c.treesize)).unwrap_or_default();
        let child = arena.alloc(DirState {
            name,
            parent: Some(dir),
            wnode,
            depth,
            id,
            uid,
            gid,
            mode,
            hash,
            treesize,
            in_cache,
            incomplete: FxHashSet::default(),
            complete: Vec::new(),
        });
        if !queued && unchanged && in_cache {
            // Nothing under it changed and we know its hashes: take the
            // shortcut and never descend.
            counters::bump(Op::DirTraversalSkipped);
            trace!("Skipping traversal of unchanged {abspath}");
            arena.get_mut(dir).complete.push(child);
        } else {
            arena.get_mut(dir).incomplete.insert(child);
        }
    }

    Ok(!sh.arena.lock().unwrap().get(dir).incomplete.is_empty())
}

fn process_upload(sh: &Arc<Shared>, ndx: usize, dir: DirIx, users: &mut UserNames) -> Result<()> {
    if sh.cancel.load(Ordering::Relaxed) {
        return Ok(());
    }
    let path = sh.arena.lock().unwrap().abs_path(dir);
    debug!("Directory {path} is ready - will upload");
    upload_dir(sh, ndx, dir, &path, users)?;
    {
        let wnode = sh.arena.lock().unwrap().get(dir).wnode;
        // No longer queued for this run.
        sh.wtree.lock().unwrap().set_queued(wnode, false);
    }

    let mut schedule_parent = None;
    let mut publish_chain = Vec::new();
    let mut completed_root = false;
    {
        let mut arena = sh.arena.lock().unwrap();
        let complete = std::mem::take(&mut arena.get_mut(dir).complete);
        for c in complete {
            arena.free(c);
        }
        debug_assert!(
            arena.get(dir).incomplete.is_empty(),
            "Ended upload of a directory with incomplete children"
        );

        match arena.get(dir).parent {
            Some(p) => {
                // Two workers can finish sibling children concurrently;
                // only the one that sees the parent run out of incomplete
                // children here schedules it.
                arena.get_mut(p).incomplete.remove(&dir);
                arena.get_mut(p).complete.push(dir);
                if arena.get(p).incomplete.is_empty() {
                    schedule_parent = Some((arena.get(p).depth, p));
                } else {
                    trace!(
                        "Parent of {path} still has {} unprocessed children",
                        arena.get(p).incomplete.len()
                    );
                    let mut up = Some(p);
                    while let Some(i) = up {
                        publish_chain.push(i);
                        up = arena.get(i).parent;
                    }
                }
            }
            None => completed_root = true,
        }
    }

    if let Some((depth, p)) = schedule_parent {
        debug!("Parent of {path} is eligible for upload. Stepping up");
        enqueue(sh, depth, p, Phase::Upload);
        return Ok(());
    }

    if completed_root {
        sh.status.set(ndx, WorkerState::Finishing, "", None);
        debug!("Ended processing of root {path}");
        let (hash, treesize) = {
            let arena = sh.arena.lock().unwrap();
            let st = arena.get(dir);
            (st.hash.clone(), st.treesize)
        };
        {
            let mut latest = sh.latest.lock().unwrap();
            *latest = SnapshotInfo {
                tstamp: Utc::now(),
                kind: Some(SnapshotKind::Complete),
                hash: hash.clone(),
                treesize,
            };
        }
        sh.events.publish(Event::Snapshot {
            kind: SnapshotKind::Complete,
            root: hash,
            treesize,
        });
        sh.arena.lock().unwrap().free(dir);
        return Ok(());
    }

    // The parent isn't ready. Long runs publish visible progress by
    // re-serializing the ancestor chain as partial objects now and then.
    maybe_publish_partial(sh, ndx, publish_chain, users)
}

fn maybe_publish_partial(
    sh: &Arc<Shared>,
    ndx: usize,
    chain: Vec<DirIx>,
    users: &mut UserNames,
) -> Result<()> {
    {
        let mut last = sh.last_partial.lock().unwrap();
        if last.elapsed() < PARTIAL_INTERVAL {
            return Ok(());
        }
        *last = Instant::now();
    }

    for i in &chain {
        let Some(path) = ({
            let arena = sh.arena.lock().unwrap();
            arena.try_get(*i).map(|_| arena.abs_path(*i))
        }) else {
            // Consumed by its parent since we collected the chain; its
            // fresher state is already part of an ancestor's upload.
            continue;
        };
        info!("Creating partial snapshot of {path}");
        upload_dir(sh, ndx, *i, &path, users)?;
    }

    let root_ix = *chain.last().expect("partial chain can't be empty");
    let (hash, treesize) = {
        let arena = sh.arena.lock().unwrap();
        match arena.try_get(root_ix) {
            Some(st) => (st.hash.clone(), st.treesize),
            None => return Ok(()),
        }
    };
    if hash.is_empty() {
        return Ok(());
    }
    {
        let mut latest = sh.latest.lock().unwrap();
        *latest = SnapshotInfo {
            tstamp: Utc::now(),
            kind: Some(SnapshotKind::Partial),
            hash: hash.clone(),
            treesize,
        };
    }
    debug!("Partial snapshot created: {}", hash[0]);
    sh.events.publish(Event::Snapshot {
        kind: SnapshotKind::Partial,
        root: hash,
        treesize,
    });
    Ok(())
}

/// Everything we need to know about one child directory to serialize its
/// entry into the parent's listing.
struct ChildEntry {
    name: String,
    id: FsId,
    uid: u32,
    gid: u32,
    mode: u32,
    hash: ObjSeq,
    treesize: u64,
}

/// Serialize a directory: upload changed file data, then encode and upload
/// the directory object(s) referencing files and child directories.
fn upload_dir(
    sh: &Arc<Shared>,
    ndx: usize,
    dir: DirIx,
    path: &Utf8Path,
    users: &mut UserNames,
) -> Result<()> {
    let rd = match fs::read_dir(path) {
        Ok(rd) => rd,
        // If the directory disappeared, handle gracefully.
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
            info!("Skipping (couldn't open {path}: {e})");
            return Ok(());
        }
        Err(e) => return Err(Error::Filesystem(e)),
    };

    // Stable name order: identical directories must produce identical
    // objects on every run, or nothing deduplicates.
    let mut names = Vec::new();
    for entry in rd {
        match entry {
            Ok(e) => match e.file_name().into_string() {
                Ok(n) => names.push(n),
                Err(n) => info!("Skipping non-UTF-8 name {n:?} under {path}"),
            },
            Err(e) => info!("Skipping an entry under {path}: {e}"),
        }
    }
    names.sort();

    let mut entries: Vec<DirEntry> = Vec::new();

    for name in &names {
        if sh.cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        let abspath = path.join(name);
        let meta = match fs::symlink_metadata(&abspath) {
            Ok(m) => m,
            Err(e) => {
                info!("Skipping (couldn't stat {abspath}: {e})");
                continue;
            }
        };
        // Directories come from our completed children below; anything
        // else (symlinks, sockets, devices) isn't backed up.
        if !meta.file_type().is_file() {
            continue;
        }
        if !sh.filter.admits(&abspath) {
            trace!("Filter skipping {abspath}");
            continue;
        }

        let id = FsId::of(&meta);
        let cached = match sh.cache.read_obj(&id) {
            Ok(c) => c,
            Err(e) => {
                warn!("Cache read failed for {abspath}: {e:#}");
                None
            }
        };
        let (prev, unchanged) = match cached {
            Some((c, u)) => (Some(c), u),
            None => (None, false),
        };
        let was_cached = prev.is_some();

        let (uid, gid, mode) = ownership(&meta);
        let lom = Meta::PosixFile {
            name: name.clone(),
            user: users.user_name(uid),
            group: users.group_name(gid),
            mode: mode & 0o7777,
            mtime: id.mtime as u64,
            ctime: id.ctime as u64,
            size: meta.len(),
        }
        .encode();

        let (hash, treesize, data_changed) = match prev {
            Some(p) if unchanged => {
                // Contents are known to be on the server; don't even open
                // the file.
                counters::bump(Op::FileUnchanged);
                trace!("{abspath} is known and unchanged");
                (p.hash, p.treesize, false)
            }
            _ => {
                trace!("{abspath} contents are new or changed");
                sh.status.set(
                    ndx,
                    WorkerState::Uploading,
                    name,
                    (meta.len() as usize > CHUNK_SIZE).then_some(0.0),
                );
                match upload_file_data(sh, ndx, &abspath, name, meta.len())? {
                    Some((hash, treesize)) => (hash, treesize, true),
                    None => continue, // couldn't open; skipped
                }
            }
        };

        // The cache write is the last step, after the store acknowledged
        // every chunk. A crash before this point re-uploads; it never
        // invents acknowledged state.
        let cobj = CObject {
            id,
            hash: hash.clone(),
            treesize,
        };
        let cache_res = if was_cached {
            if data_changed { sh.cache.update(&cobj) } else { Ok(()) }
        } else {
            sh.cache.insert(&cobj)
        };
        if let Err(e) = cache_res {
            warn!("Couldn't cache {abspath}: {e:#}");
        }

        entries.push(DirEntry {
            refs: hash,
            meta: lom,
            treesize,
        });
    }

    // Child directories were processed earlier; serialize their entries
    // from the state captured at scan time, again in stable name order.
    let (mut children, partial, existing, in_cache, self_id, has_parent) = {
        let mut arena = sh.arena.lock().unwrap();
        let Some(st) = arena.nodes.get_mut(dir).and_then(|o| o.as_mut()) else {
            return Ok(());
        };
        let partial = !st.incomplete.is_empty();
        let existing = std::mem::take(&mut st.hash);
        let in_cache = st.in_cache;
        let self_id = st.id;
        let has_parent = st.parent.is_some();
        let child_ixs: Vec<DirIx> = st.complete.iter().chain(st.incomplete.iter()).copied().collect();
        let children: Vec<ChildEntry> = child_ixs
            .into_iter()
            .map(|c| {
                let ch = arena.get(c);
                ChildEntry {
                    name: ch.name.clone(),
                    id: ch.id,
                    uid: ch.uid,
                    gid: ch.gid,
                    mode: ch.mode,
                    hash: ch.hash.clone(),
                    treesize: ch.treesize,
                }
            })
            .collect();
        (children, partial, existing, in_cache, self_id, has_parent)
    };
    children.sort_by(|a, b| a.name.cmp(&b.name));

    for c in children {
        let lom = Meta::PosixDir {
            name: c.name,
            user: users.user_name(c.uid),
            group: users.group_name(c.gid),
            mode: c.mode & 0o7777,
            mtime: c.id.mtime as u64,
            ctime: c.id.ctime as u64,
        }
        .encode();
        entries.push(DirEntry {
            refs: c.hash,
            meta: lom,
            treesize: c.treesize,
        });
    }

    debug!("Done with all entries under {path} - will encode directory object(s)");
    sh.status.set(ndx, WorkerState::Uploading, path.as_str(), None);

    let mut new_hash = ObjSeq::new();
    let mut total = 0u64;
    let mut rest: &[DirEntry] = &entries;
    loop {
        let enc = object::encode_dir(rest, partial)?;
        rest = &rest[enc.consumed..];
        let id = ObjectId::hash(&enc.bytes);
        total += enc.treesize;
        new_hash.push(id);

        // If our cached objseq already names this object at the same
        // index, it was uploaded on a previous run; skip even the HEAD.
        let ith = new_hash.len() - 1;
        if in_cache && existing.len() > ith && existing[ith] == id {
            counters::bump(Op::DirObjectReused);
            trace!("Directory object {id} previously uploaded");
        } else if sh.store.test_object(&id)? {
            counters::bump(Op::HeadPresent);
            trace!("Directory object {id} already on the server");
        } else {
            counters::bump(Op::HeadAbsent);
            sh.store.upload_object(&enc.bytes)?;
            counters::bump(Op::ObjectUpload);
        }

        if rest.is_empty() {
            break;
        }
    }

    {
        let mut arena = sh.arena.lock().unwrap();
        if let Some(st) = arena.nodes.get_mut(dir).and_then(|o| o.as_mut()) {
            st.hash = new_hash.clone();
            st.treesize = total;
            st.in_cache = st.in_cache || has_parent;
        }
    }

    // The root has no identity captured by a parent scan; it is never
    // cached.
    if has_parent {
        let cobj = CObject {
            id: self_id,
            hash: new_hash,
            treesize: total,
        };
        let res = if in_cache {
            sh.cache.update(&cobj)
        } else {
            sh.cache.insert(&cobj)
        };
        if let Err(e) = res {
            warn!("Couldn't cache {path}: {e:#}");
        }
    }
    Ok(())
}

/// Read a file in fixed-size chunks, uploading any chunk the server lacks.
/// Returns None if the file couldn't be opened (logged and skipped).
fn upload_file_data(
    sh: &Arc<Shared>,
    ndx: usize,
    path: &Utf8Path,
    name: &str,
    file_size: u64,
) -> Result<Option<(ObjSeq, u64)>> {
    let mut fh = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!("Unable to open file {path} ({e}) - skipping");
            return Ok(None);
        }
    };

    let mut hashes = ObjSeq::new();
    let mut treesize = 0u64;
    loop {
        if sh.cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        let mut chunk = Vec::with_capacity(CHUNK_SIZE);
        chunk.push(object::VERSION);
        chunk.push(object::KIND_FILE_DATA);
        let read = match read_up_to(&mut fh, &mut chunk, CHUNK_PAYLOAD) {
            Ok(n) => n,
            Err(e) => {
                // Already-uploaded chunks stay on the server; the file just
                // isn't recorded this run.
                info!("Skipping {path} (read failed: {e})");
                return Ok(None);
            }
        };
        if read == 0 {
            break;
        }

        let id = ObjectId::hash(&chunk);
        if sh.store.test_object(&id)? {
            counters::bump(Op::HeadPresent);
            trace!("Chunk {id} already exists on the server");
        } else {
            counters::bump(Op::HeadAbsent);
            trace!("Chunk {id} needs upload");
            sh.store.upload_object(&chunk)?;
            counters::bump(Op::ObjectUpload);
        }

        treesize += chunk.len() as u64;
        hashes.push(id);

        if file_size as usize > CHUNK_SIZE {
            let frac = (treesize as f64 / file_size as f64).min(1.0);
            sh.status.set(ndx, WorkerState::Uploading, name, Some(frac));
        }

        // A short chunk means end of file. Stop rather than tailing a file
        // that's still growing.
        if read < CHUNK_PAYLOAD {
            break;
        }
    }

    Ok(Some((hashes, treesize)))
}

fn read_up_to(r: &mut impl Read, buf: &mut Vec<u8>, limit: usize) -> io::Result<usize> {
    let start = buf.len();
    buf.resize(start + limit, 0);
    let mut total = 0;
    while total < limit {
        match r.read(&mut buf[start + total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(start + total);
    Ok(total)
}
