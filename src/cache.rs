//! The local metadata cache: filesystem identity to uploaded object state.
//!
//! One invariant keeps this map honest: a row exists only if every hash it
//! names has been acknowledged by the server. Rows are therefore written
//! after upload confirmation, never before, so an unclean shutdown can lose
//! work but can never invent it.

use std::sync::Mutex;

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::Connection;
use tracing::*;

use crate::hashing::{ObjSeq, ObjectId};

/// Filesystem identity of one file or directory.
///
/// On POSIX this is device + inode plus the mtime/ctime pair; Windows would
/// use the volume serial, file ID, write time and creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FsId {
    pub dev: u64,
    pub ino: u64,
    pub mtime: i64,
    pub ctime: i64,
}

#[cfg(unix)]
impl FsId {
    pub fn of(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
        }
    }
}

/// A cached record: identity plus the object sequence and tree size the
/// entity last uploaded as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CObject {
    pub id: FsId,
    pub hash: ObjSeq,
    pub treesize: u64,
}

/// Persistent identity map, safe for concurrent use by worker threads.
pub struct Cache {
    inner: Mutex<Inner>,
}

struct Inner {
    path: Utf8PathBuf,
    conn: Option<Connection>,
}

impl Inner {
    fn conn(&mut self) -> Result<&Connection> {
        if self.conn.is_none() {
            self.conn = Some(open_db(&self.path)?);
        }
        Ok(self.conn.as_ref().unwrap())
    }
}

fn open_db(path: &Utf8Path) -> Result<Connection> {
    let mut conn = Connection::open(path.as_std_path())
        .with_context(|| format!("Couldn't open cache {path}"))?;
    let tx = conn.transaction()?;
    let ver: i32 = tx.query_row("PRAGMA user_version", (), |r| r.get(0))?;
    if ver < 1 {
        tx.execute(
            "CREATE TABLE objects (
                dev INTEGER NOT NULL,
                ino INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                ctime INTEGER NOT NULL,
                treesize INTEGER NOT NULL,
                hashes BLOB NOT NULL,
                PRIMARY KEY (dev, ino)
            ) STRICT",
            (),
        )?;
    }
    tx.execute("PRAGMA user_version=1", ())?;
    tx.commit()?;

    let jm: String = conn.query_row("PRAGMA journal_mode=wal", (), |r| r.get(0))?;
    // In-memory databases (tests) don't do WAL.
    debug_assert!(jm == "wal" || jm == "memory");

    Ok(conn)
}

fn pack_hashes(seq: &ObjSeq) -> Vec<u8> {
    let mut blob = Vec::with_capacity(seq.len() * 32);
    for id in seq {
        blob.extend_from_slice(id.as_bytes());
    }
    blob
}

fn unpack_hashes(blob: &[u8]) -> Result<ObjSeq> {
    ensure!(blob.len() % 32 == 0, "Cached hash blob has a torn length");
    Ok(blob
        .chunks_exact(32)
        .map(|c| ObjectId::from_bytes(c.try_into().unwrap()))
        .collect())
}

impl Cache {
    pub fn open<P: Into<Utf8PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let conn = open_db(&path)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                path,
                conn: Some(conn),
            }),
        })
    }

    pub fn path(&self) -> Utf8PathBuf {
        self.inner.lock().unwrap().path.clone()
    }

    /// Look up an identity. Returns the cached record (with the queried
    /// identity) and whether the stored mtime/ctime still match - if they
    /// do, the entity's data is known to be on the server already.
    pub fn read_obj(&self, id: &FsId) -> Result<Option<(CObject, bool)>> {
        let mut inner = self.inner.lock().unwrap();
        let conn = inner.conn()?;
        let rows = conn
            .prepare("SELECT mtime, ctime, treesize, hashes FROM objects WHERE dev = ?1 AND ino = ?2")?
            .query_map((id.dev as i64, id.ino as i64), |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        assert!(rows.len() <= 1);
        let Some((mtime, ctime, treesize, blob)) = rows.into_iter().next() else {
            return Ok(None);
        };
        let unchanged = mtime == id.mtime && ctime == id.ctime;
        Ok(Some((
            CObject {
                id: *id,
                hash: unpack_hashes(&blob)?,
                treesize: treesize as u64,
            },
            unchanged,
        )))
    }

    fn upsert(&self, c: &CObject) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let conn = inner.conn()?;
        conn.execute(
            "REPLACE INTO objects(dev, ino, mtime, ctime, treesize, hashes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                c.id.dev as i64,
                c.id.ino as i64,
                c.id.mtime,
                c.id.ctime,
                c.treesize as i64,
                pack_hashes(&c.hash),
            ),
        )?;
        Ok(())
    }

    pub fn insert(&self, c: &CObject) -> Result<()> {
        self.upsert(c)
    }

    pub fn update(&self, c: &CObject) -> Result<()> {
        self.upsert(c)
    }

    /// Switch to a different backing file. Used on device re-registration.
    pub fn change_cache<P: Into<Utf8PathBuf>>(&self, path: P) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.conn = None;
        inner.path = path.into();
        inner.conn()?;
        Ok(())
    }

    /// Drop every cached identity.
    pub fn clear_cache(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.conn()?.execute("DELETE FROM objects", ())?;
        Ok(())
    }

    /// Close the database handle; the next operation reopens it.
    pub fn quiesce(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.conn.take().is_some() {
            debug!("Cache {} quiesced", inner.path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn some_cobj() -> CObject {
        CObject {
            id: FsId {
                dev: 2049,
                ino: 1234567,
                mtime: 1365578757,
                ctime: 1365578758,
            },
            hash: vec![ObjectId::hash(b"chunk 1"), ObjectId::hash(b"chunk 2")],
            treesize: 12345678,
        }
    }

    #[test]
    fn smoke() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Utf8PathBuf::try_from(dir.path().join("cache.db")).unwrap();
        let cache = Cache::open(&db)?;

        let c = some_cobj();
        assert!(cache.read_obj(&c.id)?.is_none());

        cache.insert(&c)?;
        let (read, unchanged) = cache.read_obj(&c.id)?.unwrap();
        assert_eq!(read, c);
        assert!(unchanged);
        Ok(())
    }

    #[test]
    fn changed_times_flag_stale_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Utf8PathBuf::try_from(dir.path().join("cache.db")).unwrap();
        let cache = Cache::open(&db)?;

        let c = some_cobj();
        cache.insert(&c)?;

        // Same dev/ino, newer mtime: the row hits but is stale.
        let newer = FsId {
            mtime: c.id.mtime + 5,
            ..c.id
        };
        let (read, unchanged) = cache.read_obj(&newer)?.unwrap();
        assert!(!unchanged);
        assert_eq!(read.hash, c.hash);

        // The caller re-uploads and updates; now the row matches again.
        let refreshed = CObject {
            id: newer,
            hash: vec![ObjectId::hash(b"new chunk")],
            treesize: 99,
        };
        cache.update(&refreshed)?;
        let (read, unchanged) = cache.read_obj(&newer)?.unwrap();
        assert!(unchanged);
        assert_eq!(read, refreshed);
        Ok(())
    }

    #[test]
    fn survives_quiesce_and_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Utf8PathBuf::try_from(dir.path().join("cache.db")).unwrap();

        let c = some_cobj();
        {
            let cache = Cache::open(&db)?;
            cache.insert(&c)?;
            cache.quiesce();
            // Reopens transparently.
            assert!(cache.read_obj(&c.id)?.is_some());
        }
        let cache = Cache::open(&db)?;
        assert!(cache.read_obj(&c.id)?.is_some());
        Ok(())
    }

    #[test]
    fn clear_cache_drops_everything() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Utf8PathBuf::try_from(dir.path().join("cache.db")).unwrap();
        let cache = Cache::open(&db)?;

        cache.insert(&some_cobj())?;
        cache.clear_cache()?;
        assert!(cache.read_obj(&some_cobj().id)?.is_none());
        Ok(())
    }

    #[test]
    fn change_cache_switches_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let a = Utf8PathBuf::try_from(dir.path().join("a.db")).unwrap();
        let b = Utf8PathBuf::try_from(dir.path().join("b.db")).unwrap();

        let cache = Cache::open(&a)?;
        cache.insert(&some_cobj())?;
        cache.change_cache(&b)?;
        assert!(cache.read_obj(&some_cobj().id)?.is_none());
        assert_eq!(cache.path(), b);
        Ok(())
    }
}
