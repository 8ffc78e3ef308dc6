//! The versioned binary object format.
//!
//! Every object starts with a version byte and a kind byte. File-data
//! objects carry raw file bytes after the header. Directory objects carry a
//! tree size, a list of references (LoR - one hash sequence per child) and a
//! parallel list of metadata records (LoM - one type-tagged record per
//! child). Directory listings too large for one object are split greedily;
//! the resulting objects form the directory's object sequence.
//!
//! The format is a stable external interface: identical inputs must encode
//! to identical bytes, or deduplication against previous runs breaks.

use crate::error::{Error, Result};
use crate::hashing::{ObjSeq, ObjectId};

/// Maximum size of any encoded object, headers included.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Room left for file bytes once the two header bytes are written.
pub const CHUNK_PAYLOAD: usize = CHUNK_SIZE - 2;

pub const VERSION: u8 = 0x00;
pub const KIND_FILE_DATA: u8 = 0xfd;
pub const KIND_DIR_COMPLETE: u8 = 0xde;
pub const KIND_DIR_PARTIAL: u8 = 0xdd;

const TAG_POSIX_FILE: u8 = 0x01;
const TAG_POSIX_DIR: u8 = 0x02;
const TAG_WINDOWS_FILE: u8 = 0x11;
const TAG_WINDOWS_DIR: u8 = 0x12;

// Serialisation - big endian, most significant byte first.
// Strings are a u32 length followed by UTF-8 bytes; hash sequences are a
// u32 count followed by 32 raw bytes per hash.

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_u32(out, s.len() as u32);
    out.extend_from_slice(s.as_bytes());
}

fn put_seq(out: &mut Vec<u8>, seq: &[ObjectId]) {
    put_u32(out, seq.len() as u32);
    for id in seq {
        out.extend_from_slice(id.as_bytes());
    }
}

/// De-serialisation over a borrowed buffer, tracking the current offset.
struct Reader<'a> {
    buf: &'a [u8],
    ofs: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, ofs: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.ofs
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Malformed(format!("object ended before {what}")));
        }
        let s = &self.buf[self.ofs..self.ofs + n];
        self.ofs += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4, "u32")?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8, "u64")?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len, "string")?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Malformed("string is not UTF-8".into()))
    }

    fn seq(&mut self) -> Result<ObjSeq> {
        let len = self.u32()? as usize;
        let mut seq = ObjSeq::with_capacity(len);
        for _ in 0..len {
            let raw = self.take(32, "hash sequence")?;
            seq.push(ObjectId::from_bytes(raw.try_into().unwrap()));
        }
        Ok(seq)
    }
}

/// One LoM record - the metadata of a single directory entry.
///
/// Times are seconds since the epoch. Windows records carry the file
/// attributes and security descriptor string instead of mode bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Meta {
    PosixFile {
        name: String,
        user: String,
        group: String,
        mode: u32,
        mtime: u64,
        ctime: u64,
        size: u64,
    },
    PosixDir {
        name: String,
        user: String,
        group: String,
        mode: u32,
        mtime: u64,
        ctime: u64,
    },
    WindowsFile {
        name: String,
        owner: String,
        attributes: u32,
        sddl: String,
        mtime: u64,
        btime: u64,
        size: u64,
    },
    WindowsDir {
        name: String,
        owner: String,
        attributes: u32,
        sddl: String,
        mtime: u64,
        btime: u64,
    },
}

impl Meta {
    pub fn name(&self) -> &str {
        match self {
            Meta::PosixFile { name, .. }
            | Meta::PosixDir { name, .. }
            | Meta::WindowsFile { name, .. }
            | Meta::WindowsDir { name, .. } => name,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Meta::PosixDir { .. } | Meta::WindowsDir { .. })
    }

    pub fn encode(&self) -> Vec<u8> {
        // A few kilobytes per entry at most; names dominate.
        let mut out = Vec::with_capacity(128);
        match self {
            Meta::PosixFile {
                name,
                user,
                group,
                mode,
                mtime,
                ctime,
                size,
            } => {
                out.push(TAG_POSIX_FILE);
                put_str(&mut out, name);
                put_str(&mut out, user);
                put_str(&mut out, group);
                put_u32(&mut out, *mode);
                put_u64(&mut out, *mtime);
                put_u64(&mut out, *ctime);
                put_u64(&mut out, *size);
            }
            Meta::PosixDir {
                name,
                user,
                group,
                mode,
                mtime,
                ctime,
            } => {
                out.push(TAG_POSIX_DIR);
                put_str(&mut out, name);
                put_str(&mut out, user);
                put_str(&mut out, group);
                put_u32(&mut out, *mode);
                put_u64(&mut out, *mtime);
                put_u64(&mut out, *ctime);
            }
            Meta::WindowsFile {
                name,
                owner,
                attributes,
                sddl,
                mtime,
                btime,
                size,
            } => {
                out.push(TAG_WINDOWS_FILE);
                put_str(&mut out, name);
                put_str(&mut out, owner);
                put_u32(&mut out, *attributes);
                put_str(&mut out, sddl);
                put_u64(&mut out, *mtime);
                put_u64(&mut out, *btime);
                put_u64(&mut out, *size);
            }
            Meta::WindowsDir {
                name,
                owner,
                attributes,
                sddl,
                mtime,
                btime,
            } => {
                out.push(TAG_WINDOWS_DIR);
                put_str(&mut out, name);
                put_str(&mut out, owner);
                put_u32(&mut out, *attributes);
                put_str(&mut out, sddl);
                put_u64(&mut out, *mtime);
                put_u64(&mut out, *btime);
            }
        }
        out
    }

    fn decode_from(r: &mut Reader) -> Result<Meta> {
        let tag = r.u8()?;
        let m = match tag {
            TAG_POSIX_FILE => Meta::PosixFile {
                name: r.string()?,
                user: r.string()?,
                group: r.string()?,
                mode: r.u32()?,
                mtime: r.u64()?,
                ctime: r.u64()?,
                size: r.u64()?,
            },
            TAG_POSIX_DIR => Meta::PosixDir {
                name: r.string()?,
                user: r.string()?,
                group: r.string()?,
                mode: r.u32()?,
                mtime: r.u64()?,
                ctime: r.u64()?,
            },
            TAG_WINDOWS_FILE => Meta::WindowsFile {
                name: r.string()?,
                owner: r.string()?,
                attributes: r.u32()?,
                sddl: r.string()?,
                mtime: r.u64()?,
                btime: r.u64()?,
                size: r.u64()?,
            },
            TAG_WINDOWS_DIR => Meta::WindowsDir {
                name: r.string()?,
                owner: r.string()?,
                attributes: r.u32()?,
                sddl: r.string()?,
                mtime: r.u64()?,
                btime: r.u64()?,
            },
            t => return Err(Error::Malformed(format!("unknown LoM tag {t:#04x}"))),
        };
        Ok(m)
    }

    /// Decode a single record from the front of a buffer,
    /// returning it and the bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Meta, usize)> {
        let mut r = Reader::new(buf);
        let m = Meta::decode_from(&mut r)?;
        Ok((m, r.ofs))
    }
}

/// One directory entry waiting to be packed: the child's reference list,
/// its encoded LoM record, and its tree size.
///
/// The entry order of a listing is significant - the encoder packs from the
/// front, and the n'th LoM record describes the n'th LoR entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub refs: ObjSeq,
    pub meta: Vec<u8>,
    pub treesize: u64,
}

pub struct EncodedDir {
    pub bytes: Vec<u8>,
    pub treesize: u64,
    /// How many leading entries were packed.
    pub consumed: usize,
}

/// Greedily pack as many leading entries as fit into one directory object.
///
/// The written tree size is the children's tree sizes plus this object's own
/// encoded size. An empty entry list encodes to the 14-byte empty directory.
/// A first entry that alone exceeds the size limit (a file of roughly half a
/// tebibyte) fails with [`Error::OversizedEntry`].
pub fn encode_dir(entries: &[DirEntry], partial: bool) -> Result<EncodedDir> {
    // Version, kind, tree size, LoR length.
    let mut head_size = 1 + 1 + 8 + 4;
    let mut lom_size = 0usize;
    let mut treesize = 0u64;
    let mut n = 0usize;

    for e in entries {
        // 32 bytes per hash in the LoR, plus its length prefix.
        let hs_add = 4 + e.refs.len() * 32;
        let ls_add = e.meta.len();
        if head_size + hs_add + lom_size + ls_add < CHUNK_SIZE {
            head_size += hs_add;
            lom_size += ls_add;
            treesize += e.treesize;
            n += 1;
        } else {
            break;
        }
    }

    if n == 0 && !entries.is_empty() {
        return Err(Error::OversizedEntry);
    }

    // Sum of ourselves plus our children.
    treesize += (head_size + lom_size) as u64;

    let mut out = Vec::with_capacity(head_size + lom_size);
    out.push(VERSION);
    out.push(if partial {
        KIND_DIR_PARTIAL
    } else {
        KIND_DIR_COMPLETE
    });
    put_u64(&mut out, treesize);
    put_u32(&mut out, n as u32);
    for e in &entries[..n] {
        put_seq(&mut out, &e.refs);
    }
    for e in &entries[..n] {
        out.extend_from_slice(&e.meta);
    }

    Ok(EncodedDir {
        bytes: out,
        treesize,
        consumed: n,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirKind {
    Complete,
    Partial,
}

pub struct DecodedDir {
    pub kind: DirKind,
    pub treesize: u64,
    pub entries: Vec<(ObjSeq, Meta)>,
}

/// Parse one directory object.
pub fn decode_dir(buf: &[u8]) -> Result<DecodedDir> {
    let mut r = Reader::new(buf);
    let version = r.u8()?;
    if version != VERSION {
        return Err(Error::Malformed(format!(
            "unknown object version {version:#04x}"
        )));
    }
    let kind = match r.u8()? {
        KIND_DIR_COMPLETE => DirKind::Complete,
        KIND_DIR_PARTIAL => DirKind::Partial,
        k => return Err(Error::Malformed(format!("not a directory object ({k:#04x})"))),
    };
    let treesize = r.u64()?;
    let n = r.u32()? as usize;
    // Each entry costs at least a LoR length prefix and a LoM tag.
    if n > buf.len() / 5 {
        return Err(Error::Malformed(format!(
            "listing claims {n} entries in {} bytes",
            buf.len()
        )));
    }
    let mut refs = Vec::with_capacity(n);
    for _ in 0..n {
        refs.push(r.seq()?);
    }
    let mut entries = Vec::with_capacity(n);
    for lor in refs {
        entries.push((lor, Meta::decode_from(&mut r)?));
    }
    if r.remaining() != 0 {
        return Err(Error::Malformed(format!(
            "{} trailing bytes after directory listing",
            r.remaining()
        )));
    }
    Ok(DecodedDir {
        kind,
        treesize,
        entries,
    })
}

/// Frame one chunk of file bytes as a file-data object.
pub fn file_chunk(payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= CHUNK_PAYLOAD);
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.push(VERSION);
    out.push(KIND_FILE_DATA);
    out.extend_from_slice(payload);
    out
}

/// The raw file bytes of a file-data object.
pub fn file_chunk_payload(obj: &[u8]) -> Result<&[u8]> {
    if obj.len() < 2 || obj[0] != VERSION || obj[1] != KIND_FILE_DATA {
        return Err(Error::Malformed("not a file-data object".into()));
    }
    Ok(&obj[2..])
}

#[cfg(test)]
mod test {
    use super::*;

    fn file_meta(name: &str) -> Meta {
        Meta::PosixFile {
            name: name.into(),
            user: "joe".into(),
            group: "staff".into(),
            mode: 0o644,
            mtime: 1365578757,
            ctime: 1365578757,
            size: 42,
        }
    }

    #[test]
    fn meta_round_trips() -> Result<()> {
        let records = [
            file_meta("hello.txt"),
            Meta::PosixDir {
                name: "src".into(),
                user: "joe".into(),
                group: "staff".into(),
                mode: 0o755,
                mtime: 1365578757,
                ctime: 1365578760,
            },
            Meta::WindowsFile {
                name: "hello.txt".into(),
                owner: "JOE-PC\\joe".into(),
                attributes: 0x20,
                sddl: "O:BAG:SY".into(),
                mtime: 1365578757,
                btime: 1365571234,
                size: 42,
            },
            Meta::WindowsDir {
                name: "src".into(),
                owner: "JOE-PC\\joe".into(),
                attributes: 0x10,
                sddl: "O:BAG:SY".into(),
                mtime: 1365578757,
                btime: 1365571234,
            },
        ];
        for m in records {
            let bytes = m.encode();
            let (back, used) = Meta::decode(&bytes)?;
            assert_eq!(back, m);
            assert_eq!(used, bytes.len());
        }
        Ok(())
    }

    #[test]
    fn empty_directory() -> Result<()> {
        let enc = encode_dir(&[], false)?;
        assert_eq!(enc.consumed, 0);
        assert_eq!(enc.treesize, 14);
        // version, kind, treesize = 14, zero entries
        assert_eq!(
            enc.bytes,
            [0x00, 0xde, 0, 0, 0, 0, 0, 0, 0, 14, 0, 0, 0, 0]
        );

        let dec = decode_dir(&enc.bytes)?;
        assert_eq!(dec.kind, DirKind::Complete);
        assert_eq!(dec.treesize, 14);
        assert!(dec.entries.is_empty());
        Ok(())
    }

    #[test]
    fn partial_kind_byte() -> Result<()> {
        let enc = encode_dir(&[], true)?;
        assert_eq!(enc.bytes[1], KIND_DIR_PARTIAL);
        assert_eq!(decode_dir(&enc.bytes)?.kind, DirKind::Partial);
        Ok(())
    }

    #[test]
    fn listing_round_trips() -> Result<()> {
        let entries = vec![
            DirEntry {
                refs: vec![ObjectId::hash(b"chunk one"), ObjectId::hash(b"chunk two")],
                meta: file_meta("big.bin").encode(),
                treesize: 100,
            },
            DirEntry {
                refs: vec![ObjectId::hash(b"a subtree")],
                meta: Meta::PosixDir {
                    name: "sub".into(),
                    user: "joe".into(),
                    group: "staff".into(),
                    mode: 0o755,
                    mtime: 1,
                    ctime: 2,
                }
                .encode(),
                treesize: 50,
            },
        ];
        let enc = encode_dir(&entries, false)?;
        assert_eq!(enc.consumed, 2);
        assert_eq!(enc.treesize, 150 + enc.bytes.len() as u64);

        let dec = decode_dir(&enc.bytes)?;
        assert_eq!(dec.entries.len(), 2);
        assert_eq!(dec.entries[0].0, entries[0].refs);
        assert_eq!(dec.entries[0].1.name(), "big.bin");
        assert_eq!(dec.entries[1].0, entries[1].refs);
        assert!(dec.entries[1].1.is_dir());
        Ok(())
    }

    /// An entry list that exactly fills one object stays whole;
    /// one byte more splits it in two.
    #[test]
    fn split_boundary() -> Result<()> {
        // head (14) + LoR (4 + 32) + LoM must come in under CHUNK_SIZE.
        let lom_budget = CHUNK_SIZE - 14 - (4 + 32) - 1;
        let mut meta = file_meta("x").encode();
        let pad = lom_budget - meta.len();
        // Grow the name's payload to hit the budget exactly. The name length
        // prefix sits at offset 1; patch it and splice in padding.
        let name_len = u32::from_be_bytes(meta[1..5].try_into().unwrap());
        meta.splice(5 + name_len as usize..5 + name_len as usize, std::iter::repeat(b'x').take(pad));
        let new_len = (name_len as usize + pad) as u32;
        meta[1..5].copy_from_slice(&new_len.to_be_bytes());

        let small = DirEntry {
            refs: vec![ObjectId::hash(b"tiny")],
            meta: file_meta("y").encode(),
            treesize: 1,
        };

        let exact = DirEntry {
            refs: vec![ObjectId::hash(b"chunk")],
            meta: meta.clone(),
            treesize: 7,
        };
        let enc = encode_dir(&[exact.clone(), small.clone()], false)?;
        assert_eq!(enc.consumed, 1);
        assert_eq!(enc.bytes.len(), CHUNK_SIZE - 1);

        // One more byte of metadata and the entry no longer fits at all.
        let mut bigger = meta;
        let name_len = u32::from_be_bytes(bigger[1..5].try_into().unwrap());
        bigger.splice(5..5, std::iter::once(b'x'));
        bigger[1..5].copy_from_slice(&(name_len + 1).to_be_bytes());
        let over = DirEntry {
            refs: vec![ObjectId::hash(b"chunk")],
            meta: bigger,
            treesize: 7,
        };
        assert!(matches!(
            encode_dir(&[over], false),
            Err(Error::OversizedEntry)
        ));
        Ok(())
    }

    #[test]
    fn greedy_packing_consumes_prefix() -> Result<()> {
        // Three entries, each taking roughly half the budget: the first
        // object takes one, the next call takes the rest.
        let half = CHUNK_SIZE / 2;
        let big = DirEntry {
            refs: vec![ObjectId::hash(b"c")],
            meta: vec![0x01; half],
            treesize: 10,
        };
        let entries = vec![big.clone(), big.clone(), big];
        let first = encode_dir(&entries, false)?;
        assert_eq!(first.consumed, 1);
        let second = encode_dir(&entries[first.consumed..], false)?;
        assert_eq!(second.consumed, 1);
        let third = encode_dir(&entries[first.consumed + second.consumed..], false)?;
        assert_eq!(third.consumed, 1);
        Ok(())
    }

    #[test]
    fn file_chunk_framing() -> Result<()> {
        let obj = file_chunk(b"some file bytes");
        assert_eq!(&obj[..2], &[VERSION, KIND_FILE_DATA]);
        assert_eq!(file_chunk_payload(&obj)?, b"some file bytes");
        assert!(file_chunk_payload(&[0x00, 0xde]).is_err());
        Ok(())
    }

    #[test]
    fn truncated_objects_are_malformed() {
        let enc = encode_dir(&[], false).unwrap();
        for cut in 1..enc.bytes.len() {
            assert!(decode_dir(&enc.bytes[..cut]).is_err());
        }
    }
}
