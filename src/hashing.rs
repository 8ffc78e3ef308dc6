//! Tools for hashing everything we store into a unique [`ObjectId`]

use std::fmt;

use anyhow::{Context, Result, ensure};
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

/// The hash (a SHA-256) that names every object in the store.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId {
    digest: [u8; 32],
}

/// An ordered sequence of object hashes composing one logical entity
/// (a chunked file, or a directory split across several objects).
pub type ObjSeq = Vec<ObjectId>;

impl ObjectId {
    /// Calculates an ID from the given bytes
    pub fn hash(bytes: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(bytes).into(),
        }
    }

    pub fn from_bytes(digest: [u8; 32]) -> Self {
        Self { digest }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Gets a git-like shortened version of the hash that's unique enough
    /// for most log lines.
    pub fn short_name(&self) -> String {
        let mut full = format!("{self}");
        let _rest = full.split_off(8);
        full
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ digest: {} }}", HEXLOWER.encode(&self.digest))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.digest))
    }
}

impl std::str::FromStr for ObjectId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .with_context(|| format!("Couldn't decode {s} as lowercase hex"))?;

        ensure!(bytes.len() == 32, "Expected a 64-character SHA-256 hex name");
        let mut digest = [0; 32];
        digest.copy_from_slice(&bytes);
        Ok(ObjectId { digest })
    }
}
