//! Decide which paths a backup admits.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::RegexSet;
use tracing::*;

/// Compiled admission rules shared by every worker of an engine instance.
///
/// The engine's own cache database is always excluded, or each run would
/// dirty it and re-trigger CDP forever.
pub struct Filter {
    skip_paths: Vec<Utf8PathBuf>,
    skip_names: RegexSet,
}

impl Filter {
    pub fn new(
        skip_paths: &[Utf8PathBuf],
        skip_patterns: &[String],
        skip_fstypes: &[String],
        cache_path: Option<&Utf8Path>,
    ) -> Result<Filter> {
        let skip_names =
            RegexSet::new(skip_patterns).context("Skip rules are not valid regex")?;
        let mut skip_paths = skip_paths.to_vec();
        skip_paths.extend(mounts_of_types(skip_fstypes)?);
        if let Some(c) = cache_path {
            skip_paths.push(c.to_owned());
        }
        Ok(Filter {
            skip_paths,
            skip_names,
        })
    }

    /// A filter that admits everything.
    pub fn admit_all() -> Filter {
        Filter {
            skip_paths: Vec::new(),
            skip_names: RegexSet::empty(),
        }
    }

    /// Should this absolute path be backed up?
    pub fn admits(&self, path: &Utf8Path) -> bool {
        if self.skip_paths.iter().any(|p| path.starts_with(p)) {
            return false;
        }
        if let Some(name) = path.file_name() {
            if self.skip_names.is_match(name) {
                return false;
            }
        }
        true
    }
}

/// Resolve excluded filesystem types to their current mount points.
#[cfg(target_os = "linux")]
fn mounts_of_types(types: &[String]) -> Result<Vec<Utf8PathBuf>> {
    if types.is_empty() {
        return Ok(Vec::new());
    }
    let mounts =
        std::fs::read_to_string("/proc/mounts").context("Couldn't read the mount table")?;
    let mut skipped = Vec::new();
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mountpoint), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if types.iter().any(|t| t == fstype) {
            debug!("Skipping {fstype} filesystem at {mountpoint}");
            skipped.push(Utf8PathBuf::from(mountpoint));
        }
    }
    Ok(skipped)
}

#[cfg(not(target_os = "linux"))]
fn mounts_of_types(_types: &[String]) -> Result<Vec<Utf8PathBuf>> {
    Ok(Vec::new())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn skips_paths_and_patterns() -> Result<()> {
        let f = Filter::new(
            &[Utf8PathBuf::from("/home/joe/tmp")],
            &[String::from(r"\.o$"), String::from(r"^~")],
            &[],
            Some(Utf8Path::new("/home/joe/.offsite-cache")),
        )?;

        assert!(f.admits(Utf8Path::new("/home/joe/code/main.rs")));
        assert!(!f.admits(Utf8Path::new("/home/joe/tmp/scratch")));
        assert!(!f.admits(Utf8Path::new("/home/joe/code/main.o")));
        assert!(!f.admits(Utf8Path::new("/home/joe/docs/~lockfile")));
        assert!(!f.admits(Utf8Path::new("/home/joe/.offsite-cache")));
        Ok(())
    }

    #[test]
    fn admit_all_admits_everything() {
        let f = Filter::admit_all();
        assert!(f.admits(Utf8Path::new("/anything/at/all")));
    }
}
