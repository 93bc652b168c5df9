use std::path::{Path, PathBuf};

use nix::sys::statvfs::{statvfs, Statvfs};

use crate::error::Result;

/// A single backing directory unioned into the mount.
///
/// `Source` is an opaque storage pool: callers never reach into it except
/// through [Source::path] (to build concrete paths) and the usage queries
/// below, all of which re-read the host filesystem on every call rather than
/// caching — sources are expected to change size out from under us whenever
/// the union is serving real traffic.
#[derive(Debug, Clone)]
pub struct Source {
    path: PathBuf,
}

/// A point-in-time snapshot of a [Source]'s usage, as reported by `statvfs(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

impl Source {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `join(self.path, rel)`, per the concrete-path definition in the data model.
    pub fn concrete_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.path.join(rel)
    }

    fn statvfs(&self) -> Result<Statvfs> {
        Ok(statvfs(&self.path)?)
    }

    /// Number of free blocks, in the source's own block size. Used by the
    /// router's free-space rule, which compares this field directly rather
    /// than bytes (matching the distilled source's own `f_bfree` comparison).
    pub fn free_blocks(&self) -> Result<u64> {
        Ok(self.statvfs()?.blocks_free() as u64)
    }

    pub fn usage(&self) -> Result<Usage> {
        let stv = self.statvfs()?;
        let frsize = stv.fragment_size() as u64;
        Ok(Usage {
            free_bytes: stv.blocks_available() as u64 * frsize,
            total_bytes: stv.blocks() as u64 * frsize,
            used_bytes: (stv.blocks() as u64 - stv.blocks_free() as u64) * frsize,
        })
    }

    pub fn free_bytes(&self) -> Result<u64> {
        Ok(self.usage()?.free_bytes)
    }
}

/// Field-by-field aggregate of every source's `statvfs`, per §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateStatvfs {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub files_available: u64,
    pub block_size: u64,
    pub fragment_size: u64,
    pub name_max: u64,
    pub flags: u64,
}

/// Merges per-source `statvfs` results according to the table in §4.2:
/// block/file-node counts sum, block/fragment size and flags take the first
/// source's value, and max filename length is the minimum across sources.
///
/// This is deliberately optimistic: the sum of free space is reported even
/// though no single file can straddle two sources. Returns the first error
/// encountered if any source's `statvfs` fails (no partial result, per §7).
pub fn aggregate_statvfs(sources: &[Source]) -> Result<AggregateStatvfs> {
    let mut stats = Vec::with_capacity(sources.len());
    for source in sources {
        stats.push(AggregateStatvfs::from_statvfs(&source.statvfs()?));
    }
    Ok(merge_statvfs(&stats))
}

impl AggregateStatvfs {
    fn from_statvfs(stv: &Statvfs) -> Self {
        Self {
            blocks: stv.blocks() as u64,
            blocks_free: stv.blocks_free() as u64,
            blocks_available: stv.blocks_available() as u64,
            files: stv.files() as u64,
            files_free: stv.files_free() as u64,
            files_available: stv.files_available() as u64,
            block_size: stv.block_size() as u64,
            fragment_size: stv.fragment_size() as u64,
            name_max: stv.name_max() as u64,
            flags: stv.flags().bits() as u64,
        }
    }
}

/// The pure merge step of [aggregate_statvfs], split out so it can be driven
/// by literal numbers in tests without needing host filesystems of an exact
/// known size.
fn merge_statvfs(stats: &[AggregateStatvfs]) -> AggregateStatvfs {
    let mut iter = stats.iter();
    let mut agg = *iter.next().expect("merge_statvfs called with no sources");

    for stv in iter {
        agg.blocks += stv.blocks;
        agg.blocks_free += stv.blocks_free;
        agg.blocks_available += stv.blocks_available;
        agg.files += stv.files;
        agg.files_free += stv.files_free;
        agg.files_available += stv.files_available;
        agg.name_max = agg.name_max.min(stv.name_max);
    }

    agg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(free: u64, total: u64) -> AggregateStatvfs {
        AggregateStatvfs {
            blocks: total,
            blocks_free: free,
            blocks_available: free,
            files: 0,
            files_free: 0,
            files_available: 0,
            block_size: 4096,
            fragment_size: 4096,
            name_max: 255,
            flags: 0,
        }
    }

    #[test]
    fn merge_sums_space_and_keeps_first_sources_block_size() {
        let merged = merge_statvfs(&[stats(1000, 2000), stats(1000, 2000)]);
        assert_eq!(merged.blocks_free, 2000);
        assert_eq!(merged.blocks, 4000);
        assert_eq!(merged.block_size, 4096);
        assert_eq!(merged.name_max, 255);
    }

    #[test]
    fn merge_keeps_first_sources_flags() {
        let mut a = stats(1000, 2000);
        a.flags = 0b101;
        let mut b = stats(1000, 2000);
        b.flags = 0b010;
        let merged = merge_statvfs(&[a, b]);
        assert_eq!(merged.flags, 0b101);
    }

    #[test]
    fn merge_takes_minimum_name_max() {
        let mut a = stats(1000, 2000);
        a.name_max = 255;
        let mut b = stats(1000, 2000);
        b.name_max = 143;
        let merged = merge_statvfs(&[a, b]);
        assert_eq!(merged.name_max, 143);
    }
}
