use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::source::{Source, Usage};

/// A single relocation the balancer performed (or would perform, in
/// `dry_run` mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub name: OsString,
    pub from: PathBuf,
    pub to: PathBuf,
    pub size: u64,
}

/// Mutable per-source bookkeeping the balance pass updates as it commits
/// moves, so later decisions in the same run see the effect of earlier ones.
struct BalanceSource {
    source: Source,
    free_bytes: u64,
    used_bytes: u64,
}

struct SourceFile {
    rel_name: OsString,
    full_path: PathBuf,
    size: u64,
}

/// Redistributes whole top-level entries across sources to equalize
/// `used_bytes`, per §4.3.
///
/// The balancer is an offline tool: it assumes the sources are quiescent
/// (the union is unmounted, or no other writer is touching them) and takes
/// no locks of its own.
pub struct Balancer {
    sources: Vec<Source>,
}

impl Balancer {
    pub fn new(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    /// Runs one balance pass. With `dry_run`, produces the same `Move` log
    /// but performs no filesystem mutation.
    #[instrument(skip(self))]
    pub fn balance(&self, dry_run: bool) -> Result<Vec<Move>> {
        let mut usages = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            usages.push(source.usage()?);
        }
        plan_and_execute(&self.sources, usages, dry_run)
    }
}

/// The algorithm in §4.3, parameterized over `usages` rather than reading
/// them from the host: lets tests drive exact `used_bytes`/`free_bytes`
/// figures without needing quota-controlled filesystems, while still
/// exercising the real move/copy machinery against temp directories.
fn plan_and_execute(sources: &[Source], usages: Vec<Usage>, dry_run: bool) -> Result<Vec<Move>> {
    let mut balance_sources: Vec<BalanceSource> = sources
        .iter()
        .zip(usages)
        .map(|(source, usage)| BalanceSource {
            source: source.clone(),
            free_bytes: usage.free_bytes,
            used_bytes: usage.used_bytes,
        })
        .collect();

    let target: f64 = balance_sources.iter().map(|s| s.used_bytes as f64).sum::<f64>()
        / balance_sources.len() as f64;

    let mut overloaded: Vec<usize> = (0..balance_sources.len())
        .filter(|&i| balance_sources[i].used_bytes as f64 > target)
        .collect();
    // Ascending: least-overloaded source is drained first. Decided and
    // documented in DESIGN.md rather than reversed to "most overloaded
    // first", which the distilled source's own comment claims but its
    // code does not implement.
    overloaded.sort_by_key(|&i| balance_sources[i].used_bytes);

    let mut underloaded: Vec<usize> = (0..balance_sources.len())
        .filter(|&i| balance_sources[i].used_bytes as f64 <= target)
        .collect();
    underloaded.sort_by(|&a, &b| {
        let a = &balance_sources[a];
        let b = &balance_sources[b];
        (b.used_bytes, b.source.path()).cmp(&(a.used_bytes, a.source.path()))
    });

    let mut moves = Vec::new();

    for &o_idx in &overloaded {
        let mut entries = list_top_level_with_sizes(balance_sources[o_idx].source.path())?;
        // Largest first; ties broken by lexicographically later name first.
        entries.sort_by(|a, b| (b.size, &b.rel_name).cmp(&(a.size, &a.rel_name)));

        let mut moved_this_pass: Vec<OsString> = Vec::new();

        for &d_idx in &underloaded {
            for entry in &entries {
                if moved_this_pass.contains(&entry.rel_name) {
                    continue;
                }

                let o_used = balance_sources[o_idx].used_bytes;
                let (d_used, d_free) = (
                    balance_sources[d_idx].used_bytes,
                    balance_sources[d_idx].free_bytes,
                );

                let fits = d_free as f64 - entry.size as f64 >= 0.0;
                let no_overshoot = d_used as f64 + entry.size as f64 <= target;
                let no_undershoot = o_used as f64 - entry.size as f64 >= target;

                if !(fits && no_overshoot && no_undershoot) {
                    continue;
                }

                let dest_path = balance_sources[d_idx]
                    .source
                    .concrete_path(&entry.rel_name);

                info!(
                    entry = ?entry.rel_name,
                    from = %balance_sources[o_idx].source.path().display(),
                    to = %balance_sources[d_idx].source.path().display(),
                    size = entry.size,
                    dry_run,
                    "balancer move"
                );

                if !dry_run {
                    if let Err(failure) = relocate(&entry.full_path, &dest_path) {
                        warn!(
                            entry = ?entry.rel_name,
                            from = %entry.full_path.display(),
                            to = %dest_path.display(),
                            error = %failure.error,
                            destructive = failure.destructive,
                            "move failed"
                        );
                        if failure.destructive {
                            return Err(failure.error);
                        }
                        // The original is still intact (the copy either never
                        // started or failed before touching it); skip this
                        // entry and let the pass continue with the rest.
                        continue;
                    }
                }

                balance_sources[o_idx].used_bytes -= entry.size;
                balance_sources[o_idx].free_bytes += entry.size;
                balance_sources[d_idx].used_bytes += entry.size;
                balance_sources[d_idx].free_bytes -= entry.size;

                moved_this_pass.push(entry.rel_name.clone());
                moves.push(Move {
                    name: entry.rel_name.clone(),
                    from: entry.full_path.clone(),
                    to: dest_path,
                    size: entry.size,
                });
            }
        }
    }

    Ok(moves)
}

/// Lists the top-level entries of `source_root` with their computed sizes:
/// a file's own size, a directory's recursive sum of regular-file sizes, or
/// a symlink's link size.
fn list_top_level_with_sizes(source_root: &Path) -> Result<Vec<SourceFile>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(source_root).map_err(|e| Error::SourceUnreadable {
        path: source_root.to_path_buf(),
        source: e,
    })? {
        let entry = entry.map_err(|e| Error::SourceUnreadable {
            path: source_root.to_path_buf(),
            source: e,
        })?;
        let rel_name = entry.file_name();
        let full_path = entry.path();
        let size = path_size(&full_path)?;
        out.push(SourceFile {
            rel_name,
            full_path,
            size,
        });
    }
    Ok(out)
}

fn path_size(path: &Path) -> Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_symlink() {
        return Ok(meta.len());
    }
    if meta.is_file() {
        return Ok(meta.len());
    }

    let mut total = 0u64;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|e| {
            Error::from(e.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walkdir failure")
            }))
        })?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(|e| {
                Error::from(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walkdir metadata failure")
                }))
            })?.len();
        }
    }
    Ok(total)
}

/// A `relocate` failure, distinguishing whether the original at `from` is
/// still intact.
///
/// `destructive` is set only for the window between a successful copy and a
/// failed removal of the original: at that point the entry exists in both
/// places, and retrying or skipping it silently could duplicate or lose data
/// on a later pass. Every other failure mode (the rename itself, or the copy
/// failing before the original is touched) leaves `from` exactly as it was.
struct RelocateFailure {
    destructive: bool,
    error: Error,
}

/// Moves the whole entry at `from` to `to`: a rename if both paths share a
/// device, otherwise a recursive copy followed by removal of the original.
/// Per §4.3's failure semantics, a failed copy must leave the original
/// intact; we only remove `from` after every file has been copied.
fn relocate(from: &Path, to: &Path) -> std::result::Result<(), RelocateFailure> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            warn!(from = %from.display(), to = %to.display(), "cross-device move, falling back to copy");
            if let Err(error) = copy_recursive(from, to) {
                return Err(RelocateFailure {
                    destructive: false,
                    error,
                });
            }
            match fs::remove_dir_all(from).or_else(|_| fs::remove_file(from)) {
                Ok(()) => Ok(()),
                Err(e) => Err(RelocateFailure {
                    destructive: true,
                    error: e.into(),
                }),
            }
        }
        Err(e) => Err(RelocateFailure {
            destructive: false,
            error: e.into(),
        }),
    }
}

fn copy_recursive(from: &Path, to: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(from)?;
    if meta.is_symlink() {
        let target = fs::read_link(from)?;
        std::os::unix::fs::symlink(target, to)?;
        return Ok(());
    }
    if meta.is_file() {
        fs::copy(from, to)?;
        return Ok(());
    }

    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let child_to = to.join(entry.file_name());
        copy_recursive(&entry.path(), &child_to)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_file(path: &Path, size: usize) {
        fs::write(path, vec![b'x'; size]).unwrap();
    }

    #[test]
    fn list_top_level_sizes_sums_directory_contents() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        write_file(&dir.path().join("d").join("a"), 10);
        write_file(&dir.path().join("d").join("b"), 20);
        write_file(&dir.path().join("f"), 5);

        let entries = list_top_level_with_sizes(dir.path()).unwrap();
        let mut by_name: std::collections::HashMap<_, _> =
            entries.into_iter().map(|e| (e.rel_name, e.size)).collect();
        assert_eq!(by_name.remove(&OsString::from("d")), Some(30));
        assert_eq!(by_name.remove(&OsString::from("f")), Some(5));
    }

    fn usage(used: u64, total: u64) -> Usage {
        Usage {
            used_bytes: used,
            total_bytes: total,
            free_bytes: total - used,
        }
    }

    #[test]
    fn balance_single_file_splits_evenly() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        write_file(&d0.path().join("a"), 100);
        write_file(&d0.path().join("b"), 100);

        let sources = vec![Source::new(d0.path()), Source::new(d1.path())];
        let usages = vec![usage(200, 200), usage(0, 200)];

        let moves = plan_and_execute(&sources, usages, false).unwrap();
        assert_eq!(moves.len(), 1, "exactly one of a/b should move");

        let d0_remaining: Vec<_> = fs::read_dir(d0.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        let d1_remaining: Vec<_> = fs::read_dir(d1.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(d0_remaining.len(), 1);
        assert_eq!(d1_remaining.len(), 1);

        let mut total = 0u64;
        for entry in fs::read_dir(d0.path()).unwrap() {
            total += path_size(&entry.unwrap().path()).unwrap();
        }
        assert_eq!(total, 100);
        let mut total = 0u64;
        for entry in fs::read_dir(d1.path()).unwrap() {
            total += path_size(&entry.unwrap().path()).unwrap();
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn balance_respects_floor_and_makes_no_move() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        write_file(&d0.path().join("a"), 100);

        let sources = vec![Source::new(d0.path()), Source::new(d1.path())];
        let usages = vec![usage(100, 200), usage(0, 200)];

        let moves = plan_and_execute(&sources, usages, false).unwrap();
        assert!(moves.is_empty(), "moving the only file would undershoot the target");
        assert!(d0.path().join("a").exists());
    }

    #[test]
    fn balance_moves_biggest_entry_first() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        write_file(&d1.path().join("big"), 50);
        for i in 0..5 {
            write_file(&d1.path().join(format!("small_{i}")), 10);
        }

        let sources = vec![Source::new(d0.path()), Source::new(d1.path())];
        let usages = vec![usage(0, 200), usage(100, 200)];

        let moves = plan_and_execute(&sources, usages, false).unwrap();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].name, OsString::from("big"));

        assert!(d0.path().join("big").exists());
        assert!(!d1.path().join("big").exists());
        for i in 0..5 {
            assert!(d1.path().join(format!("small_{i}")).exists());
        }
    }

    #[test]
    fn balance_dry_run_performs_no_filesystem_mutation() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        write_file(&d0.path().join("a"), 100);
        write_file(&d0.path().join("b"), 100);

        let sources = vec![Source::new(d0.path()), Source::new(d1.path())];
        let usages = vec![usage(200, 200), usage(0, 200)];

        let moves = plan_and_execute(&sources, usages, true).unwrap();
        assert_eq!(moves.len(), 1);
        assert!(d0.path().join("a").exists());
        assert!(d0.path().join("b").exists());
        assert_eq!(fs::read_dir(d1.path()).unwrap().count(), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn dir_used_bytes(dir: &Path) -> u64 {
            fs::read_dir(dir)
                .unwrap()
                .map(|e| path_size(&e.unwrap().path()).unwrap())
                .sum()
        }

        fn write_files(dir: &Path, sizes: &[u64]) -> u64 {
            for (i, size) in sizes.iter().enumerate() {
                write_file(&dir.join(format!("f{i}")), *size as usize);
            }
            sizes.iter().sum()
        }

        proptest! {
            #[test]
            fn never_overshoots_or_undershoots(sizes in proptest::collection::vec(1u64..30, 1..6)) {
                let d0 = TempDir::new().unwrap();
                let d1 = TempDir::new().unwrap();
                let total_size = write_files(d0.path(), &sizes);
                let total = total_size * 2 + 10;
                let target = total_size as f64 / 2.0;

                let sources = vec![Source::new(d0.path()), Source::new(d1.path())];
                let usages = vec![
                    usage(total_size, total),
                    usage(0, total),
                ];

                let moves = plan_and_execute(&sources, usages, false).unwrap();
                let max_moved = moves.iter().map(|m| m.size).max().unwrap_or(0) as f64;

                let d0_used = dir_used_bytes(d0.path()) as f64;
                let d1_used = dir_used_bytes(d1.path()) as f64;

                prop_assert!(d1_used <= target + max_moved + 1.0);
                prop_assert!(moves.is_empty() || d0_used >= target - 1.0);
            }

            #[test]
            fn balancing_twice_in_a_row_performs_no_further_moves(
                sizes in proptest::collection::vec(1u64..30, 1..6)
            ) {
                let d0 = TempDir::new().unwrap();
                let d1 = TempDir::new().unwrap();
                let total_size = write_files(d0.path(), &sizes);
                let total = total_size * 2 + 10;

                let sources = vec![Source::new(d0.path()), Source::new(d1.path())];
                let usages = vec![
                    usage(total_size, total),
                    usage(0, total),
                ];
                plan_and_execute(&sources, usages, false).unwrap();

                let d0_used = dir_used_bytes(d0.path());
                let d1_used = dir_used_bytes(d1.path());
                let usages_again = vec![
                    usage(d0_used, total),
                    usage(d1_used, total),
                ];
                let second_pass = plan_and_execute(&sources, usages_again, false).unwrap();
                prop_assert!(second_pass.is_empty());
            }

            #[test]
            fn dry_run_never_mutates_disk(sizes in proptest::collection::vec(1u64..30, 1..6)) {
                let d0 = TempDir::new().unwrap();
                let d1 = TempDir::new().unwrap();
                let total_size = write_files(d0.path(), &sizes);
                let total = total_size * 2 + 10;

                let sources = vec![Source::new(d0.path()), Source::new(d1.path())];
                let usages = vec![
                    usage(total_size, total),
                    usage(0, total),
                ];

                let before = dir_used_bytes(d0.path());
                plan_and_execute(&sources, usages, true).unwrap();
                let after = dir_used_bytes(d0.path());

                prop_assert_eq!(before, after);
                prop_assert_eq!(fs::read_dir(d1.path()).unwrap().count(), 0);
            }
        }
    }
}
