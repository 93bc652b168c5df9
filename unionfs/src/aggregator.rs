use std::ffi::OsString;

use tracing::instrument;

use crate::error::{Error, Result};
use crate::source::{aggregate_statvfs, AggregateStatvfs, Source};

/// Provides union semantics for operations that are inherently root-scoped:
/// listing the root, aggregating free-space statistics, and the startup
/// duplicate-name check, per §4.2.
#[derive(Debug, Clone)]
pub struct NamespaceAggregator {
    sources: std::sync::Arc<[Source]>,
}

/// An entry found at the union root, tagged with the source it came from.
#[derive(Debug, Clone)]
pub struct RootEntry {
    pub name: OsString,
    pub source_index: usize,
}

impl NamespaceAggregator {
    pub fn new(sources: std::sync::Arc<[Source]>) -> Self {
        Self { sources }
    }

    /// Checks that no two sources share a root-level name. Must be run
    /// before any operation is served; a violation is startup-fatal.
    #[instrument(skip(self))]
    pub fn check_for_duplicates(&self) -> Result<()> {
        let mut seen: std::collections::HashMap<OsString, &std::path::Path> =
            std::collections::HashMap::new();

        for source in self.sources.iter() {
            let entries = std::fs::read_dir(source.path()).map_err(|e| Error::SourceUnreadable {
                path: source.path().to_path_buf(),
                source: e,
            })?;

            for entry in entries {
                let entry = entry.map_err(|e| Error::SourceUnreadable {
                    path: source.path().to_path_buf(),
                    source: e,
                })?;
                let name = entry.file_name();

                if let Some(&first_path) = seen.get(&name) {
                    return Err(Error::DuplicatePath {
                        name,
                        first: first_path.to_path_buf(),
                        second: source.path().to_path_buf(),
                    });
                }
                seen.insert(name, source.path());
            }
        }

        Ok(())
    }

    /// Returns the union of every source's root directory, in source
    /// declaration order. No deduplication is needed thanks to the
    /// root-uniqueness invariant enforced by [Self::check_for_duplicates].
    ///
    /// The synthetic `.`/`..` entries are the FUSE binding's responsibility
    /// to add (it knows the inode numbers to use for them); this returns
    /// only the real entries.
    #[instrument(skip(self))]
    pub fn list_root(&self) -> Result<Vec<RootEntry>> {
        let mut out = Vec::new();
        for (source_index, source) in self.sources.iter().enumerate() {
            let entries = std::fs::read_dir(source.path()).map_err(|e| Error::SourceUnreadable {
                path: source.path().to_path_buf(),
                source: e,
            })?;
            for entry in entries {
                let entry = entry.map_err(|e| Error::SourceUnreadable {
                    path: source.path().to_path_buf(),
                    source: e,
                })?;
                out.push(RootEntry {
                    name: entry.file_name(),
                    source_index,
                });
            }
        }
        Ok(out)
    }

    /// Aggregates `statvfs` across every source per the merge table in §4.2.
    #[instrument(skip(self))]
    pub fn statfs(&self) -> Result<AggregateStatvfs> {
        aggregate_statvfs(&self.sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn duplicate_top_level_name_is_rejected() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        fs::write(d0.path().join("x"), b"a").unwrap();
        fs::write(d1.path().join("x"), b"b").unwrap();

        let sources: std::sync::Arc<[Source]> =
            vec![Source::new(d0.path()), Source::new(d1.path())].into();
        let agg = NamespaceAggregator::new(sources);

        let err = agg.check_for_duplicates().unwrap_err();
        assert!(matches!(err, Error::DuplicatePath { .. }));
    }

    #[test]
    fn no_collisions_succeeds() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        fs::write(d0.path().join("a"), b"a").unwrap();
        fs::write(d1.path().join("b"), b"b").unwrap();

        let sources: std::sync::Arc<[Source]> =
            vec![Source::new(d0.path()), Source::new(d1.path())].into();
        let agg = NamespaceAggregator::new(sources);
        agg.check_for_duplicates().unwrap();
    }

    #[test]
    fn list_root_concatenates_in_declaration_order() {
        let d0 = TempDir::new().unwrap();
        let d1 = TempDir::new().unwrap();
        fs::write(d0.path().join("a"), b"a").unwrap();
        fs::write(d1.path().join("b"), b"b").unwrap();

        let sources: std::sync::Arc<[Source]> =
            vec![Source::new(d0.path()), Source::new(d1.path())].into();
        let agg = NamespaceAggregator::new(sources);

        let entries = agg.list_root().unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![OsString::from("a"), OsString::from("b")]);
    }
}
