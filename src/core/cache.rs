// src/core/cache.rs

//! The in-memory variable cache feeding the synthesised welcome and the
//! operator display.
//!
//! Invariants: a pure-DELTA keyword is never stored; `updated` is
//! monotonic per keyword; the welcome snapshot follows the catalogue's
//! declared order.

use crate::core::RouterError;
use crate::core::catalogue::VariableCatalogue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Current on-disk snapshot format version. Older or unversioned files are
/// rejected and the router starts with an empty cache.
const SNAPSHOT_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: String,
    pub updated: Instant,
}

/// On-disk form of the cache.
#[derive(Serialize, Deserialize)]
struct CacheSnapshotFile {
    version: u32,
    variables: HashMap<String, String>,
}

/// Keyword -> latest value. Owned by the router core; readers snapshot.
#[derive(Debug, Default)]
pub struct VariableCache {
    entries: HashMap<String, CacheEntry>,
}

impl VariableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.entries.contains_key(keyword)
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.entries.get(keyword).map(|e| e.value.as_str())
    }

    /// Seconds since the keyword was last updated.
    pub fn age(&self, keyword: &str) -> Option<f64> {
        self.entries
            .get(keyword)
            .map(|e| e.updated.elapsed().as_secs_f64())
    }

    /// Stores a value. The caller is responsible for never putting a
    /// pure-DELTA keyword here; `router::apply` enforces that with the
    /// catalogue.
    pub fn put(&mut self, keyword: &str, value: &str) {
        self.entries.insert(
            keyword.to_string(),
            CacheEntry {
                value: value.to_string(),
                updated: Instant::now(),
            },
        );
    }

    /// All cached keywords in catalogue-declared order, with keywords the
    /// catalogue does not know sorted PSX-numerically at the end. This is
    /// the replay order for welcomes and `bang` replies.
    pub fn keywords_in_catalogue_order(&self, catalogue: &VariableCatalogue) -> Vec<String> {
        let mut known: Vec<(usize, String)> = Vec::new();
        let mut unknown: Vec<String> = Vec::new();
        for keyword in self.entries.keys() {
            match catalogue.declared_index(keyword) {
                Some(index) => known.push((index, keyword.clone())),
                None => unknown.push(keyword.clone()),
            }
        }
        known.sort_by_key(|(index, _)| *index);
        catalogue.sort_psx_keywords(&mut unknown);
        known
            .into_iter()
            .map(|(_, k)| k)
            .chain(unknown)
            .collect()
    }

    /// The `(keyword, value)` sequence a welcome or `bang` reply walks:
    /// catalogue order, pure-DELTA keywords excluded.
    pub fn snapshot_for_welcome(&self, catalogue: &VariableCatalogue) -> Vec<(String, String)> {
        self.keywords_in_catalogue_order(catalogue)
            .into_iter()
            .filter(|k| !catalogue.is_pure_delta(k))
            .filter_map(|k| self.get(&k).map(|v| (k.clone(), v.to_string())))
            .collect()
    }

    /// Reads a snapshot written by a previous run, for serving welcomes
    /// before the upstream connects. Bad or stale-format data is rejected.
    pub fn read_from_file(&mut self, path: &Path) -> Result<(), RouterError> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "No cache snapshot at {}, starting with an empty cache",
                    path.display()
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: CacheSnapshotFile = match serde_json::from_str(&data) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    "Bad data in {}, starting with an empty cache: {e}",
                    path.display()
                );
                return Ok(());
            }
        };
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            warn!(
                "Cache snapshot {} has format version {}, expected {}; ignoring it",
                path.display(),
                snapshot.version,
                SNAPSHOT_FORMAT_VERSION
            );
            return Ok(());
        }
        let now = Instant::now();
        for (keyword, value) in snapshot.variables {
            self.entries.insert(
                keyword,
                CacheEntry {
                    value,
                    updated: now,
                },
            );
        }
        info!(
            "Loaded {} cached keywords from {}",
            self.entries.len(),
            path.display()
        );
        Ok(())
    }

    /// Writes the snapshot. An empty cache is not worth a file.
    pub fn write_to_file(&self, path: &Path) -> Result<(), RouterError> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let snapshot = CacheSnapshotFile {
            version: SNAPSHOT_FORMAT_VERSION,
            variables: self
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.value.clone()))
                .collect(),
        };
        let data = serde_json::to_string(&snapshot)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}
