//! Rank address directory using a shared filesystem
//!
//! Servers publish their listening endpoint under their rank, then block
//! until every rank in the group has published. The directory file is the
//! single bootstrap artifact: late-starting peers synchronize with early
//! ones by polling for it.
//!
//! File format:
//!   line 1     : decimal group size
//!   lines 2..  : "<rank>,<endpoint>"
//!
//! Entries may appear in any order and the file is append-consistent; a
//! file with fewer than group-size entries just means some peers have not
//! published yet.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory error types
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Directory I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Directory parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Directory incomplete: {have} of {want} ranks published")]
    Incomplete { have: usize, want: usize },

    #[error("Directory not found: {0}")]
    NotFound(PathBuf),

    #[error("Unknown rank: {0}")]
    UnknownRank(u32),

    #[error("Directory load failed after {attempts} attempts")]
    RetriesExhausted { attempts: usize },
}

/// Bounded retry policy for bootstrap polling.
///
/// The bound and interval are operational knobs, not protocol guarantees.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::defaults::DIRECTORY_RETRIES,
            interval: Duration::from_millis(
                crate::config::defaults::DIRECTORY_RETRY_INTERVAL_MS,
            ),
        }
    }
}

/// Discovery backend behind the publish/load contract.
///
/// The file backend is the only one shipped; a key-value store or gossip
/// backend can slot in behind the same trait.
pub trait Discovery: Send + Sync {
    /// Publish this rank's endpoint. Called once per rank.
    fn publish(&self, rank: u32, endpoint: &str) -> Result<(), DirectoryError>;

    /// Single read attempt. Returns `Incomplete` or `NotFound` while peers
    /// are still publishing; anything unparseable is fatal.
    fn load(&self, group_size: u32) -> Result<HashMap<u32, String>, DirectoryError>;
}

/// File-based discovery on a shared filesystem
pub struct FileDiscovery {
    path: PathBuf,
    group_size: u32,
}

impl FileDiscovery {
    pub fn new<P: AsRef<Path>>(path: P, group_size: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            group_size,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> DirectoryError {
        DirectoryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Discovery for FileDiscovery {
    fn publish(&self, rank: u32, endpoint: &str) -> Result<(), DirectoryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        // The creating writer owns the group-size header line. Losing the
        // creation race degrades to a plain append; every rank knows the
        // same group size, so whoever wins writes the same header.
        let entry = format!("{},{}\n", rank, endpoint);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                tracing::info!(
                    "Creating directory file {:?} (rank {} first to publish)",
                    self.path,
                    rank
                );
                // Header and first entry in one write so no reader ever
                // observes a header-less entry.
                let initial = format!("{}\n{}", self.group_size, entry);
                file.write_all(initial.as_bytes())
                    .and_then(|_| file.flush())
                    .map_err(|e| self.io_err(e))?;
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let mut file = OpenOptions::new()
                    .append(true)
                    .open(&self.path)
                    .map_err(|e| self.io_err(e))?;
                file.write_all(entry.as_bytes())
                    .and_then(|_| file.flush())
                    .map_err(|e| self.io_err(e))?;
            }
            Err(e) => return Err(self.io_err(e)),
        }

        tracing::info!("Published rank {} -> {} in {:?}", rank, endpoint, self.path);
        Ok(())
    }

    fn load(&self, group_size: u32) -> Result<HashMap<u32, String>, DirectoryError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DirectoryError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(self.io_err(e)),
        };

        let mut lines = contents.lines().enumerate();

        // Line 1 is the decimal group size written by the creating rank.
        let (_, header) = lines.next().ok_or(DirectoryError::Parse {
            line: 1,
            reason: "empty directory file".to_string(),
        })?;
        let declared = header
            .trim()
            .parse::<u32>()
            .map_err(|e| DirectoryError::Parse {
                line: 1,
                reason: format!("bad group size '{}': {}", header.trim(), e),
            })?;
        if declared != group_size {
            return Err(DirectoryError::Parse {
                line: 1,
                reason: format!(
                    "directory declares group size {}, expected {}",
                    declared, group_size
                ),
            });
        }

        let mut entries = HashMap::new();
        for (line_num, line) in lines {
            let line_num = line_num + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let (rank_str, endpoint) =
                trimmed
                    .split_once(',')
                    .ok_or_else(|| DirectoryError::Parse {
                        line: line_num,
                        reason: format!("expected '<rank>,<endpoint>', got '{}'", trimmed),
                    })?;

            let rank = rank_str.parse::<u32>().map_err(|e| DirectoryError::Parse {
                line: line_num,
                reason: format!("bad rank '{}': {}", rank_str, e),
            })?;

            if rank >= group_size {
                return Err(DirectoryError::Parse {
                    line: line_num,
                    reason: format!("rank {} out of range for group size {}", rank, group_size),
                });
            }

            if entries.insert(rank, endpoint.to_string()).is_some() {
                return Err(DirectoryError::Parse {
                    line: line_num,
                    reason: format!("duplicate entry for rank {}", rank),
                });
            }
        }

        if entries.len() < group_size as usize {
            return Err(DirectoryError::Incomplete {
                have: entries.len(),
                want: group_size as usize,
            });
        }

        Ok(entries)
    }
}

/// Resolved rank to endpoint mapping, populated once at bootstrap.
///
/// Write-once, read-many: no entry is ever mutated after `load` returns,
/// so lookups need no locking.
pub struct AddressDirectory {
    endpoints: Vec<String>,
}

impl AddressDirectory {
    /// Block until the discovery backend has entries for all `group_size`
    /// ranks, polling with the given retry policy.
    ///
    /// Incomplete or missing directories are retried; a malformed
    /// directory is fatal immediately.
    pub async fn load(
        discovery: &dyn Discovery,
        group_size: u32,
        retry: RetryPolicy,
    ) -> Result<Self, DirectoryError> {
        for attempt in 1..=retry.max_attempts {
            match discovery.load(group_size) {
                Ok(entries) => {
                    tracing::info!(
                        "Loaded address directory (attempt {}/{}): {} ranks",
                        attempt,
                        retry.max_attempts,
                        entries.len()
                    );

                    let mut endpoints = Vec::with_capacity(group_size as usize);
                    for rank in 0..group_size {
                        // load() guarantees every rank below group_size is present
                        endpoints.push(entries[&rank].clone());
                    }
                    return Ok(Self { endpoints });
                }
                Err(
                    DirectoryError::NotFound(_) | DirectoryError::Incomplete { .. },
                ) if attempt < retry.max_attempts => {
                    tracing::debug!(
                        "Directory not ready, retrying in {:?} (attempt {}/{})",
                        retry.interval,
                        attempt,
                        retry.max_attempts
                    );
                    tokio::time::sleep(retry.interval).await;
                }
                Err(e @ (DirectoryError::NotFound(_) | DirectoryError::Incomplete { .. })) => {
                    tracing::error!(
                        "Directory still incomplete after {} attempts: {}",
                        retry.max_attempts,
                        e
                    );
                    return Err(DirectoryError::RetriesExhausted {
                        attempts: retry.max_attempts,
                    });
                }
                Err(e) => {
                    tracing::error!("Fatal directory error: {}", e);
                    return Err(e);
                }
            }
        }

        Err(DirectoryError::RetriesExhausted {
            attempts: retry.max_attempts,
        })
    }

    /// Build a directory directly from resolved endpoints, indexed by rank.
    /// Used by tests and by non-file discovery backends.
    pub fn from_endpoints(endpoints: Vec<String>) -> Self {
        Self { endpoints }
    }

    /// O(1) endpoint lookup. Unknown ranks are a hard error here; the
    /// local proxy's modulo wraparound is deliberately not applied at this
    /// layer.
    pub fn resolve(&self, rank: u32) -> Result<&str, DirectoryError> {
        self.endpoints
            .get(rank as usize)
            .map(|s| s.as_str())
            .ok_or(DirectoryError::UnknownRank(rank))
    }

    pub fn group_size(&self) -> u32 {
        self.endpoints.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn discovery(dir: &TempDir, group_size: u32) -> FileDiscovery {
        FileDiscovery::new(dir.path().join("directory"), group_size)
    }

    #[test]
    fn test_publish_and_load() {
        let dir = TempDir::new().unwrap();
        let d = discovery(&dir, 2);

        d.publish(0, "127.0.0.1:4000").unwrap();
        d.publish(1, "127.0.0.1:4001").unwrap();

        let entries = d.load(2).unwrap();
        assert_eq!(entries[&0], "127.0.0.1:4000");
        assert_eq!(entries[&1], "127.0.0.1:4001");
    }

    #[test]
    fn test_file_has_group_size_header() {
        let dir = TempDir::new().unwrap();
        let d = discovery(&dir, 2);
        d.publish(1, "127.0.0.1:4001").unwrap();

        let contents = std::fs::read_to_string(dir.path().join("directory")).unwrap();
        assert_eq!(contents, "2\n1,127.0.0.1:4001\n");
    }

    #[test]
    fn test_load_incomplete() {
        let dir = TempDir::new().unwrap();
        let d = discovery(&dir, 2);

        d.publish(0, "127.0.0.1:4000").unwrap();

        let result = d.load(2);
        assert!(matches!(
            result,
            Err(DirectoryError::Incomplete { have: 1, want: 2 })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let d = discovery(&dir, 1);
        assert!(matches!(d.load(1), Err(DirectoryError::NotFound(_))));
    }

    #[test]
    fn test_load_malformed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("directory");
        std::fs::write(&path, "not a directory entry\n").unwrap();

        let d = FileDiscovery::new(&path, 1);
        assert!(matches!(d.load(1), Err(DirectoryError::Parse { .. })));
    }

    #[test]
    fn test_load_group_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("directory");
        std::fs::write(&path, "4\n0,a:1\n").unwrap();

        let d = FileDiscovery::new(&path, 2);
        assert!(matches!(d.load(2), Err(DirectoryError::Parse { .. })));
    }

    #[test]
    fn test_load_duplicate_rank() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("directory");
        std::fs::write(&path, "1\n0,a:1\n0,b:2\n").unwrap();

        let d = FileDiscovery::new(&path, 1);
        assert!(matches!(d.load(1), Err(DirectoryError::Parse { .. })));
    }

    #[test]
    fn test_load_out_of_range_rank() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("directory");
        std::fs::write(&path, "2\n5,a:1\n").unwrap();

        let d = FileDiscovery::new(&path, 2);
        assert!(matches!(d.load(2), Err(DirectoryError::Parse { .. })));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let dir = AddressDirectory::from_endpoints(vec![
            "127.0.0.1:4000".to_string(),
            "127.0.0.1:4001".to_string(),
        ]);

        let first = dir.resolve(1).unwrap().to_string();
        let second = dir.resolve(1).unwrap().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_unknown_rank() {
        let dir = AddressDirectory::from_endpoints(vec!["127.0.0.1:4000".to_string()]);
        assert!(matches!(
            dir.resolve(1),
            Err(DirectoryError::UnknownRank(1))
        ));
        assert!(matches!(
            dir.resolve(7),
            Err(DirectoryError::UnknownRank(7))
        ));
    }

    #[tokio::test]
    async fn test_load_blocks_until_all_published() {
        // Scenario: load(3) starts before all three entries exist and must
        // complete without a premature error once the third appears.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("directory");

        let d = FileDiscovery::new(&path, 3);
        d.publish(0, "127.0.0.1:4000").unwrap();

        let loader_path = path.clone();
        let loader = tokio::spawn(async move {
            let d = FileDiscovery::new(&loader_path, 3);
            AddressDirectory::load(
                &d,
                3,
                RetryPolicy {
                    max_attempts: 100,
                    interval: Duration::from_millis(10),
                },
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        d.publish(1, "127.0.0.1:4001").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        d.publish(2, "127.0.0.1:4002").unwrap();

        let loaded = loader.await.unwrap().unwrap();
        assert_eq!(loaded.group_size(), 3);
        assert_eq!(loaded.resolve(2).unwrap(), "127.0.0.1:4002");
    }

    #[tokio::test]
    async fn test_load_retries_exhausted() {
        let dir = TempDir::new().unwrap();
        let d = discovery(&dir, 2);
        d.publish(0, "127.0.0.1:4000").unwrap();

        let result = AddressDirectory::load(
            &d,
            2,
            RetryPolicy {
                max_attempts: 3,
                interval: Duration::from_millis(5),
            },
        )
        .await;

        assert!(matches!(
            result,
            Err(DirectoryError::RetriesExhausted { attempts: 3 })
        ));
    }
}
