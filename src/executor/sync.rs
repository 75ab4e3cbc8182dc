// Checksum-driven file sync over an established connection

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glob::Pattern;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::runner::{shell_quote, ProcessRunner, RunOptions};
use super::Connection;
use crate::output::errors::ArmadaError;

/// Options for a sync invocation
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Glob filters on relative paths; empty means everything
    pub include: Vec<String>,
    /// Glob filters removing matches from the transfer set
    pub exclude: Vec<String>,
    /// Remove remote files with no local counterpart
    pub delete: bool,
    /// Report changes without touching the remote side
    pub dry_run: bool,
}

/// One change the sync made (or would make, under dry-run)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncChange {
    Upload(String),
    Delete(String),
}

/// Outcome of a sync invocation
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub changes: Vec<SyncChange>,
    pub unchanged: usize,
    pub dry_run: bool,
}

impl SyncResult {
    pub fn uploads(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().filter_map(|c| match c {
            SyncChange::Upload(p) => Some(p.as_str()),
            SyncChange::Delete(_) => None,
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().filter_map(|c| match c {
            SyncChange::Delete(p) => Some(p.as_str()),
            SyncChange::Upload(_) => None,
        })
    }
}

/// Synchronizes a local file tree to a remote path, transferring only files
/// whose checksums differ
pub struct FileSync {
    runner: ProcessRunner,
}

impl FileSync {
    pub fn new(runner: ProcessRunner) -> Self {
        FileSync { runner }
    }

    pub async fn sync(
        &self,
        conn: &dyn Connection,
        local: &Path,
        remote: &str,
        options: &SyncOptions,
    ) -> Result<SyncResult, ArmadaError> {
        let local_files = collect_local(local, options)?;
        let remote_files = self.remote_checksums(conn, remote).await?;
        let remote_root = remote.trim_end_matches('/');

        let mut changes = Vec::new();
        let mut unchanged = 0usize;

        for (rel, checksum) in &local_files {
            match remote_files.get(rel) {
                Some(existing) if existing == checksum => unchanged += 1,
                _ => changes.push(SyncChange::Upload(rel.clone())),
            }
        }

        if options.delete {
            for rel in remote_files.keys() {
                if !local_files.contains_key(rel) {
                    changes.push(SyncChange::Delete(rel.clone()));
                }
            }
        }

        debug!(
            host = conn.host_alias(),
            uploads = changes.iter().filter(|c| matches!(c, SyncChange::Upload(_))).count(),
            deletes = changes.iter().filter(|c| matches!(c, SyncChange::Delete(_))).count(),
            unchanged,
            dry_run = options.dry_run,
            "sync plan"
        );

        if options.dry_run {
            return Ok(SyncResult {
                changes,
                unchanged,
                dry_run: true,
            });
        }

        for change in &changes {
            match change {
                SyncChange::Upload(rel) => {
                    let remote_path = format!("{}/{}", remote_root, rel);
                    if let Some(parent) = Path::new(&remote_path).parent() {
                        self.runner
                            .run(
                                conn,
                                &format!("mkdir -p {}", shell_quote(&parent.to_string_lossy())),
                                &RunOptions::new(),
                            )
                            .await?;
                    }
                    let local_path = local_file_path(local, rel);
                    conn.upload_file(&local_path, &remote_path).await?;
                }
                SyncChange::Delete(rel) => {
                    let remote_path = format!("{}/{}", remote_root, rel);
                    self.runner
                        .run(
                            conn,
                            &format!("rm -f {}", shell_quote(&remote_path)),
                            &RunOptions::new(),
                        )
                        .await?;
                }
            }
        }

        Ok(SyncResult {
            changes,
            unchanged,
            dry_run: false,
        })
    }

    /// Inventory the remote tree as relative path -> sha256
    async fn remote_checksums(
        &self,
        conn: &dyn Connection,
        remote: &str,
    ) -> Result<BTreeMap<String, String>, ArmadaError> {
        let root = remote.trim_end_matches('/');
        let cmd = format!(
            "find {} -type f -exec sha256sum {{}} + 2>/dev/null",
            shell_quote(root)
        );

        // A missing remote directory is an empty tree, not an error
        let output = self.runner.run_tolerant(conn, &cmd, &RunOptions::new()).await?;

        let mut checksums = BTreeMap::new();
        for line in output.stdout.lines() {
            let Some((hash, path)) = line.split_once("  ") else {
                continue;
            };
            let rel = path
                .strip_prefix(root)
                .map(|p| p.trim_start_matches('/'))
                .unwrap_or(path);
            checksums.insert(rel.to_string(), hash.to_string());
        }
        Ok(checksums)
    }
}

/// Walk the local tree into relative path -> sha256, applying the glob filters
fn collect_local(
    local: &Path,
    options: &SyncOptions,
) -> Result<BTreeMap<String, String>, ArmadaError> {
    let mut files = BTreeMap::new();

    if local.is_file() {
        let rel = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if matches_filters(&rel, options) {
            files.insert(rel, checksum_file(local)?);
        }
        return Ok(files);
    }

    if !local.is_dir() {
        return Err(ArmadaError::Io {
            message: "sync source does not exist".to_string(),
            path: Some(local.to_path_buf()),
        });
    }

    walk(local, local, options, &mut files)?;
    Ok(files)
}

fn walk(
    root: &Path,
    dir: &Path,
    options: &SyncOptions,
    files: &mut BTreeMap<String, String>,
) -> Result<(), ArmadaError> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| ArmadaError::Io {
            message: format!("failed to read directory: {}", e),
            path: Some(dir.to_path_buf()),
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            walk(root, &path, options, files)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            if matches_filters(&rel, options) {
                files.insert(rel, checksum_file(&path)?);
            }
        }
    }
    Ok(())
}

fn matches_filters(rel: &str, options: &SyncOptions) -> bool {
    if !options.include.is_empty()
        && !options
            .include
            .iter()
            .any(|g| Pattern::new(g).map(|p| p.matches(rel)).unwrap_or(false))
    {
        return false;
    }

    !options
        .exclude
        .iter()
        .any(|g| Pattern::new(g).map(|p| p.matches(rel)).unwrap_or(false))
}

fn checksum_file(path: &Path) -> Result<String, ArmadaError> {
    let content = std::fs::read(path).map_err(|e| ArmadaError::Io {
        message: format!("failed to read file: {}", e),
        path: Some(path.to_path_buf()),
    })?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

fn local_file_path(local: &Path, rel: &str) -> PathBuf {
    if local.is_file() {
        local.to_path_buf()
    } else {
        local.join(rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalConnection;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn tree(dir: &Path) -> BTreeMap<String, String> {
        collect_local(dir, &SyncOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_initial_sync_uploads_everything() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "index.html", "hello");
        write(src.path(), "assets/app.js", "let x = 1;");

        let sync = FileSync::new(ProcessRunner::default());
        let conn = LocalConnection::controller();
        let result = sync
            .sync(
                &conn,
                src.path(),
                dst.path().to_str().unwrap(),
                &SyncOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.uploads().count(), 2);
        assert_eq!(tree(src.path()), tree(dst.path()));
    }

    #[tokio::test]
    async fn test_unchanged_files_are_skipped() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "a.txt", "same");
        write(dst.path(), "a.txt", "same");
        write(src.path(), "b.txt", "new");

        let sync = FileSync::new(ProcessRunner::default());
        let conn = LocalConnection::controller();
        let result = sync
            .sync(
                &conn,
                src.path(),
                dst.path().to_str().unwrap(),
                &SyncOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.unchanged, 1);
        let uploads: Vec<&str> = result.uploads().collect();
        assert_eq!(uploads, vec!["b.txt"]);
    }

    #[tokio::test]
    async fn test_delete_extraneous() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "keep.txt", "x");
        write(dst.path(), "keep.txt", "x");
        write(dst.path(), "stale.txt", "old");

        let sync = FileSync::new(ProcessRunner::default());
        let conn = LocalConnection::controller();
        let options = SyncOptions {
            delete: true,
            ..Default::default()
        };
        let result = sync
            .sync(&conn, src.path(), dst.path().to_str().unwrap(), &options)
            .await
            .unwrap();

        let deletes: Vec<&str> = result.deletes().collect();
        assert_eq!(deletes, vec!["stale.txt"]);
        assert!(!dst.path().join("stale.txt").exists());
    }

    #[tokio::test]
    async fn test_dry_run_reports_but_does_not_mutate() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "new.txt", "content");
        write(dst.path(), "stale.txt", "old");

        let before = tree(dst.path());

        let sync = FileSync::new(ProcessRunner::default());
        let conn = LocalConnection::controller();
        let options = SyncOptions {
            delete: true,
            dry_run: true,
            ..Default::default()
        };
        let result = sync
            .sync(&conn, src.path(), dst.path().to_str().unwrap(), &options)
            .await
            .unwrap();

        assert!(result.dry_run);
        assert_eq!(result.uploads().count(), 1);
        assert_eq!(result.deletes().count(), 1);
        // Destination is byte-identical to before the call
        assert_eq!(before, tree(dst.path()));
    }

    #[tokio::test]
    async fn test_exclude_filter() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "app.js", "code");
        write(src.path(), "debug.log", "noise");

        let sync = FileSync::new(ProcessRunner::default());
        let conn = LocalConnection::controller();
        let options = SyncOptions {
            exclude: vec!["*.log".to_string()],
            ..Default::default()
        };
        let result = sync
            .sync(&conn, src.path(), dst.path().to_str().unwrap(), &options)
            .await
            .unwrap();

        let uploads: Vec<&str> = result.uploads().collect();
        assert_eq!(uploads, vec!["app.js"]);
        assert!(!dst.path().join("debug.log").exists());
    }

    #[tokio::test]
    async fn test_include_filter_limits_set() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "a.css", "x");
        write(src.path(), "b.js", "y");
        write(src.path(), "c.txt", "z");

        let sync = FileSync::new(ProcessRunner::default());
        let conn = LocalConnection::controller();
        let options = SyncOptions {
            include: vec!["*.css".to_string(), "*.js".to_string()],
            ..Default::default()
        };
        let result = sync
            .sync(&conn, src.path(), dst.path().to_str().unwrap(), &options)
            .await
            .unwrap();

        assert_eq!(result.uploads().count(), 2);
        assert!(!dst.path().join("c.txt").exists());
    }

    #[tokio::test]
    async fn test_single_file_source() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write(src.path(), "artifact.tar.gz", "bytes");

        let sync = FileSync::new(ProcessRunner::default());
        let conn = LocalConnection::controller();
        let result = sync
            .sync(
                &conn,
                &src.path().join("artifact.tar.gz"),
                dst.path().to_str().unwrap(),
                &SyncOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.uploads().count(), 1);
        assert!(dst.path().join("artifact.tar.gz").exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_io_error() {
        let dst = tempfile::tempdir().unwrap();
        let sync = FileSync::new(ProcessRunner::default());
        let conn = LocalConnection::controller();

        let err = sync
            .sync(
                &conn,
                Path::new("/nonexistent/source"),
                dst.path().to_str().unwrap(),
                &SyncOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArmadaError::Io { .. }));
    }
}
