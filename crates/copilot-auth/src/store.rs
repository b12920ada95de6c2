//! On-disk token store
//!
//! One file per token. Active tokens live in the tokens directory as
//! `<id>.copilot_token`; exhausted tokens live in the `QuotaExhausted`
//! subdirectory as `<reset_at>-<id>.copilot_token`, so reclaiming only needs
//! the filename. Moving between the two sets is a single `rename`, which keeps
//! every record in exactly one set even if the process dies mid-transition.
//!
//! New files are written to a dot-prefixed `.tmp` sibling and renamed into
//! place. `recover()` runs on open and sweeps anything a crash left behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use common::Secret;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{EXHAUSTED_DIR_NAME, TOKEN_SUFFIX};
use crate::error::{Error, Result};
use crate::record::{ExhaustedEntry, TokenRecord};

/// Result of scanning one storage set.
///
/// Corrupt entries are reported by filename and otherwise ignored.
#[derive(Debug)]
pub struct Scan<T> {
    pub entries: Vec<T>,
    pub corrupt: Vec<String>,
}

impl<T> Default for Scan<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            corrupt: Vec::new(),
        }
    }
}

/// What `recover()` had to repair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Recovery {
    pub temp_files_removed: usize,
    pub duplicates_resolved: usize,
    pub legacy_migrated: usize,
}

/// File-backed token store.
///
/// The Mutex serializes every mutation (insert, relocation, removal) so that
/// ordinal assignment and renames never interleave. Scans don't take it.
pub struct TokenStore {
    active_dir: PathBuf,
    exhausted_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl TokenStore {
    /// Open the store rooted at `tokens_dir`, creating both directories if
    /// needed and repairing leftovers from an earlier crash.
    pub async fn open(tokens_dir: impl Into<PathBuf>) -> Result<Self> {
        let active_dir = tokens_dir.into();
        let exhausted_dir = active_dir.join(EXHAUSTED_DIR_NAME);
        Self::open_with(active_dir, exhausted_dir).await
    }

    /// Open with an explicit exhausted directory. Both directories must be on
    /// the same filesystem for relocation to stay a single rename.
    pub async fn open_with(active_dir: PathBuf, exhausted_dir: PathBuf) -> Result<Self> {
        for dir in [&active_dir, &exhausted_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Io(format!("creating {}: {e}", dir.display())))?;
        }

        let store = Self {
            active_dir,
            exhausted_dir,
            write_lock: Mutex::new(()),
        };

        let recovery = store.recover().await?;
        if recovery != Recovery::default() {
            info!(
                temp_files_removed = recovery.temp_files_removed,
                duplicates_resolved = recovery.duplicates_resolved,
                legacy_migrated = recovery.legacy_migrated,
                "repaired token store"
            );
        }
        info!(path = %store.active_dir.display(), "token store opened");
        Ok(store)
    }

    /// Read every active token, ordered by ascending id.
    pub async fn scan_active(&self) -> Result<Scan<TokenRecord>> {
        let mut scan = Scan::default();
        for name in list_files(&self.active_dir).await? {
            if !is_token_file(&name) {
                continue;
            }
            let Some(id) = parse_active_name(&name) else {
                let err = Error::StoreCorrupt(format!("unparseable active token name {name}"));
                warn!(file = %name, error = %err, "skipping corrupt token entry");
                scan.corrupt.push(name);
                continue;
            };
            match read_secret(&self.active_dir.join(&name)).await {
                Ok(secret) => scan.entries.push(TokenRecord::active(id, secret)),
                Err(e) => {
                    warn!(token_id = id, error = %e, "skipping unreadable token");
                    scan.corrupt.push(name);
                }
            }
        }
        scan.entries.sort_by_key(|r| r.id);
        Ok(scan)
    }

    /// List exhausted tokens from their filenames, ordered by ascending id.
    pub async fn scan_exhausted(&self) -> Result<Scan<ExhaustedEntry>> {
        let mut scan = Scan::default();
        for name in list_files(&self.exhausted_dir).await? {
            if !is_token_file(&name) {
                continue;
            }
            match parse_exhausted_name(&name) {
                Some((reset_at, id)) => scan.entries.push(ExhaustedEntry { id, reset_at }),
                None => {
                    let err =
                        Error::StoreCorrupt(format!("unparseable exhausted token name {name}"));
                    warn!(file = %name, error = %err, "skipping corrupt token entry");
                    scan.corrupt.push(name);
                }
            }
        }
        scan.entries.sort_by_key(|e| e.id);
        Ok(scan)
    }

    /// Persist a new token under the next free ordinal and return that ordinal.
    pub async fn insert(&self, secret: &str) -> Result<u64> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(Error::InvalidCredentials("token secret is empty".into()));
        }

        let _guard = self.write_lock.lock().await;
        let id = self.next_id().await?;
        write_atomic(&self.active_dir, id, secret).await?;
        debug!(token_id = id, "stored token");
        Ok(id)
    }

    /// Move a token into the exhausted set, stamping `reset_at` into its name.
    ///
    /// A token that is already exhausted is renamed in place so the newer
    /// reset time wins.
    pub async fn exhaust(&self, id: u64, reset_at: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let target = self.exhausted_dir.join(exhausted_name(reset_at, id));

        match tokio::fs::rename(self.active_path(id), &target).await {
            Ok(()) => {
                debug!(token_id = id, reset_at, "moved token to exhausted set");
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Io(format!(
                    "moving token {id} to exhausted set: {e}"
                )));
            }
        }

        let current = self
            .find_exhausted(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("token {id} is in neither set")))?;
        if current.reset_at != reset_at {
            let from = self
                .exhausted_dir
                .join(exhausted_name(current.reset_at, id));
            tokio::fs::rename(&from, &target)
                .await
                .map_err(|e| Error::Io(format!("refreshing reset time of token {id}: {e}")))?;
            debug!(token_id = id, reset_at, "refreshed reset time");
        }
        Ok(())
    }

    /// Move an exhausted token back into the active set.
    pub async fn reactivate(&self, id: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let entry = self
            .find_exhausted(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("token {id} is not exhausted")))?;
        let from = self.exhausted_dir.join(exhausted_name(entry.reset_at, id));
        tokio::fs::rename(&from, self.active_path(id))
            .await
            .map_err(|e| Error::Io(format!("moving token {id} to active set: {e}")))?;
        debug!(token_id = id, "moved token to active set");
        Ok(())
    }

    /// Delete a token from whichever set holds it. Returns whether it existed.
    pub async fn remove(&self, id: u64) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.active_path(id)).await {
            Ok(()) => {
                debug!(token_id = id, "removed active token");
                return Ok(true);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(format!("removing token {id}: {e}"))),
        }

        let Some(entry) = self.find_exhausted(id).await? else {
            return Ok(false);
        };
        let path = self.exhausted_dir.join(exhausted_name(entry.reset_at, id));
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Error::Io(format!("removing token {id}: {e}")))?;
        debug!(token_id = id, "removed exhausted token");
        Ok(true)
    }

    /// Repair what an interrupted process may have left on disk.
    ///
    /// - stale `.tmp` files are deleted (the rename that would have published
    ///   them never happened)
    /// - a legacy unnumbered `.copilot_token` primary file and legacy
    ///   `<reset_at>.copilot_token` exhausted files get fresh ordinals
    /// - an id present in both sets keeps only its exhausted copy
    ///
    /// Idempotent; running it on a clean store changes nothing.
    pub async fn recover(&self) -> Result<Recovery> {
        let _guard = self.write_lock.lock().await;
        let mut report = Recovery::default();

        for dir in [&self.active_dir, &self.exhausted_dir] {
            for name in list_files(dir).await? {
                if is_temp_file(&name) {
                    remove_file(&dir.join(&name)).await?;
                    warn!(file = %name, "removed stale temp file");
                    report.temp_files_removed += 1;
                }
            }
        }

        let legacy_primary = self.active_dir.join(format!(".{TOKEN_SUFFIX}"));
        if tokio::fs::try_exists(&legacy_primary).await.unwrap_or(false) {
            let id = self.next_id().await?;
            rename(&legacy_primary, &self.active_path(id)).await?;
            info!(token_id = id, "migrated legacy primary token");
            report.legacy_migrated += 1;
        }

        for name in list_files(&self.exhausted_dir).await? {
            if let Some(stem) = strip_token_suffix(&name)
                && let Some(reset_at) = parse_ordinal(stem)
            {
                let id = self.next_id().await?;
                let target = self.exhausted_dir.join(exhausted_name(reset_at, id));
                rename(&self.exhausted_dir.join(&name), &target).await?;
                info!(token_id = id, reset_at, "migrated legacy exhausted token");
                report.legacy_migrated += 1;
            }
        }

        let exhausted_ids: HashSet<u64> = self
            .scan_exhausted()
            .await?
            .entries
            .iter()
            .map(|e| e.id)
            .collect();
        for name in list_files(&self.active_dir).await? {
            if let Some(id) = parse_active_name(&name)
                && exhausted_ids.contains(&id)
            {
                remove_file(&self.active_dir.join(&name)).await?;
                warn!(token_id = id, "token present in both sets, kept exhausted copy");
                report.duplicates_resolved += 1;
            }
        }

        Ok(report)
    }

    fn active_path(&self, id: u64) -> PathBuf {
        self.active_dir.join(active_name(id))
    }

    async fn find_exhausted(&self, id: u64) -> Result<Option<ExhaustedEntry>> {
        let scan = self.scan_exhausted().await?;
        Ok(scan.entries.into_iter().find(|e| e.id == id))
    }

    /// One past the largest ordinal in either set.
    async fn next_id(&self) -> Result<u64> {
        let mut max = 0u64;
        for name in list_files(&self.active_dir).await? {
            if let Some(id) = parse_active_name(&name) {
                max = max.max(id);
            }
        }
        for name in list_files(&self.exhausted_dir).await? {
            if let Some((_, id)) = parse_exhausted_name(&name) {
                max = max.max(id);
            }
        }
        Ok(max + 1)
    }
}

fn active_name(id: u64) -> String {
    format!("{id}.{TOKEN_SUFFIX}")
}

fn exhausted_name(reset_at: u64, id: u64) -> String {
    format!("{reset_at}-{id}.{TOKEN_SUFFIX}")
}

fn temp_name(id: u64) -> String {
    format!(".{id}.{TOKEN_SUFFIX}.tmp")
}

fn is_token_file(name: &str) -> bool {
    strip_token_suffix(name).is_some()
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".tmp")
}

fn strip_token_suffix(name: &str) -> Option<&str> {
    name.strip_suffix(TOKEN_SUFFIX)?.strip_suffix('.')
}

/// Strict decimal parse: `u64::from_str` would also accept a leading `+`.
fn parse_ordinal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_active_name(name: &str) -> Option<u64> {
    parse_ordinal(strip_token_suffix(name)?)
}

fn parse_exhausted_name(name: &str) -> Option<(u64, u64)> {
    let (reset_at, id) = strip_token_suffix(name)?.split_once('-')?;
    Some((parse_ordinal(reset_at)?, parse_ordinal(id)?))
}

async fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::Io(format!("reading {}: {e}", dir.display())))?;
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::Io(format!("reading {}: {e}", dir.display())))?
    {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

async fn read_secret(path: &Path) -> Result<Secret<String>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::StoreCorrupt(format!("reading {}: {e}", path.display())))?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(Error::StoreCorrupt(format!("{} is empty", path.display())));
    }
    Ok(Secret::new(trimmed.to_string()))
}

/// Write a token file atomically with 0600 permissions.
async fn write_atomic(dir: &Path, id: u64, secret: &str) -> Result<()> {
    let tmp_path = dir.join(temp_name(id));

    tokio::fs::write(&tmp_path, secret.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    rename(&tmp_path, &dir.join(active_name(id))).await
}

async fn rename(from: &Path, to: &Path) -> Result<()> {
    tokio::fs::rename(from, to).await.map_err(|e| {
        Error::Io(format!(
            "renaming {} to {}: {e}",
            from.display(),
            to.display()
        ))
    })
}

async fn remove_file(path: &Path) -> Result<()> {
    tokio::fs::remove_file(path)
        .await
        .map_err(|e| Error::Io(format!("removing {}: {e}", path.display())))
}
