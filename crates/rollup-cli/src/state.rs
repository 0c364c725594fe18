//! State file: the in-memory store and run log persisted as one JSON document
//! between CLI invocations.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use rollup_core::domain::SourceBar;
use rollup_core::impls::{InMemoryRunLog, InMemoryTaskStore, RunLogSnapshot, StoreSnapshot};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    store: StoreSnapshot,
    #[serde(default)]
    run_log: RunLogSnapshot,
}

/// Store + run log loaded from `path`. A missing file is an empty state.
///
/// An exclusive lock on `<path>.lock` is held from `load` until the workspace
/// is dropped, so a second invocation on the same state fails instead of
/// overwriting the first one's save.
pub struct Workspace {
    path: PathBuf,
    _lock: fs::File,
    pub store: InMemoryTaskStore,
    pub run_log: InMemoryRunLog,
}

impl Workspace {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = acquire_lock(&path)?;
        let file = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading state file {}", path.display()))?;
            serde_json::from_str::<StateFile>(&raw)
                .with_context(|| format!("parsing state file {}", path.display()))?
        } else {
            debug!(path = %path.display(), "no state file yet, starting empty");
            StateFile::default()
        };

        Ok(Self {
            store: InMemoryTaskStore::from_snapshot(file.store),
            run_log: InMemoryRunLog::from_snapshot(file.run_log),
            _lock: lock,
            path,
        })
    }

    /// Writes to a sibling temp file, then renames over the target.
    pub async fn save(&self) -> Result<()> {
        let file = StateFile {
            store: self.store.snapshot().await,
            run_log: self.run_log.snapshot().await,
        };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing state file {}", self.path.display()))?;
        debug!(path = %self.path.display(), "state saved");
        Ok(())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

// the state file itself is replaced by rename on save, so the lock lives beside it
fn acquire_lock(path: &Path) -> Result<fs::File> {
    let lock_path = lock_path(path);
    let file = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("opening lock file {}", lock_path.display()))?;
    if let Err(err) = file.try_lock_exclusive() {
        debug!(path = %lock_path.display(), error = %err, "state lock not acquired");
        bail!(
            "state file {} is in use by another rollup process",
            path.display()
        );
    }
    Ok(file)
}

/// Reads 1m source bars, one JSON object per line. Blank lines are ignored.
pub fn read_bars(path: &Path) -> Result<Vec<SourceBar>> {
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut bars = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let bar: SourceBar = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid bar", path.display(), idx + 1))?;
        bars.push(bar);
    }
    Ok(bars)
}
