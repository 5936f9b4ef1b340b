use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

use crate::constants::{ACCOUNTS_FILE, ENV_DATA_DIR};
use crate::error::{AppError, AppResult};
use crate::models::PoolDocument;

const DATA_DIR: &str = "opencode";

// Resolve the directory holding the accounts document. Env override first,
// then a per-process temp dir under test, then the platform config dir.
pub fn data_dir() -> AppResult<PathBuf> {
    fn ensure_dir(path: &PathBuf) -> AppResult<()> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        Ok(())
    }

    if let Ok(env_path) = std::env::var(ENV_DATA_DIR) {
        if !env_path.trim().is_empty() {
            let dir = PathBuf::from(env_path);
            ensure_dir(&dir)?;
            return Ok(dir);
        }
    }
    if cfg!(test) {
        let dir = std::env::temp_dir().join(format!(".antigravity-relay-test-{}", std::process::id()));
        ensure_dir(&dir)?;
        return Ok(dir);
    }
    if let Some(config) = dirs::config_dir() {
        let dir = config.join(DATA_DIR);
        if ensure_dir(&dir).is_ok() {
            return Ok(dir);
        }
    }
    let fallback = std::env::temp_dir().join(DATA_DIR);
    ensure_dir(&fallback)?;
    Ok(fallback)
}

// Durable load/save of the accounts document. Whole-document replace only;
// callers treat the in-memory pool as authoritative when a save fails.
#[derive(Debug, Clone)]
pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn at_default_location() -> AppResult<Self> {
        Ok(Self {
            path: data_dir()?.join(ACCOUNTS_FILE),
        })
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // Missing, empty, and unparseable documents all load as `None`; a corrupt
    // file must not take the whole request path down.
    pub fn load(&self) -> AppResult<Option<PoolDocument>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<PoolDocument>(&content) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                warn!(
                    "[W-ACCOUNTS-PARSE] ignoring_unparseable_accounts_document at {:?}: {}",
                    self.path, e
                );
                Ok(None)
            }
        }
    }

    // Atomic full replace: write to a uniquely named temp file, then rename.
    pub fn save(&self, doc: &PoolDocument) -> AppResult<()> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| AppError::Config(format!("failed_to_serialize_accounts_document: {}", e)))?;
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_name = format!(
            "{}.{}.{}.tmp",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| ACCOUNTS_FILE.to_string()),
            std::process::id(),
            seq,
        );
        let tmp_path = self.path.with_file_name(tmp_name);
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    // Explicit credential-clearing path only; the request path never deletes
    // the document.
    pub fn clear(&self) -> AppResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
