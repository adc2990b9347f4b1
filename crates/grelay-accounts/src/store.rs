use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::record::AccountRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A loaded account: the on-disk record plus per-process runtime state.
/// `path` is `None` for credentials injected through the environment,
/// which are never written back.
#[derive(Debug, Clone)]
pub struct Account {
    pub path: Option<PathBuf>,
    pub record: AccountRecord,
    pub dead: bool,
    pub onboarded: bool,
    /// An enrolment handshake is in flight for this account; guarded by
    /// the pool mutex like `dead`.
    pub onboarding: bool,
}

impl Account {
    pub fn new(path: Option<PathBuf>, record: AccountRecord) -> Self {
        Account {
            path,
            record,
            dead: false,
            onboarded: false,
            onboarding: false,
        }
    }

    pub fn display_name(&self) -> String {
        self.path
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "<env>".to_string())
    }
}

pub fn load_file(path: &Path) -> Result<Account, StoreError> {
    let raw = fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = serde_json::from_str(&raw).map_err(|source| StoreError::Parse {
        name: path.display().to_string(),
        source,
    })?;
    let record = AccountRecord::from_json_value(value).map_err(|source| StoreError::Parse {
        name: path.display().to_string(),
        source,
    })?;
    Ok(Account::new(Some(path.to_path_buf()), record))
}

pub fn load_env_json(raw: &str) -> Result<Account, StoreError> {
    let value = serde_json::from_str(raw).map_err(|source| StoreError::Parse {
        name: "GEMINI_CREDENTIALS".to_string(),
        source,
    })?;
    let record = AccountRecord::from_json_value(value).map_err(|source| StoreError::Parse {
        name: "GEMINI_CREDENTIALS".to_string(),
        source,
    })?;
    Ok(Account::new(None, record))
}

/// Scan `dir` for `*.json` credential files, sorted by name. Files that
/// fail to parse are logged and skipped so one bad file cannot keep the
/// rest of the pool from loading.
pub fn load_dir(dir: &Path) -> Vec<Account> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "accounts directory not readable");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut accounts = Vec::new();
    for path in paths {
        match load_file(&path) {
            Ok(account) => {
                info!(account = %account.display_name(), "loaded account");
                accounts.push(account);
            }
            Err(err) => warn!(file = %path.display(), error = %err, "skipping account file"),
        }
    }
    accounts
}

/// Rewrite the account file atomically: serialize to a sibling temp path,
/// then rename over the original.
pub fn persist(account: &Account) -> io::Result<()> {
    let Some(path) = account.path.as_deref() else {
        return Ok(());
    };
    let data = serde_json::to_vec_pretty(&account.record)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}
