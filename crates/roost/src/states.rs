//! On-disk record of workload states across agent restarts.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::environment::state::ProcessState;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to {op} state file {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// `states.json` under the node root directory.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded states. A missing or empty file means no workloads.
    pub async fn load(&self) -> StateResult<HashMap<String, ProcessState>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(source) => {
                return Err(StateError::Io {
                    op: "read",
                    path: self.path.clone(),
                    source,
                });
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(HashMap::new());
        }
        serde_json::from_slice(&raw).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the file with `states`, atomically.
    pub async fn save(&self, states: &HashMap<String, ProcessState>) -> StateResult<()> {
        let _guard = self.write_lock.lock().await;
        let io_err = |op: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| StateError::Io { op, path, source }
        };

        let body = serde_json::to_vec_pretty(states).map_err(|source| StateError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err("create directory for", &self.path))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(io_err("write", &tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(io_err("replace", &self.path))?;

        debug!("saved {} workload state(s)", states.len());
        Ok(())
    }
}
