//! Object-store capability for raw files, curated training sets and model artifacts.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const LANDING_PREFIX: &str = "landing-zone/";
pub const CURATED_PREFIX: &str = "curated-zone/";
pub const CHECKPOINT_PREFIX: &str = "models/checkpoints/";
pub const LATEST_MODEL_KEY: &str = "models/model.json";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {0} not found")]
    NotFound(String),
    #[error("invalid artifact key '{0}'")]
    InvalidKey(String),
    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

pub trait ArtifactStore: Send + Sync {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ArtifactError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ArtifactError>;
}

pub fn sort_newest_first(objects: &mut [ObjectMeta]) {
    objects.sort_by(|a, b| {
        b.last_modified
            .cmp(&a.last_modified)
            .then_with(|| b.key.cmp(&a.key))
    });
}

#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(ArtifactError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn collect(&self, dir: &Path, out: &mut Vec<ObjectMeta>) -> Result<(), ArtifactError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_err(&dir.display().to_string(), err)),
        };

        for entry in entries {
            let entry = entry.map_err(|err| io_err(&dir.display().to_string(), err))?;
            let path = entry.path();
            let meta = entry
                .metadata()
                .map_err(|err| io_err(&path.display().to_string(), err))?;
            if meta.is_dir() {
                self.collect(&path, out)?;
                continue;
            }
            if path
                .file_name()
                .map(|name| name.to_string_lossy().ends_with(".tmp"))
                .unwrap_or(false)
            {
                continue;
            }
            let Some(key) = self.key_for(&path) else {
                continue;
            };
            let modified = meta
                .modified()
                .map_err(|err| io_err(&key, err))?;
            out.push(ObjectMeta {
                key,
                last_modified: DateTime::<Utc>::from(modified),
                size: meta.len(),
            });
        }
        Ok(())
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(parts.join("/"))
    }
}

impl ArtifactStore for LocalArtifactStore {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ArtifactError> {
        let dir_part = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir_part)?
        };

        let mut out = Vec::new();
        self.collect(&start, &mut out)?;
        out.retain(|meta| meta.key.starts_with(prefix));

        debug!(
            component = "artifacts",
            event = "artifacts.list",
            prefix,
            objects = out.len()
        );
        Ok(out)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound(key.to_string())
            } else {
                io_err(key, err)
            }
        })
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| io_err(key, err))?;
        }
        write_atomic(&path, bytes).map_err(|err| io_err(key, err))?;

        debug!(
            component = "artifacts",
            event = "artifacts.put",
            key,
            bytes = bytes.len()
        );
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)
}

fn io_err(key: &str, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
        key: key.to_string(),
        source,
    }
}
