use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};

use super::StorageResult;
use crate::error::RagError;

/// Maps logical collection names to the physical table currently backing
/// them. Repointing an entry is the commit point of a replacement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionManifest {
    #[serde(default)]
    collections: HashMap<String, CollectionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub table: String,
    pub updated_at: String,
}

impl CollectionManifest {
    pub fn table_for(&self, name: &str) -> Option<&str> {
        self.collections.get(name).map(|entry| entry.table.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn set(&mut self, name: &str, table: &str) {
        self.collections.insert(
            name.to_string(),
            CollectionEntry {
                table: table.to_string(),
                updated_at: chrono::Utc::now().to_rfc3339(),
            },
        );
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.collections.values().map(|entry| entry.table.as_str())
    }
}

pub async fn load_manifest(path: &Path) -> StorageResult<CollectionManifest> {
    match fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(CollectionManifest::default()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
            RagError::Storage(format!("corrupt manifest at {}: {err}", path.display()))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Ok(CollectionManifest::default())
        }
        Err(err) => Err(RagError::Storage(format!(
            "failed to read manifest at {}: {err}",
            path.display()
        ))),
    }
}

/// Write via temp file + fsync + rename so a crash never leaves a torn
/// manifest behind.
pub async fn store_manifest(path: &Path, manifest: &CollectionManifest) -> StorageResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .await
            .map_err(|err| write_error(path, &err))?;
    }

    let json = serde_json::to_vec_pretty(manifest).map_err(|err| write_error(path, &err))?;

    let tmp_path = temp_path(path);
    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(|err| write_error(path, &err))?;
    file.write_all(&json)
        .await
        .map_err(|err| write_error(path, &err))?;
    file.sync_all()
        .await
        .map_err(|err| write_error(path, &err))?;

    fs::rename(&tmp_path, path)
        .await
        .map_err(|err| write_error(path, &err))?;
    Ok(())
}

fn write_error(path: &Path, err: &dyn std::fmt::Display) -> RagError {
    RagError::Storage(format!(
        "failed to write manifest at {}: {err}",
        path.display()
    ))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let file_name = path
        .file_name()
        .map(|name| format!("{}.tmp", name.to_string_lossy()))
        .unwrap_or_else(|| "manifest.tmp".to_string());
    tmp.set_file_name(file_name);
    tmp
}
