// SPDX-License-Identifier: GPL-3.0-or-later
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaServerError {
    #[error("media server request failed: {0}")]
    Request(String),
    #[error("media server rejected the token")]
    Unauthorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    Movie,
    Show,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibrarySection {
    pub id: String,
    pub kind: SectionKind,
    pub locations: Vec<PathBuf>,
}

impl LibrarySection {
    pub fn contains(&self, path: &Path) -> bool {
        self.locations.iter().any(|l| path.starts_with(l))
    }
}

/// Media server collaborator, e.g. Plex.
#[async_trait]
pub trait MediaServer: Send + Sync {
    async fn sections(&self) -> Result<Vec<LibrarySection>, MediaServerError>;
    async fn scan_path(&self, section_id: &str, path: &Path) -> Result<(), MediaServerError>;
    /// File paths of every part matching `title`.
    async fn search(&self, title: &str) -> Result<Vec<PathBuf>, MediaServerError>;
    async fn remove_item(&self, path: &Path) -> Result<bool, MediaServerError>;

    async fn contains_path(&self, title: &str, path: &Path) -> Result<bool, MediaServerError> {
        Ok(self.search(title).await?.iter().any(|p| p == path))
    }
}

/// Used without a media server: the filesystem is the library.
#[derive(Debug, Clone, Default)]
pub struct FilesystemLibrary;

#[async_trait]
impl MediaServer for FilesystemLibrary {
    async fn sections(&self) -> Result<Vec<LibrarySection>, MediaServerError> {
        Ok(Vec::new())
    }

    async fn scan_path(&self, _section_id: &str, _path: &Path) -> Result<(), MediaServerError> {
        Ok(())
    }

    async fn search(&self, _title: &str) -> Result<Vec<PathBuf>, MediaServerError> {
        Ok(Vec::new())
    }

    async fn remove_item(&self, path: &Path) -> Result<bool, MediaServerError> {
        Ok(!path.exists())
    }

    async fn contains_path(&self, _title: &str, path: &Path) -> Result<bool, MediaServerError> {
        Ok(path.exists())
    }
}
