//! Filesystem artifact storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::artifact::Artifact;
use crate::error::RetentionError;
use crate::retention::ArtifactStorage;

/// Artifacts stored as files; `location` is a path relative to `root`.
pub struct FsArtifactStorage {
    root: PathBuf,
}

impl FsArtifactStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, artifact: &Artifact) -> Result<PathBuf, RetentionError> {
        let relative = Path::new(&artifact.location);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));
        if escapes {
            return Err(RetentionError::Storage {
                artifact: artifact.id,
                reason: format!("location '{}' is outside the storage root", artifact.location),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStorage for FsArtifactStorage {
    async fn delete(&self, artifact: &Artifact) -> Result<(), RetentionError> {
        let path = self.resolve(artifact)?;
        let result = if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Artifact already absent");
                Ok(())
            }
            Err(e) => Err(RetentionError::Storage {
                artifact: artifact.id,
                reason: e.to_string(),
            }),
        }
    }
}
