use futures_util::future::BoxFuture;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::CoreError;

/// Storage for uploaded message attachments.
pub trait FileStore: Send + Sync {
    /// Remove the file behind an attachment URL. Missing files are not an error.
    fn delete<'a>(&'a self, file_url: &'a str) -> BoxFuture<'a, Result<(), CoreError>>;
}

/// Attachments on the local filesystem, served under `url_prefix`.
#[derive(Clone)]
pub struct LocalFileStore {
    base_path: PathBuf,
    url_prefix: String,
}

impl LocalFileStore {
    pub fn new(base_path: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            url_prefix: url_prefix.into(),
        }
    }

    /// Map an attachment URL to a path under `base_path`.
    ///
    /// `Ok(None)` means the URL points somewhere this store does not own.
    pub fn resolve(&self, file_url: &str) -> Result<Option<PathBuf>, CoreError> {
        let Some(key) = file_url.strip_prefix(&self.url_prefix) else {
            return Ok(None);
        };
        let key = Path::new(key.trim_start_matches('/'));
        if key.as_os_str().is_empty()
            || key.components().any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CoreError::validation("invalid attachment path"));
        }
        Ok(Some(self.base_path.join(key)))
    }
}

impl FileStore for LocalFileStore {
    fn delete<'a>(&'a self, file_url: &'a str) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            let Some(path) = self.resolve(file_url)? else {
                tracing::debug!(file_url, "attachment not locally stored, skipping delete");
                return Ok(());
            };
            match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(CoreError::Internal(format!(
                    "failed to delete {}: {err}",
                    path.display()
                ))),
            }
        })
    }
}
