//! Fetches `filesToLoad` entries into the execution context's filesystem.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::FileToLoad;
use crate::runtime::{FsError, VirtualFs};

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Attempts per remote file, including the first one.
    pub max_attempts: u32,
    /// Base delay; attempt `n` waits `n × retry_delay` before retrying.
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl LoaderConfig {
    pub fn from_config(cfg: &Config) -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: cfg
                .get_u64("FILE_LOAD_RETRIES")
                .map(|n| n.clamp(1, u32::MAX as u64) as u32)
                .unwrap_or(defaults.max_attempts),
            retry_delay: cfg
                .get_u64("FILE_LOAD_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            request_timeout: cfg
                .get_u64("REQUEST_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to load {url} after {attempts} attempts: {reason}")]
    Exhausted { url: String, attempts: u32, reason: String },
    #[error("File entry '{0}' has neither content nor url")]
    MissingSource(String),
    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: FsError,
    },
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

pub struct FileLoader {
    client: Client,
    config: LoaderConfig,
}

impl FileLoader {
    pub fn new(config: LoaderConfig) -> Result<Self, LoadError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    /// Materialize every entry, stopping at the first one that fails.
    pub async fn load_all(&self, files: &[FileToLoad], fs: &mut dyn VirtualFs) -> Result<usize, LoadError> {
        for file in files {
            self.load(file, fs).await?;
        }
        Ok(files.len())
    }

    pub async fn load(&self, file: &FileToLoad, fs: &mut dyn VirtualFs) -> Result<(), LoadError> {
        let content = match (&file.content, &file.url) {
            (Some(content), _) => content.clone(),
            (None, Some(url)) => self.fetch(url).await?,
            (None, None) => return Err(LoadError::MissingSource(file.path.clone())),
        };
        fs.write_file(&file.path, &content)
            .map_err(|source| LoadError::Write { path: file.path.clone(), source })?;
        info!(path = %file.path, bytes = content.len(), "file loaded");
        Ok(())
    }

    /// Fetch a URL, retrying with a linear backoff.
    pub async fn fetch(&self, url: &str) -> Result<String, LoadError> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(%url, attempt, attempts, "fetching file");
            match self.fetch_once(url).await {
                Ok(content) => return Ok(content),
                Err(reason) if attempt >= attempts => {
                    return Err(LoadError::Exhausted { url: url.to_string(), attempts, reason });
                }
                Err(reason) => {
                    warn!(%url, attempt, %reason, "file fetch failed, retrying");
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
            }
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<String, String> {
        if let Some(path) = local_path(url) {
            return std::fs::read_to_string(path).map_err(|e| e.to_string());
        }
        let resp = self.client.get(url).send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        resp.text().await.map_err(|e| e.to_string())
    }
}

/// Non-HTTP sources are read from the host filesystem.
fn local_path(url: &str) -> Option<&str> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return None;
    }
    Some(url.strip_prefix("file://").unwrap_or(url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MemoryFs;

    fn quick() -> LoaderConfig {
        LoaderConfig {
            max_attempts: 2,
            retry_delay: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn inline_content_is_written_with_parents() {
        let loader = FileLoader::new(quick()).unwrap();
        let mut fs = MemoryFs::new();
        let files = [FileToLoad::inline("pkg/util.py", "X = 1\n")];
        assert_eq!(loader.load_all(&files, &mut fs).await.unwrap(), 1);
        assert_eq!(fs.read_file("pkg/util.py").unwrap(), "X = 1\n");
    }

    #[tokio::test]
    async fn local_sources_are_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data.csv");
        std::fs::write(&source, "a,b\n1,2\n").unwrap();
        let loader = FileLoader::new(quick()).unwrap();
        let mut fs = MemoryFs::new();
        let url = format!("file://{}", source.display());
        loader.load(&FileToLoad::remote("data.csv", url), &mut fs).await.unwrap();
        assert_eq!(fs.read_file("data.csv").unwrap(), "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn missing_source_exhausts_retries() {
        let loader = FileLoader::new(quick()).unwrap();
        let mut fs = MemoryFs::new();
        let err = loader
            .load(&FileToLoad::remote("x.txt", "/definitely/not/here.txt"), &mut fs)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Exhausted { attempts: 2, .. }), "{err}");
        assert!(!fs.exists("x.txt").unwrap());
    }
}
