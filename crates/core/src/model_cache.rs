//! Model acquisition: resolve a locator to model bytes, fetching remote
//! models once and serving later loads from a [`ModelCache`].
//!
//! Cache failures never fail a load; they are logged and the model is
//! fetched again.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::logging::redact_sensitive_text;

const FETCH_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const FETCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const FETCH_MAX_ATTEMPTS: usize = 3;
const FETCH_RETRY_BACKOFF_MS: u64 = 250;
const CACHE_KEY_PREFIX: &str = "model_";
const CACHE_KEY_MAX_SANITIZED: usize = 96;
const CACHE_FILE_EXTENSION: &str = "onnx";

/// Key/value store for downloaded model bytes.
pub trait ModelCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Retrieves model bytes from a remote URL.
pub trait ModelFetcher: Send + Sync {
    fn fetch(&self, url: &Url) -> Result<Vec<u8>>;
}

/// Cache key for a locator: `model_` plus the locator with every
/// non-alphanumeric character replaced by `_`, suffixed with a short digest
/// so truncated or colliding sanitizations stay distinct.
///
/// Query, fragment and userinfo of URLs stay out of the readable part; the
/// digest still covers the full locator.
pub fn cache_key(locator: &str) -> String {
    let readable = match Url::parse(locator) {
        Ok(mut url) if url.has_host() => {
            url.set_query(None);
            url.set_fragment(None);
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        _ => locator.to_string(),
    };
    let sanitized: String = readable
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .take(CACHE_KEY_MAX_SANITIZED)
        .collect();
    let digest = Sha256::digest(locator.as_bytes());
    let digest_hex = format!("{digest:x}");
    format!("{CACHE_KEY_PREFIX}{sanitized}_{}", &digest_hex[..12])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelLocator {
    Remote(Url),
    Local(PathBuf),
}

impl ModelLocator {
    /// Accepts http(s) URLs, `file://` URLs, and bare filesystem paths.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("model locator is empty");
        }

        match Url::parse(raw) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Ok(Self::Remote(url)),
                "file" => url
                    .to_file_path()
                    .map(Self::Local)
                    .map_err(|_| anyhow!("invalid file URL: {raw}")),
                // Windows drive letters parse as one-letter schemes.
                scheme if scheme.len() == 1 => Ok(Self::Local(PathBuf::from(raw))),
                scheme => bail!(
                    "unsupported model URL scheme '{scheme}' for '{}' (expected http, https or file)",
                    redact_sensitive_text(raw)
                ),
            },
            Err(_) => Ok(Self::Local(PathBuf::from(raw))),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Self::Remote(url) => redacted_url_for_display(url),
            Self::Local(path) => path.display().to_string(),
        }
    }
}

fn redacted_url_for_display(url: &Url) -> String {
    let mut display = url.clone();
    if !display.username().is_empty() || display.password().is_some() {
        let _ = display.set_username("");
        let _ = display.set_password(None);
    }
    redact_sensitive_text(display.as_str())
}

pub struct ModelLoader {
    cache: Arc<dyn ModelCache>,
    fetcher: Arc<dyn ModelFetcher>,
}

impl ModelLoader {
    pub fn new(cache: Arc<dyn ModelCache>, fetcher: Arc<dyn ModelFetcher>) -> Self {
        Self { cache, fetcher }
    }

    pub fn load(&self, locator: &str) -> Result<Vec<u8>> {
        match ModelLocator::parse(locator)? {
            ModelLocator::Local(path) => {
                debug!(path = %path.display(), "Reading local model");
                fs::read(&path)
                    .with_context(|| format!("failed to read model file: {}", path.display()))
            }
            ModelLocator::Remote(url) => self.load_remote(&url),
        }
    }

    fn load_remote(&self, url: &Url) -> Result<Vec<u8>> {
        let shown_url = redacted_url_for_display(url);
        let key = cache_key(url.as_str());

        match self.cache.get(&key) {
            Ok(Some(bytes)) => {
                debug!(url = %shown_url, %key, bytes = bytes.len(), "Model served from cache");
                return Ok(bytes);
            }
            Ok(None) => debug!(url = %shown_url, %key, "Model cache miss"),
            Err(error) => warn!(
                url = %shown_url,
                %key,
                error = %format!("{error:#}"),
                "Model cache read failed; fetching"
            ),
        }

        let bytes = self
            .fetcher
            .fetch(url)
            .with_context(|| format!("failed to fetch model from {shown_url}"))?;
        info!(url = %shown_url, bytes = bytes.len(), "Model fetched");

        if let Err(error) = self.cache.put(&key, &bytes) {
            warn!(
                url = %shown_url,
                %key,
                error = %format!("{error:#}"),
                "Model cache write failed; continuing without caching"
            );
        }

        Ok(bytes)
    }
}

#[derive(Debug, Default)]
pub struct MemoryModelCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModelCache for MemoryModelCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("model cache lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("model cache lock poisoned"))?;
        entries.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// One `<key>.onnx` file per model under `root`.
#[derive(Debug, Clone)]
pub struct FsModelCache {
    root: PathBuf,
}

impl FsModelCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.{CACHE_FILE_EXTENSION}"))
    }
}

impl ModelCache for FsModelCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error)
                .with_context(|| format!("failed to read cached model: {}", path.display())),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root).with_context(|| {
            format!("failed to create model cache dir: {}", self.root.display())
        })?;

        let final_path = self.entry_path(key);
        let tmp_path = final_path.with_extension(format!("{CACHE_FILE_EXTENSION}.part"));
        cleanup_file_if_exists(&tmp_path);

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
        let mut tmp_guard = TempFileCleanupGuard::new(&tmp_path);

        tmp_file
            .write_all(bytes)
            .with_context(|| format!("failed to write temp file: {}", tmp_path.display()))?;
        tmp_file
            .sync_all()
            .with_context(|| format!("failed to fsync temp file: {}", tmp_path.display()))?;
        drop(tmp_file);

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to atomically move {} -> {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        tmp_guard.disarm();
        Ok(())
    }
}

struct TempFileCleanupGuard<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> TempFileCleanupGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn disarm(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileCleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.keep {
            cleanup_file_if_exists(self.path);
        }
    }
}

fn cleanup_file_if_exists(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Blocking HTTP fetcher with bounded retries on transient failures.
///
/// The client is built per fetch, so constructing a fetcher inside an async
/// runtime is fine; `fetch` itself must run off the runtime's threads.
#[derive(Debug, Clone)]
pub struct HttpModelFetcher {
    max_attempts: usize,
}

impl Default for HttpModelFetcher {
    fn default() -> Self {
        Self {
            max_attempts: FETCH_MAX_ATTEMPTS,
        }
    }
}

impl HttpModelFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelFetcher for HttpModelFetcher {
    fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        let redacted = redacted_url_for_display(url);
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(FETCH_CONNECT_TIMEOUT)
            .timeout(FETCH_REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client for model fetch")?;

        let max_attempts = self.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match fetch_once(&client, url, &redacted) {
                Ok(bytes) => return Ok(bytes),
                Err(FetchAttemptError { retryable, error }) => {
                    if retryable && attempt < max_attempts {
                        debug!(
                            url = %redacted,
                            attempt,
                            max_attempts,
                            error = %error,
                            "model fetch attempt failed; retrying"
                        );
                        let backoff_ms = FETCH_RETRY_BACKOFF_MS.saturating_mul(attempt as u64);
                        std::thread::sleep(Duration::from_millis(backoff_ms));
                        continue;
                    }

                    if retryable {
                        return Err(anyhow!(
                            "model fetch failed after {max_attempts} attempts for {redacted}: {error}"
                        ));
                    }
                    return Err(error);
                }
            }
        }

        Err(anyhow!(
            "model fetch failed after {max_attempts} attempts for {redacted}"
        ))
    }
}

fn fetch_once(
    client: &reqwest::blocking::Client,
    url: &Url,
    redacted_url: &str,
) -> std::result::Result<Vec<u8>, FetchAttemptError> {
    let response = client.get(url.as_str()).send().map_err(|err| {
        let wrapped = anyhow!("failed to start model fetch from {redacted_url}");
        FetchAttemptError::classify(&err, wrapped)
    })?;

    let status = response.status();
    if !status.is_success() {
        let wrapped = anyhow!(
            "model fetch returned HTTP {} for {}",
            status.as_u16(),
            redacted_url
        );
        return Err(if is_retryable_status(status) {
            FetchAttemptError::retryable(wrapped)
        } else {
            FetchAttemptError::fatal(wrapped)
        });
    }

    let bytes = response.bytes().map_err(|err| {
        let wrapped = anyhow!("failed while reading model body from {redacted_url}");
        FetchAttemptError::classify(&err, wrapped)
    })?;

    if bytes.is_empty() {
        return Err(FetchAttemptError::fatal(anyhow!(
            "model fetch returned an empty body for {redacted_url}"
        )));
    }

    Ok(bytes.to_vec())
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

struct FetchAttemptError {
    retryable: bool,
    error: anyhow::Error,
}

impl FetchAttemptError {
    fn retryable(error: anyhow::Error) -> Self {
        Self {
            retryable: true,
            error,
        }
    }

    fn fatal(error: anyhow::Error) -> Self {
        Self {
            retryable: false,
            error,
        }
    }

    fn classify(err: &reqwest::Error, wrapped: anyhow::Error) -> Self {
        if is_retryable_reqwest_error(err) {
            Self::retryable(wrapped)
        } else {
            Self::fatal(wrapped)
        }
    }
}
