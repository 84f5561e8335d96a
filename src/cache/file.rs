//! Durable tier persisting expiration and value to a single locked file.
//!
//! Layout: `<header>\n<payload>`. The header is the expiration as RFC 3339 text,
//! the payload is the JSON-encoded value. A file ending right after the
//! delimiter holds no value.
//!
//! Header width changes between writes (sub-second precision varies), so saving
//! resizes the header in place by shifting the bytes that follow it instead of
//! rewriting the whole file. The cost of a header update is independent of the
//! payload size.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use std::io::SeekFrom;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::lock::{FileLock, LockOptions};
use super::traits::{Cacheable, Capabilities, Loaded, Persisted, TierStorage};

pub const DELIMITER: &[u8] = b"\n";

/// Shortest well-formed header plus delimiter (`2024-01-02T03:00:00Z\n`).
pub const MIN_HEADER_LEN: u64 = 21;

/// Headers longer than this are treated as corrupt.
const MAX_HEADER_LEN: u64 = 128;

const SCAN_CHUNK: usize = 32;
const COPY_CHUNK: usize = 64 * 1024;

struct OpenCache {
  file: File,
  lock: FileLock,
}

/// File-backed tier. One instance per path per process; other processes are
/// kept out by an advisory lock held between `init` and `dispose`.
pub struct FileCachedValue<T> {
  path: PathBuf,
  lock_options: LockOptions,
  open: Mutex<Option<OpenCache>>,
  _value: PhantomData<fn() -> T>,
}

impl<T> FileCachedValue<T> {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self::with_lock_options(path, LockOptions::default())
  }

  pub fn with_lock_options(path: impl Into<PathBuf>, lock_options: LockOptions) -> Self {
    Self {
      path: path.into(),
      lock_options,
      open: Mutex::new(None),
      _value: PhantomData,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn not_open(&self) -> color_eyre::eyre::Report {
    eyre!("Cache file {} is not open", self.path.display())
  }
}

#[async_trait]
impl<T: Cacheable> TierStorage<T> for FileCachedValue<T> {
  fn kind(&self) -> &'static str {
    "file"
  }

  fn capabilities(&self) -> Capabilities {
    // Durable tiers own their file and may delete it.
    Capabilities {
      needs_source: true,
      needs_init: true,
      destroyable: true,
    }
  }

  async fn init(&self, ceiling: DateTime<Utc>) -> Result<()> {
    let mut open = self.open.lock().await;
    if open.is_some() {
      return Ok(());
    }

    if let Some(parent) = self.path.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| eyre!("Failed to create cache directory {}: {}", parent.display(), e))?;
    }

    let lock = FileLock::acquire(&self.path, &self.lock_options).await?;

    let mut file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&self.path)
      .await
      .map_err(|e| eyre!("Failed to open cache file {}: {}", self.path.display(), e))?;

    let len = file_len(&file).await?;
    if len < MIN_HEADER_LEN {
      debug!("Writing fresh header to {}", self.path.display());
      let mut fresh = render_header(ceiling);
      fresh.extend_from_slice(DELIMITER);
      file.set_len(0).await?;
      write_at(&mut file, 0, &fresh).await?;
    }

    *open = Some(OpenCache { file, lock });
    Ok(())
  }

  async fn load(&self) -> Result<Loaded<T>> {
    let mut open = self.open.lock().await;
    let cache = open.as_mut().ok_or_else(|| self.not_open())?;

    let bytes = read_all(&mut cache.file).await?;
    let split = bytes
      .windows(DELIMITER.len())
      .position(|w| w == DELIMITER)
      .ok_or_else(|| eyre!("Cache file {} has no header delimiter", self.path.display()))?;

    let expiration = parse_header(&bytes[..split])?;
    let payload = &bytes[split + DELIMITER.len()..];
    if payload.is_empty() {
      return Ok(Loaded::new(None, Some(expiration)));
    }

    let value: T = serde_json::from_slice(payload).map_err(|e| {
      eyre!(
        "Failed to deserialize cached value in {}: {}",
        self.path.display(),
        e
      )
    })?;
    Ok(Loaded::new(Some(value), Some(expiration)))
  }

  async fn load_expiration(&self) -> Result<Option<Persisted>> {
    let mut open = self.open.lock().await;
    let cache = open.as_mut().ok_or_else(|| self.not_open())?;

    let Some(header_len) = find_delimiter(&mut cache.file).await? else {
      return Ok(None);
    };
    let mut header = vec![0u8; header_len as usize];
    read_exact_at(&mut cache.file, 0, &mut header).await?;
    let expiration = parse_header(&header)?;
    let has_value = file_len(&cache.file).await? > header_len + DELIMITER.len() as u64;

    Ok(Some(Persisted {
      expiration,
      has_value,
    }))
  }

  async fn save(&self, value: Option<&T>, expiration: DateTime<Utc>) -> Result<()> {
    let payload = value
      .map(serde_json::to_vec)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize value for {}: {}", self.path.display(), e))?;

    let mut open = self.open.lock().await;
    let cache = open.as_mut().ok_or_else(|| self.not_open())?;

    let header_len = rewrite_header(&mut cache.file, &render_header(expiration)).await?;
    let payload_at = header_len + DELIMITER.len() as u64;
    match payload {
      Some(bytes) => {
        write_at(&mut cache.file, payload_at, &bytes).await?;
        cache.file.set_len(payload_at + bytes.len() as u64).await?;
      }
      None => cache.file.set_len(payload_at).await?,
    }
    cache.file.flush().await?;
    Ok(())
  }

  async fn save_expiration(&self, expiration: DateTime<Utc>) -> Result<()> {
    let mut open = self.open.lock().await;
    let cache = open.as_mut().ok_or_else(|| self.not_open())?;
    rewrite_header(&mut cache.file, &render_header(expiration)).await?;
    cache.file.flush().await?;
    Ok(())
  }

  async fn clear(&self) -> Result<bool> {
    let mut open = self.open.lock().await;
    let cache = open.as_mut().ok_or_else(|| self.not_open())?;

    let Some(header_len) = find_delimiter(&mut cache.file).await? else {
      return Ok(false);
    };
    let keep = header_len + DELIMITER.len() as u64;
    if file_len(&cache.file).await? <= keep {
      return Ok(false);
    }
    cache.file.set_len(keep).await?;
    Ok(true)
  }

  async fn dispose(&self) -> Result<()> {
    let Some(mut cache) = self.open.lock().await.take() else {
      return Ok(());
    };
    cache.file.flush().await?;
    cache
      .file
      .sync_all()
      .await
      .map_err(|e| eyre!("Failed to sync cache file {}: {}", self.path.display(), e))?;
    drop(cache.file);
    cache.lock.release().await
  }

  async fn destroy(&self) -> Result<()> {
    match tokio::fs::remove_file(&self.path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(eyre!(
        "Failed to delete cache file {}: {}",
        self.path.display(),
        e
      )),
    }
  }
}

pub fn render_header(expiration: DateTime<Utc>) -> Vec<u8> {
  expiration
    .to_rfc3339_opts(SecondsFormat::AutoSi, true)
    .into_bytes()
}

pub fn parse_header(bytes: &[u8]) -> Result<DateTime<Utc>> {
  let text = std::str::from_utf8(bytes).map_err(|_| eyre!("Cache header is not UTF-8"))?;
  DateTime::parse_from_rfc3339(text)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Malformed cache header {:?}: {}", text, e))
}

/// Replace the header with `header`, shifting everything from the delimiter on
/// so the payload stays intact. Returns the new header length.
async fn rewrite_header(file: &mut File, header: &[u8]) -> Result<u64> {
  let new_len = header.len() as u64;
  let Some(old_len) = find_delimiter(file).await? else {
    // No usable header: start over.
    file.set_len(0).await?;
    write_at(file, 0, header).await?;
    write_at(file, new_len, DELIMITER).await?;
    return Ok(new_len);
  };

  let total = file_len(file).await?;
  let tail = total - old_len;
  if new_len < old_len {
    debug!("Shrinking cache header {} -> {} bytes", old_len, new_len);
    copy_within(file, old_len, new_len, tail).await?;
    file.set_len(total - (old_len - new_len)).await?;
  } else if new_len > old_len {
    debug!("Growing cache header {} -> {} bytes", old_len, new_len);
    copy_within(file, old_len, new_len, tail).await?;
  }
  write_at(file, 0, header).await?;
  Ok(new_len)
}

/// Offset of the header delimiter, scanning in small chunks and never reading
/// past it more than one chunk.
async fn find_delimiter(file: &mut File) -> Result<Option<u64>> {
  file.seek(SeekFrom::Start(0)).await?;
  let mut seen: Vec<u8> = Vec::with_capacity(SCAN_CHUNK * 2);
  let mut chunk = [0u8; SCAN_CHUNK];

  while (seen.len() as u64) < MAX_HEADER_LEN {
    let n = file.read(&mut chunk).await?;
    if n == 0 {
      return Ok(None);
    }
    let from = seen.len().saturating_sub(DELIMITER.len() - 1);
    seen.extend_from_slice(&chunk[..n]);
    if let Some(pos) = seen[from..]
      .windows(DELIMITER.len())
      .position(|w| w == DELIMITER)
    {
      return Ok(Some((from + pos) as u64));
    }
  }
  Ok(None)
}

/// Move `len` bytes from `from` to `to` within the same file using a bounded
/// buffer. Right shifts run backward from the end so no byte is overwritten
/// before it has been moved.
async fn copy_within(file: &mut File, from: u64, to: u64, len: u64) -> Result<()> {
  if from == to || len == 0 {
    return Ok(());
  }
  let mut buf = vec![0u8; COPY_CHUNK.min(len as usize)];

  if to < from {
    let mut done = 0u64;
    while done < len {
      let n = (buf.len() as u64).min(len - done) as usize;
      read_exact_at(file, from + done, &mut buf[..n]).await?;
      write_at(file, to + done, &buf[..n]).await?;
      done += n as u64;
    }
  } else {
    let mut remaining = len;
    while remaining > 0 {
      let n = (buf.len() as u64).min(remaining) as usize;
      let offset = remaining - n as u64;
      read_exact_at(file, from + offset, &mut buf[..n]).await?;
      write_at(file, to + offset, &buf[..n]).await?;
      remaining = offset;
    }
  }
  Ok(())
}

async fn read_all(file: &mut File) -> Result<Vec<u8>> {
  file.seek(SeekFrom::Start(0)).await?;
  let mut bytes = Vec::new();
  file.read_to_end(&mut bytes).await?;
  Ok(bytes)
}

async fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<()> {
  file.seek(SeekFrom::Start(offset)).await?;
  file.read_exact(buf).await?;
  Ok(())
}

async fn write_at(file: &mut File, offset: u64, bytes: &[u8]) -> Result<()> {
  file.seek(SeekFrom::Start(offset)).await?;
  file.write_all(bytes).await?;
  file.flush().await?;
  Ok(())
}

async fn file_len(file: &File) -> Result<u64> {
  Ok(file.metadata().await?.len())
}
