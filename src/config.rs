use chrono::{FixedOffset, NaiveTime, Timelike};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{ExpirationPolicy, FileNamer, LockOptions, TierKind};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub expiration: ExpirationConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  /// Cached entities by name
  #[serde(default)]
  pub entities: BTreeMap<String, EntityConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpirationConfig {
  /// Daily wall-clock cutoff, "HH:MM"
  pub cutoff: String,
  /// Timezone of the cutoff as a UTC offset, e.g. "+02:00"
  #[serde(default = "default_utc_offset")]
  pub utc_offset: String,
}

fn default_utc_offset() -> String {
  "+00:00".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  /// Directory for file tiers (defaults to $XDG_DATA_HOME/tiercache)
  pub directory: Option<PathBuf>,
  #[serde(default = "default_lock_stale_ms")]
  pub lock_stale_ms: u64,
  #[serde(default = "default_lock_update_ms")]
  pub lock_update_ms: u64,
  #[serde(default)]
  pub lock_retries: u32,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      directory: None,
      lock_stale_ms: default_lock_stale_ms(),
      lock_update_ms: default_lock_update_ms(),
      lock_retries: 0,
    }
  }
}

fn default_lock_stale_ms() -> u64 {
  10_000
}

fn default_lock_update_ms() -> u64 {
  5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
  /// Tier kinds, most preferred first. The last one must be `origin`.
  pub tiers: Vec<TierKind>,
  /// URL the origin tier fetches from
  pub url: String,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tiercache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tiercache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/tiercache/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tiercache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tiercache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.policy()?;

    if self.storage.lock_update_ms >= self.storage.lock_stale_ms {
      return Err(eyre!(
        "lock_update_ms ({}) must be shorter than lock_stale_ms ({})",
        self.storage.lock_update_ms,
        self.storage.lock_stale_ms
      ));
    }

    for (name, entity) in &self.entities {
      match entity.tiers.last() {
        None => return Err(eyre!("Entity {} has no tiers", name)),
        Some(TierKind::Origin) => {}
        Some(kind) => {
          return Err(eyre!(
            "Entity {} must end with an origin tier, not {}",
            name,
            kind
          ))
        }
      }
      url::Url::parse(&entity.url)
        .map_err(|e| eyre!("Entity {} has an invalid url {:?}: {}", name, entity.url, e))?;
    }

    Ok(())
  }

  pub fn policy(&self) -> Result<ExpirationPolicy> {
    let cutoff = NaiveTime::parse_from_str(&self.expiration.cutoff, "%H:%M")
      .map_err(|e| eyre!("Invalid cutoff {:?}: {}", self.expiration.cutoff, e))?;
    let offset: FixedOffset = self
      .expiration
      .utc_offset
      .parse()
      .map_err(|e| eyre!("Invalid utc_offset {:?}: {}", self.expiration.utc_offset, e))?;
    ExpirationPolicy::new(cutoff.hour(), cutoff.minute(), offset)
  }

  pub fn storage_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.storage.directory {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tiercache"))
  }

  pub fn file_namer(&self) -> Result<FileNamer> {
    Ok(FileNamer::new(self.storage_dir()?))
  }

  pub fn lock_options(&self) -> LockOptions {
    LockOptions {
      stale: Duration::from_millis(self.storage.lock_stale_ms),
      update: Duration::from_millis(self.storage.lock_update_ms),
      retries: self.storage.lock_retries,
      ..LockOptions::default()
    }
  }

  pub fn entity(&self, name: &str) -> Result<&EntityConfig> {
    self.entities.get(name).ok_or_else(|| {
      eyre!(
        "Unknown entity {:?}. Configured: {}",
        name,
        self.entities.keys().cloned().collect::<Vec<_>>().join(", ")
      )
    })
  }
}
