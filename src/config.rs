use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{media, scroll, views};

const DEFAULT_ENV_PREFIX: &str = "HOMEFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub views: ViewsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Hosted row store. An empty `base_url` selects the in-process backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub viewer_id: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            access_token: None,
            user_agent: default_user_agent(),
            viewer_id: None,
        }
    }
}

fn default_user_agent() -> String {
    format!("homefeed/{}", crate::VERSION)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_listing_window")]
    pub listing_window: usize,
    #[serde(default = "default_media_window")]
    pub media_window: usize,
    #[serde(default = "default_fast_scroll_velocity")]
    pub fast_scroll_velocity: f64,
    #[serde(default = "default_fast_scroll_cooldown", with = "humantime_serde")]
    pub fast_scroll_cooldown: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            capacity: default_capacity(),
            listing_window: default_listing_window(),
            media_window: default_media_window(),
            fast_scroll_velocity: default_fast_scroll_velocity(),
            fast_scroll_cooldown: default_fast_scroll_cooldown(),
            workers: default_workers(),
        }
    }
}

impl MediaConfig {
    pub fn to_manager_config(&self) -> media::Config {
        media::Config {
            cache_dir: self.cache_dir.clone(),
            capacity: self.capacity,
            listing_window: self.listing_window,
            media_window: self.media_window,
            scroll: scroll::ScrollPolicy {
                fast_velocity: self.fast_scroll_velocity,
                cooldown: self.fast_scroll_cooldown,
            },
            workers: self.workers,
            http_client: None,
        }
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    media::default_cache_dir()
}

fn default_capacity() -> usize {
    media::DEFAULT_CAPACITY
}

fn default_listing_window() -> usize {
    media::DEFAULT_LISTING_WINDOW
}

fn default_media_window() -> usize {
    media::DEFAULT_MEDIA_WINDOW
}

fn default_fast_scroll_velocity() -> f64 {
    scroll::DEFAULT_FAST_VELOCITY
}

fn default_fast_scroll_cooldown() -> Duration {
    scroll::DEFAULT_COOLDOWN
}

fn default_workers() -> usize {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewsConfig {
    #[serde(default = "default_view_threshold", with = "humantime_serde")]
    pub threshold: Duration,
    #[serde(default = "default_search_visibility")]
    pub search_visibility: f64,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            threshold: default_view_threshold(),
            search_visibility: default_search_visibility(),
        }
    }
}

fn default_view_threshold() -> Duration {
    views::DEFAULT_THRESHOLD
}

fn default_search_visibility() -> f64 {
    views::DEFAULT_SEARCH_VISIBILITY
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> Option<PathBuf> {
    crate::storage::default_path()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.backend.base_url.is_empty() {
        base.backend.base_url = other.backend.base_url;
    }
    if !other.backend.api_key.is_empty() {
        base.backend.api_key = other.backend.api_key;
    }
    if other.backend.access_token.is_some() {
        base.backend.access_token = other.backend.access_token;
    }
    if !other.backend.user_agent.is_empty() {
        base.backend.user_agent = other.backend.user_agent;
    }
    if other.backend.viewer_id.is_some() {
        base.backend.viewer_id = other.backend.viewer_id;
    }

    if other.media.cache_dir.is_some() {
        base.media.cache_dir = other.media.cache_dir;
    }
    if other.media.capacity != 0 {
        base.media.capacity = other.media.capacity;
    }
    base.media.listing_window = other.media.listing_window;
    base.media.media_window = other.media.media_window;
    if other.media.fast_scroll_velocity > 0.0 {
        base.media.fast_scroll_velocity = other.media.fast_scroll_velocity;
    }
    base.media.fast_scroll_cooldown = other.media.fast_scroll_cooldown;
    if other.media.workers != 0 {
        base.media.workers = other.media.workers;
    }

    base.views.threshold = other.views.threshold;
    base.views.search_visibility = other.views.search_visibility.clamp(0.0, 1.0);

    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    base
}

/// Applies `PREFIX_SECTION__KEY` variables on top of `cfg`. Values that fail
/// to parse are skipped.
fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "backend.base_url" => cfg.backend.base_url = value,
        "backend.api_key" => cfg.backend.api_key = value,
        "backend.access_token" => cfg.backend.access_token = non_empty(value),
        "backend.user_agent" => cfg.backend.user_agent = value,
        "backend.viewer_id" => cfg.backend.viewer_id = non_empty(value),
        "media.cache_dir" => cfg.media.cache_dir = Some(PathBuf::from(value)),
        "media.capacity" => {
            if let Ok(parsed) = value.parse::<usize>() {
                if parsed > 0 {
                    cfg.media.capacity = parsed;
                }
            }
        }
        "media.listing_window" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.media.listing_window = parsed;
            }
        }
        "media.media_window" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.media.media_window = parsed;
            }
        }
        "media.fast_scroll_velocity" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.media.fast_scroll_velocity = parsed;
            }
        }
        "media.fast_scroll_cooldown" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.media.fast_scroll_cooldown = duration;
            }
        }
        "media.workers" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.media.workers = parsed;
            }
        }
        "views.threshold" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.views.threshold = duration;
            }
        }
        "views.search_visibility" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.views.search_visibility = parsed.clamp(0.0, 1.0);
            }
        }
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        _ => {}
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("homefeed").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_without_files() {
        let dir = tempdir().unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(dir.path().join("missing.yaml")),
            env_prefix: Some("HOMEFEED_TEST_DEFAULTS".into()),
        })
        .unwrap();
        assert_eq!(cfg.media.capacity, 12);
        assert_eq!(cfg.media.listing_window, 3);
        assert_eq!(cfg.media.media_window, 2);
        assert_eq!(cfg.media.fast_scroll_cooldown, Duration::from_millis(700));
        assert_eq!(cfg.views.threshold, Duration::from_secs(1));
        assert!(cfg.backend.base_url.is_empty());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "media:\n  capacity: 6\n  fast_scroll_cooldown: 1s\nviews:\n  threshold: 2s\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("HOMEFEED_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.media.capacity, 6);
        assert_eq!(cfg.media.listing_window, 3);
        assert_eq!(cfg.media.fast_scroll_cooldown, Duration::from_secs(1));
        assert_eq!(cfg.views.threshold, Duration::from_secs(2));
        assert_eq!(cfg.views.search_visibility, 0.7);
    }

    #[test]
    fn env_overrides() {
        env::set_var("HOMEFEED_TEST_ENV_MEDIA__CAPACITY", "4");
        env::set_var("HOMEFEED_TEST_ENV_VIEWS__THRESHOLD", "1500ms");
        env::set_var("HOMEFEED_TEST_ENV_BACKEND__VIEWER_ID", "  ");
        let dir = tempdir().unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(dir.path().join("missing.yaml")),
            env_prefix: Some("HOMEFEED_TEST_ENV".into()),
        })
        .unwrap();
        assert_eq!(cfg.media.capacity, 4);
        assert_eq!(cfg.views.threshold, Duration::from_millis(1500));
        assert_eq!(cfg.backend.viewer_id, None);
        env::remove_var("HOMEFEED_TEST_ENV_MEDIA__CAPACITY");
        env::remove_var("HOMEFEED_TEST_ENV_VIEWS__THRESHOLD");
        env::remove_var("HOMEFEED_TEST_ENV_BACKEND__VIEWER_ID");
    }

    #[test]
    fn media_section_maps_to_manager_config() {
        let cfg = MediaConfig {
            capacity: 5,
            fast_scroll_velocity: 2400.0,
            ..MediaConfig::default()
        };
        let manager = cfg.to_manager_config();
        assert_eq!(manager.capacity, 5);
        assert_eq!(manager.scroll.fast_velocity, 2400.0);
        assert_eq!(manager.scroll.cooldown, Duration::from_millis(700));
    }
}
