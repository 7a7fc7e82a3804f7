use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dispatcher;

const DEFAULT_ENV_PREFIX: &str = "COMMENTS";
const APP_DIR: &str = "comments-engine";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub thread: ThreadConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteConfig {
    #[serde(default)]
    pub site_url: String,
    /// Members API root; empty means `<site_url>/members/api/`.
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Admin frame location; empty disables moderation.
    #[serde(default)]
    pub admin_url: String,
    #[serde(default)]
    pub post_id: String,
    #[serde(default)]
    pub session_cookie: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            api_url: String::new(),
            api_key: String::new(),
            admin_url: String::new(),
            post_id: String::new(),
            session_cookie: String::new(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("comments-engine/{}", crate::VERSION)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_replies_page_size")]
    pub replies_page_size: u32,
    #[serde(default = "default_status_reset", with = "humantime_serde")]
    pub status_reset: Duration,
    #[serde(default = "default_notification_duration", with = "humantime_serde")]
    pub notification_duration: Duration,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            replies_page_size: default_replies_page_size(),
            status_reset: default_status_reset(),
            notification_duration: default_notification_duration(),
        }
    }
}

impl ThreadConfig {
    pub fn dispatcher_options(&self) -> dispatcher::Options {
        dispatcher::Options {
            status_reset: self.status_reset,
            notification_duration: self.notification_duration,
        }
    }
}

fn default_page_size() -> u32 {
    20
}

fn default_replies_page_size() -> u32 {
    100
}

fn default_status_reset() -> Duration {
    dispatcher::DEFAULT_STATUS_RESET
}

fn default_notification_duration() -> Duration {
    dispatcher::DEFAULT_NOTIFICATION_DURATION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminConfig {
    #[serde(default = "default_rpc_timeout", with = "humantime_serde")]
    pub rpc_timeout: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: default_rpc_timeout(),
        }
    }
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".into()
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
    for (key, value) in load_env(prefix) {
        apply_env_value(&mut cfg, &key, value);
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_string(base: &mut String, other: String) {
    if !other.is_empty() {
        *base = other;
    }
}

fn merge_config(mut base: Config, other: Config) -> Config {
    merge_string(&mut base.site.site_url, other.site.site_url);
    merge_string(&mut base.site.api_url, other.site.api_url);
    merge_string(&mut base.site.api_key, other.site.api_key);
    merge_string(&mut base.site.admin_url, other.site.admin_url);
    merge_string(&mut base.site.post_id, other.site.post_id);
    merge_string(&mut base.site.session_cookie, other.site.session_cookie);
    if other.site.user_agent != default_user_agent() {
        merge_string(&mut base.site.user_agent, other.site.user_agent);
    }

    if other.thread.page_size != 0 && other.thread.page_size != default_page_size() {
        base.thread.page_size = other.thread.page_size;
    }
    if other.thread.replies_page_size != 0
        && other.thread.replies_page_size != default_replies_page_size()
    {
        base.thread.replies_page_size = other.thread.replies_page_size;
    }
    if other.thread.status_reset != default_status_reset() {
        base.thread.status_reset = other.thread.status_reset;
    }
    if other.thread.notification_duration != default_notification_duration() {
        base.thread.notification_duration = other.thread.notification_duration;
    }

    if other.admin.rpc_timeout != default_rpc_timeout() {
        base.admin.rpc_timeout = other.admin.rpc_timeout;
    }

    if other.log.filter != default_log_filter() {
        merge_string(&mut base.log.filter, other.log.filter);
    }

    base
}

/// Environment overrides keyed by dotted path, e.g. `thread.page_size`.
/// Presence decides the override, so a variable may restore a default.
fn load_env(prefix: &str) -> HashMap<String, String> {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    env::vars()
        .filter_map(|(key, value)| {
            let stripped = key.strip_prefix(&upper_prefix)?;
            Some((stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect()
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "site.site_url" => cfg.site.site_url = value,
        "site.api_url" => cfg.site.api_url = value,
        "site.api_key" => cfg.site.api_key = value,
        "site.admin_url" => cfg.site.admin_url = value,
        "site.post_id" => cfg.site.post_id = value,
        "site.session_cookie" => cfg.site.session_cookie = value,
        "site.user_agent" => cfg.site.user_agent = value,
        "thread.page_size" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.thread.page_size = parsed;
            }
        }
        "thread.replies_page_size" => {
            if let Ok(parsed) = value.parse::<u32>() {
                cfg.thread.replies_page_size = parsed;
            }
        }
        "thread.status_reset" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.thread.status_reset = duration;
            }
        }
        "thread.notification_duration" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.thread.notification_duration = duration;
            }
        }
        "admin.rpc_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.admin.rpc_timeout = duration;
            }
        }
        "log.filter" => cfg.log.filter = value,
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.yaml"))
}
