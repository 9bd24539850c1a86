use crate::models::{StationRef, View};
use anyhow::{Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const DEFAULT_SERVER: &str = "localhost:6600";
const MAX_KNOWN_HOSTS: usize = 10;
const MIN_LIST_HEIGHT: u16 = 120;
const MAX_LIST_HEIGHT: u16 = 800;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// MPD address as `host:port`.
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub known_hosts: Vec<String>,
    #[serde(default)]
    pub last_genre: Option<String>,
    #[serde(default)]
    pub last_station: Option<StationRef>,
    #[serde(default)]
    pub favorites: Vec<StationRef>,
    #[serde(default)]
    pub layout: Layout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    #[serde(default)]
    pub active_view: View,
    /// Height of the station list in the popup, in logical pixels.
    #[serde(default = "default_list_height")]
    pub list_height: u16,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            active_view: View::default(),
            list_height: default_list_height(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            password: None,
            known_hosts: vec![],
            last_genre: None,
            last_station: None,
            favorites: vec![],
            layout: Layout::default(),
        }
    }
}

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

fn default_list_height() -> u16 {
    300
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read config: {path:?}")),
        };
        let text = String::from_utf8_lossy(&bytes);
        toml::from_str(&text).with_context(|| format!("Invalid config TOML: {path:?}"))
    }

    pub fn save_atomic(&self) -> Result<()> {
        self.save_atomic_to(&config_path()?)
    }

    pub fn save_atomic_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().context("Config path has no parent")?;
        ensure_private_dir(parent)?;
        let data = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        let tmp = parent.join(format!(
            ".{}.tmp.{suffix}",
            path.file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("config.toml")
        ));

        {
            let mut file = fs::File::create(&tmp).with_context(|| format!("Create temp file: {tmp:?}"))?;
            file.write_all(data.as_bytes())
                .with_context(|| format!("Write temp file: {tmp:?}"))?;
            file.sync_all()
                .with_context(|| format!("Sync temp file: {tmp:?}"))?;
        }

        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Atomic rename to: {path:?}"));
        }

        let dir_file = fs::File::open(parent).with_context(|| format!("Open config dir: {parent:?}"))?;
        let _ = dir_file.sync_all();

        Ok(())
    }

    pub fn toggle_favorite(&mut self, station: StationRef) {
        if let Some(idx) = self.favorites.iter().position(|s| s.id == station.id) {
            self.favorites.remove(idx);
        } else {
            self.favorites.push(station);
        }
    }

    /// Grows or shrinks the station list, returning the new height.
    pub fn resize_list(&mut self, delta: i32) -> u16 {
        let height = (i32::from(self.layout.list_height) + delta)
            .clamp(i32::from(MIN_LIST_HEIGHT), i32::from(MAX_LIST_HEIGHT));
        self.layout.list_height = height as u16;
        self.layout.list_height
    }

    /// Moves `host` to the front of the known hosts, most recent first.
    pub fn remember_host(&mut self, host: &str) {
        let host = host.trim();
        if host.is_empty() {
            return;
        }
        self.known_hosts.retain(|h| h != host);
        self.known_hosts.insert(0, host.to_string());
        self.known_hosts.truncate(MAX_KNOWN_HOSTS);
    }
}

fn config_path() -> Result<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config"))
        })
        .context("Could not determine XDG config directory")?;
    Ok(base.join("pythagora").join("config.toml"))
}

fn ensure_private_dir(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::create_dir_all(path).with_context(|| format!("Create config dir: {path:?}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Set permissions on config dir: {path:?}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(id: &str) -> StationRef {
        StationRef {
            id: id.to_string(),
            name: format!("Station {id}"),
        }
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(cfg.server, "localhost:6600");
        assert_eq!(cfg.layout, Layout::default());
        assert!(cfg.favorites.is_empty());
    }

    #[test]
    fn saves_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = AppConfig::default();
        cfg.last_genre = Some("Jazz".into());
        cfg.last_station = Some(station("300"));
        cfg.layout.active_view = View::Shoutcast;
        cfg.toggle_favorite(station("1"));
        cfg.save_atomic_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.last_genre.as_deref(), Some("Jazz"));
        assert_eq!(loaded.last_station, Some(station("300")));
        assert_eq!(loaded.layout.active_view, View::Shoutcast);
        assert_eq!(loaded.favorites, vec![station("1")]);

        let leftovers = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "server = \"mpd.lan:6600\"\n[layout]\nactive_view = \"shoutcast\"\n").unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.server, "mpd.lan:6600");
        assert_eq!(cfg.layout.active_view, View::Shoutcast);
        assert_eq!(cfg.layout.list_height, 300);
    }

    #[test]
    fn favorites_toggle() {
        let mut cfg = AppConfig::default();
        cfg.toggle_favorite(station("1"));
        cfg.toggle_favorite(station("2"));
        cfg.toggle_favorite(station("1"));
        assert_eq!(cfg.favorites, vec![station("2")]);
    }

    #[test]
    fn known_hosts_most_recent_first() {
        let mut cfg = AppConfig::default();
        cfg.remember_host("a:6600");
        cfg.remember_host("b:6600");
        cfg.remember_host("a:6600");
        cfg.remember_host("  ");
        assert_eq!(cfg.known_hosts, vec!["a:6600", "b:6600"]);

        for i in 0..20 {
            cfg.remember_host(&format!("h{i}:6600"));
        }
        assert_eq!(cfg.known_hosts.len(), MAX_KNOWN_HOSTS);
        assert_eq!(cfg.known_hosts[0], "h19:6600");
    }

    #[test]
    fn list_height_is_clamped() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.resize_list(60), 360);
        assert_eq!(cfg.resize_list(-1000), MIN_LIST_HEIGHT);
        assert_eq!(cfg.resize_list(5000), MAX_LIST_HEIGHT);
        assert_eq!(cfg.layout.list_height, MAX_LIST_HEIGHT);
    }

    #[test]
    fn failed_rename_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // a non-empty directory where the config file should go
        let path = dir.path().join("config.toml");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "x").unwrap();

        assert!(AppConfig::default().save_atomic_to(&path).is_err());

        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
    }
}
