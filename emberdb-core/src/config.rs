//! Configuration store: a reloadable `key=value` property bag
//!
//! Properties come from a config file (one pair per line, `;` and `#` start
//! comments) with an override layer applied after every reload, so
//! command-line options keep winning. All accessors and `reload` share one
//! mutex. The store is an explicit value threaded through the coordinator;
//! only the process bootstrap may bind it somewhere global.

use crate::error::{EmberError, Result};
use crate::types::{Timestamp, TimeUnit};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CFG_TSDB_PAGE_COUNT: &str = "tsdb.page.count";
pub const CFG_TSDB_PAGE_COUNT_DEF: i64 = 4096;
pub const CFG_TSDB_COMPRESSOR_VERSION: &str = "tsdb.compressor.version";
pub const CFG_TSDB_COMPRESSOR_VERSION_DEF: i64 = 1;
pub const CFG_TSDB_SELF_METER_ENABLED: &str = "tsdb.self_meter.enabled";
pub const CFG_TSDB_TIMESTAMP_RESOLUTION: &str = "tsdb.timestamp.resolution";
pub const CFG_TSDB_DATA_DIR: &str = "tsdb.data.dir";
pub const CFG_TSDB_ROLLUP_INTERVAL: &str = "tsdb.rollup.interval";
pub const CFG_TSDB_ROLLUP_INTERVAL_DEF: &str = "1h";
pub const CFG_TSDB_COMPACT_ENABLED: &str = "tsdb.compact.enabled";
pub const CFG_CONFIG_RELOAD_ENABLED: &str = "config.reload.enabled";
pub const CFG_CONFIG_RELOAD_FREQUENCY: &str = "config.reload.frequency";
pub const CFG_CONFIG_RELOAD_FREQUENCY_DEF: &str = "5min";
pub const CFG_CLUSTER_SERVERS: &str = "cluster.servers";
pub const CFG_TICKTOCK_HOME: &str = "ticktock.home";
pub const CFG_LOG_FILE: &str = "log.file";

/// One named config value with typed parsers
#[derive(Debug, Clone)]
pub struct Property {
    name: String,
    value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self.value.to_lowercase().as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            _ => Err(self.invalid()),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        self.value.trim().parse().map_err(|_| self.invalid())
    }

    pub fn as_float(&self) -> Result<f64> {
        self.value.trim().parse().map_err(|_| self.invalid())
    }

    /// Parse a byte count with an optional `K`, `M` or `G` suffix
    pub fn as_bytes(&self) -> Result<u64> {
        Self::parse_bytes(&self.value).ok_or_else(|| self.invalid())
    }

    /// Parse a duration with a unit suffix and convert to `unit`
    pub fn as_time(&self, unit: TimeUnit) -> Result<Timestamp> {
        Self::parse_time(&self.value, unit).ok_or_else(|| self.invalid())
    }

    pub(crate) fn parse_bytes(value: &str) -> Option<u64> {
        let v = value.trim();
        let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
        let number: u64 = v[..split].parse().ok()?;
        let multiplier = match v[split..].trim().to_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" => 1024,
            "m" | "mb" => 1024 * 1024,
            "g" | "gb" => 1024 * 1024 * 1024,
            _ => return None,
        };
        Some(number * multiplier)
    }

    pub(crate) fn parse_time(value: &str, unit: TimeUnit) -> Option<Timestamp> {
        let v = value.trim();
        let split = v.find(|c: char| !c.is_ascii_digit()).unwrap_or(v.len());
        let number: u64 = v[..split].parse().ok()?;
        let suffix = v[split..].trim();
        let from = if suffix.is_empty() {
            TimeUnit::Sec
        } else {
            TimeUnit::from_suffix(&suffix.to_lowercase())?
        };
        Some(number * from.as_ms() / unit.as_ms())
    }

    fn invalid(&self) -> EmberError {
        EmberError::InvalidConfig {
            key: self.name.clone(),
            value: self.value.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    properties: HashMap<String, Property>,
    overrides: HashMap<String, String>,
}

/// Process-wide configuration, reloaded in place
pub struct ConfigStore {
    file_path: PathBuf,
    inner: Mutex<Inner>,

    // globals derived by init()
    millisecond: bool,
    cluster_enabled: bool,
    self_meter_enabled: bool,
}

impl ConfigStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            inner: Mutex::new(Inner::default()),
            millisecond: false,
            cluster_enabled: false,
            self_meter_enabled: false,
        }
    }

    /// Load the config file and derive the globals. The external timer
    /// should schedule `reload` at `reload_frequency` when
    /// `reload_enabled` returns true.
    pub fn init(&mut self) -> Result<()> {
        self.reload()?;

        self.millisecond =
            self.get_str_or(CFG_TSDB_TIMESTAMP_RESOLUTION, "second") == "millisecond";
        self.cluster_enabled = self.exists(CFG_CLUSTER_SERVERS);
        self.self_meter_enabled = self.get_bool_or(CFG_TSDB_SELF_METER_ENABLED, false);
        Ok(())
    }

    /// Re-read the config file, then overlay the overrides
    pub fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        let file = std::fs::File::open(&self.file_path)?;
        inner.properties.clear();

        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            inner
                .properties
                .insert(key.to_string(), Property::new(key, value.trim()));
        }

        let overrides: Vec<(String, String)> = inner
            .overrides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in overrides {
            inner
                .properties
                .insert(key.clone(), Property::new(key, value));
        }

        debug!("loaded {} properties", inner.properties.len());
        Ok(())
    }

    pub fn set_value(&self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let mut inner = self.inner.lock();
        inner
            .properties
            .insert(name.clone(), Property::new(name, value.into()));
    }

    /// Register a value that survives reloads, e.g. a command-line option
    pub fn add_override(&self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let mut inner = self.inner.lock();
        inner.overrides.insert(name.clone(), value.clone());
        inner.properties.insert(name.clone(), Property::new(name, value));
    }

    pub fn exists(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        inner.properties.contains_key(name) || inner.overrides.contains_key(name)
    }

    fn with_property<T>(&self, name: &str, f: impl FnOnce(&Property) -> Result<T>) -> Result<T> {
        let inner = self.inner.lock();
        match inner.properties.get(name) {
            Some(property) => f(property),
            None => Err(EmberError::MissingKey(name.to_string())),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        self.with_property(name, |p| p.as_bool())
    }

    pub fn get_bool_or(&self, name: &str, default: bool) -> bool {
        self.get_bool(name).unwrap_or(default)
    }

    pub fn get_int(&self, name: &str) -> Result<i64> {
        self.with_property(name, |p| p.as_int())
    }

    pub fn get_int_or(&self, name: &str, default: i64) -> i64 {
        self.get_int(name).unwrap_or(default)
    }

    pub fn get_float(&self, name: &str) -> Result<f64> {
        self.with_property(name, |p| p.as_float())
    }

    pub fn get_float_or(&self, name: &str, default: f64) -> f64 {
        self.get_float(name).unwrap_or(default)
    }

    pub fn get_str(&self, name: &str) -> Result<String> {
        self.with_property(name, |p| Ok(p.as_str().to_string()))
    }

    pub fn get_str_or(&self, name: &str, default: &str) -> String {
        self.get_str(name).unwrap_or_else(|_| default.to_string())
    }

    pub fn get_bytes(&self, name: &str) -> Result<u64> {
        self.with_property(name, |p| p.as_bytes())
    }

    pub fn get_bytes_or(&self, name: &str, default: &str) -> Result<u64> {
        match self.get_bytes(name) {
            Err(EmberError::MissingKey(_)) => {
                Property::parse_bytes(default).ok_or_else(|| EmberError::InvalidConfig {
                    key: name.to_string(),
                    value: default.to_string(),
                })
            }
            other => other,
        }
    }

    pub fn get_time(&self, name: &str, unit: TimeUnit) -> Result<Timestamp> {
        self.with_property(name, |p| p.as_time(unit))
    }

    pub fn get_time_or(&self, name: &str, unit: TimeUnit, default: &str) -> Result<Timestamp> {
        match self.get_time(name, unit) {
            Err(EmberError::MissingKey(_)) => {
                Property::parse_time(default, unit).ok_or_else(|| EmberError::InvalidConfig {
                    key: name.to_string(),
                    value: default.to_string(),
                })
            }
            other => other,
        }
    }

    // ---- derived globals ------------------------------------------------

    pub fn is_millisecond(&self) -> bool {
        self.millisecond
    }

    pub fn is_cluster_enabled(&self) -> bool {
        self.cluster_enabled
    }

    pub fn is_self_meter_enabled(&self) -> bool {
        self.self_meter_enabled
    }

    pub fn reload_enabled(&self) -> bool {
        self.get_bool_or(CFG_CONFIG_RELOAD_ENABLED, false)
    }

    /// Reload period in seconds for the external timer
    pub fn reload_frequency(&self) -> Result<Timestamp> {
        self.get_time_or(
            CFG_CONFIG_RELOAD_FREQUENCY,
            TimeUnit::Sec,
            CFG_CONFIG_RELOAD_FREQUENCY_DEF,
        )
    }

    // ---- path derivation ------------------------------------------------

    /// Data directory: `tsdb.data.dir`, then `<ticktock.home>/data`, then
    /// `<cwd>/data`
    pub fn data_dir(&self) -> PathBuf {
        if let Ok(dir) = self.get_str(CFG_TSDB_DATA_DIR) {
            return PathBuf::from(dir);
        }
        if let Ok(home) = self.get_str(CFG_TICKTOCK_HOME) {
            return Path::new(&home).join("data");
        }
        PathBuf::from("data")
    }

    /// Log directory: the directory of `log.file`, then
    /// `<ticktock.home>/log`, then `<cwd>/log`
    pub fn log_dir(&self) -> PathBuf {
        if let Ok(log_file) = self.get_str(CFG_LOG_FILE) {
            let path = PathBuf::from(log_file);
            return match path.parent() {
                Some(parent) if parent != Path::new("") => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
        }
        if let Ok(home) = self.get_str(CFG_TICKTOCK_HOME) {
            return Path::new(&home).join("log");
        }
        PathBuf::from("log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("ember.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_and_accessors() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "; leading comment\n\
             # another comment\n\
             tsdb.page.count = 128\n\
             tsdb.self_meter.enabled=true\n\
             some.ratio = 0.75\n\
             buffer.size = 16m\n\
             tsdb.rollup.interval = 10min\n\
             greeting = hello\n",
        );

        let mut config = ConfigStore::new(path);
        config.init().unwrap();

        assert_eq!(config.get_int(CFG_TSDB_PAGE_COUNT).unwrap(), 128);
        assert!(config.get_bool(CFG_TSDB_SELF_METER_ENABLED).unwrap());
        assert_eq!(config.get_float("some.ratio").unwrap(), 0.75);
        assert_eq!(config.get_bytes("buffer.size").unwrap(), 16 * 1024 * 1024);
        assert_eq!(
            config.get_time(CFG_TSDB_ROLLUP_INTERVAL, TimeUnit::Sec).unwrap(),
            600
        );
        assert_eq!(
            config.get_time(CFG_TSDB_ROLLUP_INTERVAL, TimeUnit::Min).unwrap(),
            10
        );
        assert_eq!(config.get_str("greeting").unwrap(), "hello");
        assert!(config.is_self_meter_enabled());
        assert!(!config.is_cluster_enabled());
        assert!(!config.is_millisecond());
    }

    #[test]
    fn test_missing_key() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "a = 1\n");
        let config = ConfigStore::new(path);
        config.reload().unwrap();

        assert!(matches!(
            config.get_int("no.such.key"),
            Err(EmberError::MissingKey(_))
        ));
        assert_eq!(config.get_int_or("no.such.key", 42), 42);
        assert_eq!(
            config
                .get_time_or("no.such.key", TimeUnit::Sec, "5min")
                .unwrap(),
            300
        );
    }

    #[test]
    fn test_overrides_survive_reload() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "answer = 1\n");
        let config = ConfigStore::new(path.clone());
        config.reload().unwrap();
        assert_eq!(config.get_int("answer").unwrap(), 1);

        config.add_override("answer", "2");
        assert_eq!(config.get_int("answer").unwrap(), 2);

        // the file changes under us; the override still wins
        std::fs::write(&path, "answer = 3\nfresh = yes\n").unwrap();
        config.reload().unwrap();
        assert_eq!(config.get_int("answer").unwrap(), 2);
        assert!(config.get_bool("fresh").unwrap());
    }

    #[test]
    fn test_reload_missing_file_is_io_error() {
        let config = ConfigStore::new("/nonexistent/ember.conf");
        assert!(matches!(config.reload(), Err(EmberError::Io(_))));
    }

    #[test]
    fn test_cluster_and_resolution_globals() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "cluster.servers = 10.0.0.1,10.0.0.2\n\
             tsdb.timestamp.resolution = millisecond\n",
        );
        let mut config = ConfigStore::new(path);
        config.init().unwrap();

        assert!(config.is_cluster_enabled());
        assert!(config.is_millisecond());
    }

    #[test]
    fn test_path_derivation() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "ticktock.home = /srv/ember\n");
        let config = ConfigStore::new(path);
        config.reload().unwrap();

        assert_eq!(config.data_dir(), PathBuf::from("/srv/ember/data"));
        assert_eq!(config.log_dir(), PathBuf::from("/srv/ember/log"));

        config.set_value(CFG_TSDB_DATA_DIR, "/mnt/fast");
        assert_eq!(config.data_dir(), PathBuf::from("/mnt/fast"));

        config.set_value(CFG_LOG_FILE, "/var/log/ember/ember.log");
        assert_eq!(config.log_dir(), PathBuf::from("/var/log/ember"));
    }

    #[test]
    fn test_bad_value() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "tsdb.page.count = many\n");
        let config = ConfigStore::new(path);
        config.reload().unwrap();

        assert!(matches!(
            config.get_int(CFG_TSDB_PAGE_COUNT),
            Err(EmberError::InvalidConfig { .. })
        ));
    }
}
