use std::{collections::HashSet, fs, time::Duration};

use podipam_ipam::range::Range;
use podipam_pool::PoolConfig;
use podipam_trace::init::TraceConfig;
use serde::{Deserialize, Serialize};

use super::error::{ConfigError, Error};

pub const DEFAULT_DATA_PATH: &str = "/var/lib/podipam/ipam.redb";
pub const DEFAULT_GC_INTERVAL: u64 = 60;
pub const DEFAULT_TOMBSTONE_GRACE: u64 = 60 * 60;
pub const DEFAULT_STICKY_WINDOW: u64 = 5 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default = "default_gc_interval")]
    pub gc_interval: u64,
    #[serde(default = "default_tombstone_grace")]
    pub tombstone_grace: u64,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
}

/// One logical network. A network is backed either by a static range or by a
/// cloud-provisioned pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolConfig>,
    /// Seconds a released pooled address stays reserved for a sticky pod.
    #[serde(default = "default_sticky_window")]
    pub sticky_window: u64,
}

fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

fn default_gc_interval() -> u64 {
    DEFAULT_GC_INTERVAL
}

fn default_tombstone_grace() -> u64 {
    DEFAULT_TOMBSTONE_GRACE
}

fn default_sticky_window() -> u64 {
    DEFAULT_STICKY_WINDOW
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_path: default_data_path(),
            gc_interval: DEFAULT_GC_INTERVAL,
            tombstone_grace: DEFAULT_TOMBSTONE_GRACE,
            trace: TraceConfig::default(),
            networks: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file).map_err(Error::StdIo)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(ConfigError::FailedToLoad(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.gc_interval == 0 {
            return Err(Error::Config(ConfigError::ZeroInterval("gc_interval")));
        }
        let mut names = HashSet::new();
        for network in self.networks.iter() {
            if !names.insert(network.name.as_str()) {
                return Err(Error::Config(ConfigError::DuplicateNetwork(
                    network.name.clone(),
                )));
            }
            match (&network.range, &network.pool) {
                (Some(range), None) => {
                    range.canonicalize().map_err(Error::Ipam)?;
                }
                (None, Some(pool)) => pool.validate().map_err(Error::Pool)?,
                _ => return Err(Error::Config(ConfigError::Backend(network.name.clone()))),
            }
        }
        Ok(())
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval)
    }

    pub fn tombstone_grace(&self) -> Duration {
        Duration::from_secs(self.tombstone_grace)
    }
}

impl NetworkConfig {
    pub fn sticky_window(&self) -> Duration {
        Duration::from_secs(self.sticky_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
data_path: /tmp/podipam.redb
gc_interval: 30
trace:
  level: debug
  format: json
networks:
  - name: static
    range:
      subnet: 10.0.0.0/24
      range_start: 10.0.0.10
      gateway: 10.0.0.1
      exclude:
        - 10.0.0.64/26
  - name: eni
    pool:
      min_idle: 1
      max_idle: 2
      capacity: 4
    sticky_window: 60
"#;

    #[test]
    fn works_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = Config::load(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.data_path, "/tmp/podipam.redb");
        assert_eq!(config.gc_interval, 30);
        assert_eq!(config.tombstone_grace, DEFAULT_TOMBSTONE_GRACE);
        assert_eq!(config.trace.level, "debug");
        assert_eq!(config.networks.len(), 2);

        let range = config.networks[0].range.as_ref().unwrap();
        assert_eq!(range.exclude.len(), 1);
        assert_eq!(config.networks[0].sticky_window, DEFAULT_STICKY_WINDOW);

        let pool = config.networks[1].pool.as_ref().unwrap();
        assert_eq!(pool.capacity, 4);
        assert_eq!(pool.reconcile_interval, PoolConfig::default().reconcile_interval);
        assert_eq!(config.networks[1].sticky_window(), Duration::from_secs(60));
    }

    #[test]
    fn fails_duplicate_network() {
        let network = NetworkConfig {
            name: "a".to_string(),
            range: Some(Range::new("10.0.0.0/24".parse().unwrap())),
            pool: None,
            sticky_window: 0,
        };
        let config = Config {
            networks: vec![network.clone(), network],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Config(ConfigError::DuplicateNetwork(_)))
        ));
    }

    #[test]
    fn fails_both_backends() {
        let config = Config {
            networks: vec![NetworkConfig {
                name: "a".to_string(),
                range: Some(Range::new("10.0.0.0/24".parse().unwrap())),
                pool: Some(PoolConfig::default()),
                sticky_window: 0,
            }],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Config(ConfigError::Backend(_)))
        ));
    }

    #[test]
    fn fails_invalid_range() {
        let config = Config {
            networks: vec![NetworkConfig {
                name: "a".to_string(),
                range: Some(Range::new("10.0.0.1/24".parse().unwrap())),
                pool: None,
                sticky_window: 0,
            }],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Ipam(_))));
    }
}
