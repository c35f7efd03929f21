use std::{
    error::Error,
    fmt,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::{
    cli::Cli,
    conf::conf_serde::{duration, level},
};

/// Prometheus scrape endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConf {
    pub enabled: bool,
    /// IP address to listen on.
    pub listen_address: String,
    pub port: u16,
}

impl Default for MetricsConf {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 10250,
        }
    }
}

/// Settings for the stream demultiplexer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollerConf {
    /// Capacity of the queue stream owners use to request a flow teardown.
    /// - Default: 1000
    pub teardown_channel_capacity: usize,

    /// Memory ceiling, in bytes, for the fd -> address cache.
    /// - Default: 500000
    pub fd_cache_memory: usize,

    /// Average size, in bytes, of one fd cache entry. The cache holds
    /// `fd_cache_memory / fd_cache_entry_size` entries.
    /// - Default: 40
    pub fd_cache_entry_size: usize,

    /// A stream that sees no chunk for this long is torn down. `0s` disables
    /// idle teardown.
    /// - Default: 10s
    #[serde(with = "duration")]
    pub stream_idle_timeout: Duration,
}

impl Default for PollerConf {
    fn default() -> Self {
        Self {
            teardown_channel_capacity: defaults::teardown_channel_capacity(),
            fd_cache_memory: defaults::fd_cache_memory(),
            fd_cache_entry_size: defaults::fd_cache_entry_size(),
            stream_idle_timeout: defaults::stream_idle_timeout(),
        }
    }
}

/// Application configuration.
///
/// Loaded by layering the defaults, then the YAML file, then CLI overrides.
#[derive(Debug, Deserialize, Serialize)]
pub struct Conf {
    /// Path the configuration was loaded from, kept for [`Conf::reload`].
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    #[serde(with = "level")]
    pub log_level: Level,

    /// bpffs path where the probes pin the chunks perf event array.
    #[serde(default = "defaults::chunks_map_pin")]
    pub chunks_map_pin: PathBuf,

    /// Pages per CPU for each perf ring. Must be a power of two.
    /// - Default: 64
    #[serde(default = "defaults::perf_buffer_pages")]
    pub perf_buffer_pages: usize,

    /// Capacity of the queue between the reassembly contexts and the sorter
    /// consumer.
    /// - Default: 5000
    #[serde(default = "defaults::packet_channel_capacity")]
    pub packet_channel_capacity: usize,

    #[serde(default)]
    pub poller: PollerConf,

    #[serde(default)]
    pub metrics: MetricsConf,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            config_path: None,
            log_level: Level::INFO,
            chunks_map_pin: defaults::chunks_map_pin(),
            perf_buffer_pages: defaults::perf_buffer_pages(),
            packet_channel_capacity: defaults::packet_channel_capacity(),
            poller: PollerConf::default(),
            metrics: MetricsConf::default(),
        }
    }
}

mod defaults {
    use std::{path::PathBuf, time::Duration};

    pub fn chunks_map_pin() -> PathBuf {
        PathBuf::from("/sys/fs/bpf/tlsflow/chunks_buffer")
    }

    pub fn perf_buffer_pages() -> usize {
        64
    }

    pub fn packet_channel_capacity() -> usize {
        5000
    }

    pub fn teardown_channel_capacity() -> usize {
        1000
    }

    pub fn fd_cache_memory() -> usize {
        500_000
    }

    pub fn fd_cache_entry_size() -> usize {
        40
    }

    pub fn stream_idle_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Conf {
    /// Build the configuration from `cli`.
    ///
    /// Priority order is defaults < configuration file < CLI arguments.
    /// Environment variables reach this layer through `cli`, since clap reads
    /// `TLSFLOW_CONFIG_PATH` and `TLSFLOW_LOG_LEVEL`.
    ///
    /// # Errors
    /// * `ConfigError::NoConfigFile` - the given path does not exist.
    /// * `ConfigError::InvalidConfigPath` - the given path is not a file.
    /// * `ConfigError::InvalidExtension` - the file is not YAML.
    /// * `ConfigError::Extraction` - the merged layers do not form a `Conf`.
    /// * `ConfigError::InvalidValue` - a value is out of range.
    pub fn new(cli: Cli) -> Result<(Self, Cli), ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path_to_store = if let Some(config_path) = &cli.config {
            validate_config_path(config_path)?;
            figment = figment.merge(Yaml::file(config_path));
            Some(config_path.clone())
        } else {
            None
        };

        figment = figment.merge(Serialized::defaults(&cli));

        let mut conf: Conf = figment.extract()?;
        conf.validate()?;

        conf.config_path = config_path_to_store;
        Ok((conf, cli))
    }

    /// Re-read the configuration file on top of the current values.
    ///
    /// CLI arguments are not re-applied; the current configuration already
    /// carries them.
    pub fn reload(&self) -> Result<Self, ConfigError> {
        let Some(path) = &self.config_path else {
            return Err(ConfigError::NoConfigFile);
        };

        let mut conf: Conf = Figment::from(Serialized::defaults(self))
            .merge(Yaml::file(path))
            .extract()?;
        conf.validate()?;
        conf.config_path = self.config_path.clone();

        Ok(conf)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.perf_buffer_pages.is_power_of_two() {
            return Err(ConfigError::invalid_value(
                "perf_buffer_pages",
                format!("{} is not a power of two", self.perf_buffer_pages),
            ));
        }
        if self.packet_channel_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "packet_channel_capacity",
                "must be positive",
            ));
        }
        if self.poller.teardown_channel_capacity == 0 {
            return Err(ConfigError::invalid_value(
                "poller.teardown_channel_capacity",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Checks that `path` is an existing file with a YAML extension.
fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if !path.is_file() {
        if path.exists() {
            return Err(ConfigError::InvalidConfigPath(
                path.to_string_lossy().into_owned(),
            ));
        }
        return Err(ConfigError::NoConfigFile);
    }

    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        Some(ext) => Err(ConfigError::InvalidExtension(ext.to_string())),
        None => Err(ConfigError::InvalidExtension("none".to_string())),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    /// The specified configuration file does not exist.
    NoConfigFile,
    /// The path exists but is not a file.
    InvalidConfigPath(String),
    /// The file has an unsupported extension.
    InvalidExtension(String),
    /// Failed to extract configuration data.
    Extraction(Box<figment::Error>),
    /// A value parsed but is not usable.
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoConfigFile => write!(f, "no config file provided"),
            ConfigError::InvalidConfigPath(p) => write!(f, "path '{p}' is not a valid file"),
            ConfigError::InvalidExtension(ext) => {
                write!(f, "invalid file extension '.{ext}', expected 'yaml' or 'yml'")
            }
            ConfigError::Extraction(e) => write!(f, "configuration error: {e}"),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "invalid value for '{field}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Extraction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Extraction(Box::from(e))
    }
}

pub mod conf_serde {
    pub mod level {
        use serde::{self, Deserialize, Deserializer, Serializer};
        use tracing::Level;

        pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(level.as_str())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse::<Level>().map_err(serde::de::Error::custom)
        }

        pub mod option {
            use super::*;

            pub fn serialize<S>(level: &Option<Level>, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                match level {
                    Some(l) => serializer.serialize_str(l.as_str()),
                    None => serializer.serialize_none(),
                }
            }

            pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Level>, D::Error>
            where
                D: Deserializer<'de>,
            {
                Option::<String>::deserialize(deserializer)?
                    .map(|s| s.parse::<Level>().map_err(serde::de::Error::custom))
                    .transpose()
            }
        }
    }

    pub mod duration {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            humantime::parse_duration(&s).map_err(serde::de::Error::custom)
        }
    }
}
