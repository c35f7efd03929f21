use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::conf::conf_serde::level;

#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g., "tlsflow.yaml").
    #[arg(short, long, value_name = "FILE", env = "TLSFLOW_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Override the log level from the configuration file (e.g., "debug", "warn").
    #[arg(short, long, value_name = "LEVEL", env = "TLSFLOW_LOG_LEVEL")]
    #[serde(with = "level::option", skip_serializing_if = "Option::is_none", default)]
    pub log_level: Option<Level>,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser as _;
    use figment::Jail;
    use tracing::Level;

    use super::Cli;

    #[test]
    fn parses_long_flags() {
        Jail::expect_with(|jail| {
            jail.set_env("TLSFLOW_CONFIG_PATH", "/tmp/tlsflow.yaml");
            jail.set_env("TLSFLOW_LOG_LEVEL", "debug");

            let cli = Cli::parse_from([
                "tlsflow",
                "--config",
                "/path/to/conf.yaml",
                "--log-level",
                "warn",
            ]);
            assert_eq!(cli.config, Some(PathBuf::from("/path/to/conf.yaml")));
            assert_eq!(cli.log_level, Some(Level::WARN));

            Ok(())
        });
    }

    #[test]
    fn parses_short_flags() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["tlsflow", "-c", "conf.yml", "-l", "trace"]);
            assert_eq!(cli.config, Some(PathBuf::from("conf.yml")));
            assert_eq!(cli.log_level, Some(Level::TRACE));

            Ok(())
        });
    }

    #[test]
    fn parses_from_env_when_no_args() {
        Jail::expect_with(|jail| {
            jail.set_env("TLSFLOW_CONFIG_PATH", "/tmp/tlsflow.yaml");
            jail.set_env("TLSFLOW_LOG_LEVEL", "debug");

            let cli = Cli::parse_from(["tlsflow"]);
            assert_eq!(cli.config, Some(PathBuf::from("/tmp/tlsflow.yaml")));
            assert_eq!(cli.log_level, Some(Level::DEBUG));

            Ok(())
        });
    }

    #[test]
    fn log_level_is_unset_by_default() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["tlsflow"]);
            assert_eq!(cli.config, None);
            assert_eq!(cli.log_level, None);

            Ok(())
        });
    }
}
