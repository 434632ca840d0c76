//! Relay configuration.
//!
//! - [`types`]: the YAML config types and their defaults
//! - [`validate`]: config validation
//!
//! The main entry points are:
//! - [`load_configs`]: Load config files from disk
//! - [`create_relay_configs`]: Validate loaded configs

mod types;
mod validate;

pub use types::*;
pub use validate::create_relay_configs;

/// Parses one YAML document holding a list of relay configs.
pub fn parse_configs(config_str: &str) -> std::io::Result<Vec<RelayConfig>> {
    serde_yaml::from_str::<Vec<RelayConfig>>(config_str).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Could not parse config YAML: {e}"),
        )
    })
}

/// Loads configuration files from the provided paths.
///
/// Reads each file, parses it as YAML, and returns the combined list of configs.
pub async fn load_configs(args: &[String]) -> std::io::Result<Vec<RelayConfig>> {
    let mut all_configs = vec![];
    for config_filename in args {
        let config_bytes = match tokio::fs::read(config_filename).await {
            Ok(b) => b,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Could not read config file {config_filename}: {e}"),
                ));
            }
        };

        let config_str = match String::from_utf8(config_bytes) {
            Ok(s) => s,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Could not parse config file {config_filename} as UTF8: {e}"),
                ));
            }
        };

        let mut configs = match parse_configs(&config_str) {
            Ok(c) => c,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Could not load config file {config_filename}: {e}"),
                ));
            }
        };
        all_configs.append(&mut configs)
    }

    Ok(all_configs)
}
