//! Configuration validation.

use std::collections::HashSet;

use super::types::RelayConfig;

fn invalid(config: &RelayConfig, message: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("invalid relay config for {}: {message}", config.bind_location),
    )
}

fn validate_relay_config(config: &RelayConfig) -> std::io::Result<()> {
    if config.bind_location.address().is_hostname() {
        return Err(invalid(config, "bind_location must be an IP address"));
    }
    if config.target.port() == 0 {
        return Err(invalid(config, "target port must not be 0"));
    }

    let timeouts = &config.timeouts;
    if timeouts.full_cone_secs == 0 || timeouts.symmetric_secs == 0 || timeouts.dial_secs == 0 {
        return Err(invalid(config, "timeouts must be greater than 0"));
    }
    if timeouts.full_cone_secs < timeouts.symmetric_secs {
        return Err(invalid(
            config,
            format!(
                "full_cone_secs ({}) must not be shorter than symmetric_secs ({})",
                timeouts.full_cone_secs, timeouts.symmetric_secs
            ),
        ));
    }

    let backoff = &config.backoff;
    if backoff.base_millis == 0 || backoff.max_tracked == 0 {
        return Err(invalid(
            config,
            "backoff base_millis and max_tracked must be greater than 0",
        ));
    }
    if backoff.max_secs.saturating_mul(1000) < backoff.base_millis {
        return Err(invalid(config, "backoff max_secs must not be below base_millis"));
    }

    if config.queue_capacity == 0 {
        return Err(invalid(config, "queue_capacity must be greater than 0"));
    }

    if let Some(interface) = config.bind_interface.as_ref() {
        if interface.is_empty() {
            return Err(invalid(config, "bind_interface must not be empty"));
        }
        if !cfg!(any(
            target_os = "android",
            target_os = "fuchsia",
            target_os = "linux"
        )) {
            return Err(invalid(
                config,
                "bind_interface is only supported on Linux-like platforms",
            ));
        }
    }

    Ok(())
}

/// Validates every config and rejects duplicate bind locations.
pub fn create_relay_configs(configs: Vec<RelayConfig>) -> std::io::Result<Vec<RelayConfig>> {
    let mut seen = HashSet::new();
    for config in configs.iter() {
        validate_relay_config(config)?;
        if !seen.insert(config.bind_location.clone()) {
            return Err(invalid(config, "bind_location is used more than once"));
        }
    }
    Ok(configs)
}
