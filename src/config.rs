use anyhow::Context;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Adapter settings, read from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    /// Base URL of the device, e.g. `http://192.168.1.40`
    pub shelly_url: String,
    /// Overrides the serial reported by the device
    pub serial: Option<String>,
    /// Serve only this channel instead of every channel of the device
    pub channel: Option<u32>,
    pub poll_interval: Duration,
    /// Settings are kept in memory only when unset
    pub settings_file: Option<PathBuf>,
}

impl AdapterConfig {
    pub fn new(shelly_url: impl Into<String>) -> Self {
        Self {
            shelly_url: shelly_url.into(),
            serial: None,
            channel: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            settings_file: None,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let shelly_url = env::var("SHELLY_URL")
            .context("Required to add Shelly device address (SHELLY_URL env var)")?;

        let channel = match non_empty_var("SHELLY_CHANNEL") {
            Some(raw) => Some(
                raw.parse::<u32>()
                    .with_context(|| format!("Invalid SHELLY_CHANNEL `{raw}`"))?,
            ),
            None => None,
        };
        let poll_interval = match non_empty_var("POLL_INTERVAL_MS") {
            Some(raw) => {
                let millis: u64 = raw
                    .parse()
                    .with_context(|| format!("Invalid POLL_INTERVAL_MS `{raw}`"))?;
                anyhow::ensure!(millis > 0, "POLL_INTERVAL_MS must be positive");
                Duration::from_millis(millis)
            }
            None => DEFAULT_POLL_INTERVAL,
        };

        Ok(Self {
            shelly_url,
            serial: non_empty_var("SHELLY_SERIAL"),
            channel,
            poll_interval,
            settings_file: non_empty_var("SETTINGS_FILE").map(PathBuf::from),
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests share the process environment
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 5] = [
        "SHELLY_URL",
        "SHELLY_SERIAL",
        "SHELLY_CHANNEL",
        "POLL_INTERVAL_MS",
        "SETTINGS_FILE",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();
        env::set_var("SHELLY_URL", "http://10.0.0.5");

        let config = AdapterConfig::from_env().unwrap();
        assert_eq!(config, AdapterConfig::new("http://10.0.0.5"));
        clear_env();
    }

    #[test]
    fn test_all_values() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();
        env::set_var("SHELLY_URL", "http://10.0.0.5");
        env::set_var("SHELLY_SERIAL", "c8f09e8a1b2c");
        env::set_var("SHELLY_CHANNEL", "2");
        env::set_var("POLL_INTERVAL_MS", "500");
        env::set_var("SETTINGS_FILE", "/data/shelly.json");

        let config = AdapterConfig::from_env().unwrap();
        assert_eq!(config.serial.as_deref(), Some("c8f09e8a1b2c"));
        assert_eq!(config.channel, Some(2));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.settings_file, Some(PathBuf::from("/data/shelly.json")));
        clear_env();
    }

    #[test]
    fn test_missing_url_is_an_error() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();
        assert!(AdapterConfig::from_env().is_err());
    }

    #[test]
    fn test_invalid_numbers_are_errors() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();
        env::set_var("SHELLY_URL", "http://10.0.0.5");

        env::set_var("SHELLY_CHANNEL", "one");
        assert!(AdapterConfig::from_env().is_err());
        env::remove_var("SHELLY_CHANNEL");

        env::set_var("POLL_INTERVAL_MS", "0");
        assert!(AdapterConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_blank_optional_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        clear_env();
        env::set_var("SHELLY_URL", "http://10.0.0.5");
        env::set_var("SHELLY_SERIAL", "  ");
        env::set_var("SETTINGS_FILE", "");

        let config = AdapterConfig::from_env().unwrap();
        assert_eq!(config.serial, None);
        assert_eq!(config.settings_file, None);
        clear_env();
    }
}
