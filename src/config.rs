use crate::connectivity::{ConnectivityConfig, ConnectivitySettings, Credentials};
use anyhow::{Context, Result, bail};
use std::{env, path::PathBuf, str::FromStr, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// HTTP server configuration
    pub ui: UiConfig,

    /// Radio mode and retry policy; credentials come from the host
    /// environment and are never persisted by this service
    pub wifi: WifiConfig,

    /// Update pipeline configuration
    pub update: UpdateConfig,
}

#[derive(Clone, Debug)]
pub struct UiConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct WifiConfig {
    pub connectivity: ConnectivityConfig,
    pub settings: ConnectivitySettings,
}

#[derive(Clone, Debug)]
pub struct UpdateConfig {
    /// Directory holding the update region and boot-target marker.
    pub flash_dir: PathBuf,
    /// Update region capacity in bytes.
    pub region_size: u64,
    /// Abort a transfer that stalls for longer than this.
    pub idle_timeout: Duration,
    /// Delay between the success response and the restart, so the client
    /// learns the outcome before the device goes away.
    pub restart_grace: Duration,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// Returns a reference to the cached configuration. On first call, it
    /// loads and validates all configuration from environment variables.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// application cannot function without valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        Ok(Self {
            ui: UiConfig {
                port: env_or("UI_PORT", 8080)?,
            },
            wifi: WifiConfig {
                connectivity: load_connectivity()?,
                settings: ConnectivitySettings {
                    poll_interval: Duration::from_millis(env_or("WIFI_POLL_INTERVAL_MS", 500)?),
                    max_attempts: env_or("WIFI_MAX_ATTEMPTS", 10)?,
                },
            },
            update: UpdateConfig {
                flash_dir: env::var("FLASH_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/var/lib/emberlink/flash")),
                region_size: env_or("UPDATE_REGION_SIZE", 4 * 1024 * 1024)?,
                idle_timeout: Duration::from_secs(env_or("UPDATE_IDLE_TIMEOUT_SECS", 30)?),
                restart_grace: Duration::from_secs(env_or("RESTART_GRACE_SECS", 2)?),
            },
        })
    }
}

fn load_connectivity() -> Result<ConnectivityConfig> {
    let mode = env::var("WIFI_MODE").unwrap_or_else(|_| "ap".to_string());

    let station = || -> Result<Credentials> {
        Ok(Credentials {
            ssid: env::var("WIFI_SSID").context("WIFI_SSID missing")?,
            passphrase: env::var("WIFI_PASSPHRASE").unwrap_or_default(),
        })
    };
    let access_point = || -> Result<Credentials> {
        Ok(Credentials {
            ssid: env::var("AP_SSID").unwrap_or_else(|_| "EMBERLINK-AP".to_string()),
            passphrase: env::var("AP_PASSPHRASE").unwrap_or_else(|_| "emberlink".to_string()),
        })
    };

    match mode.as_str() {
        "station" => Ok(ConnectivityConfig::Station(station()?)),
        "ap" => Ok(ConnectivityConfig::AccessPoint(access_point()?)),
        "dual" => Ok(ConnectivityConfig::Dual {
            station: station()?,
            access_point: access_point()?,
        }),
        other => bail!("invalid WIFI_MODE '{other}' (expected station, ap or dual)"),
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("{key} format")),
        Err(_) => Ok(default),
    }
}
