//! Connectivity manager: radio mode and connection lifecycle.
//!
//! The device must never become silently unreachable because a one-time
//! station association failed. `start()` therefore applies the configured
//! mode with a bounded retry for the station leg and degrades gracefully: in
//! dual mode the access point is brought up first, so reachability is never
//! worse than AP-only even when the station network cannot be joined.
//!
//! Reconnection is caller-initiated: the manager never re-enters
//! `Connecting` on its own, so it cannot compete for bandwidth with an
//! in-progress firmware transfer.

use log::{info, warn};
use serde::Serialize;
use std::{
    net::IpAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    /// Station association did not complete within the retry ceiling.
    /// Non-fatal: the device stays reachable via whatever mode succeeded and
    /// the caller may retry `start()` later.
    #[error("station association timed out after {attempts} attempts")]
    AssociationTimeout { attempts: u32 },
    #[error("radio error: {0}")]
    Radio(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub passphrase: String,
}

/// Desired radio mode; constructed once at startup and never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectivityConfig {
    Station(Credentials),
    AccessPoint(Credentials),
    Dual {
        station: Credentials,
        access_point: Credentials,
    },
}

impl ConnectivityConfig {
    fn mode(&self) -> RadioMode {
        match self {
            ConnectivityConfig::Station(_) => RadioMode::Station,
            ConnectivityConfig::AccessPoint(_) => RadioMode::AccessPoint,
            ConnectivityConfig::Dual { .. } => RadioMode::Dual,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioMode {
    Station,
    AccessPoint,
    Dual,
}

/// Station-leg link status. Pure access-point operation is `ApOnly`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    ApOnly,
}

/// Process-wide connectivity diagnostics, owned by the manager and read by
/// the status endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub mode: RadioMode,
    pub link: LinkStatus,
    pub access_point_active: bool,
    pub retries: u32,
    pub ip_address: Option<String>,
}

/// Retry policy for the bounded association wait.
#[derive(Clone, Copy, Debug)]
pub struct ConnectivitySettings {
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_attempts: 10,
        }
    }
}

/// Radio/network stack boundary; implementations belong to the platform.
#[cfg_attr(test, mockall::automock)]
pub trait Radio: Send + Sync {
    /// Bring up the access point; returns once the radio accepts the config.
    fn start_access_point(&self, ssid: &str, passphrase: &str) -> Result<(), ConnectivityError>;

    /// Kick off an asynchronous association attempt; must not block.
    fn begin_association(&self, ssid: &str, passphrase: &str) -> Result<(), ConnectivityError>;

    /// Current station link status as reported by the network stack.
    fn is_associated(&self) -> bool;

    /// Address assigned to the station interface, if any.
    fn ip_address(&self) -> Option<IpAddr>;
}

/// Adapter for hosts whose operating system already owns the radio: the OS
/// network stack keeps the link up, so association is reported as established
/// immediately and access-point startup is a no-op. Firmware targets
/// implement [`Radio`] against their platform API instead.
pub struct OsRadio;

impl Radio for OsRadio {
    fn start_access_point(&self, ssid: &str, _passphrase: &str) -> Result<(), ConnectivityError> {
        info!("access point '{ssid}' delegated to the host network stack");
        Ok(())
    }

    fn begin_association(&self, _ssid: &str, _passphrase: &str) -> Result<(), ConnectivityError> {
        Ok(())
    }

    fn is_associated(&self) -> bool {
        true
    }

    fn ip_address(&self) -> Option<IpAddr> {
        None
    }
}

pub struct ConnectivityManager {
    radio: Arc<dyn Radio>,
    config: ConnectivityConfig,
    settings: ConnectivitySettings,
    state: Mutex<ConnectivityState>,
}

impl ConnectivityManager {
    /// Store the desired mode. Pure data: no radio hardware is touched until
    /// [`start`](Self::start).
    pub fn new(
        radio: Arc<dyn Radio>,
        config: ConnectivityConfig,
        settings: ConnectivitySettings,
    ) -> Self {
        let state = ConnectivityState {
            mode: config.mode(),
            link: LinkStatus::Disconnected,
            access_point_active: false,
            retries: 0,
            ip_address: None,
        };
        Self {
            radio,
            config,
            settings,
            state: Mutex::new(state),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state.lock().unwrap().clone()
    }

    /// Apply the configured mode.
    ///
    /// Station association blocks the caller for at most
    /// `poll_interval * max_attempts`; past the ceiling the state is left
    /// `Disconnected` and the mode is not silently downgraded. In dual mode
    /// the access point comes up first and stays up regardless of the
    /// station outcome.
    pub async fn start(&self) -> Result<(), ConnectivityError> {
        match &self.config {
            ConnectivityConfig::Station(station) => self.associate(station).await,
            ConnectivityConfig::AccessPoint(ap) => {
                self.radio.start_access_point(&ap.ssid, &ap.passphrase)?;
                self.update(|s| {
                    s.link = LinkStatus::ApOnly;
                    s.access_point_active = true;
                });
                info!("access point '{}' up", ap.ssid);
                Ok(())
            }
            ConnectivityConfig::Dual {
                station,
                access_point,
            } => {
                self.radio
                    .start_access_point(&access_point.ssid, &access_point.passphrase)?;
                self.update(|s| s.access_point_active = true);
                info!("access point '{}' up, joining '{}'", access_point.ssid, station.ssid);

                match self.associate(station).await {
                    Ok(()) => Ok(()),
                    Err(ConnectivityError::AssociationTimeout { attempts }) => {
                        warn!(
                            "station association failed after {attempts} attempts; \
                             device remains reachable via access point '{}'",
                            access_point.ssid
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Bounded sleep-and-poll association wait.
    async fn associate(&self, station: &Credentials) -> Result<(), ConnectivityError> {
        self.update(|s| {
            s.link = LinkStatus::Connecting;
            s.retries = 0;
        });
        self.radio
            .begin_association(&station.ssid, &station.passphrase)?;

        for attempt in 1..=self.settings.max_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;
            self.update(|s| s.retries = attempt);

            if self.radio.is_associated() {
                let ip = self.radio.ip_address();
                self.update(|s| {
                    s.link = LinkStatus::Connected;
                    s.ip_address = ip.map(|a| a.to_string());
                });
                info!(
                    "associated with '{}' after {attempt} attempt(s){}",
                    station.ssid,
                    ip.map(|a| format!(", ip {a}")).unwrap_or_default()
                );
                return Ok(());
            }
        }

        self.update(|s| s.link = LinkStatus::Disconnected);
        Err(ConnectivityError::AssociationTimeout {
            attempts: self.settings.max_attempts,
        })
    }

    fn update(&self, f: impl FnOnce(&mut ConnectivityState)) {
        f(&mut self.state.lock().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_settings(max_attempts: u32) -> ConnectivitySettings {
        ConnectivitySettings {
            poll_interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    fn creds(ssid: &str) -> Credentials {
        Credentials {
            ssid: ssid.into(),
            passphrase: "hunter22".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn station_polls_exactly_the_ceiling_before_giving_up() {
        let polls = Arc::new(AtomicU32::new(0));
        let polls_seen = polls.clone();

        let mut radio = MockRadio::new();
        radio.expect_begin_association().times(1).returning(|_, _| Ok(()));
        radio.expect_is_associated().returning(move || {
            polls.fetch_add(1, Ordering::SeqCst);
            false
        });

        let manager = ConnectivityManager::new(
            Arc::new(radio),
            ConnectivityConfig::Station(creds("lab-net")),
            fast_settings(10),
        );

        assert_eq!(
            manager.start().await,
            Err(ConnectivityError::AssociationTimeout { attempts: 10 })
        );
        assert_eq!(polls_seen.load(Ordering::SeqCst), 10);

        let state = manager.state();
        assert_eq!(state.link, LinkStatus::Disconnected);
        assert_eq!(state.retries, 10);
        assert!(!state.access_point_active);
    }

    #[tokio::test(start_paused = true)]
    async fn station_connects_before_the_ceiling() {
        let polls = Arc::new(AtomicU32::new(0));

        let mut radio = MockRadio::new();
        radio.expect_begin_association().times(1).returning(|_, _| Ok(()));
        radio
            .expect_is_associated()
            .returning(move || polls.fetch_add(1, Ordering::SeqCst) + 1 >= 3);
        radio
            .expect_ip_address()
            .returning(|| Some("192.168.4.17".parse().unwrap()));

        let manager = ConnectivityManager::new(
            Arc::new(radio),
            ConnectivityConfig::Station(creds("lab-net")),
            fast_settings(10),
        );

        manager.start().await.expect("should connect");
        let state = manager.state();
        assert_eq!(state.link, LinkStatus::Connected);
        assert_eq!(state.retries, 3);
        assert_eq!(state.ip_address.as_deref(), Some("192.168.4.17"));
    }

    #[tokio::test(start_paused = true)]
    async fn dual_mode_keeps_access_point_when_station_fails() {
        let mut radio = MockRadio::new();
        radio
            .expect_start_access_point()
            .times(1)
            .returning(|_, _| Ok(()));
        radio.expect_begin_association().times(1).returning(|_, _| Ok(()));
        radio.expect_is_associated().times(4).returning(|| false);

        let manager = ConnectivityManager::new(
            Arc::new(radio),
            ConnectivityConfig::Dual {
                station: creds("unreachable-net"),
                access_point: creds("device-ap"),
            },
            fast_settings(4),
        );

        // Degraded, not fatal.
        manager.start().await.expect("dual start should succeed");

        let state = manager.state();
        assert!(state.access_point_active);
        assert_eq!(state.link, LinkStatus::Disconnected);
        assert_eq!(state.retries, 4);
    }

    #[tokio::test]
    async fn access_point_mode_is_immediate() {
        let mut radio = MockRadio::new();
        radio
            .expect_start_access_point()
            .times(1)
            .returning(|_, _| Ok(()));

        let manager = ConnectivityManager::new(
            Arc::new(radio),
            ConnectivityConfig::AccessPoint(creds("device-ap")),
            ConnectivitySettings::default(),
        );

        manager.start().await.expect("ap start");
        let state = manager.state();
        assert_eq!(state.link, LinkStatus::ApOnly);
        assert!(state.access_point_active);
        assert_eq!(state.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_may_retry_after_timeout() {
        let polls = Arc::new(AtomicU32::new(0));

        let mut radio = MockRadio::new();
        radio.expect_begin_association().times(2).returning(|_, _| Ok(()));
        // Fails the entire first round (2 polls), succeeds on the second.
        radio
            .expect_is_associated()
            .returning(move || polls.fetch_add(1, Ordering::SeqCst) + 1 > 2);
        radio.expect_ip_address().returning(|| None);

        let manager = ConnectivityManager::new(
            Arc::new(radio),
            ConnectivityConfig::Station(creds("flaky-net")),
            fast_settings(2),
        );

        assert!(manager.start().await.is_err());
        manager.start().await.expect("retry should connect");
        assert_eq!(manager.state().link, LinkStatus::Connected);
    }
}
