//! Activation gate
//!
//! Toggling only happens after a threshold that is computed once at startup:
//! thirty minutes before today's sunset, or one second ago in testing mode.

use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use duskswitch_common::tracing;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::config::DaemonConfig;
use crate::sunset::SunsetClient;

/// How long before sunset the gate opens
pub const ACTIVATION_OFFSET_MINUTES: i64 = 30;

/// Errors raised while computing the activation threshold
#[derive(Error, Debug)]
pub enum GateError {
    #[error("sunset request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("sunset service answered HTTP {0}")]
    Status(u16),

    #[error("sunset service reported status {0}")]
    Api(String),

    #[error("could not parse sunset time {0:?}")]
    Parse(String),

    #[error("a location is required to look up the sunset")]
    MissingLocation,
}

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// A single activation threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationGate {
    threshold: DateTime<Local>,
}

impl ActivationGate {
    pub fn at(threshold: DateTime<Local>) -> Self {
        Self { threshold }
    }

    /// Gate that is already open
    pub fn testing(now: DateTime<Local>) -> Self {
        Self::at(now - ChronoDuration::seconds(1))
    }

    pub fn from_sunset(sunset: DateTime<Utc>) -> Self {
        Self::at(sunset.with_timezone(&Local) - ChronoDuration::minutes(ACTIVATION_OFFSET_MINUTES))
    }

    pub fn threshold(&self) -> DateTime<Local> {
        self.threshold
    }

    /// Strictly past the threshold
    pub fn is_open(&self, now: DateTime<Local>) -> bool {
        now > self.threshold
    }

    /// Time left until the gate opens, `None` once it is open
    pub fn remaining(&self, now: DateTime<Local>) -> Option<Duration> {
        if self.is_open(now) {
            return None;
        }
        // a gate exactly at `now` opens on the next tick
        (self.threshold - now)
            .to_std()
            .ok()
            .map(|d| d.max(Duration::from_millis(1)))
    }
}

/// Compute the gate from the configuration, fetching today's sunset unless testing
pub async fn resolve(
    config: &DaemonConfig,
    clock: &dyn Clock,
) -> Result<ActivationGate, GateError> {
    let now = clock.now();

    if config.testing {
        info!("Testing mode, activation time is now");
        return Ok(ActivationGate::testing(now));
    }

    let location = config.location.ok_or(GateError::MissingLocation)?;
    info!("Getting sunset data...");

    let client = SunsetClient::new(&config.network.sunset_api_url, config.sunset_timeout())?;
    let sunset = client.fetch_sunset(location, now.date_naive()).await?;
    let gate = ActivationGate::from_sunset(sunset);

    info!(
        "Sunset at {}, activating at {}",
        sunset.with_timezone(&Local).format("%H:%M:%S"),
        gate.threshold().format("%H:%M:%S")
    );
    Ok(gate)
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use duskswitch_common::Location;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_testing_gate_is_open() {
        let gate = ActivationGate::testing(noon());
        assert!(gate.is_open(noon()));
        assert_eq!(gate.remaining(noon()), None);
    }

    #[test]
    fn test_threshold_is_thirty_minutes_before_sunset() {
        let sunset = Utc.with_ymd_and_hms(2024, 6, 21, 19, 33, 0).unwrap();
        let gate = ActivationGate::from_sunset(sunset);
        assert_eq!(
            gate.threshold(),
            Utc.with_ymd_and_hms(2024, 6, 21, 19, 3, 0)
                .unwrap()
                .with_timezone(&Local)
        );
    }

    #[test]
    fn test_gate_opens_strictly_after_threshold() {
        let gate = ActivationGate::at(noon());
        assert!(!gate.is_open(noon() - ChronoDuration::seconds(1)));
        assert!(!gate.is_open(noon()));
        assert!(gate.is_open(noon() + ChronoDuration::milliseconds(1)));
    }

    #[test]
    fn test_remaining_delay() {
        let gate = ActivationGate::at(noon());
        assert_eq!(
            gate.remaining(noon() - ChronoDuration::minutes(5)),
            Some(Duration::from_secs(300))
        );
        assert_eq!(gate.remaining(noon()), Some(Duration::from_millis(1)));
    }

    #[tokio::test]
    async fn test_resolve_in_testing_mode_skips_the_network() {
        let mut config = DaemonConfig::default();
        config.testing = true;
        config.location = None;
        config.network.sunset_api_url = "http://127.0.0.1:1/unreachable".to_string();

        let clock = clock::ManualClock::new(noon());
        let gate = resolve(&config, &clock).await.unwrap();
        assert_eq!(gate.threshold(), noon() - ChronoDuration::seconds(1));
    }

    #[tokio::test]
    async fn test_resolve_requires_location() {
        let mut config = DaemonConfig::default();
        config.location = None;

        let clock = clock::ManualClock::new(noon());
        assert!(matches!(
            resolve(&config, &clock).await,
            Err(GateError::MissingLocation)
        ));
    }

    #[tokio::test]
    async fn test_resolve_fails_when_service_is_down() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = DaemonConfig::default();
        config.location = Some(Location {
            latitude: 52.52,
            longitude: 13.405,
        });
        config.network.sunset_api_url = format!("http://127.0.0.1:{}/json", port);
        config.network.sunset_timeout_ms = 2_000;

        let clock = clock::ManualClock::new(noon());
        assert!(matches!(
            resolve(&config, &clock).await,
            Err(GateError::Request(_))
        ));
    }
}
