//! Sunset lookup against the sunrise-sunset.org JSON API

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use duskswitch_common::{tracing, Location};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::gate::GateError;

// `results` is an object on success and an empty string on errors
#[derive(Debug, Deserialize)]
struct SunsetResponse {
    #[serde(default)]
    results: Value,
    status: String,
}

pub struct SunsetClient {
    http: reqwest::Client,
    api_url: String,
}

impl SunsetClient {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, GateError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
        })
    }

    /// Fetch the sunset on `date` at `location`
    pub async fn fetch_sunset(
        &self,
        location: Location,
        date: NaiveDate,
    ) -> Result<DateTime<Utc>, GateError> {
        debug!(
            "Requesting sunset for {} at {},{}",
            date, location.latitude, location.longitude
        );

        let response = self
            .http
            .get(&self.api_url)
            .query(&[
                ("lat", location.latitude.to_string()),
                ("lng", location.longitude.to_string()),
                ("date", date.format("%Y-%m-%d").to_string()),
                ("formatted", "0".to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GateError::Status(status.as_u16()));
        }

        let body: SunsetResponse = response.json().await?;
        if body.status != "OK" {
            return Err(GateError::Api(body.status));
        }
        let sunset = body
            .results
            .get("sunset")
            .and_then(Value::as_str)
            .ok_or_else(|| GateError::Parse("missing results.sunset".to_string()))?;

        parse_sunset(sunset, date)
    }
}

/// Parse the service's sunset field.
///
/// Unformatted responses are RFC 3339. The formatted `h:mm:ss AM` variant is
/// UTC on `date`.
pub fn parse_sunset(raw: &str, date: NaiveDate) -> Result<DateTime<Utc>, GateError> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let time = NaiveTime::parse_from_str(raw, "%I:%M:%S %p")
        .map_err(|_| GateError::Parse(raw.to_string()))?;
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}
