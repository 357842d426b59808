//! Throttling configuration schema.
//!
//! The types deserialize from YAML or JSON (anything serde supports); loading
//! from files is the caller's concern. Validation that cannot be expressed in
//! the type system lives in [`ThrottleConfig::validate`].

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::limit::{Rate, RateLimitAlg};

/// A `"<count>/<unit>"` rate, with unit one of `s`, `m`, `h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateValue {
    pub count: usize,
    pub duration: Duration,
}

impl From<RateValue> for Rate {
    fn from(value: RateValue) -> Self {
        Rate {
            count: value.count,
            duration: value.duration,
        }
    }
}

impl FromStr for RateValue {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRate(s.to_string());
        let (count, unit) = s.split_once('/').ok_or_else(invalid)?;
        let count: usize = count.trim().parse().map_err(|_| invalid())?;
        let duration = match unit.trim() {
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            _ => return Err(invalid()),
        };
        Ok(Self { count, duration })
    }
}

impl<'de> Deserialize<'de> for RateValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*(ms|s|m|h)\s*$").expect("duration regex"));

pub(crate) fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let captures = DURATION_RE
        .captures(s)
        .ok_or_else(|| ConfigError::InvalidDuration(s.to_string()))?;
    let value: f64 = captures[1]
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;
    let factor = match &captures[2] {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(ConfigError::InvalidDuration(s.to_string())),
    };
    Ok(Duration::from_secs_f64(value * factor))
}

/// A human-readable duration such as `"250ms"`, `"5s"`, `"1m"` or `"2h"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConfigDuration(pub Duration);

impl FromStr for ConfigDuration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(Self)
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Retry-after advertised on rejection: a fixed duration, or `"auto"` to use
/// the limiter's own estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryAfterValue {
    #[default]
    Auto,
    Fixed(Duration),
}

impl<'de> Deserialize<'de> for RetryAfterValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.trim().eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        parse_duration(&raw)
            .map(Self::Fixed)
            .map_err(serde::de::Error::custom)
    }
}

/// A list of strings accepted either as a YAML sequence or as a single
/// comma-separated scalar (`tags: tag_a,tag_b`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringList(pub Vec<String>);

impl StringList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn intersects(&self, other: &StringList) -> bool {
        self.0.iter().any(|item| other.0.contains(item))
    }
}

impl From<Vec<String>> for StringList {
    fn from(values: Vec<String>) -> Self {
        Self(values)
    }
}

impl<'de> Deserialize<'de> for StringList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            One(String),
            Many(Vec<String>),
        }
        let values = match Repr::deserialize(deserializer)? {
            Repr::One(raw) => split_csv(&raw),
            Repr::Many(items) => items.iter().flat_map(|item| split_csv(item)).collect(),
        };
        Ok(Self(values))
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

/// How the partitioning key is derived from a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// A single fixed key: every call shares one limiter state.
    Fixed,
    /// First value of the named metadata header.
    Header,
    /// Remote peer IP.
    RemoteAddr,
    /// Caller identity, via the extractor supplied in the middleware options.
    Identity,
    /// Fully custom extractor supplied in the middleware options.
    Custom,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyConfig {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    #[serde(default)]
    pub header_name: Option<String>,
    /// When false (the default), an empty key bypasses limiting; when true,
    /// empty keys are limited under the `""` key.
    #[serde(default)]
    pub no_bypass_empty: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitZoneConfig {
    #[serde(default)]
    pub alg: RateLimitAlg,
    pub rate_limit: RateValue,
    #[serde(default)]
    pub burst_limit: usize,
    #[serde(default)]
    pub backlog_limit: usize,
    #[serde(default)]
    pub backlog_timeout: ConfigDuration,
    #[serde(default)]
    pub key: Option<KeyConfig>,
    #[serde(default)]
    pub max_keys: usize,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub excluded_keys: Vec<String>,
    #[serde(default)]
    pub included_keys: Vec<String>,
    /// HTTP status advertised by HTTP front ends sharing this config; the
    /// gRPC surface always rejects with `ResourceExhausted`.
    #[serde(default)]
    pub response_status_code: u16,
    #[serde(default)]
    pub response_retry_after: RetryAfterValue,
    /// Default selection tags, used when a rule's zone reference carries none.
    #[serde(default)]
    pub tags: StringList,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightLimitZoneConfig {
    pub in_flight_limit: usize,
    #[serde(default)]
    pub backlog_limit: usize,
    #[serde(default)]
    pub backlog_timeout: ConfigDuration,
    #[serde(default)]
    pub key: Option<KeyConfig>,
    #[serde(default)]
    pub max_keys: usize,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub excluded_keys: Vec<String>,
    #[serde(default)]
    pub included_keys: Vec<String>,
    #[serde(default)]
    pub response_status_code: u16,
    #[serde(default)]
    pub response_retry_after: RetryAfterValue,
    #[serde(default)]
    pub tags: StringList,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub path: String,
    /// RPC method names this route is restricted to; empty means any.
    #[serde(default)]
    pub methods: StringList,
}

/// Reference to a zone from a rule, with per-(rule, zone) selection tags.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRef {
    pub zone: String,
    #[serde(default)]
    pub tags: StringList,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub rate_limits: Vec<ZoneRef>,
    #[serde(default)]
    pub in_flight_limits: Vec<ZoneRef>,
    #[serde(default)]
    pub tags: StringList,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThrottleConfig {
    pub rate_limit_zones: HashMap<String, RateLimitZoneConfig>,
    pub in_flight_limit_zones: HashMap<String, InFlightLimitZoneConfig>,
    pub rules: Vec<RuleConfig>,
}

impl ThrottleConfig {
    /// Checks zone references and the parts of zone configs the type system
    /// cannot enforce. Must pass before limiters are instantiated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, zone) in &self.rate_limit_zones {
            if zone.rate_limit.count == 0 || u32::try_from(zone.rate_limit.count).is_err() {
                return Err(ConfigError::InvalidRate(format!(
                    "zone {name:?}: bad rate count {}",
                    zone.rate_limit.count
                )));
            }
            if u32::try_from(zone.burst_limit).is_err() {
                return Err(ConfigError::InvalidRate(format!(
                    "zone {name:?}: burst {} is too large",
                    zone.burst_limit
                )));
            }
            validate_key(&zone.key)?;
        }
        for zone in self.in_flight_limit_zones.values() {
            if zone.in_flight_limit == 0 {
                return Err(ConfigError::InvalidInFlightLimit);
            }
            validate_key(&zone.key)?;
        }
        for (index, rule) in self.rules.iter().enumerate() {
            for zone_ref in &rule.rate_limits {
                if !self.rate_limit_zones.contains_key(&zone_ref.zone) {
                    return Err(ConfigError::UnresolvedZone {
                        rule: index,
                        kind: "rate limit",
                        zone: zone_ref.zone.clone(),
                    });
                }
            }
            for zone_ref in &rule.in_flight_limits {
                if !self.in_flight_limit_zones.contains_key(&zone_ref.zone) {
                    return Err(ConfigError::UnresolvedZone {
                        rule: index,
                        kind: "in-flight limit",
                        zone: zone_ref.zone.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn validate_key(key: &Option<KeyConfig>) -> Result<(), ConfigError> {
    if let Some(key) = key {
        if key.key_type == KeyType::Header && key.header_name.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::MissingHeaderName {
                key_type: "header".to_string(),
            });
        }
    }
    Ok(())
}
