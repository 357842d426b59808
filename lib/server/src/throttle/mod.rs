//! Throttling gate: route matching, tag-based rule selection, and the
//! composition of rate and in-flight limiting zones around the handler.

pub mod config;
pub mod metrics;
mod middleware;
mod routes;

pub use config::{
    ConfigDuration, InFlightLimitZoneConfig, KeyConfig, KeyType, RateLimitZoneConfig, RateValue,
    RetryAfterValue, RouteConfig, RuleConfig, StringList, ThrottleConfig, ZoneRef,
};
pub use metrics::ThrottleMetrics;
pub use middleware::{ThrottleInterceptor, ThrottleOptions};
