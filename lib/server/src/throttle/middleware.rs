//! The throttling gate.
//!
//! At construction, rules are compiled: routes are normalised and, for the
//! instance's filter tags, the participating zones of every rule are selected
//! once. Zone limiters are singletons shared by all rules referencing them.
//! Per call, the matching rules' gates are resolved (cached per method path)
//! and chained so that every rate gate runs before any in-flight gate; the
//! most restrictive zone effectively decides admission.
//!
//! Tag selection follows a strict precedence:
//! 1. no filter tags and no rule tags: only untagged zones apply;
//! 2. no filter tags but rule tags present: the rule is skipped;
//! 3. filter tags intersect the rule tags: every zone of the rule applies;
//! 4. otherwise a zone applies iff its own tags intersect the filter tags.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use once_cell::sync::OnceCell;
use tonic::Status;

use super::config::{
    InFlightLimitZoneConfig, KeyConfig, KeyType, RateLimitZoneConfig, RetryAfterValue, StringList,
    ThrottleConfig, ZoneRef,
};
use super::metrics::ThrottleMetrics;
use super::routes::{normalize_path, CompiledRoute};
use crate::error::ConfigError;
use crate::interceptor::{Call, Interceptor, Next};
use crate::limit::in_flight::{
    InFlightLimitOnError, InFlightLimitOnReject, InFlightLimitOnRejectInDryRun,
};
use crate::limit::rate::{RateLimitOnError, RateLimitOnReject, RateLimitOnRejectInDryRun};
use crate::limit::{
    self, key, CallNext, InFlightLimitHandler, InFlightLimitOptions, KeyExtraction, KeyExtractor,
    RateLimitHandler, RateLimitOptions, RateLimitParams,
};

/// Options of a single middleware instance.
#[derive(Clone, Default)]
pub struct ThrottleOptions {
    /// Filter tags advertised by this instance; see the module docs for the
    /// selection precedence.
    pub tags: Vec<String>,
    /// Build every selected zone's limiter at construction instead of on the
    /// first matching call.
    pub build_at_init: bool,
    /// Extractor backing `key: {type: identity}` zones.
    pub get_key_identity: Option<KeyExtractor>,
    /// Extractor backing `key: {type: custom}` zones.
    pub get_key_custom: Option<KeyExtractor>,
    pub metrics: Option<Arc<ThrottleMetrics>>,
    pub rate_limit_on_reject: Option<RateLimitOnReject>,
    pub rate_limit_on_reject_in_dry_run: Option<RateLimitOnRejectInDryRun>,
    pub rate_limit_on_error: Option<RateLimitOnError>,
    pub in_flight_limit_on_reject: Option<InFlightLimitOnReject>,
    pub in_flight_limit_on_reject_in_dry_run: Option<InFlightLimitOnRejectInDryRun>,
    pub in_flight_limit_on_error: Option<InFlightLimitOnError>,
}

struct RateZonePlan {
    cfg: RateLimitZoneConfig,
    extractor: Option<KeyExtractor>,
}

struct InFlightZonePlan {
    cfg: InFlightLimitZoneConfig,
    extractor: Option<KeyExtractor>,
}

struct CompiledRule {
    routes: Vec<CompiledRoute>,
    rate_zones: Vec<String>,
    in_flight_zones: Vec<String>,
}

enum Gate {
    Rate(Arc<RateLimitHandler>),
    InFlight(Arc<InFlightLimitHandler>),
}

struct ZoneSet {
    rate: HashMap<String, Arc<RateLimitHandler>>,
    in_flight: HashMap<String, Arc<InFlightLimitHandler>>,
}

/// Chain interceptor applying the configured throttling rules.
pub struct ThrottleInterceptor {
    opts: ThrottleOptions,
    rules: Vec<CompiledRule>,
    rate_plans: HashMap<String, RateZonePlan>,
    in_flight_plans: HashMap<String, InFlightZonePlan>,
    zones: OnceCell<ZoneSet>,
    method_gates: DashMap<String, Arc<Vec<Gate>>>,
}

impl ThrottleInterceptor {
    pub fn new(cfg: ThrottleConfig, opts: ThrottleOptions) -> Result<Self, ConfigError> {
        cfg.validate()?;

        let filter_tags = StringList(opts.tags.clone());
        let mut rules = Vec::with_capacity(cfg.rules.len());
        for rule in &cfg.rules {
            let rate_zones = select_zones(&filter_tags, &rule.tags, &rule.rate_limits, |name| {
                cfg.rate_limit_zones[name].tags.clone()
            });
            let in_flight_zones =
                select_zones(&filter_tags, &rule.tags, &rule.in_flight_limits, |name| {
                    cfg.in_flight_limit_zones[name].tags.clone()
                });
            rules.push(CompiledRule {
                routes: rule.routes.iter().map(CompiledRoute::compile).collect(),
                rate_zones,
                in_flight_zones,
            });
        }

        // Key extractors are built eagerly for every referenced zone so that
        // missing identity/custom extractors fail construction, not traffic.
        let mut rate_plans = HashMap::new();
        for (name, zone) in &cfg.rate_limit_zones {
            let extractor = build_extractor(
                &zone.key,
                &zone.excluded_keys,
                &zone.included_keys,
                &opts,
            )?;
            rate_plans.insert(
                name.clone(),
                RateZonePlan {
                    cfg: zone.clone(),
                    extractor,
                },
            );
        }
        let mut in_flight_plans = HashMap::new();
        for (name, zone) in &cfg.in_flight_limit_zones {
            let extractor = build_extractor(
                &zone.key,
                &zone.excluded_keys,
                &zone.included_keys,
                &opts,
            )?;
            in_flight_plans.insert(
                name.clone(),
                InFlightZonePlan {
                    cfg: zone.clone(),
                    extractor,
                },
            );
        }

        let interceptor = Self {
            opts,
            rules,
            rate_plans,
            in_flight_plans,
            zones: OnceCell::new(),
            method_gates: DashMap::new(),
        };
        if interceptor.opts.build_at_init {
            let zones = interceptor.build_zone_set();
            let _ = interceptor.zones.set(zones);
        }
        Ok(interceptor)
    }

    fn zone_set(&self) -> &ZoneSet {
        self.zones.get_or_init(|| self.build_zone_set())
    }

    /// Instantiates limiters for every zone selected by at least one rule.
    /// The configs were validated at construction, so this cannot fail.
    fn build_zone_set(&self) -> ZoneSet {
        let mut rate = HashMap::new();
        let mut in_flight = HashMap::new();
        for rule in &self.rules {
            for name in &rule.rate_zones {
                if !rate.contains_key(name) {
                    let plan = &self.rate_plans[name];
                    let handler = self
                        .build_rate_handler(name, plan)
                        .expect("rate zone validated at construction");
                    rate.insert(name.clone(), Arc::new(handler));
                }
            }
            for name in &rule.in_flight_zones {
                if !in_flight.contains_key(name) {
                    let plan = &self.in_flight_plans[name];
                    let handler = self
                        .build_in_flight_handler(name, plan)
                        .expect("in-flight zone validated at construction");
                    in_flight.insert(name.clone(), Arc::new(handler));
                }
            }
        }
        ZoneSet { rate, in_flight }
    }

    fn build_rate_handler(
        &self,
        name: &str,
        plan: &RateZonePlan,
    ) -> Result<RateLimitHandler, ConfigError> {
        let zone = name.to_string();
        let metrics = self.opts.metrics.clone();
        let retry_after_cfg = plan.cfg.response_retry_after;
        let user_on_reject = self.opts.rate_limit_on_reject.clone();
        let on_reject: RateLimitOnReject = Arc::new(move |call, params| {
            if let Some(metrics) = &metrics {
                metrics.inc_rate_limit_rejects(&zone, false);
            }
            let params = RateLimitParams {
                estimated_retry_after: match retry_after_cfg {
                    RetryAfterValue::Auto => params.estimated_retry_after,
                    RetryAfterValue::Fixed(fixed) => fixed,
                },
                ..params.clone()
            };
            match &user_on_reject {
                Some(hook) => hook(call, &params),
                None => limit::rate::default_on_reject(call, &params),
            }
        });

        let zone = name.to_string();
        let metrics = self.opts.metrics.clone();
        let user_dry_run = self.opts.rate_limit_on_reject_in_dry_run.clone();
        let on_reject_in_dry_run: RateLimitOnRejectInDryRun = Arc::new(move |call, params| {
            if let Some(metrics) = &metrics {
                metrics.inc_rate_limit_rejects(&zone, true);
            }
            match &user_dry_run {
                Some(hook) => hook(call, params),
                None => limit::rate::default_on_reject_in_dry_run(call, params),
            }
        });

        RateLimitHandler::new(
            plan.cfg.rate_limit.into(),
            RateLimitOptions {
                alg: plan.cfg.alg,
                max_burst: plan.cfg.burst_limit,
                get_key: plan.extractor.clone(),
                max_keys: plan.cfg.max_keys,
                dry_run: plan.cfg.dry_run,
                backlog_limit: plan.cfg.backlog_limit,
                backlog_timeout: plan.cfg.backlog_timeout.0,
                on_reject: Some(on_reject),
                on_reject_in_dry_run: Some(on_reject_in_dry_run),
                on_error: self.opts.rate_limit_on_error.clone(),
            },
        )
    }

    fn build_in_flight_handler(
        &self,
        name: &str,
        plan: &InFlightZonePlan,
    ) -> Result<InFlightLimitHandler, ConfigError> {
        let zone = name.to_string();
        let metrics = self.opts.metrics.clone();
        let retry_after_cfg = plan.cfg.response_retry_after;
        let user_on_reject = self.opts.in_flight_limit_on_reject.clone();
        let on_reject: InFlightLimitOnReject = Arc::new(move |call, params| {
            if let Some(metrics) = &metrics {
                metrics.inc_in_flight_limit_rejects(&zone, false);
            }
            if let RetryAfterValue::Fixed(fixed) = retry_after_cfg {
                limit::set_retry_after_header(call, fixed);
            }
            match &user_on_reject {
                Some(hook) => hook(call, params),
                None => limit::in_flight::default_on_reject(call, params),
            }
        });

        let zone = name.to_string();
        let metrics = self.opts.metrics.clone();
        let user_dry_run = self.opts.in_flight_limit_on_reject_in_dry_run.clone();
        let on_reject_in_dry_run: InFlightLimitOnRejectInDryRun = Arc::new(move |call, params| {
            if let Some(metrics) = &metrics {
                metrics.inc_in_flight_limit_rejects(&zone, true);
            }
            match &user_dry_run {
                Some(hook) => hook(call, params),
                None => limit::in_flight::default_on_reject_in_dry_run(call, params),
            }
        });

        InFlightLimitHandler::new(
            plan.cfg.in_flight_limit,
            InFlightLimitOptions {
                get_key: plan.extractor.clone(),
                max_keys: plan.cfg.max_keys,
                dry_run: plan.cfg.dry_run,
                backlog_limit: plan.cfg.backlog_limit,
                backlog_timeout: plan.cfg.backlog_timeout.0,
                on_reject: Some(on_reject),
                on_reject_in_dry_run: Some(on_reject_in_dry_run),
                on_error: self.opts.in_flight_limit_on_error.clone(),
            },
        )
    }

    /// Ordered gates for a normalised method path: every matching rule's rate
    /// zones first, then the in-flight zones, in configuration order.
    fn gates_for(&self, path: &str) -> Arc<Vec<Gate>> {
        if let Some(gates) = self.method_gates.get(path) {
            return gates.value().clone();
        }
        let zones = self.zone_set();
        let method = path.rsplit('/').next().unwrap_or_default();

        let mut rate_gates = Vec::new();
        let mut in_flight_gates = Vec::new();
        for rule in &self.rules {
            if !rule.routes.iter().any(|route| route.matches(path, method)) {
                continue;
            }
            for name in &rule.rate_zones {
                rate_gates.push(Gate::Rate(zones.rate[name].clone()));
            }
            for name in &rule.in_flight_zones {
                in_flight_gates.push(Gate::InFlight(zones.in_flight[name].clone()));
            }
        }
        rate_gates.extend(in_flight_gates);

        self.method_gates
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(rate_gates))
            .value()
            .clone()
    }
}

#[async_trait::async_trait]
impl Interceptor for ThrottleInterceptor {
    async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status> {
        let path = normalize_path(&call.info.full_method);
        let gates = self.gates_for(&path);
        if gates.is_empty() {
            return next.run(call).await;
        }
        run_gates(
            gates.as_slice(),
            call,
            Box::new(move |call| Box::pin(next.run(call))),
        )
        .await
    }
}

fn run_gates<'c>(
    gates: &'c [Gate],
    call: &'c mut Call,
    tail: CallNext<'c>,
) -> BoxFuture<'c, Result<(), Status>> {
    Box::pin(async move {
        match gates.split_first() {
            None => tail(call).await,
            Some((gate, rest)) => {
                let cont: CallNext<'c> = Box::new(move |call| run_gates(rest, call, tail));
                match gate {
                    Gate::Rate(handler) => handler.handle(call, cont).await,
                    Gate::InFlight(handler) => handler.handle(call, cont).await,
                }
            }
        }
    })
}

/// Applies the four-case tag precedence to every zone reference of a rule.
fn select_zones(
    filter_tags: &StringList,
    rule_tags: &StringList,
    refs: &[ZoneRef],
    zone_default_tags: impl Fn(&str) -> StringList,
) -> Vec<String> {
    refs.iter()
        .filter(|zone_ref| {
            let zone_tags = if zone_ref.tags.is_empty() {
                zone_default_tags(&zone_ref.zone)
            } else {
                zone_ref.tags.clone()
            };
            zone_applies(filter_tags, rule_tags, &zone_tags)
        })
        .map(|zone_ref| zone_ref.zone.clone())
        .collect()
}

fn zone_applies(filter_tags: &StringList, rule_tags: &StringList, zone_tags: &StringList) -> bool {
    if filter_tags.is_empty() {
        return rule_tags.is_empty() && zone_tags.is_empty();
    }
    if !rule_tags.is_empty() && filter_tags.intersects(rule_tags) {
        return true;
    }
    !zone_tags.is_empty() && filter_tags.intersects(zone_tags)
}

fn build_extractor(
    key: &Option<KeyConfig>,
    excluded_keys: &[String],
    included_keys: &[String],
    opts: &ThrottleOptions,
) -> Result<Option<KeyExtractor>, ConfigError> {
    let Some(key_cfg) = key else {
        return Ok(None);
    };
    let base = match key_cfg.key_type {
        KeyType::Fixed => key::fixed(),
        KeyType::Header => {
            let header_name =
                key_cfg
                    .header_name
                    .clone()
                    .ok_or_else(|| ConfigError::MissingHeaderName {
                        key_type: "header".to_string(),
                    })?;
            key::by_header(header_name, key_cfg.no_bypass_empty)
        }
        KeyType::RemoteAddr => key::by_remote_addr(),
        KeyType::Identity => {
            let identity = opts
                .get_key_identity
                .clone()
                .ok_or(ConfigError::MissingIdentityExtractor)?;
            bypass_empty(identity, key_cfg.no_bypass_empty)
        }
        KeyType::Custom => opts
            .get_key_custom
            .clone()
            .ok_or(ConfigError::MissingCustomExtractor)?,
    };
    Ok(Some(key::with_key_filters(
        base,
        excluded_keys.to_vec(),
        included_keys.to_vec(),
    )))
}

/// Applies the `no_bypass_empty` contract on top of a user extractor.
fn bypass_empty(extractor: KeyExtractor, no_bypass_empty: bool) -> KeyExtractor {
    if no_bypass_empty {
        return extractor;
    }
    Arc::new(move |call: &Call| {
        let extraction = extractor(call)?;
        if !extraction.bypass && extraction.key.is_empty() {
            return Ok(KeyExtraction::bypass());
        }
        Ok(extraction)
    })
}
