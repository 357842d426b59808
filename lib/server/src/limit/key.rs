//! Partitioning keys for the limiting engines.
//!
//! A key extractor derives the partition key from the call. An empty key may
//! either bypass limiting or participate as the "" key, depending on the
//! extractor's `no_bypass_empty` flag.

use std::sync::Arc;

use crate::interceptor::Call;

/// Result of key extraction: the key itself, or a bypass marker meaning the
/// call is not limited at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExtraction {
    pub key: String,
    pub bypass: bool,
}

impl KeyExtraction {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            bypass: false,
        }
    }

    pub fn bypass() -> Self {
        Self {
            key: String::new(),
            bypass: true,
        }
    }
}

pub type KeyExtractor = Arc<dyn Fn(&Call) -> anyhow::Result<KeyExtraction> + Send + Sync>;

/// Keys calls by the first value of a metadata header.
pub fn by_header(header_name: impl Into<String>, no_bypass_empty: bool) -> KeyExtractor {
    let header_name = header_name.into();
    Arc::new(move |call: &Call| {
        let value = call.info.header(&header_name).unwrap_or_default();
        if value.is_empty() && !no_bypass_empty {
            return Ok(KeyExtraction::bypass());
        }
        Ok(KeyExtraction::key(value))
    })
}

/// Keys calls by the remote peer IP; calls without peer info are bypassed.
pub fn by_remote_addr() -> KeyExtractor {
    Arc::new(|call: &Call| match call.info.remote_addr {
        Some(addr) => Ok(KeyExtraction::key(addr.ip().to_string())),
        None => Ok(KeyExtraction::bypass()),
    })
}

/// Keys every call with the same fixed (empty) key, forcing a single shared
/// limiter state even when a key extractor is required by the configuration.
pub fn fixed() -> KeyExtractor {
    Arc::new(|_call: &Call| Ok(KeyExtraction::key("")))
}

/// Whether `key` matches any of the patterns. A trailing `*` makes a pattern
/// a prefix match; otherwise the comparison is exact.
pub fn key_matches(patterns: &[String], key: &str) -> bool {
    patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    })
}

/// Wraps an extractor with excluded/included key lists: excluded keys are
/// never limited; when the included list is non-empty, only those keys are.
pub fn with_key_filters(
    extractor: KeyExtractor,
    excluded_keys: Vec<String>,
    included_keys: Vec<String>,
) -> KeyExtractor {
    if excluded_keys.is_empty() && included_keys.is_empty() {
        return extractor;
    }
    Arc::new(move |call: &Call| {
        let extraction = extractor(call)?;
        if extraction.bypass {
            return Ok(extraction);
        }
        if key_matches(&excluded_keys, &extraction.key) {
            return Ok(KeyExtraction::bypass());
        }
        if !included_keys.is_empty() && !key_matches(&included_keys, &extraction.key) {
            return Ok(KeyExtraction::bypass());
        }
        Ok(extraction)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{CallInfo, CallKind};
    use tonic::metadata::MetadataValue;

    fn call_with_header(name: &'static str, value: &'static str) -> Call {
        let mut info = CallInfo::new("/test.Service/Do", CallKind::Unary);
        info.metadata.insert(name, MetadataValue::from_static(value));
        Call::new(info)
    }

    #[test]
    fn header_key_with_bypass_semantics() {
        let extractor = by_header("x-client-id", false);
        let call = call_with_header("x-client-id", "client-1");
        assert_eq!(extractor(&call).unwrap(), KeyExtraction::key("client-1"));

        let empty = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        assert_eq!(extractor(&empty).unwrap(), KeyExtraction::bypass());

        let strict = by_header("x-client-id", true);
        assert_eq!(strict(&empty).unwrap(), KeyExtraction::key(""));
    }

    #[test]
    fn remote_addr_key() {
        let mut info = CallInfo::new("/test.Service/Do", CallKind::Unary);
        info.remote_addr = Some("10.0.0.7:54321".parse().unwrap());
        let call = Call::new(info);
        assert_eq!(by_remote_addr()(&call).unwrap(), KeyExtraction::key("10.0.0.7"));

        let no_peer = Call::new(CallInfo::new("/test.Service/Do", CallKind::Unary));
        assert_eq!(by_remote_addr()(&no_peer).unwrap(), KeyExtraction::bypass());
    }

    #[test]
    fn glob_patterns() {
        let patterns = vec!["good-client1".to_string(), "very-good-client*".to_string()];
        assert!(key_matches(&patterns, "good-client1"));
        assert!(key_matches(&patterns, "very-good-client777"));
        assert!(!key_matches(&patterns, "good-client2"));
        assert!(!key_matches(&patterns, "very-good"));
    }

    #[test]
    fn filters_exclude_and_include() {
        let base = by_header("x-client-id", true);
        let filtered = with_key_filters(
            base,
            vec!["trusted*".to_string()],
            vec!["bad-1".to_string(), "bad-2".to_string()],
        );

        let excluded = call_with_header("x-client-id", "trusted-7");
        assert!(filtered(&excluded).unwrap().bypass);

        let included = call_with_header("x-client-id", "bad-1");
        assert_eq!(filtered(&included).unwrap(), KeyExtraction::key("bad-1"));

        let other = call_with_header("x-client-id", "neutral");
        assert!(filtered(&other).unwrap().bypass);
    }
}
