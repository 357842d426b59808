//! Route compilation and matching.
//!
//! Paths are normalised (empty, `.` and `..` segments folded) before any
//! comparison. A pattern starting with `= ` requires an exact match; anything
//! else matches by whole-segment prefix. A non-empty method set additionally
//! restricts the route to the listed RPC method names.

use super::config::RouteConfig;

/// Folds `.` and `..` segments and collapses duplicate slashes.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut normalized = String::with_capacity(path.len());
    normalized.push('/');
    normalized.push_str(&segments.join("/"));
    normalized
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledRoute {
    pattern: String,
    exact: bool,
    methods: Vec<String>,
}

impl CompiledRoute {
    pub(crate) fn compile(cfg: &RouteConfig) -> Self {
        let (exact, raw) = match cfg.path.strip_prefix("= ") {
            Some(rest) => (true, rest),
            None => (false, cfg.path.as_str()),
        };
        Self {
            pattern: normalize_path(raw),
            exact,
            methods: cfg.methods.0.clone(),
        }
    }

    /// `path` must already be normalised; `method` is the RPC method name.
    pub(crate) fn matches(&self, path: &str, method: &str) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == method) {
            return false;
        }
        if self.exact {
            return path == self.pattern;
        }
        if self.pattern == "/" {
            return true;
        }
        path == self.pattern
            || (path.len() > self.pattern.len()
                && path.starts_with(&self.pattern)
                && path.as_bytes()[self.pattern.len()] == b'/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::config::StringList;

    fn route(path: &str, methods: &[&str]) -> CompiledRoute {
        CompiledRoute::compile(&RouteConfig {
            path: path.to_string(),
            methods: StringList(methods.iter().map(|m| m.to_string()).collect()),
        })
    }

    #[test]
    fn normalizes_dots_and_slashes() {
        assert_eq!(normalize_path("/aaa/./../aaa/b"), "/aaa/b");
        assert_eq!(normalize_path("/bbb/."), "/bbb");
        assert_eq!(normalize_path("/bbb/cc/.."), "/bbb");
        assert_eq!(normalize_path("/bbb/cc/../cc/.."), "/bbb");
        assert_eq!(normalize_path("/bbb/cc/../././."), "/bbb");
        assert_eq!(normalize_path("//x///y"), "/x/y");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/.."), "/");
    }

    #[test]
    fn prefix_matching_respects_segment_boundaries() {
        let r = route("/acme.Files", &[]);
        assert!(r.matches("/acme.Files", "any"));
        assert!(r.matches("/acme.Files/Upload", "Upload"));
        assert!(r.matches("/acme.Files/a/b", "b"));
        assert!(!r.matches("/acme.FilesV2/Upload", "Upload"));
        assert!(!r.matches("/other", "other"));
    }

    #[test]
    fn exact_matching() {
        let r = route("= /acme.Files/Upload", &[]);
        assert!(r.matches("/acme.Files/Upload", "Upload"));
        assert!(!r.matches("/acme.Files/Upload/x", "x"));
        assert!(!r.matches("/acme.Files", "acme.Files"));
    }

    #[test]
    fn method_set_restricts_matches() {
        let r = route("/acme.Files", &["Upload", "Delete"]);
        assert!(r.matches("/acme.Files/Upload", "Upload"));
        assert!(r.matches("/acme.Files/Delete", "Delete"));
        assert!(!r.matches("/acme.Files/Download", "Download"));
    }

    #[test]
    fn root_pattern_matches_everything_as_prefix() {
        let r = route("/", &[]);
        assert!(r.matches("/anything/at/all", "all"));
        let exact_root = route("= /", &[]);
        assert!(exact_root.matches("/", ""));
        assert!(!exact_root.matches("/x", "x"));
    }
}
