//! URL → bucket classification.
//!
//! Rules are regular expressions evaluated against the URL path in priority
//! order; the first match wins and unmatched URLs go to the default bucket.
//! Results are memoized in a bounded moka cache keyed on the path, since the
//! same handful of asset and API paths dominate real traffic.

use regex::Regex;

use super::config::{EdgeConfig, ReplayRoute, RouteRule};
use crate::{HuginnError, Result};

/// Base used to resolve relative URLs (`/api/x`) for path extraction.
const RELATIVE_BASE: &str = "http://localhost";

/// Priority-ordered request classifier.
pub struct Router {
    rules: Vec<(Regex, String)>,
    replay: Vec<(Regex, String)>,
    default_bucket: String,
    api_prefix: String,
    memo: moka::sync::Cache<String, String>,
}

impl Router {
    /// Compile the rules of `config`.
    pub fn new(config: &EdgeConfig) -> Result<Self> {
        Ok(Self {
            rules: compile(
                config
                    .routes
                    .iter()
                    .map(|RouteRule { pattern, bucket }| (pattern, bucket)),
            )?,
            replay: compile(
                config
                    .replay_routes
                    .iter()
                    .map(|ReplayRoute { pattern, tag }| (pattern, tag)),
            )?,
            default_bucket: config.default_bucket.clone(),
            api_prefix: config.api_prefix.clone(),
            memo: moka::sync::Cache::new(config.classification_cache_size),
        })
    }

    /// Bucket name for `url`.
    pub fn classify(&self, url: &str) -> String {
        let path = url_path(url);
        if let Some(bucket) = self.memo.get(&path) {
            return bucket;
        }
        let bucket = self
            .rules
            .iter()
            .find(|(re, _)| re.is_match(&path))
            .map(|(_, bucket)| bucket.clone())
            .unwrap_or_else(|| self.default_bucket.clone());
        self.memo.insert(path, bucket.clone());
        bucket
    }

    /// Replay tag for a mutating request to `url`, if one is configured.
    pub fn replay_tag(&self, url: &str) -> Option<&str> {
        let path = url_path(url);
        self.replay
            .iter()
            .find(|(re, _)| re.is_match(&path))
            .map(|(_, tag)| tag.as_str())
    }

    /// Whether `url` addresses the API.
    pub fn is_api(&self, url: &str) -> bool {
        url_path(url).starts_with(&self.api_prefix)
    }
}

fn compile<'a>(
    rules: impl Iterator<Item = (&'a String, &'a String)>,
) -> Result<Vec<(Regex, String)>> {
    rules
        .map(|(pattern, target)| {
            Regex::new(pattern)
                .map(|re| (re, target.clone()))
                .map_err(|e| {
                    HuginnError::Configuration(format!("invalid route pattern '{pattern}': {e}"))
                })
        })
        .collect()
}

/// Path component of an absolute or relative URL.
pub(crate) fn url_path(url: &str) -> String {
    let parsed = match url::Url::parse(url) {
        Ok(u) => Ok(u),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            url::Url::parse(RELATIVE_BASE).and_then(|base| base.join(url))
        }
        Err(e) => Err(e),
    };
    match parsed {
        Ok(u) => u.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or(url).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(&EdgeConfig::default()).unwrap()
    }

    #[test]
    fn classifies_default_groups() {
        let r = router();
        assert_eq!(r.classify("/api/dashboard/stats"), "api");
        assert_eq!(r.classify("https://app.example.org/api/users?page=2"), "api");
        assert_eq!(r.classify("/assets/logo.PNG"), "images");
        assert_eq!(r.classify("/fonts/inter.woff2"), "fonts");
        assert_eq!(r.classify("/files/report.pdf"), "documents");
        assert_eq!(r.classify("/locales/fr/common.json"), "i18n");
        assert_eq!(r.classify("/static/app.js"), "static");
        assert_eq!(r.classify("/"), "static");
    }

    #[test]
    fn unmatched_goes_to_default_bucket() {
        assert_eq!(router().classify("/beneficiaries/42"), "runtime");
    }

    #[test]
    fn first_matching_rule_wins() {
        let config = EdgeConfig::default().route(r"^/api/reports/", "documents");
        let r = Router::new(&config).unwrap();
        assert_eq!(r.classify("/api/reports/annual"), "documents");
        assert_eq!(r.classify("/api/other"), "api");
    }

    #[test]
    fn memoized_result_is_stable() {
        let r = router();
        assert_eq!(r.classify("/api/a"), "api");
        assert_eq!(r.classify("/api/a"), "api");
    }

    #[test]
    fn replay_tags() {
        let r = router();
        assert_eq!(r.replay_tag("/api/evaluations/7"), Some("evaluation-sync"));
        assert_eq!(r.replay_tag("/api/unknown"), None);
    }

    #[test]
    fn invalid_pattern_is_configuration_error() {
        let config = EdgeConfig::default().route("(", "api");
        assert!(matches!(
            Router::new(&config),
            Err(HuginnError::Configuration(_))
        ));
    }

    #[test]
    fn path_extraction_drops_query() {
        assert_eq!(url_path("/api/x?y=1"), "/api/x");
        assert_eq!(url_path("http://h/a/b#frag"), "/a/b");
    }
}
