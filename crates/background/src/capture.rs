//! Passive capture of signed resource URLs.
//!
//! The layer never constructs these URLs. It only remembers ones observed
//! passing through normal page traffic, keyed by the tab and the logical
//! resource they belong to.

use reqwest::Url;
use resilink_config::CaptureRuleConfig;
use resilink_core::context::TabId;
use tracing::trace;

/// A request that matched a capture rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub tab: TabId,
    pub resource_id: String,
    pub url: String,
}

/// Host/path/parameter rules deciding which requests are worth remembering.
#[derive(Debug, Clone)]
pub struct CaptureRules {
    rules: Vec<CaptureRuleConfig>,
}

impl CaptureRules {
    pub fn new(rules: Vec<CaptureRuleConfig>) -> Self {
        Self { rules }
    }

    /// Match an observed request against the rules.
    ///
    /// Negative tab ids (extension or background requests), unparsable URLs,
    /// non-matching host or path, and requests lacking the id parameter are
    /// ignored.
    pub fn observe(&self, tab_id: i64, url: &str) -> Option<Captured> {
        let tab = TabId::from_raw(tab_id)?;
        let parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?;

        let rule = self
            .rules
            .iter()
            .find(|r| r.host == host && r.path == parsed.path())?;

        let resource_id = query_param(&parsed, &rule.id_param).filter(|v| !v.is_empty())?;

        trace!(tab_id = %tab, resource_id = %resource_id, "Captured resource URL");
        Some(Captured {
            tab,
            resource_id,
            url: parsed.to_string(),
        })
    }

    /// Whether the background may fetch `url` on a page's behalf: the path
    /// must equal a rule's path and the host must be that rule's domain or
    /// a subdomain of it (`www.` is dropped from the rule host).
    pub fn allows(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        self.rules.iter().any(|rule| {
            let rule_host = rule.host.to_ascii_lowercase();
            let domain = rule_host.strip_prefix("www.").unwrap_or(&rule_host);
            let host_ok = host == domain
                || host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'));
            host_ok && url.path() == rule.path
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// The `lang` and `caps` query parameters of a captured URL, when present.
pub fn resource_params(url: &str) -> (Option<String>, Option<String>) {
    match Url::parse(url) {
        Ok(parsed) => (query_param(&parsed, "lang"), query_param(&parsed, "caps")),
        Err(_) => (None, None),
    }
}

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}
