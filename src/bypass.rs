//! Collaborator bypass list.
//!
//! Targets whose hostname matches a listed domain (exactly, or as a
//! subdomain) are contacted directly instead of through the pool, so that
//! out-of-band interaction payloads keep the source address the tester
//! expects.

use serde::{Deserialize, Serialize};

/// Domains bypassed by default.
pub const DEFAULT_BYPASS_DOMAINS: &[&str] = &["burpcollaborator.net", "oastify.com"];

/// The bypass domain list with its enable flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BypassList {
    pub enabled: bool,
    pub domains: Vec<String>,
}

impl Default for BypassList {
    fn default() -> Self {
        BypassList {
            enabled: true,
            domains: DEFAULT_BYPASS_DOMAINS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl BypassList {
    pub fn new(enabled: bool, domains: Vec<String>) -> Self {
        BypassList { enabled, domains }
    }

    /// True when `host` should skip the pool: the list is enabled and the
    /// host equals a listed domain or ends with `"." + domain`.
    pub fn matches(&self, host: &str) -> bool {
        if !self.enabled || host.is_empty() {
            return false;
        }
        let host = host.to_ascii_lowercase();
        self.domains.iter().any(|d| {
            let d = d.to_ascii_lowercase();
            host == d || host.ends_with(&format!(".{}", d))
        })
    }

    /// Add a domain if not already listed.
    pub fn add(&mut self, domain: &str) -> bool {
        if self.domains.iter().any(|d| d == domain) {
            return false;
        }
        self.domains.push(domain.to_string());
        true
    }

    /// Remove a domain. Returns whether it was present.
    pub fn remove(&mut self, domain: &str) -> bool {
        let before = self.domains.len();
        self.domains.retain(|d| d != domain);
        self.domains.len() != before
    }

    pub fn clear(&mut self) {
        self.domains.clear();
    }
}
