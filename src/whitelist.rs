//! Agent allow-listing over discovery-profile hosts.
//!
//! Agents identify themselves with a `UCP-Agent` header carrying a
//! `profile="<url>"` attribute. When enforcement is on, the profile URL's
//! host must match one of the configured patterns before any session
//! operation runs.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static PROFILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"profile="([^"]+)""#).expect("profile regex is valid"));

/// Agents allowed when no explicit whitelist is configured.
pub const DEFAULT_PATTERNS: [&str; 4] =
    ["api.openai.com", "google.com", "*.google.com", "anthropic.com"];

/// Extracts the `profile="<url>"` attribute from a `UCP-Agent` header.
pub fn profile_url_from_header(header: &str) -> Option<&str> {
    PROFILE_RE.captures(header).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Decides whether the agent behind `agent_header` may use the protocol.
/// Deny on any missing piece: no header, no profile attribute, unparseable
/// URL, or no matching pattern.
pub fn is_whitelisted(agent_header: Option<&str>, patterns: &[String]) -> bool {
    let header = match agent_header {
        Some(h) if !h.is_empty() => h,
        _ => return false,
    };

    let Some(profile_url) = profile_url_from_header(header) else {
        return false;
    };

    let Ok(url) = Url::parse(profile_url) else {
        return false;
    };

    let Some(host) = url.host_str() else {
        return false;
    };

    let defaults: Vec<String>;
    let patterns: &[String] = if patterns.is_empty() {
        defaults = DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect();
        &defaults
    } else {
        patterns
    };

    patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .any(|pattern| host_matches(host, pattern))
}

/// A `*.domain` pattern matches the bare domain and any subdomain, with a
/// proper label boundary: `shop.google.com` matches `*.google.com` but
/// `evilgoogle.com` does not.
fn host_matches(host: &str, pattern: &str) -> bool {
    if let Some(domain) = pattern.strip_prefix("*.") {
        host == domain
            || host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.ends_with('.'))
    } else {
        host == pattern
    }
}
