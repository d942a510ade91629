//! Hostname handling for machine targets: FQDN validation and numeric-range
//! host pattern expansion.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::{PlanError, Result};

const MAX_FQDN_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;

/// A validated fully-qualified domain name.
///
/// Validation follows the usual length/label predicate: at most 255 chars
/// overall, dot-separated labels of 1-63 alphanumeric-or-hyphen characters
/// that neither start nor end with a hyphen. A single trailing dot is
/// accepted and stripped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Fqdn(String);

impl Fqdn {
    /// Validate `hostname` and wrap it.
    pub fn new(hostname: &str) -> Result<Self> {
        if hostname.is_empty() || hostname.len() > MAX_FQDN_LEN {
            return Err(PlanError::InvalidFqdn(hostname.to_string()));
        }
        let stripped = hostname.strip_suffix('.').unwrap_or(hostname);
        let valid = !stripped.is_empty()
            && stripped.split('.').all(|label| {
                !label.is_empty()
                    && label.len() <= MAX_LABEL_LEN
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
        if valid {
            Ok(Self(stripped.to_string()))
        } else {
            Err(PlanError::InvalidFqdn(hostname.to_string()))
        }
    }

    /// The hostname as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fqdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fqdn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for Fqdn {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Fqdn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(&raw).map_err(serde::de::Error::custom)
    }
}

static RANGE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+)-(\d+)\]").expect("static pattern compiles"));

/// Expand a host pattern with a single numeric range into hostnames.
///
/// `h[00-02].x` expands to `h00.x`, `h01.x`, `h02.x`; the zero-padding width
/// follows the range-start width. A pattern without a range must itself be a
/// valid FQDN and expands to itself.
pub fn expand_host_pattern(pattern: &str) -> Result<Vec<Fqdn>> {
    let Some(captures) = RANGE_PATTERN.captures(pattern) else {
        return Ok(vec![Fqdn::new(pattern)?]);
    };

    let range = captures.get(0).expect("whole match");
    let start_text = &captures[1];
    let start: u64 = start_text
        .parse()
        .map_err(|_| PlanError::InvalidHostPattern(pattern.to_string()))?;
    let end: u64 = captures[2]
        .parse()
        .map_err(|_| PlanError::InvalidHostPattern(pattern.to_string()))?;
    if end < start {
        return Err(PlanError::InvalidHostPattern(pattern.to_string()));
    }

    let width = start_text.len();
    let mut expanded = Vec::with_capacity((end - start + 1) as usize);
    for number in start..=end {
        let hostname = format!(
            "{}{number:0width$}{}",
            &pattern[..range.start()],
            &pattern[range.end()..],
        );
        expanded.push(Fqdn::new(&hostname)?);
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_fqdns() {
        for hostname in ["myhost01.yahoo.com", "h1.x", "localhost", "a.b-c.d."] {
            assert!(Fqdn::new(hostname).is_ok(), "{hostname} should validate");
        }
    }

    #[test]
    fn rejects_malformed_hostnames() {
        let too_long = format!("{}.com", "a".repeat(MAX_FQDN_LEN));
        for hostname in ["-leading.dash", "trailing-.dash", "sp ace.com", "", too_long.as_str()] {
            assert!(Fqdn::new(hostname).is_err(), "{hostname:?} should be rejected");
        }
    }

    #[test]
    fn pattern_expands_with_range_start_width() {
        let hosts = expand_host_pattern("h[00-02].x").expect("expand");
        let names: Vec<&str> = hosts.iter().map(Fqdn::as_str).collect();
        assert_eq!(names, vec!["h00.x", "h01.x", "h02.x"]);
    }

    #[test]
    fn pattern_without_padding_keeps_plain_numbers() {
        let hosts = expand_host_pattern("web[9-11].example.com").expect("expand");
        let names: Vec<&str> = hosts.iter().map(Fqdn::as_str).collect();
        assert_eq!(names, vec!["web9.example.com", "web10.example.com", "web11.example.com"]);
    }

    #[test]
    fn rangeless_pattern_is_a_single_hostname() {
        let hosts = expand_host_pattern("solo.example.com").expect("expand");
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(expand_host_pattern("h[05-01].x").is_err());
    }
}
