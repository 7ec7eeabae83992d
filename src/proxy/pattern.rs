//! Host pattern matching for domains.
//!
//! | Pattern   | Matches                          |
//! |-----------|----------------------------------|
//! | `*`       | everything                       |
//! | `*x*`     | values containing `x`            |
//! | `*x`      | values ending with `x`           |
//! | `x*`      | values starting with `x`         |
//! | `/re/`    | values matching the regex `re`   |
//! | otherwise | the exact value                  |
//!
//! Runs of asterisks collapse to one before matching.

use regex::Regex;

use crate::errors::{GatewayError, Result};

pub fn pattern_match(value: &str, pattern: &str) -> Result<bool> {
    if pattern.is_empty() {
        return Err(GatewayError::validation_field("empty pattern", "patterns"));
    }
    let pattern = collapse_asterisks(pattern);
    if pattern == "*" {
        return Ok(true);
    }

    let prefix = pattern.starts_with('*');
    let suffix = pattern.ends_with('*');
    let matched = match (prefix, suffix) {
        (true, true) => value.contains(&pattern[1..pattern.len() - 1]),
        (true, false) => value.ends_with(&pattern[1..]),
        (false, true) => value.starts_with(&pattern[..pattern.len() - 1]),
        (false, false) if pattern.len() > 1 && pattern.starts_with('/') && pattern.ends_with('/') => {
            let re = Regex::new(&pattern[1..pattern.len() - 1]).map_err(|e| {
                GatewayError::validation_field(format!("invalid pattern {}: {}", pattern, e), "patterns")
            })?;
            re.is_match(value)
        }
        (false, false) => pattern == value,
    };
    Ok(matched)
}

/// Returns the first pattern matching `value`.
pub fn match_any<'a>(value: &str, patterns: &'a [String]) -> Result<Option<&'a str>> {
    for pattern in patterns {
        if pattern_match(value, pattern)? {
            return Ok(Some(pattern));
        }
    }
    Ok(None)
}

pub fn match_all(value: &str, patterns: &[String]) -> Result<bool> {
    for pattern in patterns {
        if !pattern_match(value, pattern)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn collapse_asterisks(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c == '*' && out.ends_with('*') {
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_wildcards() {
        assert!(pattern_match("example.com", "*").unwrap());
        assert!(pattern_match("example.com", "**").unwrap());
        assert!(pattern_match("api.example.com", "*.example.com").unwrap());
        assert!(!pattern_match("example.org", "*.example.com").unwrap());
        assert!(pattern_match("api.example.com", "api.*").unwrap());
        assert!(pattern_match("my-api.example.com", "*api*").unwrap());
        assert!(pattern_match("my-api.example.com", "***api**").unwrap());
        assert!(!pattern_match("example.com", "*api*").unwrap());
    }

    #[test]
    fn test_exact_and_regex() {
        assert!(pattern_match("example.com", "example.com").unwrap());
        assert!(!pattern_match("www.example.com", "example.com").unwrap());
        assert!(pattern_match("v2.example.com", r"/^v\d+\.example\.com$/").unwrap());
        assert!(!pattern_match("vx.example.com", r"/^v\d+\.example\.com$/").unwrap());
        assert!(pattern_match("x", "/[/").is_err());
    }

    #[test]
    fn test_empty_pattern_is_error() {
        assert!(pattern_match("example.com", "").is_err());
        assert!(match_any("example.com", &patterns(&["nope", ""])).is_err());
    }

    #[test]
    fn test_match_any_returns_first() {
        let list = patterns(&["*.org", "*.com", "example.*"]);
        assert_eq!(match_any("example.com", &list).unwrap(), Some("*.com"));
        assert_eq!(match_any("example.net", &list).unwrap(), Some("example.*"));
        assert_eq!(match_any("other.net", &list).unwrap(), None);
    }

    #[test]
    fn test_match_all() {
        assert!(match_all("api.example.com", &patterns(&["api.*", "*.com"])).unwrap());
        assert!(!match_all("api.example.org", &patterns(&["api.*", "*.com"])).unwrap());
        assert!(match_all("anything", &[]).unwrap());
    }

    proptest! {
        #[test]
        fn prop_star_matches_everything(value in ".*") {
            prop_assert!(pattern_match(&value, "*").unwrap());
        }

        #[test]
        fn prop_prefix_pattern_matches_extensions(prefix in "[a-z.]{1,12}", rest in "[a-z.]{0,12}") {
            let value = format!("{}{}", prefix, rest);
            let pattern = format!("{}*", prefix);
            prop_assert!(pattern_match(&value, &pattern).unwrap());
        }
    }
}
