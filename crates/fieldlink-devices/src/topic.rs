//! MQTT topic patterns and the device topic naming convention.
//!
//! Devices listen on `cmd/{device_id}`, answer on `resp/{device_id}` and
//! announce themselves on `register`. Prefixes come from [`TopicSettings`].

use fieldlink_core::config::TopicSettings;

use crate::error::{GatewayError, Result};

/// Whether `topic` is matched by `pattern`.
///
/// Levels are compared in lock-step: `#` matches everything that remains
/// (including nothing), `+` matches exactly one level, anything else must be
/// equal. Both sides must be fully consumed unless a `#` ended the walk.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some(_), None) => return false,
            (Some("+"), Some(_)) => continue,
            (Some(expected), Some(actual)) => {
                if expected != actual {
                    return false;
                }
            }
            (None, None) => return true,
            (None, Some(_)) => return false,
        }
    }
}

/// Whether the pattern contains `+` or `#`.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.split('/').any(|level| level == "+" || level == "#")
}

/// Reject patterns a broker would refuse.
///
/// `#` must be the last level and wildcards must occupy a whole level.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(GatewayError::InvalidPattern("empty pattern".to_string()));
    }

    let levels: Vec<&str> = pattern.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        let has_wildcard = level.contains('+') || level.contains('#');
        if has_wildcard && level.len() > 1 {
            return Err(GatewayError::InvalidPattern(format!(
                "wildcard must occupy a whole level: {}",
                pattern
            )));
        }
        if *level == "#" && i + 1 != levels.len() {
            return Err(GatewayError::InvalidPattern(format!(
                "'#' must be the last level: {}",
                pattern
            )));
        }
    }
    Ok(())
}

/// Ordering key for wildcard patterns, most specific first.
///
/// More literal levels win; at equal literal count a pattern without `#`
/// beats one with it, then fewer `+` levels win.
pub(crate) fn specificity(pattern: &str) -> (usize, bool, usize) {
    let mut literals = 0;
    let mut singles = 0;
    let mut multi = false;
    for level in pattern.split('/') {
        match level {
            "+" => singles += 1,
            "#" => multi = true,
            _ => literals += 1,
        }
    }
    (literals, !multi, usize::MAX - singles)
}

/// Topic a device receives commands on.
pub fn command_topic(topics: &TopicSettings, device_id: &str) -> String {
    format!("{}/{}", topics.command_prefix, device_id)
}

/// Topic a device publishes responses on.
pub fn response_topic(topics: &TopicSettings, device_id: &str) -> String {
    format!("{}/{}", topics.response_prefix, device_id)
}

/// Wildcard covering every device's response topic.
pub fn response_wildcard(topics: &TopicSettings) -> String {
    format!("{}/+", topics.response_prefix)
}

/// Extract the device id from a `resp/{device_id}` topic.
pub fn device_id_from_response_topic<'a>(topics: &TopicSettings, topic: &'a str) -> Option<&'a str> {
    topic
        .strip_prefix(topics.response_prefix.as_str())
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|id| !id.is_empty() && !id.contains('/'))
}
