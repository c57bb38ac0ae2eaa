//! Topic pattern matching.
//!
//! Topics are dot-separated segments. A subscription pattern may use `*` in
//! place of any segment to match exactly one segment of a published topic.

use crate::error::BusError;

/// Whether a published `topic` matches a subscription `pattern`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('.');
    let mut t = topic.split('.');
    loop {
        match (p.next(), t.next()) {
            (None, None) => return true,
            (Some(ps), Some(ts)) if ps == "*" || ps == ts => continue,
            _ => return false,
        }
    }
}

/// Reject empty topics and empty segments.
pub fn validate_pattern(pattern: &str) -> Result<(), BusError> {
    if pattern.is_empty() || pattern.split('.').any(|s| s.is_empty()) {
        return Err(BusError::InvalidTopic(pattern.to_string()));
    }
    Ok(())
}

/// Concrete topics must not contain wildcards.
pub fn validate_topic(topic: &str) -> Result<(), BusError> {
    validate_pattern(topic)?;
    if topic.split('.').any(|s| s == "*") {
        return Err(BusError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// One segment of a topic: non-empty, with no separator, wildcard or
/// whitespace.
pub fn validate_segment(segment: &str) -> Result<(), BusError> {
    if segment.is_empty()
        || segment
            .chars()
            .any(|c| c == '.' || c == '*' || c.is_whitespace())
    {
        return Err(BusError::InvalidTopic(segment.to_string()));
    }
    Ok(())
}
