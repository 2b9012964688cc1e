//! Topic names and filters
//!
//! Validation and matching rules for MQTT topics, plus composition of
//! shared-subscription filters (`$share/{group}/{filter}`).

pub mod validation;

pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

/// Parse a shared subscription filter
/// Returns (share_group, actual_filter) if it's a shared subscription, or None
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let (group, actual_filter) = rest.split_once('/')?;
    if group.is_empty() || actual_filter.is_empty() {
        return None;
    }
    Some((group, actual_filter))
}

/// Build the filter to subscribe with, optionally as a member of a share group
///
/// Several relays subscribed under the same group split the upstream
/// traffic between them instead of each receiving every message.
pub fn subscription_filter(filter: &str, share_group: Option<&str>) -> String {
    match share_group {
        Some(group) if !group.is_empty() => format!("$share/{}/{}", group, filter),
        _ => filter.to_string(),
    }
}
