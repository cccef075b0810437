//! Validation for topic and subscription IDs.

use crate::error::ValidationError;
use crate::Result;

const MIN_ID_LEN: usize = 3;
const MAX_ID_LEN: usize = 255;

/// Pub/Sub topic ID validation (3-255 chars, must start with letter).
pub fn validate_topic_id(topic_id: &str) -> Result<()> {
    check_resource_id(topic_id, "Topic").map_err(|reason| ValidationError::InvalidTopicId(reason).into())
}

/// Pub/Sub subscription ID validation (3-255 chars, must start with letter).
pub fn validate_subscription_id(subscription_id: &str) -> Result<()> {
    check_resource_id(subscription_id, "Subscription")
        .map_err(|reason| ValidationError::InvalidSubscriptionId(reason).into())
}

/// Shared rules: length, leading letter, no `goog` prefix, restricted charset.
fn check_resource_id(id: &str, kind: &str) -> std::result::Result<(), String> {
    if id.len() < MIN_ID_LEN || id.len() > MAX_ID_LEN {
        return Err(format!(
            "{} ID must be {}-{} characters, got {}",
            kind,
            MIN_ID_LEN,
            MAX_ID_LEN,
            id.len()
        ));
    }

    if let Some(first) = id.chars().next() {
        if !first.is_ascii_alphabetic() {
            return Err(format!("{} ID must start with a letter", kind));
        }
    }

    if id.to_ascii_lowercase().starts_with("goog") {
        return Err(format!("{} ID must not start with \"goog\"", kind));
    }

    for ch in id.chars() {
        if !ch.is_ascii_alphanumeric() && !matches!(ch, '-' | '_' | '.' | '~' | '+' | '%') {
            return Err(format!("{} ID contains invalid character: '{}'", kind, ch));
        }
    }

    Ok(())
}
