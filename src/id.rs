//! App user id generation and classification.
//!
//! Anonymous ids are generated locally before the user identifies
//! themselves. Format: `$RCAnonymousID:{uuid_simple}` (32 lowercase hex
//! chars, no hyphens). [`generate_anonymous_id`] and [`is_anonymous_id`]
//! must agree on this shape.

use uuid::Uuid;

/// Prefix of every generated anonymous id.
pub const ANONYMOUS_ID_PREFIX: &str = "$RCAnonymousID:";

const ANONYMOUS_ID_HEX_LEN: usize = 32;

/// Generate a fresh anonymous app user id.
pub fn generate_anonymous_id() -> String {
    format!("{}{}", ANONYMOUS_ID_PREFIX, Uuid::new_v4().as_simple())
}

/// Check whether `id` has the generated anonymous shape.
///
/// Matches `^\$RCAnonymousID:[a-f0-9]{32}$`. Uppercase hex is rejected
/// because the generator never produces it.
pub fn is_anonymous_id(id: &str) -> bool {
    let Some(hex_part) = id.strip_prefix(ANONYMOUS_ID_PREFIX) else {
        return false;
    };

    hex_part.len() == ANONYMOUS_ID_HEX_LEN
        && hex_part
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Normalize a caller-supplied id: trims whitespace, `None` when blank.
pub fn normalize_app_user_id(id: &str) -> Option<&str> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
