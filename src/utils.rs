//! Identifier helpers

use uuid7::uuid7;

pub const INCIDENT_PREFIX: &str = "inc";
pub const ASSIGNMENT_PREFIX: &str = "asg";
pub const COMMENT_PREFIX: &str = "cmt";
pub const EVENT_PREFIX: &str = "evt";

// construct a unique id from a uuid7 then hex encode it behind the prefix.
// uuid7 leads with the unix millis so ids sort by creation time.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", hex::encode(uuid7().as_bytes()))
}

/// Returns true if `id` looks like something produced by [`new_id`] with `prefix`.
pub fn is_valid_id(prefix: &str, id: &str) -> bool {
    match id.split_once('_') {
        Some((p, body)) => {
            p == prefix
                && body.len() == 32
                && body.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        }
        None => false,
    }
}
