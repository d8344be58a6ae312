//! Identifier generation for JSON-RPC requests and synthesized tool calls.

use chrono::Utc;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

fn random_suffix() -> String {
    // Falls back to the clock's subsecond nanos if the OS source is unavailable.
    let entropy = getrandom::u64()
        .unwrap_or_else(|_| u64::from(Utc::now().timestamp_subsec_nanos()).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    let mut suffix = to_base36(entropy);
    suffix.truncate(9);
    suffix
}

/// Time-plus-random id, unique enough to key pending requests.
pub fn generate_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    format!("{}{}", to_base36(millis), random_suffix())
}

/// Id for a tool call recovered from message content.
pub fn generate_tool_call_id() -> String {
    format!(
        "toolcall_{}_{}",
        Utc::now().timestamp_millis(),
        random_suffix()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn base36_encodes_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn generated_ids_do_not_repeat() {
        let ids: HashSet<String> = (0..500).map(|_| generate_id()).collect();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn tool_call_ids_carry_prefix() {
        assert!(generate_tool_call_id().starts_with("toolcall_"));
    }
}
