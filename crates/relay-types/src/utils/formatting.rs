//! String formatting utilities for log output.

use alloy_primitives::B256;

/// Truncates a string to its first 8 characters followed by "..".
pub fn truncate_id(id: &str) -> String {
	if id.len() <= 8 {
		id.to_string()
	} else {
		format!("{}..", &id[..8])
	}
}

/// Short form of a hash for log lines, e.g. `0x1a2b3c..`.
pub fn short_hash(hash: &B256) -> String {
	truncate_id(&with_0x_prefix(&hex::encode(&hash[..4])))
}

/// Adds "0x" prefix to a hex string if it doesn't already have one.
pub fn with_0x_prefix(hex_str: &str) -> String {
	if hex_str.to_lowercase().starts_with("0x") {
		hex_str.to_string()
	} else {
		format!("0x{}", hex_str)
	}
}

/// Removes "0x" or "0X" prefix from a hex string if present.
pub fn without_0x_prefix(hex_str: &str) -> &str {
	hex_str
		.strip_prefix("0x")
		.or_else(|| hex_str.strip_prefix("0X"))
		.unwrap_or(hex_str)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_truncate_id() {
		assert_eq!(truncate_id("1234"), "1234");
		assert_eq!(truncate_id("12345678"), "12345678");
		assert_eq!(truncate_id("123456789abc"), "12345678..");
	}

	#[test]
	fn test_short_hash() {
		let hash = B256::repeat_byte(0xab);
		assert_eq!(short_hash(&hash), "0xababab..");
	}

	#[test]
	fn test_prefix_helpers() {
		assert_eq!(with_0x_prefix("abcd"), "0xabcd");
		assert_eq!(with_0x_prefix("0Xabcd"), "0Xabcd");
		assert_eq!(without_0x_prefix("0xabcd"), "abcd");
		assert_eq!(without_0x_prefix("0Xabcd"), "abcd");
		assert_eq!(without_0x_prefix("abcd"), "abcd");
	}
}
