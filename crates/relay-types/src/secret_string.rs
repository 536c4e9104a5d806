//! Wrapper for private keys and other secrets read from configuration.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::Zeroizing;

/// A string that is zeroed on drop and redacted in `Debug`, `Display` and
/// serialized output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(Zeroizing<String>);

impl SecretString {
	pub fn new(s: String) -> Self {
		Self(Zeroizing::new(s))
	}

	/// Lends the secret to `f` without letting it escape.
	pub fn with_exposed<F, R>(&self, f: F) -> R
	where
		F: FnOnce(&str) -> R,
	{
		f(&self.0)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "SecretString(***REDACTED***)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "***REDACTED***")
	}
}

impl From<&str> for SecretString {
	fn from(s: &str) -> Self {
		Self::new(s.to_string())
	}
}

impl From<String> for SecretString {
	fn from(s: String) -> Self {
		Self::new(s)
	}
}

impl Serialize for SecretString {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str("***REDACTED***")
	}
}

impl<'de> Deserialize<'de> for SecretString {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		String::deserialize(deserializer).map(Self::new)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_secret_is_redacted() {
		let secret = SecretString::from("0xdeadbeef");
		assert_eq!(format!("{}", secret), "***REDACTED***");
		assert!(!format!("{:?}", secret).contains("dead"));
		assert_eq!(serde_json::to_string(&secret).unwrap(), "\"***REDACTED***\"");
		secret.with_exposed(|s| assert_eq!(s, "0xdeadbeef"));
	}
}
