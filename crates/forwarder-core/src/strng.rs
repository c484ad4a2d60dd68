//! Cheap-clone interned strings for hot-path data (hostnames, matcher
//! patterns, credential keys) that get cloned once per request but rarely
//! mutated.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use arcstr::ArcStr;
use serde::{Deserialize, Serialize};

/// An immutable, reference-counted string. Cloning is an atomic increment,
/// not a heap copy, so `Strng` is the type of choice for anything that flows
/// through the request path more than once (a hostname compared against
/// several matchers, a credential-tier key looked up on every CONNECT).
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Strng(ArcStr);

impl Strng {
	pub fn new(s: impl AsRef<str>) -> Self {
		Strng(ArcStr::from(s.as_ref()))
	}

	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}
}

pub fn new(s: impl AsRef<str>) -> Strng {
	Strng::new(s)
}

impl Deref for Strng {
	type Target = str;
	fn deref(&self) -> &str {
		self.0.as_str()
	}
}

impl Borrow<str> for Strng {
	fn borrow(&self) -> &str {
		self.0.as_str()
	}
}

impl AsRef<str> for Strng {
	fn as_ref(&self) -> &str {
		self.0.as_str()
	}
}

impl From<&str> for Strng {
	fn from(s: &str) -> Self {
		Strng::new(s)
	}
}

impl From<String> for Strng {
	fn from(s: String) -> Self {
		Strng(ArcStr::from(s))
	}
}

impl From<Strng> for String {
	fn from(s: Strng) -> Self {
		s.0.to_string()
	}
}

impl fmt::Display for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

impl fmt::Debug for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.0.as_str(), f)
	}
}

impl Serialize for Strng {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for Strng {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(Strng::from(s))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clone_is_cheap_and_equal() {
		let a = Strng::new("example.com");
		let b = a.clone();
		assert_eq!(a, b);
		assert_eq!(a.as_str(), "example.com");
	}

	#[test]
	fn usable_as_map_key_by_str() {
		use std::collections::HashMap;
		let mut m: HashMap<Strng, u32> = HashMap::new();
		m.insert(Strng::new("host"), 1);
		assert_eq!(m.get("host"), Some(&1));
	}
}
