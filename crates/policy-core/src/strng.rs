//! Cheap-clone interned string type used everywhere a route key, header
//! name, or policy name is passed around and cloned across phases.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

/// An `Arc`-backed string. Cloning is a refcount bump, not an allocation.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Strng(arcstr::ArcStr);

impl Strng {
	pub fn new(s: impl Into<arcstr::ArcStr>) -> Self {
		Strng(s.into())
	}

	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}
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

impl fmt::Debug for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&self.0, f)
	}
}

impl fmt::Display for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

impl From<&str> for Strng {
	fn from(s: &str) -> Self {
		Strng(arcstr::ArcStr::from(s))
	}
}

impl From<String> for Strng {
	fn from(s: String) -> Self {
		Strng(arcstr::ArcStr::from(s))
	}
}

impl From<&String> for Strng {
	fn from(s: &String) -> Self {
		Strng(arcstr::ArcStr::from(s.as_str()))
	}
}

/// Shorthand constructor, mirroring `Strng::new`.
pub fn new(s: impl Into<arcstr::ArcStr>) -> Strng {
	Strng::new(s)
}
