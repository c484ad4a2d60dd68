//! Regex include/exclude host matcher used by the deny/direct/MITM domain
//! lists (spec.md §3, §4.3).

use regex::Regex;

#[derive(thiserror::Error, Debug)]
pub enum MatcherError {
	#[error("empty include list")]
	EmptyInclude,
	#[error("invalid pattern {pattern:?}: {source}")]
	InvalidPattern {
		pattern: String,
		#[source]
		source: regex::Error,
	},
}

/// One compiled alternation for includes, one for excludes. A string
/// matches iff it matches the include alternation and not the exclude one.
#[derive(Debug, Clone)]
pub struct Matcher {
	include: Regex,
	exclude: Option<Regex>,
	inverse: bool,
}

impl Matcher {
	/// Parses a list of `[-]pattern` items. A leading `-` marks the pattern
	/// exclusion; the literal pattern `all` expands to `.*`. At least one
	/// include pattern is required.
	pub fn build<'a>(items: impl IntoIterator<Item = &'a str>) -> Result<Self, MatcherError> {
		let mut includes = Vec::new();
		let mut excludes = Vec::new();
		for item in items {
			let (target, pattern) = match item.strip_prefix('-') {
				Some(rest) => (&mut excludes, rest),
				None => (&mut includes, item),
			};
			let pattern = if pattern == "all" { ".*" } else { pattern };
			target.push(pattern.to_string());
		}
		if includes.is_empty() {
			return Err(MatcherError::EmptyInclude);
		}
		let include = compile_alternation(&includes)?;
		let exclude = if excludes.is_empty() {
			None
		} else {
			Some(compile_alternation(&excludes)?)
		};
		Ok(Matcher { include, exclude, inverse: false })
	}

	pub fn match_str(&self, s: &str) -> bool {
		let m = self.include.is_match(s) && !self.exclude.as_ref().is_some_and(|e| e.is_match(s));
		m != self.inverse
	}

	/// Returns a matcher with the result negated.
	pub fn inverse(&self) -> Matcher {
		Matcher {
			include: self.include.clone(),
			exclude: self.exclude.clone(),
			inverse: !self.inverse,
		}
	}
}

fn compile_alternation(patterns: &[String]) -> Result<Regex, MatcherError> {
	let joined = format!("(?:{})", patterns.join("|"));
	Regex::new(&joined).map_err(|source| MatcherError::InvalidPattern {
		pattern: joined,
		source,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn include_and_not_exclude() {
		let m = Matcher::build(["all", "-foo"]).unwrap();
		assert!(!m.match_str("foo"));
		assert!(m.match_str("bar"));
	}

	#[test]
	fn inverse_negates_including_the_excluded_case() {
		let m = Matcher::build(["all", "-foo"]).unwrap();
		let inv = m.inverse();
		for s in ["foo", "bar", "anything"] {
			assert_eq!(m.match_str(s), !inv.match_str(s), "mismatch for {s}");
		}
		assert!(!m.match_str("foo"));
	}

	#[test]
	fn empty_include_is_an_error() {
		assert!(matches!(Matcher::build(["-only-exclude"]).unwrap_err(), MatcherError::EmptyInclude));
	}

	#[test]
	fn literal_domains_and_anchors() {
		let m = Matcher::build([r"^blocked\."]).unwrap();
		assert!(m.match_str("blocked.example"));
		assert!(!m.match_str("notblocked.example"));
	}
}
