// MIT License - Copyright (c) 2026 Peter Wright
// Topic filter matching

use regex::Regex;

/// A compiled MQTT subscription pattern.
///
/// `+` matches exactly one topic level, `#` matches everything that remains
/// (one or more levels). Literal levels are matched verbatim.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    pattern: String,
    regex: Regex,
}

impl TopicFilter {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let escaped = regex::escape(pattern)
            .replace(r"\+", "[^/]+")
            .replace(r"\#", ".+");
        let regex = Regex::new(&format!("^{escaped}$"))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }
}
