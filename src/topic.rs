//! Glob patterns over message topics.
//!
//! `*` matches any run of characters (dots included) and `?` matches a single
//! character, so `*.bodhi.update.*` matches `org.fedoraproject.prod.bodhi.update.comment`.

use regex::Regex;

use crate::error::ConfigError;

/// A compiled topic glob.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    source: String,
    regex: Regex,
}

impl TopicPattern {
    /// Compile a glob into an anchored regex.
    pub fn new(glob: &str) -> Result<Self, ConfigError> {
        let mut pattern = String::with_capacity(glob.len() + 8);
        pattern.push('^');
        for c in glob.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        pattern.push('$');

        let regex = Regex::new(&pattern).map_err(|e| ConfigError::InvalidTopicPattern {
            pattern: glob.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            source: glob.to_string(),
            regex,
        })
    }

    /// Compile a list of globs, failing on the first invalid one.
    pub fn compile_all(globs: &[String]) -> Result<Vec<Self>, ConfigError> {
        globs.iter().map(|g| Self::new(g)).collect()
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    /// The glob this pattern was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// True if any pattern matches the topic.
pub fn any_matches(patterns: &[TopicPattern], topic: &str) -> bool {
    patterns.iter().any(|p| p.matches(topic))
}
