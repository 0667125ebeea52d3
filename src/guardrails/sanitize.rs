//! Prompt-injection marker stripping.

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

pub const DEFAULT_INJECTION_PATTERNS: &[&str] = &[
    r"(?i)ignore\s+(all\s+)?previous\s+instructions",
    r"(?i)system\s*:",
    r"(?i)<\|im_start\|>",
    r"(?i)<\|im_end\|>",
    r"(?i)<\|endoftext\|>",
    r"(?i)```\s*system",
];

/// Text after sanitization, with the markers that were removed.
#[derive(Debug, Clone, PartialEq)]
pub struct Sanitized {
    pub text: String,
    pub hits: Vec<String>,
}

impl Sanitized {
    pub fn was_modified(&self) -> bool {
        !self.hits.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    patterns: Vec<Regex>,
}

impl Sanitizer {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn sanitize(&self, text: &str) -> Sanitized {
        let mut out = text.to_string();
        let mut hits = Vec::new();
        for pattern in &self.patterns {
            for m in pattern.find_iter(&out) {
                hits.push(m.as_str().to_string());
            }
            out = pattern.replace_all(&out, REDACTED).into_owned();
        }
        Sanitized { text: out, hits }
    }
}
