//! Dangerous-construct scan over generated code.

use regex::Regex;

pub const DEFAULT_RISKY_PATTERNS: &[&str] = &[
    r"\beval\s*\(",
    r"\bexec\s*\(",
    r"\bsubprocess\b",
    r"\bos\.system\s*\(",
    r"\b__import__\s*\(",
    r"\bchild_process\b",
];

#[derive(Debug, Clone, PartialEq)]
pub struct RiskFinding {
    pub file: String,
    pub pattern: String,
}

impl std::fmt::Display for RiskFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "risky pattern '{}' found in {}", self.pattern, self.file)
    }
}

#[derive(Debug, Clone)]
pub struct RiskScanner {
    patterns: Vec<Regex>,
}

impl RiskScanner {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn scan<'a>(&self, files: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<RiskFinding> {
        let mut findings = Vec::new();
        for (file, code) in files {
            for pattern in &self.patterns {
                if pattern.is_match(code) {
                    findings.push(RiskFinding {
                        file: file.to_string(),
                        pattern: pattern.as_str().to_string(),
                    });
                }
            }
        }
        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> RiskScanner {
        let patterns: Vec<String> = DEFAULT_RISKY_PATTERNS.iter().map(|s| s.to_string()).collect();
        RiskScanner::new(&patterns).unwrap()
    }

    #[test]
    fn flags_shell_and_eval() {
        let findings = scanner().scan([
            ("main.py", "import subprocess\nsubprocess.run(['ls'])"),
            ("util.js", "const x = eval (input)"),
            ("ok.py", "def evaluate(x): return x"),
        ]);
        let files: Vec<_> = findings.iter().map(|f| f.file.as_str()).collect();
        assert_eq!(files, vec!["main.py", "util.js"]);
    }

    #[test]
    fn configurable_patterns_replace_defaults() {
        let scanner = RiskScanner::new(&[r"\bunsafe\b".to_string()]).unwrap();
        assert!(scanner.scan([("lib.rs", "eval(x)")]).is_empty());
        assert_eq!(scanner.scan([("lib.rs", "unsafe { }")]).len(), 1);
    }
}
