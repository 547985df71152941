//! Rule and rule set types.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::RuleError;

/// The action a rule asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleType {
    /// Hand the connection to a named handler or proxy.
    ConnHandler,
    /// Let the traffic through untouched.
    Passthrough,
    /// Drop the traffic.
    Drop,
    /// Log raw TCP traffic.
    LogTcp,
    /// Log HTTP requests.
    LogHttp,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::ConnHandler => "conn_handler",
            RuleType::Passthrough => "passthrough",
            RuleType::Drop => "drop",
            RuleType::LogTcp => "log_tcp",
            RuleType::LogHttp => "log_http",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conn_handler" => Ok(RuleType::ConnHandler),
            "passthrough" => Ok(RuleType::Passthrough),
            "drop" => Ok(RuleType::Drop),
            "log_tcp" => Ok(RuleType::LogTcp),
            "log_http" => Ok(RuleType::LogHttp),
            other => Err(format!("unknown rule type '{other}'")),
        }
    }
}

/// A single declarative rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Position in the rule file.
    pub index: usize,
    pub rule_type: RuleType,
    /// Handler or proxy kind, e.g. `proxy_ssh`. May be empty.
    pub name: String,
    /// Handler name or proxy destination. May be empty.
    pub target: String,
    /// Matching criteria, interpreted by the packet engine.
    pub match_expr: String,
}

impl Rule {
    /// Whether the dispatcher should consider this rule at all.
    pub fn is_dispatchable(&self) -> bool {
        self.rule_type == RuleType::ConnHandler && !self.target.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(rename = "type")]
    rule_type: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    target: String,
    #[serde(rename = "match")]
    match_expr: String,
}

impl RawRule {
    fn validate(self, index: usize) -> Result<Rule, RuleError> {
        let rule_type = self
            .rule_type
            .trim()
            .parse::<RuleType>()
            .map_err(|reason| RuleError::Invalid { index, reason })?;

        let match_expr = self.match_expr.trim().to_string();
        if match_expr.is_empty() {
            return Err(RuleError::Invalid {
                index,
                reason: "match expression cannot be empty".to_string(),
            });
        }

        Ok(Rule {
            index,
            rule_type,
            name: self.name.trim().to_string(),
            target: self.target.trim().to_string(),
            match_expr,
        })
    }
}

/// An ordered, immutable collection of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    /// Build a rule set from already-validated rules, keeping their order.
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: rules.into_iter().map(Arc::new).collect(),
        }
    }

    /// Parse and validate a rule set from TOML text.
    pub fn parse(content: &str) -> Result<Self, RuleError> {
        let file: RuleFile = toml::from_str(content)?;
        let rules = file
            .rules
            .into_iter()
            .enumerate()
            .map(|(index, raw)| raw.validate(index))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(rules))
    }

    /// Load a rule set from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| RuleError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let set = Self::parse(&content)?;
        debug!(
            path = %path.display(),
            rule_count = set.len(),
            dispatchable = set.dispatchable().count(),
            "Loaded rules"
        );
        Ok(set)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter()
    }

    /// Rules eligible for dispatch registration, in file order.
    pub fn dispatchable(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter().filter(|r| r.is_dispatchable())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SAMPLE: &str = r#"
[[rules]]
match = "tcp dst port 22"
type = "conn_handler"
name = "proxy_ssh"
target = "10.0.0.5:22"

[[rules]]
match = "tcp dst port 8080"
type = "conn_handler"
name = "proxy_tcp"
target = "8080"

[[rules]]
match = "udp"
type = "drop"

[[rules]]
match = "tcp"
type = "conn_handler"
"#;

    #[test]
    fn test_parse_keeps_order() {
        let set = RuleSet::parse(SAMPLE).unwrap();
        assert_eq!(set.len(), 4);

        let names: Vec<_> = set.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["proxy_ssh", "proxy_tcp", "", ""]);
        assert_eq!(set.iter().nth(2).unwrap().rule_type, RuleType::Drop);
        assert_eq!(set.iter().nth(3).unwrap().index, 3);
    }

    #[test]
    fn test_dispatchable_requires_conn_handler_and_target() {
        let set = RuleSet::parse(SAMPLE).unwrap();
        let targets: Vec<_> = set.dispatchable().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["10.0.0.5:22", "8080"]);
    }

    #[rstest]
    #[case(RuleType::ConnHandler, "tcp", true)]
    #[case(RuleType::ConnHandler, "", false)]
    #[case(RuleType::Drop, "tcp", false)]
    #[case(RuleType::LogTcp, "tcp", false)]
    fn test_is_dispatchable(#[case] rule_type: RuleType, #[case] target: &str, #[case] expected: bool) {
        let rule = Rule {
            index: 0,
            rule_type,
            name: String::new(),
            target: target.to_string(),
            match_expr: "tcp".to_string(),
        };
        assert_eq!(rule.is_dispatchable(), expected);
    }

    proptest::proptest! {
        #[test]
        fn prop_dispatchable_iff_conn_handler_with_target(
            type_idx in 0usize..5,
            target in "[a-z0-9:./]{0,12}",
        ) {
            let rule_type = ["conn_handler", "passthrough", "drop", "log_tcp", "log_http"][type_idx];
            let content = format!(
                "[[rules]]\nmatch = \"tcp\"\ntype = \"{rule_type}\"\ntarget = \"{target}\"\n"
            );
            let set = RuleSet::parse(&content).unwrap();

            let expected = rule_type == "conn_handler" && !target.is_empty();
            proptest::prop_assert_eq!(set.dispatchable().count(), usize::from(expected));
        }
    }

    #[test]
    fn test_unknown_type_is_invalid() {
        let err = RuleSet::parse("[[rules]]\nmatch = \"tcp\"\ntype = \"teleport\"\n").unwrap_err();
        assert!(matches!(err, RuleError::Invalid { index: 0, .. }), "unexpected: {err}");
    }

    #[test]
    fn test_empty_match_is_invalid() {
        let err = RuleSet::parse("[[rules]]\nmatch = \"  \"\ntype = \"drop\"\n").unwrap_err();
        assert!(matches!(err, RuleError::Invalid { .. }), "unexpected: {err}");
    }

    #[test]
    fn test_malformed_toml() {
        let err = RuleSet::parse("[[rules]\nmatch =").unwrap_err();
        assert!(matches!(err, RuleError::Parse(_)));
    }

    #[test]
    fn test_empty_file_is_empty_set() {
        assert!(RuleSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = RuleSet::from_file(dir.path().join("rules.toml")).unwrap_err();
        assert!(matches!(err, RuleError::Read { .. }));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        fs::write(&path, SAMPLE).unwrap();

        let set = RuleSet::from_file(&path).unwrap();
        assert_eq!(set.len(), 4);
    }
}
