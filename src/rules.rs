//! Rule table: the ordered, immutable list of rectification rules.

use crate::config::RuleConfig;
use crate::ldap_protocol::validate_single_record;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Byte-pattern substitution rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RectificationRule {
    pub label: String,
    pub pattern: Vec<u8>,
    pub replacement: Vec<u8>,
    pub reply_to_sender: bool,
}

impl RectificationRule {
    pub fn new(
        label: impl Into<String>,
        pattern: impl Into<Vec<u8>>,
        replacement: impl Into<Vec<u8>>,
        reply_to_sender: bool,
    ) -> Self {
        Self {
            label: label.into(),
            pattern: pattern.into(),
            replacement: replacement.into(),
            reply_to_sender,
        }
    }

    /// Contiguous subsequence match. An empty pattern matches everything.
    pub fn matches(&self, data: &[u8]) -> bool {
        if self.pattern.is_empty() {
            return true;
        }
        data.windows(self.pattern.len()).any(|w| w == self.pattern.as_slice())
    }

    fn from_config(cfg: &RuleConfig) -> Result<Self> {
        let label = cfg.label.trim();
        if label.is_empty() {
            bail!("Rule label must not be empty");
        }
        let pattern = decode_hex(&cfg.pattern)
            .with_context(|| format!("Rule {}: invalid pattern", label))?;
        if pattern.is_empty() {
            bail!("Rule {}: pattern must not be empty", label);
        }
        let replacement = decode_hex(&cfg.replacement)
            .with_context(|| format!("Rule {}: invalid replacement", label))?;
        Ok(Self::new(label, pattern, replacement, cfg.reply_to_sender))
    }
}

/// Decode a hex string, ignoring whitespace and ':' separators.
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let compact: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(&compact).with_context(|| format!("Invalid hex string: {:?}", s))
}

/// Ordered rule list, cheap to clone and shared read-only between sessions.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Arc<[RectificationRule]>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RuleTable {
    pub fn new(rules: Vec<RectificationRule>) -> Self {
        Self { rules: rules.into() }
    }

    /// Build the table from config, keeping the configured order.
    pub fn from_config(rules: &[RuleConfig]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(rules.len());
        for cfg in rules {
            let rule = RectificationRule::from_config(cfg)?;
            if !seen.insert(rule.label.clone()) {
                bail!("Duplicate rule label: {}", rule.label);
            }
            if let Err(e) = validate_single_record(&rule.replacement) {
                warn!(
                    "Rule {}: replacement is not a single BER record ({}); sessions where it fires will be closed",
                    rule.label, e
                );
            }
            out.push(rule);
        }
        Ok(Self::new(out))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RectificationRule> {
        self.rules.iter()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.label.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_cfg(label: &str, pattern: &str, replacement: &str) -> RuleConfig {
        RuleConfig {
            label: label.to_string(),
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
            reply_to_sender: false,
        }
    }

    #[test]
    fn test_decode_hex_separators() {
        assert_eq!(decode_hex("63 33 04 00").unwrap(), vec![0x63, 0x33, 0x04, 0x00]);
        assert_eq!(decode_hex("63:33\n04\t00").unwrap(), vec![0x63, 0x33, 0x04, 0x00]);
        assert_eq!(decode_hex("ABcd").unwrap(), vec![0xAB, 0xCD]);
        assert!(decode_hex("").unwrap().is_empty());
    }

    #[test]
    fn test_decode_hex_invalid() {
        assert!(decode_hex("6").is_err());
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn test_rule_matches() {
        let rule = RectificationRule::new("r", b"cn=".to_vec(), b"x".to_vec(), false);
        assert!(rule.matches(b"dn: cn=admin"));
        assert!(!rule.matches(b"ou=people"));
        assert!(!rule.matches(b"cn"));
        let empty = RectificationRule::new("e", Vec::new(), b"x".to_vec(), false);
        assert!(empty.matches(b""));
    }

    #[test]
    fn test_rule_table_from_config_keeps_order() {
        let table = RuleTable::from_config(&[
            rule_cfg("second", "42", "04 01 43"),
            rule_cfg("first", "41", "04 01 42"),
        ])
        .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.labels().collect::<Vec<_>>(), vec!["second", "first"]);
        let first = table.iter().next().unwrap();
        assert_eq!(first.pattern, vec![0x42]);
        assert_eq!(first.replacement, vec![0x04, 0x01, 0x43]);
    }

    #[test]
    fn test_rule_table_rejects_bad_rules() {
        assert!(RuleTable::from_config(&[rule_cfg("", "41", "42")]).is_err());
        assert!(RuleTable::from_config(&[rule_cfg("a", "", "42")]).is_err());
        assert!(RuleTable::from_config(&[rule_cfg("a", "4", "42")]).is_err());
        assert!(RuleTable::from_config(&[rule_cfg("a", "41", "xx")]).is_err());
        assert!(RuleTable::from_config(&[
            rule_cfg("dup", "41", "42"),
            rule_cfg("dup", "43", "44"),
        ])
        .is_err());
    }

    #[test]
    fn test_rule_table_accepts_non_record_replacement() {
        let table = RuleTable::from_config(&[rule_cfg("raw", "41", "42 43")]).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_rule_table_empty() {
        let table = RuleTable::default();
        assert!(table.is_empty());
        assert_eq!(table.iter().count(), 0);
    }
}
