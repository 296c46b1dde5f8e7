//! Policies: ordered rules mapping data categories to an action and, for
//! erasure, a masking strategy. Read-only input to query compilation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::core::errors::{EngineError, Result};
use crate::core::value::FieldValue;
use crate::graph::config::Collection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Access,
    Erasure,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionType::Access => write!(f, "access"),
            ActionType::Erasure => write!(f, "erasure"),
        }
    }
}

/// How a policy-matched field is rewritten during erasure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MaskingStrategy {
    /// Replace the value with null.
    Null,
    /// Replace the value with a fixed string.
    Rewrite { value: String },
    /// Replace the value with a random alphanumeric string.
    RandomRewrite { length: usize },
    /// Replace the value with a salted, non-reversible digest.
    Hash { salt: String },
}

const REWRITE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

impl MaskingStrategy {
    pub fn apply(&self, original: &FieldValue) -> FieldValue {
        match self {
            MaskingStrategy::Null => FieldValue::Null,
            MaskingStrategy::Rewrite { value } => FieldValue::String(value.clone()),
            MaskingStrategy::RandomRewrite { length } => {
                let masked: String = (0..*length)
                    .map(|_| REWRITE_ALPHABET[fastrand::usize(..REWRITE_ALPHABET.len())] as char)
                    .collect();
                FieldValue::String(masked)
            }
            MaskingStrategy::Hash { salt } => {
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                salt.hash(&mut hasher);
                original.to_string().hash(&mut hasher);
                FieldValue::String(format!("{:016x}", hasher.finish()))
            }
        }
    }
}

/// One ordered rule. A rule category matches a field category exactly or as
/// a dot-separated prefix, so `user.contact` covers `user.contact.email`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub data_category: String,
    pub action: ActionType,
    #[serde(default)]
    pub masking: Option<MaskingStrategy>,
}

impl Rule {
    pub fn matches_category(&self, category: &str) -> bool {
        category == self.data_category
            || (category.len() > self.data_category.len()
                && category.starts_with(&self.data_category)
                && category.as_bytes()[self.data_category.len()] == b'.')
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub key: String,
    pub rules: Vec<Rule>,
}

impl Policy {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let policy: Policy = serde_yaml::from_str(raw)
            .map_err(|e| EngineError::validation(format!("invalid policy yaml: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(EngineError::validation_field("policy key is empty", "key"));
        }
        for rule in &self.rules {
            if rule.data_category.is_empty() {
                return Err(EngineError::validation_field(
                    format!("empty data category in policy '{}'", self.key),
                    "data_category",
                ));
            }
            match rule.action {
                ActionType::Erasure if rule.masking.is_none() => {
                    return Err(EngineError::validation(format!(
                        "erasure rule for '{}' in policy '{}' has no masking strategy",
                        rule.data_category, self.key
                    )));
                }
                ActionType::Access if rule.masking.is_some() => {
                    return Err(EngineError::validation(format!(
                        "access rule for '{}' in policy '{}' carries a masking strategy",
                        rule.data_category, self.key
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// First rule matching any of the given categories; rule order decides.
    pub fn matching_rule(&self, categories: &[String]) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|rule| categories.iter().any(|c| rule.matches_category(c)))
    }

    pub fn requires_erasure(&self) -> bool {
        self.rules.iter().any(|r| r.action == ActionType::Erasure)
    }

    /// The fields of `collection` the policy marks for erasure, with the
    /// strategy each one gets. Fields whose first matching rule is an
    /// access rule are excluded: rule order wins over later erasure rules.
    pub fn erasure_fields<'a>(
        &'a self,
        collection: &'a Collection,
    ) -> Vec<(&'a str, &'a MaskingStrategy)> {
        collection
            .fields
            .iter()
            .filter_map(|field| {
                let rule = self.matching_rule(&field.data_categories)?;
                match (&rule.action, &rule.masking) {
                    (ActionType::Erasure, Some(strategy)) => Some((field.name.as_str(), strategy)),
                    _ => None,
                }
            })
            .collect()
    }
}
