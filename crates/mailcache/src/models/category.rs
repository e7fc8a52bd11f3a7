//! Categories and the rules that assign emails to them

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AccountId;

/// Database primary key of a category
pub type CategoryId = i64;

/// A user- or system-defined bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub account_id: AccountId,
    pub name: String,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub is_system: bool,
}

/// Why a rule was rejected at the input boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("unknown rule type: {0}")]
    UnknownKind(String),
    #[error("rule value must be a non-empty string")]
    EmptyValue,
    #[error("rule is missing a category")]
    MissingCategory,
    #[error("malformed rule: {0}")]
    Malformed(String),
}

/// What a rule matches on, with its match value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RuleMatch {
    /// Suffix match on the sender's domain
    SenderDomain(String),
    /// Exact match on the sender's address
    SenderEmail(String),
    /// Case-insensitive substring of the subject
    SubjectKeyword(String),
    /// Membership in the email's label set
    Label(String),
}

impl RuleMatch {
    /// Build a rule match from its stored `(kind, value)` columns.
    ///
    /// Values are normalized here so evaluation can compare without
    /// re-lowercasing per email.
    pub fn from_parts(kind: &str, value: &str) -> Result<Self, RuleError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(RuleError::EmptyValue);
        }
        match kind {
            "sender_domain" => Ok(RuleMatch::SenderDomain(
                value.trim_start_matches('@').to_lowercase(),
            )),
            "sender_email" => Ok(RuleMatch::SenderEmail(value.to_lowercase())),
            "subject_keyword" => Ok(RuleMatch::SubjectKeyword(value.to_lowercase())),
            // Label ids are case-sensitive on the provider side
            "label" => Ok(RuleMatch::Label(value.to_string())),
            other => Err(RuleError::UnknownKind(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RuleMatch::SenderDomain(_) => "sender_domain",
            RuleMatch::SenderEmail(_) => "sender_email",
            RuleMatch::SubjectKeyword(_) => "subject_keyword",
            RuleMatch::Label(_) => "label",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            RuleMatch::SenderDomain(v)
            | RuleMatch::SenderEmail(v)
            | RuleMatch::SubjectKeyword(v)
            | RuleMatch::Label(v) => v,
        }
    }
}

/// A stored categorization rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationRule {
    pub id: i64,
    pub account_id: AccountId,
    pub matcher: RuleMatch,
    pub category_id: CategoryId,
    /// Lower runs first
    pub priority: i64,
}

/// A validated rule that has not been stored yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub matcher: RuleMatch,
    pub category_id: CategoryId,
    pub priority: i64,
}

/// Shape of a rule inside the loosely-typed settings blob
#[derive(Deserialize)]
struct RawRule {
    #[serde(rename = "type")]
    kind: Option<String>,
    value: Option<serde_json::Value>,
    category_id: Option<CategoryId>,
    priority: Option<i64>,
}

impl NewRule {
    /// Validate one rule from user settings JSON.
    ///
    /// Unknown `type` tags and non-string values are rejected instead of being
    /// carried into storage.
    pub fn parse(value: &serde_json::Value) -> Result<Self, RuleError> {
        let raw: RawRule = serde_json::from_value(value.clone())
            .map_err(|e| RuleError::Malformed(e.to_string()))?;

        let kind = raw
            .kind
            .ok_or_else(|| RuleError::Malformed("missing type".to_string()))?;
        let text = match raw.value {
            Some(serde_json::Value::String(s)) => s,
            Some(_) | None => return Err(RuleError::EmptyValue),
        };
        let matcher = RuleMatch::from_parts(&kind, &text)?;
        let category_id = raw.category_id.ok_or(RuleError::MissingCategory)?;

        Ok(Self {
            matcher,
            category_id,
            priority: raw.priority.unwrap_or(0),
        })
    }

    /// Validate a settings array, splitting valid rules from rejections
    pub fn parse_all(values: &[serde_json::Value]) -> (Vec<NewRule>, Vec<RuleError>) {
        let mut rules = Vec::new();
        let mut errors = Vec::new();
        for value in values {
            match Self::parse(value) {
                Ok(rule) => rules.push(rule),
                Err(e) => errors.push(e),
            }
        }
        (rules, errors)
    }
}
