//! Gmail-style search syntax
//!
//! Supported operators:
//! - `from:` / `to:` / `subject:` substring filters, quoted values allowed
//! - `in:inbox`, `in:trash`, `in:anywhere`, `in:Label_12`
//! - `is:unread`, `is:read`, `is:starred`, `is:unstarred`
//! - `has:attachment`
//! - `before:2024/12/01`, `after:2024-01-01`
//!
//! Anything else, including unknown `key:value` pairs, is free text.

use chrono::{DateTime, NaiveDate, Utc};

use crate::models::labels;

/// Provider labels written in upper case whatever the user typed
const SYSTEM_LABELS: &[&str] = &[
    labels::INBOX,
    labels::SENT,
    labels::DRAFT,
    labels::TRASH,
    labels::SPAM,
    labels::STARRED,
    labels::IMPORTANT,
    labels::UNREAD,
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    /// Free-text terms, each of which must match
    pub terms: Vec<String>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: Vec<String>,
    /// `in:` labels, system labels upper-cased
    pub labels: Vec<String>,
    /// `in:anywhere` also searches trash
    pub anywhere: bool,
    pub is_unread: Option<bool>,
    pub is_starred: Option<bool>,
    pub has_attachment: Option<bool>,
    /// Exclusive upper bound, start of the given day (UTC)
    pub before: Option<DateTime<Utc>>,
    /// Inclusive lower bound, start of the given day (UTC)
    pub after: Option<DateTime<Utc>>,
}

impl ParsedQuery {
    pub fn is_empty(&self) -> bool {
        *self == ParsedQuery::default()
    }

    fn apply(&mut self, op: Operator, value: String) {
        match op {
            Operator::From => self.from.push(value),
            Operator::To => self.to.push(value),
            Operator::Subject => self.subject.push(value),
            Operator::In => {
                if value.eq_ignore_ascii_case("anywhere") {
                    self.anywhere = true;
                } else {
                    self.labels.push(canonical_label(value));
                }
            }
            Operator::Is => match value.to_lowercase().as_str() {
                "unread" => self.is_unread = Some(true),
                "read" => self.is_unread = Some(false),
                "starred" => self.is_starred = Some(true),
                "unstarred" => self.is_starred = Some(false),
                other => log::debug!("[QUERY] Ignoring is:{}", other),
            },
            Operator::Has => {
                if value.eq_ignore_ascii_case("attachment") {
                    self.has_attachment = Some(true);
                }
            }
            Operator::Before => self.before = parse_date(&value).or(self.before),
            Operator::After => self.after = parse_date(&value).or(self.after),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    From,
    To,
    Subject,
    In,
    Is,
    Has,
    Before,
    After,
}

impl Operator {
    fn parse(key: &str) -> Option<Self> {
        let op = match key.to_lowercase().as_str() {
            "from" => Operator::From,
            "to" => Operator::To,
            "subject" => Operator::Subject,
            "in" | "label" => Operator::In,
            "is" => Operator::Is,
            "has" => Operator::Has,
            "before" => Operator::Before,
            "after" => Operator::After,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Operator(Operator, String),
    Text(String),
}

pub fn parse_query(input: &str) -> ParsedQuery {
    let mut query = ParsedQuery::default();
    let mut rest = input.trim_start();
    while !rest.is_empty() {
        let (token, remainder) = next_token(rest);
        match token {
            Some(Token::Operator(op, value)) => query.apply(op, value),
            Some(Token::Text(text)) => query.terms.push(text),
            None => {}
        }
        rest = remainder.trim_start();
    }
    query
}

fn next_token(input: &str) -> (Option<Token>, &str) {
    if let Some(quoted) = input.strip_prefix('"') {
        let (phrase, rest) = take_quoted(quoted);
        let token = (!phrase.trim().is_empty()).then(|| Token::Text(phrase.to_string()));
        return (token, rest);
    }

    if let Some((key, after)) = input.split_once(':')
        && !key.contains(char::is_whitespace)
        && let Some(op) = Operator::parse(key)
    {
        let (value, rest) = match after.strip_prefix('"') {
            Some(quoted) => take_quoted(quoted),
            None => take_word(after),
        };
        if !value.is_empty() {
            return (Some(Token::Operator(op, value.to_string())), rest);
        }
    }

    let (word, rest) = take_word(input);
    (Some(Token::Text(word.to_string())), rest)
}

/// Up to the closing quote, or the end of input if it is missing
fn take_quoted(input: &str) -> (&str, &str) {
    match input.find('"') {
        Some(end) => (&input[..end], &input[end + 1..]),
        None => (input, ""),
    }
}

fn take_word(input: &str) -> (&str, &str) {
    let end = input.find(char::is_whitespace).unwrap_or(input.len());
    input.split_at(end)
}

fn canonical_label(value: String) -> String {
    SYSTEM_LABELS
        .iter()
        .find(|label| label.eq_ignore_ascii_case(&value))
        .map_or(value, |label| label.to_string())
}

/// `YYYY/MM/DD` or `YYYY-MM-DD` at midnight UTC
fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    ["%Y/%m/%d", "%Y-%m-%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(input, format).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_text_and_phrases() {
        let query = parse_query("quarterly \"budget review\"  notes");
        assert_eq!(query.terms, vec!["quarterly", "budget review", "notes"]);
    }

    #[test]
    fn test_operators() {
        let query = parse_query("from:alice to:\"Team Lead\" subject:sync is:unread has:attachment");
        assert_eq!(query.from, vec!["alice"]);
        assert_eq!(query.to, vec!["Team Lead"]);
        assert_eq!(query.subject, vec!["sync"]);
        assert_eq!(query.is_unread, Some(true));
        assert_eq!(query.has_attachment, Some(true));
        assert!(query.terms.is_empty());
    }

    #[test]
    fn test_in_labels() {
        let query = parse_query("in:inbox in:Label_12 in:anywhere");
        assert_eq!(query.labels, vec!["INBOX", "Label_12"]);
        assert!(query.anywhere);
    }

    #[test]
    fn test_is_variants() {
        assert_eq!(parse_query("is:read").is_unread, Some(false));
        assert_eq!(parse_query("is:starred").is_starred, Some(true));
        assert_eq!(parse_query("is:unstarred").is_starred, Some(false));
        assert!(parse_query("is:snoozed").is_empty());
    }

    #[test]
    fn test_dates() {
        let query = parse_query("after:2024/01/01 before:2024-12-31");
        assert_eq!(query.after.unwrap().format("%Y-%m-%d").to_string(), "2024-01-01");
        assert_eq!(query.before.unwrap().format("%Y-%m-%d").to_string(), "2024-12-31");

        // Unparseable dates are dropped
        assert_eq!(parse_query("before:yesterday").before, None);
    }

    #[test]
    fn test_unknown_operator_is_text() {
        assert_eq!(parse_query("foo:bar").terms, vec!["foo:bar"]);
    }

    #[test]
    fn test_operator_without_value_is_text() {
        let query = parse_query("from: hello");
        assert!(query.from.is_empty());
        assert_eq!(query.terms, vec!["from:", "hello"]);
    }

    #[test]
    fn test_unterminated_quote() {
        let query = parse_query("subject:\"weekly report");
        assert_eq!(query.subject, vec!["weekly report"]);
    }

    #[test]
    fn test_empty() {
        assert!(parse_query("").is_empty());
        assert!(parse_query("   ").is_empty());
        assert!(parse_query("\"\"").is_empty());
    }
}
