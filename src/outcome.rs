//! Outcome normalization: derive a success/failure predicate from whatever
//! outcome-bearing columns a tenant's schema actually has.
//!
//! Four schema shapes are probed in a fixed priority order. The order is
//! deliberate and not tenant-configurable: numeric event codes beat text
//! heuristics, and the structured payload is the last resort. When none of
//! the shapes apply the rule cannot be compiled for this schema, which is a
//! legitimate end state surfaced as a compilation warning upstream.

use crate::{
    error::{Result, ServiceError},
    schema::{self, SchemaEntry},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Fail,
}

// Well-known authentication event codes with unambiguous outcomes.
const SUCCESS_EVENT_CODES: &[i64] = &[4624, 4648, 4768, 4769];
const FAILURE_EVENT_CODES: &[i64] = &[4625, 4771, 4776, 4740];

const SUCCESS_MESSAGE_PATTERN: &str = "(?i)(success|accepted|granted|logged (in|on))";
const FAILURE_MESSAGE_PATTERN: &str = "(?i)(fail|denied|invalid|rejected|locked out)";
const EVENT_TYPE_PATTERN: &str = "(?i)(auth|log[io]n|session|credential)";

const SUCCESS_STATUS_WORDS: &[&str] = &["ok", "success", "succeeded", "allowed", "granted", "accepted"];
const FAILURE_STATUS_WORDS: &[&str] = &["fail", "failed", "failure", "denied", "rejected", "error", "invalid"];

/// Expands an outcome expectation into a filter fragment for this schema.
pub fn expand_outcome(expect: OutcomeKind, entry: &SchemaEntry) -> Result<String> {
    if let Some(fragment) = event_code_strategy(expect, entry) {
        return Ok(fragment);
    }
    if let Some(fragment) = message_strategy(expect, entry) {
        return Ok(fragment);
    }
    if let Some(fragment) = status_strategy(expect, entry) {
        return Ok(fragment);
    }
    if let Some(fragment) = payload_strategy(expect, entry) {
        return Ok(fragment);
    }

    Err(ServiceError::OutcomeUnresolvable(format!(
        "schema for {} exposes no outcome-bearing field",
        entry.scope
    )))
}

fn event_code_strategy(expect: OutcomeKind, entry: &SchemaEntry) -> Option<String> {
    let column = schema::try_resolve("event_id", &entry.columns)?;
    let codes = match expect {
        OutcomeKind::Success => SUCCESS_EVENT_CODES,
        OutcomeKind::Fail => FAILURE_EVENT_CODES,
    };
    let rendered = codes
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("{column} IN ({rendered})"))
}

fn message_strategy(expect: OutcomeKind, entry: &SchemaEntry) -> Option<String> {
    // This shape needs the message/event_type pair; one alone is too noisy.
    let message = schema::try_resolve("message", &entry.columns)?;
    let event_type = schema::try_resolve("event_type", &entry.columns)?;
    let pattern = match expect {
        OutcomeKind::Success => SUCCESS_MESSAGE_PATTERN,
        OutcomeKind::Fail => FAILURE_MESSAGE_PATTERN,
    };
    Some(format!(
        "(match({message}, '{pattern}') AND match({event_type}, '{EVENT_TYPE_PATTERN}'))"
    ))
}

fn status_strategy(expect: OutcomeKind, entry: &SchemaEntry) -> Option<String> {
    let column = schema::try_resolve("status", &entry.columns)?;
    Some(format!(
        "lower({column}) IN ({})",
        render_words(vocabulary(expect))
    ))
}

fn payload_strategy(expect: OutcomeKind, entry: &SchemaEntry) -> Option<String> {
    let extra = schema::try_resolve("extra", &entry.columns)?;
    let words = render_words(vocabulary(expect));
    Some(format!(
        "(lower({extra}['status']) IN ({words}) OR lower({extra}['result']) IN ({words}))"
    ))
}

fn vocabulary(expect: OutcomeKind) -> &'static [&'static str] {
    match expect {
        OutcomeKind::Success => SUCCESS_STATUS_WORDS,
        OutcomeKind::Fail => FAILURE_STATUS_WORDS,
    }
}

fn render_words(words: &[&str]) -> String {
    words
        .iter()
        .map(|word| format!("'{word}'"))
        .collect::<Vec<_>>()
        .join(", ")
}
