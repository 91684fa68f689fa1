//! Record line codec.
//!
//! A record is one line, fields separated by single ASCII spaces, terminated
//! by exactly one `\n`. The last field always absorbs the rest of the line,
//! so payloads may contain internal spaces but never a newline.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{Error, Result};

pub type JsonMap = BTreeMap<String, Value>;

fn split_seq(line: &str) -> Result<(u64, &str)> {
    let line = line.strip_suffix('\n').ok_or_else(|| {
        let msg = "line missing trailing newline (partial trailing line)";
        log::warn!("corrupt record: {msg}");
        Error::Corrupt(msg.into())
    })?;
    let (seq_str, rest) = line.split_once(' ').ok_or_else(|| {
        log::warn!("corrupt record: malformed record line: {line:?}");
        Error::Corrupt(format!("malformed record line: {line:?}"))
    })?;
    let seq: u64 = seq_str.parse().map_err(|_| {
        log::warn!("corrupt record: malformed sequence number: {seq_str:?}");
        Error::Corrupt(format!("malformed sequence number: {seq_str:?}"))
    })?;
    Ok((seq, rest))
}

/// Parses a two-field record line: `<seq> <payload>\n`.
///
/// Used by StateKeeper (payload is a JSON object, parsed separately) and
/// EventLog-mono (payload is an opaque string).
pub fn parse_record_2(line: &str) -> Result<(u64, String)> {
    let (seq, rest) = split_seq(line)?;
    Ok((seq, rest.to_string()))
}

/// Parses a three-field record line: `<seq> <tag> <payload>\n`.
///
/// Used by EventLog-multi.
pub fn parse_record_3(line: &str) -> Result<(u64, String, String)> {
    let (seq, rest) = split_seq(line)?;
    let (tag, payload) = rest.split_once(' ').ok_or_else(|| {
        log::warn!("corrupt record: event-log line missing tag field: {rest:?}");
        Error::Corrupt(format!("event-log line missing tag field: {rest:?}"))
    })?;
    Ok((seq, tag.to_string(), payload.to_string()))
}

pub fn format_record_2(seq: u64, payload: &str) -> Result<String> {
    if payload.contains('\n') {
        return Err(Error::BadArgument(
            "payload must not contain a newline".into(),
        ));
    }
    Ok(format!("{seq} {payload}\n"))
}

pub fn format_record_3(seq: u64, tag: &str, payload: &str) -> Result<String> {
    validate_label(tag)?;
    if payload.contains('\n') {
        return Err(Error::BadArgument(
            "payload must not contain a newline".into(),
        ));
    }
    Ok(format!("{seq} {tag} {payload}\n"))
}

/// Parses a StateKeeper record's payload field as a JSON object.
pub fn parse_json_map(payload: &str) -> Result<JsonMap> {
    let value: Value = serde_json::from_str(payload)?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => {
            log::warn!("corrupt record: expected a JSON object, found {other}");
            Err(Error::Corrupt(format!(
                "expected a JSON object, found {other}"
            )))
        }
    }
}

/// Serializes a StateKeeper map as compact JSON. `serde_json`'s compact
/// writer never emits a literal newline (embedded newlines in string values
/// are escaped as `\n`), so the on-disk line-per-record format is safe.
pub fn format_json_map(map: &JsonMap) -> Result<String> {
    let value: Value = Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
    Ok(serde_json::to_string(&value)?)
}

/// Validates a partition/tag label: non-empty, no `.`, no whitespace.
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::BadArgument("label must not be empty".into()));
    }
    if label.contains('.') {
        return Err(Error::BadArgument(format!(
            "label {label:?} must not contain '.'"
        )));
    }
    if label.chars().any(|c| c.is_whitespace()) {
        return Err(Error::BadArgument(format!(
            "label {label:?} must not contain whitespace"
        )));
    }
    Ok(())
}

/// Right-biased merge: every key in `delta` overwrites the same key in `base`.
pub fn merge_right_biased(base: &mut JsonMap, delta: &JsonMap) {
    for (k, v) in delta {
        base.insert(k.clone(), v.clone());
    }
}
