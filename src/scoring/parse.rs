//! Strict validation of the model's `<result>` block.
//!
//! The model may write free-form reasoning before the block; only the last
//! `<result>…</result>` counts. Inside it every field must appear exactly
//! once, nothing else may appear, flags must be `true`/`false` and the score
//! must be a number in `[0, 10]`. Anything else is a [`ValidationError`].

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static RESULT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<result\b[^>]*>(.*?)</result\s*>").expect("valid regex"));

const FIELDS: [&str; 5] = [
    "is_ai_generated",
    "watermark_present",
    "watermark_location",
    "score",
    "feedback",
];

// One alternative per known field, so group `i + 1` holds `FIELDS[i]`.
// Each value runs to its own closing tag; inline markup stays in the value.
static KNOWN_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives: Vec<String> = FIELDS
        .iter()
        .map(|f| format!(r"<{f}\s*>(.*?)</{f}\s*>"))
        .collect();
    Regex::new(&format!("(?is){}", alternatives.join("|"))).expect("valid regex")
});

static TAG_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<([A-Za-z_]+)\s*>(.*?)</([A-Za-z_]+)\s*>").expect("valid regex")
});

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 10.0;

/// The validated verdict for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub is_ai_generated: bool,
    pub watermark_present: bool,
    pub watermark_location: String,
    /// Rounded to one decimal.
    pub score: f64,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("no <result> block in response")]
    MissingBlock,

    #[error("missing field <{0}>")]
    MissingField(&'static str),

    #[error("unknown field <{0}>")]
    UnknownField(String),

    #[error("field <{0}> appears more than once")]
    DuplicateField(String),

    #[error("mismatched tags <{open}> and </{close}>")]
    MismatchedTag { open: String, close: String },

    #[error("unexpected text inside <result>: {0:?}")]
    StrayContent(String),

    #[error("field <{field}> is not a boolean: {value:?}")]
    NotBoolean { field: &'static str, value: String },

    #[error("score is not a number: {0:?}")]
    ScoreNotNumeric(String),

    #[error("score {0} outside [0, 10]")]
    ScoreOutOfRange(f64),
}

/// Validate the assistant text and extract a [`ScoreResult`].
pub fn parse_result(text: &str) -> Result<ScoreResult, ValidationError> {
    let block = RESULT_BLOCK
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .ok_or(ValidationError::MissingBlock)?
        .as_str();

    let mut values: HashMap<&'static str, String> = HashMap::new();
    for caps in KNOWN_FIELD.captures_iter(block) {
        let Some((name, value)) = FIELDS
            .iter()
            .enumerate()
            .find_map(|(i, f)| caps.get(i + 1).map(|m| (*f, m.as_str())))
        else {
            continue;
        };
        if values.insert(name, value.trim().to_string()).is_some() {
            return Err(ValidationError::DuplicateField(name.to_string()));
        }
    }

    let leftover = KNOWN_FIELD.replace_all(block, "");
    if let Some(caps) = TAG_PAIR.captures(&leftover) {
        let open = &caps[1];
        let close = &caps[3];
        if !open.eq_ignore_ascii_case(close) {
            return Err(ValidationError::MismatchedTag {
                open: open.to_string(),
                close: close.to_string(),
            });
        }
        return Err(ValidationError::UnknownField(open.to_string()));
    }
    let leftover = leftover.trim();
    if !leftover.is_empty() {
        return Err(ValidationError::StrayContent(
            leftover.chars().take(80).collect(),
        ));
    }

    let mut take = |field: &'static str| {
        values
            .remove(field)
            .ok_or(ValidationError::MissingField(field))
    };

    Ok(ScoreResult {
        is_ai_generated: parse_bool("is_ai_generated", take("is_ai_generated")?)?,
        watermark_present: parse_bool("watermark_present", take("watermark_present")?)?,
        watermark_location: take("watermark_location")?,
        score: parse_score(take("score")?)?,
        feedback: take("feedback")?,
    })
}

fn parse_bool(field: &'static str, value: String) -> Result<bool, ValidationError> {
    if value.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(ValidationError::NotBoolean { field, value })
    }
}

fn parse_score(value: String) -> Result<f64, ValidationError> {
    let score: f64 = value
        .parse()
        .map_err(|_| ValidationError::ScoreNotNumeric(value.clone()))?;
    if !score.is_finite() {
        return Err(ValidationError::ScoreNotNumeric(value));
    }
    if !(MIN_SCORE..=MAX_SCORE).contains(&score) {
        return Err(ValidationError::ScoreOutOfRange(score));
    }
    Ok((score * 10.0).round() / 10.0)
}
