//! Clarifying questions, normalized from whatever the backend sent.
//!
//! The backend emits questions as bare strings, partial objects, or junk. Every
//! input maps to a well-formed [`ClarifyingQuestion`] so callers always have
//! something to render and answer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

pub const FALLBACK_QUESTION_TEXT: &str = "Question text not available";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub value: String,
    pub label: String,
}

/// What kind of answer a question takes, with only the data that kind needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionKind {
    YesNo,
    MultipleChoice { options: Vec<ChoiceOption> },
    Checkbox { options: Vec<ChoiceOption> },
    Text { placeholder: Option<String> },
}

impl QuestionKind {
    pub fn options(&self) -> &[ChoiceOption] {
        match self {
            QuestionKind::MultipleChoice { options } | QuestionKind::Checkbox { options } => {
                options
            }
            QuestionKind::YesNo | QuestionKind::Text { .. } => &[],
        }
    }

    pub fn has_option(&self, value: &str) -> bool {
        self.options().iter().any(|option| option.value == value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarifyingQuestion {
    pub id: String,
    pub text: String,
    pub kind: QuestionKind,
    pub required: bool,
    pub description: Option<String>,
    pub priority: Option<u32>,
    pub related_disease: Option<String>,
}

impl ClarifyingQuestion {
    fn placeholder(index: usize) -> Self {
        Self {
            id: default_id(index),
            text: FALLBACK_QUESTION_TEXT.to_string(),
            kind: QuestionKind::YesNo,
            required: true,
            description: None,
            priority: None,
            related_disease: None,
        }
    }
}

/// Normalize a list of raw questions. Never fails.
///
/// Ids are unique within the result: a question whose id is already taken
/// falls back to its positional id, suffixed if that is taken too.
pub fn normalize_questions(raw: &[Value]) -> Vec<ClarifyingQuestion> {
    let mut seen = HashSet::new();
    raw.iter()
        .enumerate()
        .map(|(index, question)| {
            let mut question = normalize_question(index, question);
            if !seen.insert(question.id.clone()) {
                let id = unused_id(&seen, index);
                debug!(duplicate = %question.id, question_id = %id, "Renaming duplicate question id");
                seen.insert(id.clone());
                question.id = id;
            }
            question
        })
        .collect()
}

fn unused_id(seen: &HashSet<String>, index: usize) -> String {
    let positional = default_id(index);
    if !seen.contains(&positional) {
        return positional;
    }
    (2..)
        .map(|n| format!("{}-{}", positional, n))
        .find(|candidate| !seen.contains(candidate))
        .unwrap_or(positional)
}

/// Normalize the `clarifying_questions` field of a response, which may not
/// even be an array.
pub fn normalize_question_list(raw: &Value) -> Vec<ClarifyingQuestion> {
    match raw {
        Value::Array(items) => normalize_questions(items),
        Value::Null => Vec::new(),
        other => {
            warn!("Clarifying questions are not an array: {}", other);
            Vec::new()
        }
    }
}

/// Normalize one raw question found at `index` in its list.
pub fn normalize_question(index: usize, raw: &Value) -> ClarifyingQuestion {
    match raw {
        Value::String(text) if !text.trim().is_empty() => ClarifyingQuestion {
            text: text.trim().to_string(),
            ..ClarifyingQuestion::placeholder(index)
        },
        Value::Object(fields) => from_object(index, fields),
        other => {
            debug!(index, "Replacing malformed question with placeholder: {}", other);
            ClarifyingQuestion::placeholder(index)
        }
    }
}

fn from_object(index: usize, fields: &Map<String, Value>) -> ClarifyingQuestion {
    let id = fields
        .get("id")
        .and_then(id_string)
        .unwrap_or_else(|| default_id(index));

    let text = ["question_text", "question", "text"]
        .iter()
        .find_map(|key| non_empty_str(fields.get(*key)))
        .unwrap_or_else(|| FALLBACK_QUESTION_TEXT.to_string());

    let options = fields.get("options").map(parse_options).unwrap_or_default();

    let kind = match fields.get("type").and_then(Value::as_str) {
        Some("multiple_choice") | Some("checkbox") if options.is_empty() => {
            debug!(question_id = %id, "Choice question without options, asking as free text");
            QuestionKind::Text { placeholder: None }
        }
        Some("multiple_choice") => QuestionKind::MultipleChoice { options },
        Some("checkbox") => QuestionKind::Checkbox { options },
        Some("text") => QuestionKind::Text {
            placeholder: non_empty_str(fields.get("placeholder")),
        },
        _ => QuestionKind::YesNo,
    };

    ClarifyingQuestion {
        id,
        text,
        kind,
        required: fields
            .get("required")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        description: non_empty_str(fields.get("description")),
        priority: fields
            .get("priority")
            .and_then(Value::as_u64)
            .and_then(|priority| u32::try_from(priority).ok()),
        related_disease: non_empty_str(fields.get("related_disease")),
    }
}

fn parse_options(raw: &Value) -> Vec<ChoiceOption> {
    let Value::Array(items) = raw else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(option) => {
                let value = option.get("value").and_then(id_string);
                let label = non_empty_str(option.get("label"));
                match (value, label) {
                    (Some(value), Some(label)) => Some(ChoiceOption { value, label }),
                    (Some(value), None) => Some(ChoiceOption {
                        label: value.clone(),
                        value,
                    }),
                    (None, Some(label)) => Some(ChoiceOption {
                        value: label.clone(),
                        label,
                    }),
                    (None, None) => None,
                }
            }
            other => id_string(other).map(|value| ChoiceOption {
                label: value.clone(),
                value,
            }),
        })
        .collect()
}

fn default_id(index: usize) -> String {
    format!("q{}", index + 1)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
