use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{DiagnosticError, Result};
use crate::question::{ClarifyingQuestion, QuestionKind};

/// A value given in reply to one clarifying question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    /// yes/no, multiple choice and free text
    Text(String),
    /// checkbox selections
    Choices(BTreeSet<String>),
}

impl AnswerValue {
    /// Whether the value actually answers something
    pub fn is_material(&self) -> bool {
        match self {
            AnswerValue::Text(text) => !text.trim().is_empty(),
            AnswerValue::Choices(choices) => !choices.is_empty(),
        }
    }
}

/// Answers collected for the current round of questions.
///
/// A key may hold `None` when a caller explicitly cleared it; cleared and empty
/// values are never submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Answers {
    values: BTreeMap<String, Option<AnswerValue>>,
}

impl Answers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an answer after checking it fits the question's kind
    pub fn record(&mut self, question: &ClarifyingQuestion, value: AnswerValue) -> Result<()> {
        let value = check_value(question, value)?;
        self.values.insert(question.id.clone(), Some(value));
        Ok(())
    }

    /// Tick or untick one checkbox option
    pub fn toggle_choice(
        &mut self,
        question: &ClarifyingQuestion,
        option: &str,
        checked: bool,
    ) -> Result<()> {
        if !matches!(question.kind, QuestionKind::Checkbox { .. }) {
            return Err(DiagnosticError::Validation(format!(
                "Question {} is not a checkbox question",
                question.id
            )));
        }
        if !question.kind.has_option(option) {
            return Err(DiagnosticError::Validation(format!(
                "'{}' is not an option of question {}",
                option, question.id
            )));
        }

        let mut choices = match self.get(&question.id) {
            Some(AnswerValue::Choices(choices)) => choices.clone(),
            _ => BTreeSet::new(),
        };
        if checked {
            choices.insert(option.to_string());
        } else {
            choices.remove(option);
        }
        self.values
            .insert(question.id.clone(), Some(AnswerValue::Choices(choices)));
        Ok(())
    }

    pub fn clear(&mut self, question_id: &str) {
        self.values.insert(question_id.to_string(), None);
    }

    pub fn get(&self, question_id: &str) -> Option<&AnswerValue> {
        self.values.get(question_id).and_then(Option::as_ref)
    }

    /// Accept a raw `{question_id: value}` object as produced by a form.
    ///
    /// Strings and numbers become text, string arrays become checkbox
    /// choices, `null` means cleared. Anything else is a validation error.
    pub fn from_json(raw: &Value) -> Result<Self> {
        let Value::Object(entries) = raw else {
            return Err(DiagnosticError::Validation(
                "Answers must be a JSON object keyed by question id".to_string(),
            ));
        };

        let mut answers = Answers::new();
        for (id, value) in entries {
            let parsed = match value {
                Value::Null => None,
                Value::String(text) => Some(AnswerValue::Text(text.clone())),
                Value::Number(number) => Some(AnswerValue::Text(number.to_string())),
                Value::Bool(flag) => {
                    Some(AnswerValue::Text(if *flag { "yes" } else { "no" }.to_string()))
                }
                Value::Array(items) => {
                    let choices = items
                        .iter()
                        .map(|item| {
                            item.as_str().map(str::to_string).ok_or_else(|| {
                                DiagnosticError::Validation(format!(
                                    "Answer to {} contains a non-text choice",
                                    id
                                ))
                            })
                        })
                        .collect::<Result<BTreeSet<String>>>()?;
                    Some(AnswerValue::Choices(choices))
                }
                Value::Object(_) => {
                    return Err(DiagnosticError::Validation(format!(
                        "Answer to {} has an unsupported shape",
                        id
                    )));
                }
            };
            answers.values.insert(id.clone(), parsed);
        }
        Ok(answers)
    }

    /// The answers worth sending for `questions`: only materially answered
    /// questions, keyed by question id.
    ///
    /// Each answer is checked against its question's kind again, so values
    /// that bypassed [`record`](Self::record) (e.g. from [`from_json`](Self::from_json))
    /// cannot reach the backend in the wrong shape.
    pub fn payload_for(
        &self,
        questions: &[ClarifyingQuestion],
    ) -> Result<BTreeMap<String, AnswerValue>> {
        let mut payload = BTreeMap::new();
        for question in questions {
            let Some(value) = self.get(&question.id).filter(|value| value.is_material()) else {
                continue;
            };
            let value = check_value(question, value.clone())?;
            if value.is_material() {
                payload.insert(question.id.clone(), value);
            }
        }
        Ok(payload)
    }

    /// Required questions that still lack a material answer
    pub fn missing_required<'a>(
        &self,
        questions: &'a [ClarifyingQuestion],
    ) -> Vec<&'a ClarifyingQuestion> {
        questions
            .iter()
            .filter(|question| question.required)
            .filter(|question| !self.get(&question.id).is_some_and(AnswerValue::is_material))
            .collect()
    }
}

fn check_value(question: &ClarifyingQuestion, value: AnswerValue) -> Result<AnswerValue> {
    let mismatch = |expected: &str| {
        DiagnosticError::Validation(format!(
            "Question {} expects {}",
            question.id, expected
        ))
    };

    match (&question.kind, value) {
        (QuestionKind::YesNo, AnswerValue::Text(text)) => {
            let normalized = text.trim().to_lowercase();
            match normalized.as_str() {
                "yes" | "no" | "" => Ok(AnswerValue::Text(normalized)),
                _ => Err(mismatch("'yes' or 'no'")),
            }
        }
        (QuestionKind::MultipleChoice { .. }, AnswerValue::Text(text)) => {
            if text.is_empty() || question.kind.has_option(&text) {
                Ok(AnswerValue::Text(text))
            } else {
                Err(mismatch("one of its listed options"))
            }
        }
        (QuestionKind::Checkbox { .. }, AnswerValue::Choices(choices)) => {
            if choices.iter().all(|choice| question.kind.has_option(choice)) {
                Ok(AnswerValue::Choices(choices))
            } else {
                Err(mismatch("only its listed options"))
            }
        }
        (QuestionKind::Text { .. }, AnswerValue::Text(text)) => Ok(AnswerValue::Text(text)),
        (QuestionKind::Checkbox { .. }, AnswerValue::Text(_)) => Err(mismatch("a set of choices")),
        (_, AnswerValue::Choices(_)) => Err(mismatch("a single text answer")),
    }
}
