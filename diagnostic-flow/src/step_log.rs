use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle of a single reasoning step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    #[default]
    Completed,
    Error,
}

impl StepStatus {
    /// Unknown or missing status strings count as completed
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("in_progress") => StepStatus::InProgress,
            Some("error") => StepStatus::Error,
            _ => StepStatus::Completed,
        }
    }
}

/// Body of a reasoning step: plain text or whatever structure the producer sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepContent {
    Text(String),
    Structured(Value),
}

impl StepContent {
    fn from_value(value: Option<Value>) -> Self {
        match value {
            Some(Value::String(text)) => StepContent::Text(text),
            None | Some(Value::Null) => StepContent::Text(String::new()),
            Some(other) => StepContent::Structured(other),
        }
    }

    /// Human-readable rendering, pretty-printing structured payloads
    pub fn render(&self) -> String {
        match self {
            StepContent::Text(text) => text.clone(),
            StepContent::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

/// One increment of the backend's diagnostic explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub id: String,
    pub agent: String,
    pub step_name: String,
    pub timestamp: String,
    pub status: StepStatus,
    pub content: StepContent,
    pub details: Option<Value>,
}

/// A step as the backend puts it on the wire, both in stream messages and in
/// the `reasoning_steps` array of REST responses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepPayload {
    #[serde(default, alias = "id")]
    pub step_id: Option<Value>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
}

/// Hands out fallback ids for steps the server did not label.
///
/// Ids are `local-{unix_millis}-{counter}`, so they are unique within one
/// generator and sort by creation order.
#[derive(Debug, Default)]
pub struct StepIdGenerator {
    next: AtomicU64,
}

impl StepIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let counter = self.next.fetch_add(1, Ordering::Relaxed);
        format!("local-{}-{}", Utc::now().timestamp_millis(), counter)
    }
}

impl ReasoningStep {
    /// Build a step from its wire payload, filling every missing field.
    pub fn from_payload(payload: StepPayload, ids: &StepIdGenerator) -> Self {
        let id = match payload.step_id {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => ids.next_id(),
        };

        Self {
            id,
            agent: payload
                .agent
                .filter(|agent| !agent.is_empty())
                .unwrap_or_else(|| "system".to_string()),
            step_name: payload
                .step
                .filter(|step| !step.is_empty())
                .unwrap_or_else(|| "processing".to_string()),
            timestamp: payload
                .timestamp
                .unwrap_or_else(|| Utc::now().to_rfc3339()),
            status: StepStatus::parse(payload.status.as_deref()),
            content: StepContent::from_value(payload.content),
            details: payload.details.filter(|details| !details.is_null()),
        }
    }

    /// Build a step from a loosely-typed JSON value.
    ///
    /// Objects are read as [`StepPayload`]; bare strings become completed
    /// `system` notes. Anything else yields `None`.
    pub fn from_value(value: Value, ids: &StepIdGenerator) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self {
                id: ids.next_id(),
                agent: "system".to_string(),
                step_name: "note".to_string(),
                timestamp: Utc::now().to_rfc3339(),
                status: StepStatus::Completed,
                content: StepContent::Text(text),
                details: None,
            }),
            value @ Value::Object(_) => serde_json::from_value::<StepPayload>(value)
                .ok()
                .map(|payload| Self::from_payload(payload, ids)),
            _ => None,
        }
    }

    /// `snake_case` step name as a title, e.g. `initial_analysis` -> `Initial Analysis`
    pub fn title(&self) -> String {
        self.step_name
            .split('_')
            .filter(|word| !word.is_empty())
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ")
    }
}

/// Ordered, deduplicated history of the reasoning steps of one session.
///
/// Every mutation returns a new snapshot and leaves `self` untouched. Every
/// appended step is committed, in-progress ones included, and the latest
/// in-progress step is also held as the pointer. When the pointer moves on or
/// is cleared, the step it leaves behind is settled to `Completed`, so at most
/// one step is ever in progress.
#[derive(Debug, Clone, Default)]
pub struct StepLog {
    steps: Arc<Vec<ReasoningStep>>,
    in_progress: Option<Arc<ReasoningStep>>,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step, replacing any committed entry that shares its id.
    ///
    /// An in-progress step also becomes the in-progress pointer; any other
    /// step clears it.
    pub fn append(&self, step: ReasoningStep) -> StepLog {
        let mut steps = settled(&self.steps, Some(&step.id));
        match steps.iter().position(|existing| existing.id == step.id) {
            Some(index) => steps[index] = step.clone(),
            None => steps.push(step.clone()),
        }

        let in_progress = (step.status == StepStatus::InProgress).then(|| Arc::new(step));
        StepLog {
            steps: Arc::new(steps),
            in_progress,
        }
    }

    /// Replace the in-progress pointer. The step is forced to `InProgress`.
    ///
    /// Committed steps that were still in progress under another id are
    /// settled. The pointer itself is not committed.
    pub fn with_in_progress(&self, step: Option<ReasoningStep>) -> StepLog {
        let keep = step.as_ref().map(|step| step.id.as_str());
        let steps = if self.steps.iter().any(|s| is_unsettled(s, keep)) {
            Arc::new(settled(&self.steps, keep))
        } else {
            Arc::clone(&self.steps)
        };

        StepLog {
            steps,
            in_progress: step.map(|mut step| {
                step.status = StepStatus::InProgress;
                Arc::new(step)
            }),
        }
    }

    pub fn clear_in_progress(&self) -> StepLog {
        self.with_in_progress(None)
    }

    pub fn current_in_progress(&self) -> Option<&ReasoningStep> {
        self.in_progress.as_deref()
    }

    /// Committed steps in arrival order
    pub fn steps(&self) -> &[ReasoningStep] {
        &self.steps
    }

    pub fn get(&self, id: &str) -> Option<&ReasoningStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Number of distinct step ids committed so far
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.in_progress.is_none()
    }

    /// Committed steps followed by the in-progress pointer when it was set
    /// directly and has no committed entry.
    pub fn visible(&self) -> impl Iterator<Item = &ReasoningStep> {
        let detached = self
            .in_progress
            .as_deref()
            .filter(|pointer| self.get(&pointer.id).is_none());
        self.steps.iter().chain(detached)
    }

    /// True when both snapshots share the same committed list, which means
    /// nothing was committed between them.
    pub fn same_entries(&self, other: &StepLog) -> bool {
        Arc::ptr_eq(&self.steps, &other.steps)
    }
}

fn is_unsettled(step: &ReasoningStep, keep: Option<&str>) -> bool {
    step.status == StepStatus::InProgress && keep != Some(step.id.as_str())
}

/// Copy of `steps` with every in-progress entry except `keep` marked completed
fn settled(steps: &[ReasoningStep], keep: Option<&str>) -> Vec<ReasoningStep> {
    steps
        .iter()
        .cloned()
        .map(|mut step| {
            if is_unsettled(&step, keep) {
                step.status = StepStatus::Completed;
            }
            step
        })
        .collect()
}
