//! Splitting compound instructions into dependent steps.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use herald_core::types::Parameters;
use herald_router::llm::extract_delimited;
use herald_router::{RuleMatcher, TextGenerator};
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::CoordinatorError;
use crate::types::SubTask;

pub const DECOMPOSE_SYSTEM_HINT: &str = "You split multi-step commands for a personal assistant \
into atomic steps. Reply with a JSON array and nothing else: \
[{\"action\": string, \"target\": string, \"parameters\": object, \"depends_on\": index of an earlier step or null}]. \
Parameters may reference earlier results as {{step-N.field}}.";

/// Sequential connectors: the right-hand clause depends on the left one.
static SEQUENTIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*;\s*|\s*,?\s*\b(?:and\s+then|then|after\s+that|afterwards)\b\s*,?\s*")
        .expect("Invalid sequential connector regex")
});

static CONJUNCTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*,?\s+and\s+").expect("Invalid conjunction regex"));

static BACK_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:it|them|that|this)\b").expect("Invalid back-reference regex")
});

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    text: String,
    /// Whether the clause depends on the one before it.
    sequential: bool,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    action: String,
    target: String,
    #[serde(default)]
    parameters: Parameters,
    #[serde(default)]
    depends_on: Option<usize>,
}

/// Turns command text into an ordered list of [`SubTask`]s.
///
/// Tries the text generator first (when configured) and falls back to a
/// connector-based splitter whose clauses are classified by the
/// [`RuleMatcher`].
pub struct Decomposer {
    generator: Option<Arc<dyn TextGenerator>>,
    rules: RuleMatcher,
    timeout: Duration,
}

impl Decomposer {
    pub fn new(rules: RuleMatcher, timeout: Duration) -> Self {
        Self {
            generator: None,
            rules,
            timeout,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Whether `text` holds more than one actionable clause.
    pub fn is_compound(&self, text: &str) -> bool {
        self.split(text).len() > 1
    }

    pub async fn decompose(&self, text: &str) -> Result<Vec<SubTask>, CoordinatorError> {
        if text.trim().is_empty() {
            return Err(CoordinatorError::Decomposition("empty command".into()));
        }
        if let Some(steps) = self.decompose_with_generator(text).await {
            info!(steps = steps.len(), "Command decomposed by generator");
            return Ok(steps);
        }
        let steps = self.decompose_with_rules(text);
        info!(steps = steps.len(), "Command decomposed by rules");
        Ok(steps)
    }

    /// Connector-based decomposition. Never empty for non-blank text.
    pub fn decompose_with_rules(&self, text: &str) -> Vec<SubTask> {
        let clauses = self.split(text);
        let classified: Vec<_> = clauses
            .iter()
            .map(|c| self.rules.classify(&c.text))
            .collect();

        let mut steps = Vec::with_capacity(clauses.len());
        for (i, (clause, fields)) in clauses.iter().zip(&classified).enumerate() {
            let mut target = fields.target.clone();
            if target == "unknown" {
                // "find the report, then email it": borrow the nearest
                // clause's target, looking ahead first.
                if let Some(other) = classified[i + 1..]
                    .iter()
                    .chain(classified[..i].iter().rev())
                    .find(|f| f.target != "unknown")
                {
                    target = other.target.clone();
                }
            }
            let mut step = SubTask::new(
                step_id(i),
                fields.action.clone(),
                target,
                fields.parameters.clone(),
            );
            if i > 0 && clause.sequential {
                step = step.depending_on(step_id(i - 1));
            }
            steps.push(step);
        }
        debug!(?steps, "Rule decomposition");
        steps
    }

    fn split(&self, text: &str) -> Vec<Clause> {
        let mut clauses = Vec::new();
        for (n, part) in SEQUENTIAL.split(text).enumerate() {
            let part = part.trim().trim_end_matches(['.', '!', ',']);
            if part.is_empty() {
                continue;
            }
            // Plain "and" only separates clauses that each carry an action.
            let pieces: Vec<&str> = CONJUNCTION.split(part).map(str::trim).collect();
            let splittable = pieces.len() > 1
                && pieces
                    .iter()
                    .all(|p| !p.is_empty() && self.rules.match_action(p).is_some());
            if splittable {
                for (k, piece) in pieces.into_iter().enumerate() {
                    let sequential = if k == 0 {
                        n > 0
                    } else {
                        BACK_REFERENCE.is_match(piece)
                    };
                    clauses.push(Clause {
                        text: piece.to_string(),
                        sequential,
                    });
                }
            } else {
                clauses.push(Clause {
                    text: part.to_string(),
                    sequential: n > 0,
                });
            }
        }
        if let Some(first) = clauses.first_mut() {
            first.sequential = false;
        }
        clauses
    }

    async fn decompose_with_generator(&self, text: &str) -> Option<Vec<SubTask>> {
        let generator = self.generator.as_ref()?;
        let prompt = format!("Decompose this command into steps.\nCommand: {}", text);
        let response = match tokio::time::timeout(
            self.timeout,
            generator.generate(&prompt, DECOMPOSE_SYSTEM_HINT),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(error = %e, "Generator decomposition failed, using rules");
                return None;
            }
            Err(_) => {
                warn!("Generator decomposition timed out, using rules");
                return None;
            }
        };
        match parse_steps(&response) {
            Ok(steps) => Some(steps),
            Err(reason) => {
                warn!(%reason, "Generator returned unusable steps, using rules");
                None
            }
        }
    }
}

fn step_id(index: usize) -> String {
    format!("step-{}", index + 1)
}

/// Parse and validate a JSON step list.
fn parse_steps(text: &str) -> Result<Vec<SubTask>, String> {
    let json = extract_delimited(text, '[', ']').ok_or("no JSON array in response")?;
    let raw: Vec<RawStep> = serde_json::from_str(json).map_err(|e| e.to_string())?;
    if raw.is_empty() {
        return Err("empty step list".into());
    }
    raw.into_iter()
        .enumerate()
        .map(|(i, step)| {
            let action = step.action.trim().to_lowercase();
            if action.is_empty() {
                return Err(format!("step {} has no action", i + 1));
            }
            let mut task = SubTask::new(
                step_id(i),
                action,
                RuleMatcher::canonical_target(&step.target),
                step.parameters,
            );
            if let Some(dep) = step.depends_on {
                if dep >= i {
                    return Err(format!("step {} depends on a later step", i + 1));
                }
                task = task.depending_on(step_id(dep));
            }
            Ok(task)
        })
        .collect()
}
