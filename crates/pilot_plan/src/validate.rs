//! Declarative IR validator.
//!
//! The validator inspects the raw JSON document rather than the typed IR so
//! that procedural keys the typed model would silently drop are still seen.

use once_cell::sync::Lazy;
use pilot_core::PilotError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const STEP_KEYS: &[&str] = &[
    "step_id",
    "stepId",
    "steps",
    "dependencies",
    "depends_on",
    "dependsOn",
    "next_step",
];
const LOOP_KEYS: &[&str] = &[
    "loop",
    "for_each",
    "forEach",
    "while",
    "iterate_over",
    "iterateOver",
    "loopSteps",
    "repeat",
];
const PROCEDURAL_KEYS: &[&str] = &["goto", "then", "else", "execute", "call", "run"];

static STEP_ID_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^step[_\-]?\d+$").expect("step id pattern is valid"));
static STEP_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*step[_\-]?\d+").expect("step token pattern is valid"));

/// Why a part of the IR is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Names or addresses a step
    StepIdentifier,
    /// Explicit loop construct
    ExplicitLoop,
    /// Control-flow keyword
    ProceduralToken,
    /// `goal` missing or empty
    MissingGoal,
    /// Not shaped like an IR at all
    Malformed,
}

/// One offending field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrViolation {
    /// JSON path of the field
    pub path: String,
    /// Category
    pub kind: ViolationKind,
    /// Human-readable detail
    pub detail: String,
}

impl fmt::Display for IrViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.detail)
    }
}

/// Result of validating an IR document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Whether the IR may be compiled
    pub valid: bool,
    /// Offending fields
    pub errors: Vec<IrViolation>,
}

impl ValidationReport {
    /// Convert a failed report into an error
    ///
    /// # Errors
    ///
    /// Returns [`PilotError::Validation`] when the report is not valid
    pub fn into_result(self) -> Result<(), PilotError> {
        if self.valid {
            Ok(())
        } else {
            Err(PilotError::Validation {
                errors: self.errors.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

/// Validator for declarative IR documents
#[derive(Debug, Clone)]
pub struct IrValidator {
    /// Reject step-addressed values such as `step2` or `{{step3.x}}`
    pub check_values: bool,
    /// Require a non-empty `goal`
    pub require_goal: bool,
}

impl IrValidator {
    /// Create a validator with every check enabled
    #[must_use]
    pub fn new() -> Self {
        Self {
            check_values: true,
            require_goal: true,
        }
    }

    /// Toggle value checks
    #[must_use]
    pub fn with_value_checks(mut self, enabled: bool) -> Self {
        self.check_values = enabled;
        self
    }

    /// Validate a raw IR document
    #[must_use]
    pub fn validate(&self, ir: &Value) -> ValidationReport {
        let mut errors = Vec::new();

        match ir {
            Value::Object(map) => {
                if self.require_goal {
                    let has_goal = map
                        .get("goal")
                        .and_then(Value::as_str)
                        .is_some_and(|g| !g.trim().is_empty());
                    if !has_goal {
                        errors.push(IrViolation {
                            path: "$.goal".to_string(),
                            kind: ViolationKind::MissingGoal,
                            detail: "goal is required".to_string(),
                        });
                    }
                }
                for key in ["data_sources", "delivery_rules"] {
                    if let Some(v) = map.get(key) {
                        if !v.is_array() {
                            errors.push(IrViolation {
                                path: format!("$.{}", key),
                                kind: ViolationKind::Malformed,
                                detail: format!("{} must be a list", key),
                            });
                        }
                    }
                }
                self.walk(ir, "$", &mut errors);
            }
            _ => errors.push(IrViolation {
                path: "$".to_string(),
                kind: ViolationKind::Malformed,
                detail: "IR must be a JSON object".to_string(),
            }),
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }

    fn walk(&self, value: &Value, path: &str, errors: &mut Vec<IrViolation>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path = format!("{}.{}", path, key);
                    if let Some(kind) = forbidden_key(key) {
                        errors.push(IrViolation {
                            path: child_path.clone(),
                            kind,
                            detail: format!("'{}' is not declarative", key),
                        });
                    }
                    self.walk(child, &child_path, errors);
                }
            }
            Value::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    self.walk(child, &format!("{}[{}]", path, i), errors);
                }
            }
            Value::String(s) if self.check_values => {
                if STEP_ID_VALUE.is_match(s.trim()) {
                    errors.push(IrViolation {
                        path: path.to_string(),
                        kind: ViolationKind::StepIdentifier,
                        detail: format!("value '{}' names a step", s),
                    });
                } else if STEP_TOKEN.is_match(s) {
                    errors.push(IrViolation {
                        path: path.to_string(),
                        kind: ViolationKind::StepIdentifier,
                        detail: format!("value '{}' references a step output", s),
                    });
                }
            }
            _ => {}
        }
    }
}

impl Default for IrValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn forbidden_key(key: &str) -> Option<ViolationKind> {
    if STEP_KEYS.contains(&key) {
        Some(ViolationKind::StepIdentifier)
    } else if LOOP_KEYS.contains(&key) {
        Some(ViolationKind::ExplicitLoop)
    } else if PROCEDURAL_KEYS.contains(&key) {
        Some(ViolationKind::ProceduralToken)
    } else {
        None
    }
}
