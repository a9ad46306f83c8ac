//! Identifiers for PILOT entities.
//!
//! Workflow and execution ids are UUIDs. Step ids are the short names the
//! compiler assigns (`step1`, `step3_send`) and are unique within one graph.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::str::FromStr;
use uuid::Uuid;

/// Execution identifier - identifies a single run of a compiled workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Create a new random ExecutionId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Key of the lock that serializes resumes of this execution
    #[must_use]
    pub fn resume_lock_key(&self) -> String {
        format!("execution:{}:resume", self.0)
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Workflow identifier - identifies a compiled, persisted workflow (an "agent")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Create a new random WorkflowId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Step identifier - names a node of the step graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Create a step id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Step id for the n-th compiled step (1-based)
    #[must_use]
    pub fn numbered(n: usize) -> Self {
        Self(format!("step{}", n))
    }

    /// Get as str
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Child id namespaced under this step (`{self}_{child}`)
    #[must_use]
    pub fn child(&self, child: &str) -> Self {
        Self(format!("{}_{}", self.0, child))
    }

    /// Whether this id is already namespaced under `parent`
    #[must_use]
    pub fn is_child_of(&self, parent: &StepId) -> bool {
        self.0.len() > parent.0.len() + 1
            && self.0.starts_with(parent.as_str())
            && self.0.as_bytes()[parent.0.len()] == b'_'
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StepId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StepId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq<str> for StepId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_id_unique() {
        let id1 = ExecutionId::new();
        let id2 = ExecutionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_execution_id_roundtrip_str() {
        let id = ExecutionId::new();
        let parsed: ExecutionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_resume_lock_key() {
        let id = ExecutionId::from_bytes([0u8; 16]);
        assert_eq!(
            id.resume_lock_key(),
            "execution:00000000-0000-0000-0000-000000000000:resume"
        );
    }

    #[test]
    fn test_workflow_id_serializes_as_plain_uuid() {
        let id = WorkflowId::from_bytes([1u8; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_step_id_numbered() {
        assert_eq!(StepId::numbered(3), "step3");
    }

    #[test]
    fn test_step_id_child() {
        let parent = StepId::new("step3");
        let child = parent.child("send");
        assert_eq!(child.as_str(), "step3_send");
        assert!(child.is_child_of(&parent));
        assert!(!parent.is_child_of(&parent));
        assert!(!StepId::new("step30").is_child_of(&parent));
    }

    #[test]
    fn test_step_id_borrow_lookup() {
        let mut set = std::collections::HashSet::new();
        set.insert(StepId::new("step1"));
        assert!(set.contains("step1"));
    }
}
