use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Lifecycle of an analysis run. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutionStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    /// Map any status label the backends emit (English or French, any case)
    /// onto the closed set. Unknown labels count as still running.
    pub fn normalize(raw: &str) -> Self {
        let s = raw.trim().to_lowercase();
        match s.as_str() {
            "running" => return ExecutionStatus::Running,
            "completed" => return ExecutionStatus::Completed,
            "failed" => return ExecutionStatus::Failed,
            _ => {}
        }

        if ["termin", "complet", "succe"].iter().any(|p| s.contains(p)) {
            ExecutionStatus::Completed
        } else if ["ech", "éch", "fail", "err"].iter().any(|p| s.contains(p)) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Running
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ExecutionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExecutionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .map(|s| ExecutionStatus::normalize(&s))
            .unwrap_or_default())
    }
}
