use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    TabSwitch,
    WindowBlur,
    CopyPaste,
    RightClick,
    FullscreenExit,
}

impl ViolationType {
    pub fn default_severity(self) -> Severity {
        match self {
            ViolationType::TabSwitch | ViolationType::FullscreenExit => Severity::High,
            ViolationType::CopyPaste | ViolationType::WindowBlur => Severity::Medium,
            ViolationType::RightClick => Severity::Low,
        }
    }

    pub fn default_description(self) -> &'static str {
        match self {
            ViolationType::TabSwitch => "Switched away from the exam tab",
            ViolationType::WindowBlur => "Exam window lost focus",
            ViolationType::CopyPaste => "Attempted a restricted copy/paste or devtools shortcut",
            ViolationType::RightClick => "Opened the context menu",
            ViolationType::FullscreenExit => "Exited fullscreen mode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A single detected integrity breach. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub severity: Severity,
}

impl Violation {
    pub fn new(violation_type: ViolationType, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            violation_type,
            timestamp,
            description: violation_type.default_description().to_string(),
            severity: violation_type.default_severity(),
        }
    }

    pub fn with_description(
        violation_type: ViolationType,
        timestamp: DateTime<Utc>,
        description: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            violation_type,
            timestamp,
            description: description.into(),
            severity,
        }
    }
}
