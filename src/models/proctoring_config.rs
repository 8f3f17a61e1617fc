use serde::{Deserialize, Serialize};

/// Per-test integrity settings, read-only for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProctoringConfig {
    #[serde(default)]
    pub is_proctored: bool,
    #[serde(default)]
    pub enable_webcam: bool,
    #[serde(default)]
    pub enable_screen_capture: bool,
    /// 0 means unlimited.
    #[serde(default)]
    pub tab_switch_limit: u32,
    #[serde(default = "default_auto_block")]
    pub auto_block_on_limit: bool,
}

fn default_auto_block() -> bool {
    true
}

impl Default for ProctoringConfig {
    fn default() -> Self {
        Self {
            is_proctored: false,
            enable_webcam: false,
            enable_screen_capture: false,
            tab_switch_limit: 0,
            auto_block_on_limit: true,
        }
    }
}

impl ProctoringConfig {
    pub fn requires_consent(&self) -> bool {
        self.is_proctored
    }

    pub fn has_tab_switch_limit(&self) -> bool {
        self.tab_switch_limit > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    pub test_id: String,
    pub title: String,
    pub duration_seconds: u64,
    pub total_marks: u32,
    pub config: ProctoringConfig,
}
