use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::models::roster::{FeedItem, RosterEntry, RosterSummary};

pub const DEFAULT_FEED_LIMIT: usize = 50;
pub const MAX_FEED_LIMIT: usize = 500;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct WarnRequest {
    #[validate(length(min = 1, max = 500))]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct FeedQuery {
    #[validate(range(min = 1, max = 500))]
    pub limit: Option<usize>,
}

impl FeedQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_FEED_LIMIT).min(MAX_FEED_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterResponse {
    pub test_id: String,
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub students: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub test_id: String,
    #[serde(flatten)]
    pub summary: RosterSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub test_id: String,
    pub violations: Vec<FeedItem>,
}
