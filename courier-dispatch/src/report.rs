use courier_store::{DeliveryLogId, DeliveryStatus};
use serde::Serialize;

use crate::error::Rejection;

/// The terminal outcome for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientResult {
    pub to: String,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Absent when the recipient was rejected before an attempt was logged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<DeliveryLogId>,
}

impl RecipientResult {
    pub fn sent(
        to: impl Into<String>,
        log_id: DeliveryLogId,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            status: DeliveryStatus::Sent,
            message_id: Some(message_id.into()),
            reason: None,
            log_id: Some(log_id),
        }
    }

    pub fn failed(
        to: impl Into<String>,
        log_id: Option<DeliveryLogId>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            status: DeliveryStatus::Failed,
            message_id: None,
            reason: Some(reason.into()),
            log_id,
        }
    }

    pub fn rejected(to: impl Into<String>, rejection: Rejection) -> Self {
        Self::failed(to, None, rejection.to_string())
    }

    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.status == DeliveryStatus::Sent
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

impl Summary {
    pub fn of(results: &[RecipientResult]) -> Self {
        let success = results.iter().filter(|result| result.is_sent()).count();

        Self {
            total: results.len(),
            success,
            failed: results.len() - success,
        }
    }
}

/// `{ success, summary: { total, success, failed }, results: [...] }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Whether the request was processed; individual failures are in
    /// `results`. For a single send it reflects that one recipient.
    pub success: bool,
    pub summary: Summary,
    pub results: Vec<RecipientResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
}

impl Report {
    pub fn single(result: RecipientResult) -> Self {
        let results = vec![result];
        Self {
            success: results.iter().all(RecipientResult::is_sent),
            summary: Summary::of(&results),
            results,
            campaign_id: None,
        }
    }

    pub fn bulk(results: Vec<RecipientResult>) -> Self {
        Self {
            success: true,
            summary: Summary::of(&results),
            results,
            campaign_id: None,
        }
    }

    pub fn campaign(campaign_id: String, results: Vec<RecipientResult>) -> Self {
        Self {
            campaign_id: Some(campaign_id),
            ..Self::bulk(results)
        }
    }
}
