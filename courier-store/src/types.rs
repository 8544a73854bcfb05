use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for a delivery log entry
///
/// A ULID: sortable by creation time and safe to use as a filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryLogId {
    id: ulid::Ulid,
}

impl DeliveryLogId {
    /// Parse an id from a filename like `01ARZ3NDEKTSV4RRFFQ69G5FAV.bin`
    ///
    /// Anything containing a path separator or `..` is rejected before
    /// parsing.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        filename.strip_suffix(".bin")?.parse().ok()
    }

    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    #[must_use]
    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }

    /// What a `sent` entry records when the provider reported no message
    /// id: the trimmed id if there is one, this entry's own id otherwise.
    #[must_use]
    pub fn provider_reference(&self, provider_message_id: &str) -> String {
        let reported = provider_message_id.trim();
        if reported.is_empty() {
            self.to_string()
        } else {
            reported.to_string()
        }
    }

    pub(crate) fn filename(&self) -> String {
        format!("{}.bin", self.id)
    }
}

impl std::str::FromStr for DeliveryLogId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            id: ulid::Ulid::from_string(s)?,
        })
    }
}

impl std::fmt::Display for DeliveryLogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl Serialize for DeliveryLogId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for DeliveryLogId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    /// `Sent` and `Failed` are terminal: nothing moves out of them.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        })
    }
}

/// Result of a terminal transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The entry moved from `pending` to the requested state.
    Applied,
    /// The entry was already terminal and was left untouched.
    AlreadyTerminal(DeliveryStatus),
}

impl Transition {
    #[must_use]
    pub const fn applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Everything a caller supplies when opening an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeliveryLogEntry {
    pub tenant_id: String,
    pub campaign_id: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

/// One row per recipient attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryLogEntry {
    pub id: DeliveryLogId,
    pub tenant_id: String,
    pub campaign_id: Option<String>,
    pub recipient: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryLogEntry {
    /// A fresh `pending` entry. The recipient is stored normalised.
    #[must_use]
    pub fn pending(id: DeliveryLogId, draft: NewDeliveryLogEntry) -> Self {
        let now = Utc::now();

        Self {
            id,
            tenant_id: draft.tenant_id,
            campaign_id: draft.campaign_id,
            recipient: draft.recipient.trim().to_lowercase(),
            subject: draft.subject,
            text_body: draft.text_body,
            html_body: draft.html_body,
            status: DeliveryStatus::Pending,
            provider_message_id: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_sent(&mut self, provider_message_id: &str) -> Transition {
        if self.status.is_terminal() {
            return Transition::AlreadyTerminal(self.status);
        }

        self.status = DeliveryStatus::Sent;
        self.provider_message_id = Some(self.id.provider_reference(provider_message_id));
        self.updated_at = Utc::now();
        Transition::Applied
    }

    pub fn mark_failed(&mut self, error_detail: &str) -> Transition {
        if self.status.is_terminal() {
            return Transition::AlreadyTerminal(self.status);
        }

        let detail = error_detail.trim();
        self.status = DeliveryStatus::Failed;
        self.error_detail = Some(if detail.is_empty() {
            String::from("unknown error")
        } else {
            detail.to_string()
        });
        self.updated_at = Utc::now();
        Transition::Applied
    }
}
