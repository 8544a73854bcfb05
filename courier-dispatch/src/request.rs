use serde::Deserialize;

/// One message for one recipient.
///
/// Every field is optional on the wire so that an incomplete entry in a bulk
/// payload becomes a per-recipient `missing fields` result rather than
/// failing the whole request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailDraft {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
}

impl EmailDraft {
    pub fn new(to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            to: Some(to.into()),
            subject: Some(subject.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// The recipient as written, for reporting.
    pub fn recipient(&self) -> &str {
        self.to.as_deref().map_or("", str::trim)
    }
}

/// `{ emails: [{ to, subject, text, html }, ...] }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequest {
    #[serde(default)]
    pub emails: Vec<EmailDraft>,
}

/// Shared content sent to a resolved set of the tenant's contacts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRequest {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    /// Restricts the campaign to these addresses; omitted (or empty) means
    /// every reachable contact.
    #[serde(default)]
    pub emails: Option<Vec<String>>,
    /// Groups the run's log entries; generated when absent.
    #[serde(default)]
    pub campaign_id: Option<String>,
}

/// Validated message content, ready to log and send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Content {
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

impl Content {
    /// Subject plus at least one non-empty body, or nothing.
    pub fn from_parts(
        subject: Option<&str>,
        text: Option<&str>,
        html: Option<&str>,
    ) -> Option<Self> {
        let subject = subject.map(str::trim).filter(|s| !s.is_empty())?;
        let text = text.filter(|body| !body.trim().is_empty());
        let html = html.filter(|body| !body.trim().is_empty());

        if text.is_none() && html.is_none() {
            return None;
        }

        Some(Self {
            subject: subject.to_string(),
            text: text.map(str::to_string),
            html: html.map(str::to_string),
        })
    }

    /// The same content addressed to `recipient`.
    pub fn draft_for(&self, recipient: String) -> EmailDraft {
        EmailDraft {
            to: Some(recipient),
            subject: Some(self.subject.clone()),
            text: self.text.clone(),
            html: self.html.clone(),
        }
    }
}
