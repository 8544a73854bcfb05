use std::{panic::AssertUnwindSafe, sync::Arc};

use courier_common::internal;
use courier_smtp::{OutboundMessage, RelayTransport};
use courier_store::{DeliveryLogId, DeliveryLogStore, NewDeliveryLogEntry, StoreError, Transition};
use courier_validator::{AddressValidator, SelfSendShield, normalize};
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::{
    config::DispatchConfig,
    contacts::{ContactDirectory, resolve_targets},
    error::{DispatchError, Rejection, Result},
    report::{RecipientResult, Report},
    request::{BulkRequest, CampaignRequest, Content, EmailDraft},
    tenant::Tenant,
};

/// Reported for an attempt whose task panicked or was cancelled.
const INTERNAL_ERROR: &str = "internal error";

/// One recipient's worth of work.
#[derive(Debug)]
struct Job {
    tenant: Arc<Tenant>,
    campaign_id: Option<Arc<str>>,
    draft: EmailDraft,
}

/// A recipient that passed every check.
#[derive(Debug)]
struct Screened {
    recipient: String,
    content: Content,
}

type Attempt = (usize, std::thread::Result<RecipientResult>);

/// Drives per-recipient attempts: validate, log `pending`, relay, settle.
///
/// Cheap to clone; every collaborator is shared.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    validator: Arc<AddressValidator>,
    shield: Arc<SelfSendShield>,
    store: Arc<dyn DeliveryLogStore>,
    relay: Arc<dyn RelayTransport>,
    contacts: Arc<dyn ContactDirectory>,
    max_concurrency: usize,
}

impl Dispatcher {
    pub fn new(
        validator: Arc<AddressValidator>,
        shield: Arc<SelfSendShield>,
        store: Arc<dyn DeliveryLogStore>,
        relay: Arc<dyn RelayTransport>,
        contacts: Arc<dyn ContactDirectory>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            validator,
            shield,
            store,
            relay,
            contacts,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn DeliveryLogStore> {
        &self.store
    }

    /// Sends one message and waits for its outcome.
    ///
    /// A rejected recipient is an error and leaves no trace in the log. Once
    /// past validation the attempt is logged, and a relay failure comes back
    /// as a `failed` result rather than an error. The attempt runs on its own
    /// task, so dropping the returned future does not abandon it.
    ///
    /// # Errors
    ///
    /// `DispatchError::Rejected` if the draft is incomplete or the
    /// recipient fails validation, `DispatchError::Store` if the attempt
    /// could not be logged (nothing is sent in that case), and
    /// `DispatchError::Interrupted` if the attempt's task died.
    #[tracing::instrument(level = "debug", skip_all, fields(tenant = %tenant.id))]
    pub async fn send_one(
        &self,
        tenant: &Arc<Tenant>,
        draft: EmailDraft,
    ) -> Result<RecipientResult> {
        let screened = self.screen(draft).await?;

        let dispatcher = self.clone();
        let tenant = Arc::clone(tenant);
        let attempt = tokio::spawn(
            async move { dispatcher.attempt(&tenant, None, screened).await }.in_current_span(),
        );

        match attempt.await {
            Ok(result) => Ok(result?),
            Err(err) => Err(DispatchError::Interrupted(err.to_string())),
        }
    }

    /// Sends every entry independently. One entry's failure never affects
    /// another's.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(tenant = %tenant.id, emails = request.emails.len())
    )]
    pub async fn send_bulk(&self, tenant: &Arc<Tenant>, request: BulkRequest) -> Report {
        let jobs = request
            .emails
            .into_iter()
            .map(|draft| Job {
                tenant: Arc::clone(tenant),
                campaign_id: None,
                draft,
            })
            .collect();

        let report = Report::bulk(self.fan_out(jobs).await);
        internal!(
            level = INFO,
            "Bulk send for {}: {} sent, {} failed",
            tenant.id,
            report.summary.success,
            report.summary.failed
        );
        report
    }

    /// Sends shared content to the tenant's reachable contacts, or the
    /// reachable subset of `request.emails`.
    ///
    /// # Errors
    ///
    /// `DispatchError::Rejected` if the shared content is incomplete,
    /// `DispatchError::Contacts` if the contact directory fails.
    #[tracing::instrument(level = "debug", skip_all, fields(tenant = %tenant.id))]
    pub async fn send_campaign(
        &self,
        tenant: &Arc<Tenant>,
        request: CampaignRequest,
    ) -> Result<Report> {
        let CampaignRequest {
            subject,
            text,
            html,
            emails,
            campaign_id,
        } = request;

        let Some(content) =
            Content::from_parts(subject.as_deref(), text.as_deref(), html.as_deref())
        else {
            return Err(Rejection::MissingFields.into());
        };

        let contacts = self.contacts.contacts(&tenant.id).await?;
        let targets = resolve_targets(&contacts, emails.as_deref());

        let campaign_id = campaign_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map_or_else(|| ulid::Ulid::new().to_string(), str::to_string);

        if targets.is_empty() {
            internal!(
                level = INFO,
                "Campaign {campaign_id} for {} resolved no recipients",
                tenant.id
            );
            return Ok(Report::campaign(campaign_id, Vec::new()));
        }

        internal!(
            level = INFO,
            "Campaign {campaign_id} for {}: {} recipients",
            tenant.id,
            targets.len()
        );

        let shared: Arc<str> = Arc::from(campaign_id.as_str());
        let jobs = targets
            .into_iter()
            .map(|recipient| Job {
                tenant: Arc::clone(tenant),
                campaign_id: Some(Arc::clone(&shared)),
                draft: content.draft_for(recipient),
            })
            .collect();

        let report = Report::campaign(campaign_id, self.fan_out(jobs).await);
        internal!(
            level = INFO,
            "Campaign {} finished: {} sent, {} failed",
            shared,
            report.summary.success,
            report.summary.failed
        );
        Ok(report)
    }

    /// Runs every job to completion on a detached task and waits for the
    /// results, in job order.
    ///
    /// Dropping the returned future leaves the batch running; every
    /// recipient still reaches a terminal state.
    async fn fan_out(&self, jobs: Vec<Job>) -> Vec<RecipientResult> {
        let labels: Vec<String> = jobs
            .iter()
            .map(|job| job.draft.recipient().to_string())
            .collect();

        let dispatcher = self.clone();
        let batch = tokio::spawn(dispatcher.run_batch(jobs).in_current_span());

        match batch.await {
            Ok(results) => results,
            Err(err) => {
                internal!(level = ERROR, "Batch did not complete: {err}");
                labels
                    .into_iter()
                    .map(|label| RecipientResult::failed(label, None, INTERNAL_ERROR))
                    .collect()
            }
        }
    }

    /// Every job with at most `max_concurrency` in flight.
    async fn run_batch(self, jobs: Vec<Job>) -> Vec<RecipientResult> {
        let labels: Vec<String> = jobs
            .iter()
            .map(|job| job.draft.recipient().to_string())
            .collect();
        let mut slots: Vec<Option<RecipientResult>> = labels.iter().map(|_| None).collect();

        let mut pending = jobs.into_iter().enumerate();
        let mut workers: JoinSet<Attempt> = JoinSet::new();

        for (index, job) in pending.by_ref().take(self.max_concurrency) {
            self.spawn(&mut workers, index, job);
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, Ok(result))) => slots[index] = Some(result),
                Ok((index, Err(_))) => {
                    internal!(
                        level = ERROR,
                        "Delivery attempt for {} panicked",
                        labels[index]
                    );
                }
                Err(err) => {
                    internal!(level = ERROR, "Delivery attempt did not complete: {err}");
                }
            }

            if let Some((index, job)) = pending.next() {
                self.spawn(&mut workers, index, job);
            }
        }

        slots
            .into_iter()
            .zip(labels)
            .map(|(slot, label)| {
                slot.unwrap_or_else(|| RecipientResult::failed(label, None, INTERNAL_ERROR))
            })
            .collect()
    }

    fn spawn(&self, workers: &mut JoinSet<Attempt>, index: usize, job: Job) {
        let dispatcher = self.clone();
        workers.spawn(async move {
            let outcome = AssertUnwindSafe(dispatcher.process(job))
                .catch_unwind()
                .await;
            (index, outcome)
        });
    }

    /// One recipient, start to finish. Never fails: every problem becomes a
    /// `failed` result.
    async fn process(self, job: Job) -> RecipientResult {
        let label = job.draft.recipient().to_string();

        let screened = match self.screen(job.draft).await {
            Ok(screened) => screened,
            Err(rejection) => {
                internal!(level = DEBUG, "Rejected {label}: {rejection}");
                return RecipientResult::rejected(label, rejection);
            }
        };

        let recipient = screened.recipient.clone();
        match self.attempt(&job.tenant, job.campaign_id, screened).await {
            Ok(result) => result,
            Err(err) => {
                internal!(level = ERROR, "Unable to log attempt for {recipient}: {err}");
                RecipientResult::failed(recipient, None, err.to_string())
            }
        }
    }

    /// Every check that happens before anything is written.
    ///
    /// The operator-mailbox check sits between format and domain so that a
    /// protected address never costs a DNS lookup.
    async fn screen(&self, draft: EmailDraft) -> std::result::Result<Screened, Rejection> {
        let EmailDraft {
            to,
            subject,
            text,
            html,
        } = draft;

        let to = to.as_deref().map(str::trim).filter(|to| !to.is_empty());
        let content = Content::from_parts(subject.as_deref(), text.as_deref(), html.as_deref());

        let (Some(to), Some(content)) = (to, content) else {
            return Err(Rejection::MissingFields);
        };

        let recipient = normalize(to);

        if !self.validator.validate_format(&recipient) {
            return Err(Rejection::InvalidFormat);
        }

        if self.shield.protects(&recipient) {
            internal!(level = WARN, "Refusing to send to operator mailbox {recipient}");
            return Err(Rejection::OperatorMailbox);
        }

        if !self.validator.validate_domain(&recipient).await {
            return Err(Rejection::DomainNotFound);
        }

        Ok(Screened { recipient, content })
    }

    /// Logs the attempt as `pending`, relays, then settles the log entry.
    ///
    /// Only a failure to create the entry is an error; nothing is sent
    /// without one.
    async fn attempt(
        &self,
        tenant: &Tenant,
        campaign_id: Option<Arc<str>>,
        screened: Screened,
    ) -> std::result::Result<RecipientResult, StoreError> {
        let Screened { recipient, content } = screened;

        let id = self
            .store
            .create(NewDeliveryLogEntry {
                tenant_id: tenant.id.clone(),
                campaign_id: campaign_id.map(|id| id.to_string()),
                recipient: recipient.clone(),
                subject: content.subject.clone(),
                text_body: content.text.clone().unwrap_or_default(),
                html_body: content.html.clone().unwrap_or_default(),
            })
            .await?;

        let message = OutboundMessage {
            from: tenant.from.clone(),
            to: vec![recipient.clone()],
            subject: content.subject,
            text: content.text,
            html: content.html,
            message_id: None,
        };

        match self.relay.relay(&message).await {
            Ok(receipt) => {
                let message_id = id.provider_reference(&receipt.message_id);
                internal!(level = DEBUG, "Sent {id} to {recipient} as {message_id}");
                let transition = self.store.mark_sent(&id, &message_id).await;
                settle(&id, transition);
                Ok(RecipientResult::sent(recipient, id, message_id))
            }
            Err(err) => {
                let detail = err.to_string();
                internal!(level = WARN, "Delivery {id} to {recipient} failed: {detail}");
                let transition = self.store.mark_failed(&id, &detail).await;
                settle(&id, transition);
                Ok(RecipientResult::failed(recipient, Some(id), detail))
            }
        }
    }
}

/// The outcome stands even if recording it fails; that only costs the log
/// its terminal state.
fn settle(id: &DeliveryLogId, transition: courier_store::Result<Transition>) {
    match transition {
        Ok(Transition::Applied) => {}
        Ok(Transition::AlreadyTerminal(status)) => {
            tracing::warn!(%id, %status, "Delivery log entry was already terminal");
        }
        Err(err) => {
            tracing::warn!(%id, error = %err, "Unable to record delivery outcome");
        }
    }
}
