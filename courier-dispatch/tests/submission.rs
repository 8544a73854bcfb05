#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Dispatch routed through a real loopback relay listener.

use std::{sync::Arc, time::Duration};

use courier_common::Signal;
use courier_dispatch::{
    BulkRequest, Contact, DispatchConfig, Dispatcher, EmailDraft, Route, StaticContactDirectory,
    Tenant,
};
use courier_smtp::{
    Credentials, RecipientPolicy, RecordingRelay, RelayConfig, RelayServer, SenderPolicy,
};
use courier_store::{DeliveryLogStore, DeliveryStatus, MemoryDeliveryLog};
use courier_validator::{AddressValidator, DnsConfig, SelfSendShield, StaticMxResolver};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

fn draft(to: &str) -> EmailDraft {
    EmailDraft::new(to, "Spring sale")
        .with_text("Everything must go")
        .with_html("<p>Everything must go</p>")
}

#[tokio::test]
async fn bulk_through_the_relay_listener() {
    let validator = Arc::new(AddressValidator::new(
        Arc::new(StaticMxResolver::default().with_domain("good.com")),
        DnsConfig::default(),
    ));
    let shield = Arc::new(SelfSendShield::new(["owner@acme.com", "news@acme.com"]));
    let upstream = RecordingRelay::failing_for(["refused@good.com"]);

    let server = RelayServer::bind(
        &RelayConfig {
            socket: "127.0.0.1:0".parse().unwrap(),
            credentials: Credentials::new("engine", "pw"),
            ..RelayConfig::default()
        },
        RecipientPolicy::new(Arc::clone(&validator), Arc::clone(&shield)),
        SenderPolicy::new("news@acme.com", ["news@acme.com"]),
        Arc::new(upstream.clone()),
    )
    .await
    .unwrap();

    let submission = server.submission_client(Duration::from_secs(5));
    let (shutdown, signal) = broadcast::channel(4);
    let listener = tokio::spawn(server.serve(signal));

    let store = Arc::new(MemoryDeliveryLog::new());
    let dispatcher = Dispatcher::new(
        validator,
        shield,
        Arc::clone(&store) as _,
        Arc::new(submission),
        Arc::new(StaticContactDirectory::new().with_contact("acme", Contact::new("a@good.com"))),
        &DispatchConfig {
            max_concurrency: 2,
            route: Route::Submission,
        },
    );
    let tenant = Arc::new(Tenant::new("acme", "news@acme.com"));

    let report = dispatcher
        .send_bulk(
            &tenant,
            BulkRequest {
                emails: vec![
                    draft("a@good.com"),
                    draft("refused@good.com"),
                    draft("x@nonexistent-domain-xyz.com"),
                    draft("b@good.com"),
                ],
            },
        )
        .await;

    assert_eq!(report.summary.total, 4);
    assert_eq!(report.summary.success, 2);
    assert_eq!(report.summary.failed, 2);
    assert_eq!(report.results[2].reason.as_deref(), Some("domain not found"));

    let refused = &report.results[1];
    assert_eq!(refused.status, DeliveryStatus::Failed);
    let entry = store.get(refused.log_id.as_ref().unwrap()).await.unwrap();
    assert_eq!(entry.status, DeliveryStatus::Failed);

    // What reached the provider carries the authoritative sender and the
    // Message-ID reported back to dispatch.
    let sent = upstream.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|message| message.from == "news@acme.com"));

    let delivered = sent
        .iter()
        .find(|message| message.to == vec!["a@good.com"])
        .unwrap();
    assert_eq!(delivered.subject, "Spring sale");
    assert_eq!(delivered.text.as_deref(), Some("Everything must go"));
    assert_eq!(delivered.message_id, report.results[0].message_id);

    shutdown.send(Signal::Shutdown).unwrap();
    listener.await.unwrap().unwrap();
}
