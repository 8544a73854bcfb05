#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use courier_common::{Signal, error::ListenerError};
use courier_smtp::{
    Credentials, OutboundMessage, RecipientPolicy, RecordingRelay, RelayConfig, RelayError,
    RelayServer, RelayTransport, SenderPolicy, SubmissionClient,
};
use courier_validator::{AddressValidator, DnsConfig, SelfSendShield, StaticMxResolver};
use tokio::sync::broadcast;

fn policies() -> (RecipientPolicy, SenderPolicy) {
    let resolver = StaticMxResolver::default().with_domain("good.com");
    (
        RecipientPolicy::new(
            Arc::new(AddressValidator::new(
                Arc::new(resolver),
                DnsConfig::default(),
            )),
            Arc::new(SelfSendShield::new(["owner@acme.com"])),
        ),
        SenderPolicy::new("news@acme.com", ["news@acme.com"]),
    )
}

fn loopback(credentials: Credentials) -> RelayConfig {
    RelayConfig {
        socket: "127.0.0.1:0".parse().unwrap(),
        credentials,
        ..RelayConfig::default()
    }
}

fn message(to: &str) -> OutboundMessage {
    OutboundMessage {
        from: String::from("news@acme.com"),
        to: vec![to.to_string()],
        subject: String::from("Spring sale"),
        text: Some(String::from("Everything must go")),
        html: Some(String::from("<p>Everything must go</p>")),
        message_id: None,
    }
}

async fn start(relay: RecordingRelay) -> (SubmissionClient, broadcast::Sender<Signal>, tokio::task::JoinHandle<()>) {
    let (recipients, senders) = policies();
    let server = RelayServer::bind(
        &loopback(Credentials::new("engine", "pw")),
        recipients,
        senders,
        Arc::new(relay),
    )
    .await
    .unwrap();

    let client = server.submission_client(Duration::from_secs(5));
    let (shutdown, signal) = broadcast::channel(4);
    let handle = tokio::spawn(async move {
        server.serve(signal).await.unwrap();
    });

    (client, shutdown, handle)
}

#[tokio::test]
async fn submission_round_trip() {
    let relay = RecordingRelay::new();
    let (client, shutdown, handle) = start(relay.clone()).await;

    let receipt = client.relay(&message("a@good.com")).await.unwrap();

    let sent = relay.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, vec!["a@good.com"]);
    assert_eq!(sent[0].subject, "Spring sale");
    assert_eq!(sent[0].text.as_deref(), Some("Everything must go"));
    assert_eq!(sent[0].html.as_deref(), Some("<p>Everything must go</p>"));
    assert_eq!(sent[0].message_id.as_deref(), Some(receipt.message_id.as_str()));

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn submission_to_operator_mailbox_is_refused() {
    let relay = RecordingRelay::new();
    let (client, shutdown, handle) = start(relay.clone()).await;

    let err = client.relay(&message("Owner@acme.com")).await.unwrap_err();
    assert!(
        matches!(err, RelayError::Rejected { code: 550, .. }),
        "{err}"
    );
    assert!(relay.sent().is_empty());

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn submission_with_wrong_credentials_fails() {
    let relay = RecordingRelay::new();
    let (client, shutdown, handle) = start(relay.clone()).await;

    let impostor = SubmissionClient::new(
        client.address(),
        Credentials::new("engine", "guess"),
        Duration::from_secs(5),
    );
    let err = impostor.relay(&message("a@good.com")).await.unwrap_err();
    assert!(matches!(err, RelayError::Rejected { code: 535, .. }), "{err}");
    assert!(relay.sent().is_empty());

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn upstream_failure_reaches_the_submitter() {
    let relay = RecordingRelay::failing("provider said no");
    let (client, shutdown, handle) = start(relay).await;

    let err = client.relay(&message("a@good.com")).await.unwrap_err();
    assert!(err.to_string().contains("provider said no"), "{err}");
    assert!(!err.is_temporary());

    shutdown.send(Signal::Shutdown).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn port_conflict_is_reported_not_fatal() {
    let (recipients, senders) = policies();
    let first = RelayServer::bind(
        &loopback(Credentials::new("engine", "pw")),
        recipients.clone(),
        senders.clone(),
        Arc::new(RecordingRelay::new()),
    )
    .await
    .unwrap();

    let taken = RelayConfig {
        socket: first.local_addr(),
        ..loopback(Credentials::new("engine", "pw"))
    };
    let err = RelayServer::bind(&taken, recipients, senders, Arc::new(RecordingRelay::new()))
        .await
        .unwrap_err();

    assert!(err.is_address_in_use(), "{err}");
}

#[tokio::test]
async fn only_loopback_addresses_are_served() {
    for socket in ["0.0.0.0:0", "[::]:0"] {
        let (recipients, senders) = policies();
        let exposed = RelayConfig {
            socket: socket.parse().unwrap(),
            ..loopback(Credentials::new("engine", "pw"))
        };

        let err = RelayServer::bind(&exposed, recipients, senders, Arc::new(RecordingRelay::new()))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ListenerError::NotLoopback { .. }),
            "{socket}: {err}"
        );
    }

    let (recipients, senders) = policies();
    let ipv6 = RelayConfig {
        socket: "[::1]:0".parse().unwrap(),
        ..loopback(Credentials::new("engine", "pw"))
    };
    // Loopback over IPv6 is fine where the host has it.
    if let Err(err) =
        RelayServer::bind(&ipv6, recipients, senders, Arc::new(RecordingRelay::new())).await
    {
        assert!(!matches!(err, ListenerError::NotLoopback { .. }), "{err}");
    }
}

#[tokio::test]
async fn blank_credentials_are_refused() {
    for credentials in [
        Credentials::default(),
        Credentials::new("engine", ""),
        Credentials::new("  ", "pw"),
    ] {
        let (recipients, senders) = policies();
        let err = RelayServer::bind(
            &loopback(credentials),
            recipients,
            senders,
            Arc::new(RecordingRelay::new()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ListenerError::MissingCredentials), "{err}");
    }
}
