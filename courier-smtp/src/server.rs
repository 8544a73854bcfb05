use std::{net::SocketAddr, sync::Arc, time::Duration};

use courier_common::{Signal, error::ListenerError, internal, timeouts::ServerTimeouts};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::broadcast};

use crate::{
    auth::Credentials,
    policy::{RecipientPolicy, SenderPolicy},
    relay::RelayTransport,
    session::{Session, SessionConfig},
    submission::SubmissionClient,
};

/// Settings for the loopback submission listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "defaults::socket")]
    pub socket: SocketAddr,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "defaults::banner")]
    pub banner: String,
    /// Advertised with `SIZE` and enforced during DATA.
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub timeouts: ServerTimeouts,
}

mod defaults {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    pub const fn socket() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 2525)
    }

    pub fn banner() -> String {
        String::from("courier")
    }

    pub const fn max_message_size() -> usize {
        10 * 1024 * 1024
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket: defaults::socket(),
            credentials: Credentials::default(),
            banner: defaults::banner(),
            max_message_size: defaults::max_message_size(),
            timeouts: ServerTimeouts::default(),
        }
    }
}

/// The relay listener, bound and ready to serve.
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    socket: SocketAddr,
    credentials: Credentials,
    session: Arc<SessionConfig>,
}

impl RelayServer {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::NotLoopback`] for any address other hosts
    /// could reach, [`ListenerError::MissingCredentials`] if the credential
    /// pair is blank, [`ListenerError::AddressInUse`] if another process
    /// holds the port, or [`ListenerError::BindFailed`] for any other bind
    /// failure.
    pub async fn bind(
        config: &RelayConfig,
        recipients: RecipientPolicy,
        senders: SenderPolicy,
        relay: Arc<dyn RelayTransport>,
    ) -> Result<Self, ListenerError> {
        if !config.socket.ip().is_loopback() {
            return Err(ListenerError::NotLoopback {
                address: config.socket.to_string(),
            });
        }

        if !config.credentials.is_configured() {
            return Err(ListenerError::MissingCredentials);
        }

        let listener = TcpListener::bind(config.socket)
            .await
            .map_err(|err| ListenerError::bind(config.socket.to_string(), err))?;
        let socket = listener
            .local_addr()
            .map_err(|err| ListenerError::bind(config.socket.to_string(), err))?;

        Ok(Self {
            listener,
            socket,
            credentials: config.credentials.clone(),
            session: Arc::new(SessionConfig {
                credentials: config.credentials.clone(),
                banner: config.banner.clone(),
                max_message_size: config.max_message_size,
                timeouts: config.timeouts.clone(),
                recipients,
                senders,
                relay,
            }),
        })
    }

    /// The bound address; differs from the configured one when port 0 was
    /// requested.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.socket
    }

    /// A client that submits to this listener with its own credentials.
    #[must_use]
    pub fn submission_client(&self, timeout: Duration) -> SubmissionClient {
        SubmissionClient::new(self.socket, self.credentials.clone(), timeout)
    }

    /// Accepts connections until `shutdown` delivers [`Signal::Shutdown`],
    /// then waits for open sessions to finish.
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept failures are logged and the
    /// listener keeps going.
    #[tracing::instrument(level = "trace", skip_all, fields(socket = %self.socket))]
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        internal!(level = INFO, "Relay listening on {}", self.socket);
        let mut sessions = Vec::new();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(
                            level = INFO,
                            "Relay listener {} received shutdown signal, finishing {} sessions ...",
                            self.socket,
                            sessions.len()
                        );
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(err) => {
                            tracing::warn!(error = %ListenerError::AcceptFailed(err), "Skipping connection");
                            continue;
                        }
                    };
                    tracing::debug!("Connection received on {} from {peer}", self.socket);

                    sessions.retain(|session: &tokio::task::JoinHandle<()>| !session.is_finished());

                    let session = Session::new(stream, peer, Arc::clone(&self.session));
                    let signal = shutdown.resubscribe();
                    sessions.push(tokio::spawn(async move {
                        if let Err(err) = session.run(signal).await {
                            if err.is_client_error() {
                                internal!(level = DEBUG, "Session ended: {err}");
                            } else {
                                internal!(level = ERROR, "Error: {err}");
                            }
                        }
                    }));
                }
            }
        }

        internal!(level = INFO, "Relay listener {} stopped", self.socket);
        Ok(())
    }
}
