//! SMTP client with support for implicit TLS and STARTTLS.

use std::{sync::Arc, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use courier_common::{incoming, outgoing};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use super::{
    error::{ClientError, Result},
    response::{Response, ResponseLine},
};

/// Longest reply line we are willing to buffer.
const MAX_LINE_LEN: u64 = 8192;

enum ClientConnection {
    Plain(BufStream<TcpStream>),
    Tls(Box<BufStream<tokio_rustls::client::TlsStream<TcpStream>>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read_line(&mut self, line: &mut Vec<u8>) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => (&mut *stream).take(MAX_LINE_LEN).read_until(b'\n', line).await?,
            Self::Tls(stream) => {
                (&mut **stream)
                    .take(MAX_LINE_LEN)
                    .read_until(b'\n', line)
                    .await?
            }
        };

        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => Ok(Self::Tls(Box::new(BufStream::new(
                tls_handshake(stream.into_inner(), domain, accept_invalid_certs).await?,
            )))),
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }
}

fn tls_config(accept_invalid_certs: bool) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    Ok(config)
}

async fn tls_handshake(
    stream: TcpStream,
    domain: &str,
    accept_invalid_certs: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(tls_config(accept_invalid_certs)?));
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))
}

/// A certificate verifier that accepts all certificates (for testing only).
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Escape lines beginning with `.` and make sure the body ends in CRLF.
fn dot_stuff(body: &str) -> String {
    let mut stuffed = String::with_capacity(body.len() + 8);

    for line in body.split_inclusive('\n') {
        if line.starts_with('.') {
            stuffed.push('.');
        }

        let content = line.trim_end_matches(['\r', '\n']);
        stuffed.push_str(content);
        stuffed.push_str("\r\n");
    }

    stuffed
}

/// An SMTP client connection.
///
/// Every reply is awaited under the configured command timeout.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    server_domain: String,
    accept_invalid_certs: bool,
    timeout: Duration,
    capabilities: Option<Response>,
}

impl std::fmt::Debug for SmtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpClient")
            .field("server_domain", &self.server_domain)
            .field(
                "tls",
                &matches!(self.connection, Some(ClientConnection::Tls(_))),
            )
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SmtpClient {
    /// Opens a plain TCP connection to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or times out.
    pub async fn connect(addr: &str, server_domain: String, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(timeout.as_secs()))??;

        Ok(Self {
            connection: Some(ClientConnection::Plain(BufStream::new(stream))),
            server_domain,
            accept_invalid_certs: false,
            timeout,
            capabilities: None,
        })
    }

    /// Opens a connection to `addr` and negotiates TLS before any SMTP is
    /// exchanged (port 465 style).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    pub async fn connect_tls(
        addr: &str,
        server_domain: String,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, async {
            let stream = TcpStream::connect(addr).await?;
            tls_handshake(stream, &server_domain, accept_invalid_certs).await
        })
        .await
        .map_err(|_| ClientError::Timeout(timeout.as_secs()))??;

        Ok(Self {
            connection: Some(ClientConnection::Tls(Box::new(BufStream::new(stream)))),
            server_domain,
            accept_invalid_certs,
            timeout,
            capabilities: None,
        })
    }

    /// Sets whether to accept invalid TLS certificates on STARTTLS.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// The most recent EHLO reply, if any.
    #[must_use]
    pub const fn capabilities(&self) -> Option<&Response> {
        self.capabilities.as_ref()
    }

    /// Reads the server greeting and requires a 220.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is not a 220.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        let response = self.read_response().await?;
        Self::expect(response, &[220])
    }

    /// Sends a raw command line and reads the reply, whatever its code.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        outgoing!("{command}");
        self.send_line(command).await?;
        self.read_response().await
    }

    /// Sends EHLO and remembers the advertised capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = Self::expect(self.command(&format!("EHLO {domain}")).await?, &[250])?;
        self.capabilities = Some(response.clone());
        Ok(response)
    }

    /// Sends STARTTLS and upgrades the connection.
    ///
    /// Capabilities are forgotten; callers must EHLO again.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS is refused or the handshake fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = Self::expect(self.command("STARTTLS").await?, &[220])?;

        let old = self
            .connection
            .take()
            .ok_or(ClientError::ConnectionClosed)?;
        self.connection = Some(
            old.upgrade_to_tls(&self.server_domain, self.accept_invalid_certs)
                .await?,
        );
        self.capabilities = None;

        Ok(response)
    }

    /// Authenticates with AUTH PLAIN (RFC 4616).
    ///
    /// # Errors
    ///
    /// Returns `AuthUnsupported` if PLAIN is not advertised, or the server's
    /// reply if the credentials are refused.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Response> {
        let offers_plain = self
            .capabilities
            .as_ref()
            .and_then(|caps| caps.advertises("AUTH"))
            .is_some_and(|mechanisms| {
                mechanisms
                    .split_whitespace()
                    .any(|m| m.eq_ignore_ascii_case("PLAIN"))
            });
        if !offers_plain {
            return Err(ClientError::AuthUnsupported);
        }

        let token = STANDARD.encode(format!("\0{username}\0{password}"));

        outgoing!("AUTH PLAIN <redacted>");
        self.send_line(&format!("AUTH PLAIN {token}")).await?;
        let response = self.read_response().await?;
        Self::expect(response, &[235])
    }

    /// Authenticates with AUTH LOGIN.
    ///
    /// # Errors
    ///
    /// Returns the server's reply if any step is refused.
    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<Response> {
        Self::expect(self.command("AUTH LOGIN").await?, &[334])?;

        outgoing!("<redacted>");
        self.send_line(&STANDARD.encode(username)).await?;
        Self::expect(self.read_response().await?, &[334])?;

        outgoing!("<redacted>");
        self.send_line(&STANDARD.encode(password)).await?;
        Self::expect(self.read_response().await?, &[235])
    }

    /// # Errors
    ///
    /// Returns the server's reply if the sender is refused.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let command = size.map_or_else(
            || format!("MAIL FROM:<{from}>"),
            |size| format!("MAIL FROM:<{from}> SIZE={size}"),
        );
        Self::expect(self.command(&command).await?, &[250])
    }

    /// # Errors
    ///
    /// Returns the server's reply if the recipient is refused.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        Self::expect(self.command(&format!("RCPT TO:<{to}>")).await?, &[250, 251])
    }

    /// Sends DATA, the dot-stuffed body and the terminating dot.
    ///
    /// # Errors
    ///
    /// Returns the server's reply if DATA or the message is refused.
    pub async fn data(&mut self, body: &str) -> Result<Response> {
        Self::expect(self.command("DATA").await?, &[354])?;

        let mut payload = dot_stuff(body);
        payload.push_str(".\r\n");

        outgoing!("<{} bytes of message data>", payload.len());
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(payload.as_bytes())
            .await?;

        Self::expect(self.read_response().await?, &[250])
    }

    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Sends QUIT. A server that hangs up without answering is fine.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn quit(&mut self) -> Result<Option<Response>> {
        match self.command("QUIT").await {
            Ok(response) => Ok(Some(response)),
            Err(ClientError::ConnectionClosed) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn expect(response: Response, codes: &[u16]) -> Result<Response> {
        if codes.contains(&response.code) {
            Ok(response)
        } else if response.is_error() {
            Err(ClientError::SmtpError {
                code: response.code,
                message: response.message(),
            })
        } else {
            Err(ClientError::UnexpectedResponse {
                code: response.code,
                message: response.message(),
            })
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(format!("{line}\r\n").as_bytes())
            .await
    }

    /// Reads a complete, possibly multi-line, reply.
    async fn read_response(&mut self) -> Result<Response> {
        let timeout = self.timeout;
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        let lines = tokio::time::timeout(timeout, async {
            let mut lines: Vec<ResponseLine> = Vec::new();
            let mut raw = Vec::new();

            loop {
                raw.clear();
                connection.read_line(&mut raw).await?;

                let text = std::str::from_utf8(&raw)?;
                if !text.ends_with('\n') {
                    return Err(ClientError::ParseError(String::from("Response line too long")));
                }

                let line = Response::parse_line(text)?;
                let last = line.is_last;
                lines.push(line);

                if last {
                    return Ok(lines);
                }
            }
        })
        .await
        .map_err(|_| ClientError::Timeout(timeout.as_secs()))??;

        let response = Response::from_lines(lines)?;
        incoming!("{response}");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing() {
        assert_eq!(dot_stuff("hello\r\n.world\n..x"), "hello\r\n..world\r\n...x\r\n");
        assert_eq!(dot_stuff(""), "");
        assert_eq!(dot_stuff("."), "..\r\n");
    }
}
