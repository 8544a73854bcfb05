//! The per-connection protocol state machine.
//!
//! Every handler here is synchronous and returns the reply to send. Work that
//! needs the network (recipient checks, relaying the message) is done by the
//! session, which feeds the result back in.

use core::fmt::{self, Display, Formatter};

use courier_common::status::Status;

use crate::{
    auth::{self, Credentials},
    command::{Command, HeloVariant},
    policy::RecipientVerdict,
};

/// Consecutive protocol errors tolerated before the connection is dropped.
const MAX_BAD_COMMANDS: u8 = 3;

const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStage {
    /// Waiting for the PLAIN response after an empty `334`.
    Plain,
    LoginUsername,
    LoginPassword { username: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Connect,
    Greeted,
    Auth(AuthStage),
    Authenticated,
    MailFrom,
    RcptTo,
    Data,
    Close,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "Connect",
            Self::Greeted => "Greeted",
            Self::Auth(_) => "Auth",
            Self::Authenticated => "Authenticated",
            Self::MailFrom => "MailFrom",
            Self::RcptTo => "RcptTo",
            Self::Data => "Data",
            Self::Close => "Close",
        })
    }
}

/// The envelope of the message currently being submitted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub sender: Option<String>,
    /// Accepted recipients only, in the order they were given.
    pub recipients: Vec<String>,
}

/// A reply to send to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub lines: Vec<String>,
    /// Close the connection once the reply is written.
    pub close: bool,
}

impl Reply {
    pub fn new(status: Status, line: impl Into<String>) -> Self {
        Self {
            status,
            lines: vec![line.into()],
            close: false,
        }
    }

    #[must_use]
    pub const fn multi(status: Status, lines: Vec<String>) -> Self {
        Self {
            status,
            lines,
            close: false,
        }
    }

    #[must_use]
    pub const fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.status.is_positive()
    }
}

/// Renders the reply in wire form, without the final CRLF.
impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        if self.lines.is_empty() {
            return write!(f, "{} ", self.status);
        }

        for (index, line) in self.lines.iter().enumerate() {
            if index == last {
                write!(f, "{} {line}", self.status)?;
            } else {
                write!(f, "{}-{line}\r\n", self.status)?;
            }
        }
        Ok(())
    }
}

/// What the session should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Reply(Reply),
    /// Assess the recipient, then call [`Protocol::recipient`].
    Verify(String),
    /// Send the reply, then read the message body.
    ReadData(Reply),
}

/// Protocol state for one connection.
#[derive(Debug)]
pub struct Protocol {
    state: State,
    envelope: Envelope,
    credentials: Credentials,
    banner: String,
    max_message_size: usize,
    authenticated_as: Option<String>,
    bad_commands: u8,
}

impl Protocol {
    pub fn new(credentials: Credentials, banner: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            state: State::Connect,
            envelope: Envelope::default(),
            credentials,
            banner: banner.into(),
            max_message_size,
            authenticated_as: None,
            bad_commands: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &State {
        &self.state
    }

    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    #[must_use]
    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    #[must_use]
    pub fn authenticated_as(&self) -> Option<&str> {
        self.authenticated_as.as_deref()
    }

    /// `true` while the next line is a SASL response rather than a command.
    #[must_use]
    pub const fn expects_auth_response(&self) -> bool {
        matches!(self.state, State::Auth(_))
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, State::Close)
    }

    #[must_use]
    pub fn greeting(&self) -> Reply {
        Reply::new(Status::ServiceReady, format!("{} ESMTP ready", self.banner))
    }

    pub fn command(&mut self, command: Command) -> Step {
        match command {
            Command::Helo(variant) => Step::Reply(self.helo(&variant)),
            Command::Auth { mechanism, initial } => {
                Step::Reply(self.auth(&mechanism, initial.as_deref()))
            }
            Command::MailFrom(sender, size) => Step::Reply(self.mail_from(sender, size)),
            Command::RcptTo(recipient) => match self.state {
                State::MailFrom | State::RcptTo => Step::Verify(recipient),
                _ => Step::Reply(self.out_of_sequence("Need MAIL before RCPT")),
            },
            Command::Data => self.data(),
            Command::Rset => {
                self.reset_transaction();
                Step::Reply(self.good(Reply::new(Status::Ok, "2.0.0 Ok")))
            }
            Command::Noop => Step::Reply(self.good(Reply::new(Status::Ok, "2.0.0 Ok"))),
            Command::Quit => {
                self.state = State::Close;
                Step::Reply(Reply::new(Status::GoodBye, "2.0.0 Bye").closing())
            }
            Command::StartTls => Step::Reply(self.bad(Reply::new(
                Status::NotImplemented,
                "5.5.1 STARTTLS not available",
            ))),
            Command::Help => Step::Reply(self.good(Reply::new(
                Status::Unknown(214),
                "2.0.0 Supported: EHLO HELO AUTH MAIL RCPT DATA RSET NOOP QUIT",
            ))),
            Command::Invalid(reason) => Step::Reply(self.bad(Reply::new(
                Status::SyntaxError,
                format!("5.5.2 Syntax error: {reason}"),
            ))),
        }
    }

    /// Answers a `RCPT TO` once its verdict is known.
    pub fn recipient(&mut self, address: String, verdict: RecipientVerdict) -> Reply {
        if !matches!(self.state, State::MailFrom | State::RcptTo) {
            return self.out_of_sequence("Need MAIL before RCPT");
        }

        let reply = match verdict {
            RecipientVerdict::Accept => {
                self.envelope.recipients.push(address);
                self.state = State::RcptTo;
                Reply::new(Status::Ok, "2.1.5 Recipient ok")
            }
            RecipientVerdict::Shielded => {
                Reply::new(Status::Error, "5.7.1 Recipient not allowed")
            }
            RecipientVerdict::InvalidFormat => {
                Reply::new(Status::Error, "5.1.3 Bad recipient address syntax")
            }
            RecipientVerdict::DomainNotFound => Reply::new(
                Status::Error,
                "5.1.2 Recipient domain does not accept mail",
            ),
        };

        self.good(reply)
    }

    /// Continues an AUTH exchange with the client's next line.
    pub fn auth_response(&mut self, line: &str) -> Reply {
        if !self.expects_auth_response() {
            return self.out_of_sequence("No authentication in progress");
        }
        let State::Auth(stage) = std::mem::replace(&mut self.state, State::Greeted) else {
            return self.out_of_sequence("No authentication in progress");
        };

        if line.trim() == "*" {
            return Reply::new(Status::InvalidParameters, "5.7.0 Authentication cancelled");
        }

        match stage {
            AuthStage::Plain => match auth::decode_plain(line) {
                Some((username, password)) => self.verify(username, &password),
                None => self.auth_failed(),
            },
            AuthStage::LoginUsername => match auth::decode_line(line) {
                Some(username) => self.prompt_password(username),
                None => self.auth_failed(),
            },
            AuthStage::LoginPassword { username } => match auth::decode_line(line) {
                Some(password) => self.verify(username, &password),
                None => self.auth_failed(),
            },
        }
    }

    /// Ends the DATA phase, handing back the envelope and starting over.
    pub fn finish_data(&mut self) -> Envelope {
        self.state = State::Authenticated;
        std::mem::take(&mut self.envelope)
    }

    /// The message overran the size limit; the transaction is abandoned.
    pub fn data_too_large(&mut self) -> Reply {
        self.finish_data();
        Reply::new(
            Status::ExceededStorage,
            "5.3.4 Message size exceeds fixed maximum message size",
        )
    }

    fn helo(&mut self, variant: &HeloVariant) -> Reply {
        if matches!(self.state, State::MailFrom | State::RcptTo) {
            self.reset_transaction();
        }
        if !matches!(self.state, State::Authenticated) {
            self.state = State::Greeted;
        }

        let reply = match variant {
            HeloVariant::Ehlo(id) => Reply::multi(
                Status::Ok,
                vec![
                    format!("{} greets {id}", self.banner),
                    format!("SIZE {}", self.max_message_size),
                    String::from("AUTH PLAIN LOGIN"),
                    String::from("ENHANCEDSTATUSCODES"),
                    String::from("8BITMIME"),
                ],
            ),
            HeloVariant::Helo(id) => Reply::new(Status::Ok, format!("{} greets {id}", self.banner)),
        };

        self.good(reply)
    }

    fn auth(&mut self, mechanism: &str, initial: Option<&str>) -> Reply {
        match self.state {
            State::Connect => return self.out_of_sequence("Send EHLO first"),
            State::Greeted => {}
            _ if self.authenticated_as.is_some() => {
                return self.out_of_sequence("Already authenticated");
            }
            _ => return self.out_of_sequence("AUTH not allowed now"),
        }

        match (mechanism, initial) {
            ("PLAIN", Some("=")) | ("PLAIN", None) => {
                self.state = State::Auth(AuthStage::Plain);
                Reply::new(Status::AuthContinue, "")
            }
            ("PLAIN", Some(response)) => match auth::decode_plain(response) {
                Some((username, password)) => self.verify(username, &password),
                None => self.auth_failed(),
            },
            ("LOGIN", None) => {
                self.state = State::Auth(AuthStage::LoginUsername);
                Reply::new(Status::AuthContinue, USERNAME_PROMPT)
            }
            ("LOGIN", Some(response)) => match auth::decode_line(response) {
                Some(username) => self.prompt_password(username),
                None => self.auth_failed(),
            },
            _ => self.bad(Reply::new(
                Status::Unknown(504),
                "5.5.4 Unrecognized authentication mechanism",
            )),
        }
    }

    fn prompt_password(&mut self, username: String) -> Reply {
        self.state = State::Auth(AuthStage::LoginPassword { username });
        Reply::new(Status::AuthContinue, PASSWORD_PROMPT)
    }

    fn verify(&mut self, username: String, password: &str) -> Reply {
        if self.credentials.matches(&username, password) {
            self.state = State::Authenticated;
            self.authenticated_as = Some(username);
            self.good(Reply::new(
                Status::AuthSuccess,
                "2.7.0 Authentication successful",
            ))
        } else {
            self.auth_failed()
        }
    }

    fn auth_failed(&mut self) -> Reply {
        self.state = State::Close;
        Reply::new(
            Status::AuthFailed,
            "5.7.8 Authentication credentials invalid",
        )
        .closing()
    }

    fn mail_from(&mut self, sender: Option<String>, size: Option<usize>) -> Reply {
        match self.state {
            State::Connect => return self.out_of_sequence("Send EHLO first"),
            State::Greeted => {
                return self.bad(Reply::new(
                    Status::AuthRequired,
                    "5.7.0 Authentication required",
                ));
            }
            State::Authenticated => {}
            _ => return self.out_of_sequence("Sender already specified"),
        }

        if size.is_some_and(|size| size > self.max_message_size) {
            return Reply::new(
                Status::ExceededStorage,
                "5.3.4 Message size exceeds fixed maximum message size",
            );
        }

        self.envelope = Envelope {
            sender,
            recipients: Vec::new(),
        };
        self.state = State::MailFrom;
        self.good(Reply::new(Status::Ok, "2.1.0 Sender ok"))
    }

    fn data(&mut self) -> Step {
        match self.state {
            State::RcptTo if !self.envelope.recipients.is_empty() => {
                self.state = State::Data;
                Step::ReadData(self.good(Reply::new(
                    Status::StartMailInput,
                    "End data with <CR><LF>.<CR><LF>",
                )))
            }
            State::MailFrom | State::RcptTo => Step::Reply(Reply::new(
                Status::TransactionFailed,
                "5.5.1 No valid recipients",
            )),
            State::Greeted => Step::Reply(self.bad(Reply::new(
                Status::AuthRequired,
                "5.7.0 Authentication required",
            ))),
            _ => Step::Reply(self.out_of_sequence("Need RCPT before DATA")),
        }
    }

    fn reset_transaction(&mut self) {
        self.envelope = Envelope::default();
        if matches!(self.state, State::MailFrom | State::RcptTo | State::Data) {
            self.state = State::Authenticated;
        }
    }

    fn out_of_sequence(&mut self, message: &str) -> Reply {
        self.bad(Reply::new(
            Status::InvalidCommandSequence,
            format!("5.5.1 {message}"),
        ))
    }

    fn good(&mut self, reply: Reply) -> Reply {
        self.bad_commands = 0;
        reply
    }

    fn bad(&mut self, reply: Reply) -> Reply {
        self.bad_commands = self.bad_commands.saturating_add(1);
        if self.bad_commands >= MAX_BAD_COMMANDS {
            self.state = State::Close;
            return Reply::new(
                Status::Unavailable,
                "4.7.0 Too many errors, closing connection",
            )
            .closing();
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn protocol() -> Protocol {
        Protocol::new(Credentials::new("courier", "secret"), "relay.test", 1024)
    }

    fn reply(step: Step) -> Reply {
        match step {
            Step::Reply(reply) | Step::ReadData(reply) => reply,
            Step::Verify(address) => panic!("unexpected verify for {address}"),
        }
    }

    fn run(protocol: &mut Protocol, line: &str) -> Reply {
        let command = Command::try_from(line).unwrap_or_else(|invalid| invalid);
        reply(protocol.command(command))
    }

    fn authenticated() -> Protocol {
        let mut protocol = protocol();
        run(&mut protocol, "EHLO client.test");
        let token = auth::encode_plain(&Credentials::new("courier", "secret"));
        let reply = run(&mut protocol, &format!("AUTH PLAIN {token}"));
        assert_eq!(reply.status, Status::AuthSuccess);
        protocol
    }

    #[test]
    fn ehlo_advertises_size_and_auth() {
        let mut protocol = protocol();
        let reply = run(&mut protocol, "EHLO client.test");

        assert_eq!(reply.status, Status::Ok);
        assert_eq!(
            reply.to_string(),
            "250-relay.test greets client.test\r\n250-SIZE 1024\r\n250-AUTH PLAIN LOGIN\r\n\
             250-ENHANCEDSTATUSCODES\r\n250 8BITMIME"
        );
        assert_eq!(protocol.state(), &State::Greeted);
    }

    #[test]
    fn mail_requires_auth() {
        let mut protocol = protocol();
        assert_eq!(
            run(&mut protocol, "MAIL FROM:<a@b.com>").status,
            Status::InvalidCommandSequence
        );

        run(&mut protocol, "EHLO client.test");
        assert_eq!(
            run(&mut protocol, "MAIL FROM:<a@b.com>").status,
            Status::AuthRequired
        );
    }

    #[test]
    fn plain_with_continuation() {
        let mut protocol = protocol();
        run(&mut protocol, "EHLO client.test");

        let reply = run(&mut protocol, "AUTH PLAIN");
        assert_eq!(reply.status, Status::AuthContinue);
        assert_eq!(reply.to_string(), "334 ");
        assert!(protocol.expects_auth_response());

        let token = auth::encode_plain(&Credentials::new("courier", "secret"));
        let reply = protocol.auth_response(&token);
        assert_eq!(reply.status, Status::AuthSuccess);
        assert_eq!(protocol.authenticated_as(), Some("courier"));
    }

    #[test]
    fn login_exchange() {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let mut protocol = protocol();
        run(&mut protocol, "EHLO client.test");

        assert_eq!(
            run(&mut protocol, "AUTH LOGIN").to_string(),
            "334 VXNlcm5hbWU6"
        );
        assert_eq!(
            protocol.auth_response(&STANDARD.encode("courier")).to_string(),
            "334 UGFzc3dvcmQ6"
        );
        assert_eq!(
            protocol.auth_response(&STANDARD.encode("secret")).status,
            Status::AuthSuccess
        );
        assert_eq!(protocol.state(), &State::Authenticated);
    }

    #[test]
    fn wrong_credentials_close_the_connection() {
        let mut protocol = protocol();
        run(&mut protocol, "EHLO client.test");

        let token = auth::encode_plain(&Credentials::new("courier", "guess"));
        let reply = run(&mut protocol, &format!("AUTH PLAIN {token}"));

        assert_eq!(reply.status, Status::AuthFailed);
        assert!(reply.close);
        assert!(protocol.is_closed());
    }

    #[test]
    fn undecodable_auth_fails_closed() {
        let mut protocol = protocol();
        run(&mut protocol, "EHLO client.test");
        let reply = run(&mut protocol, "AUTH PLAIN %%%");

        assert_eq!(reply.status, Status::AuthFailed);
        assert!(reply.close);
    }

    #[test]
    fn cancelled_auth_returns_to_greeted() {
        let mut protocol = protocol();
        run(&mut protocol, "EHLO client.test");
        run(&mut protocol, "AUTH LOGIN");

        let reply = protocol.auth_response("*");
        assert_eq!(reply.status, Status::InvalidParameters);
        assert_eq!(protocol.state(), &State::Greeted);
    }

    #[test]
    fn unknown_mechanism() {
        let mut protocol = protocol();
        run(&mut protocol, "EHLO client.test");
        assert_eq!(
            run(&mut protocol, "AUTH CRAM-MD5").status,
            Status::Unknown(504)
        );
    }

    #[test]
    fn recipients_are_independent() {
        let mut protocol = authenticated();
        run(&mut protocol, "MAIL FROM:<news@acme.com>");

        let Step::Verify(address) = protocol.command(Command::RcptTo(String::from("a@good.com")))
        else {
            panic!("expected verify");
        };
        assert_eq!(
            protocol.recipient(address, RecipientVerdict::Accept).status,
            Status::Ok
        );

        let rejected = protocol.recipient(String::from("owner@acme.com"), RecipientVerdict::Shielded);
        assert_eq!(rejected.to_string(), "550 5.7.1 Recipient not allowed");

        let rejected = protocol.recipient(String::from("bad"), RecipientVerdict::InvalidFormat);
        assert_eq!(rejected.status, Status::Error);

        assert_eq!(
            protocol.recipient(String::from("b@good.com"), RecipientVerdict::Accept).status,
            Status::Ok
        );

        assert_eq!(
            protocol.envelope().recipients,
            vec![String::from("a@good.com"), String::from("b@good.com")]
        );
    }

    #[test]
    fn data_without_recipients() {
        let mut protocol = authenticated();
        run(&mut protocol, "MAIL FROM:<news@acme.com>");
        protocol.recipient(String::from("x@nowhere.test"), RecipientVerdict::DomainNotFound);

        let reply = run(&mut protocol, "DATA");
        assert_eq!(reply.status, Status::TransactionFailed);
    }

    #[test]
    fn full_transaction_resets_envelope() {
        let mut protocol = authenticated();
        run(&mut protocol, "MAIL FROM:<news@acme.com>");
        protocol.recipient(String::from("a@good.com"), RecipientVerdict::Accept);

        let step = protocol.command(Command::Data);
        assert!(matches!(step, Step::ReadData(ref reply) if reply.status == Status::StartMailInput));
        assert_eq!(protocol.state(), &State::Data);

        let envelope = protocol.finish_data();
        assert_eq!(envelope.sender.as_deref(), Some("news@acme.com"));
        assert_eq!(envelope.recipients, vec![String::from("a@good.com")]);
        assert_eq!(protocol.state(), &State::Authenticated);
        assert_eq!(protocol.envelope(), &Envelope::default());

        // A second message on the same connection.
        assert_eq!(run(&mut protocol, "MAIL FROM:<news@acme.com>").status, Status::Ok);
    }

    #[test]
    fn declared_size_over_limit() {
        let mut protocol = authenticated();
        assert_eq!(
            run(&mut protocol, "MAIL FROM:<news@acme.com> SIZE=4096").status,
            Status::ExceededStorage
        );
        assert_eq!(protocol.state(), &State::Authenticated);
    }

    #[test]
    fn rset_clears_transaction() {
        let mut protocol = authenticated();
        run(&mut protocol, "MAIL FROM:<news@acme.com>");
        protocol.recipient(String::from("a@good.com"), RecipientVerdict::Accept);

        assert_eq!(run(&mut protocol, "RSET").status, Status::Ok);
        assert_eq!(protocol.state(), &State::Authenticated);
        assert!(protocol.envelope().recipients.is_empty());
    }

    #[test]
    fn repeated_errors_close_the_connection() {
        let mut protocol = protocol();

        assert_eq!(run(&mut protocol, "VRFY a").status, Status::SyntaxError);
        assert_eq!(run(&mut protocol, "DATA").status, Status::InvalidCommandSequence);

        let reply = run(&mut protocol, "RCPT TO:<a@b.com>");
        assert_eq!(reply.status, Status::Unavailable);
        assert!(reply.close);
        assert!(protocol.is_closed());
    }

    #[test]
    fn good_command_resets_error_count() {
        let mut protocol = protocol();

        run(&mut protocol, "VRFY a");
        run(&mut protocol, "VRFY b");
        run(&mut protocol, "NOOP");
        assert_eq!(run(&mut protocol, "VRFY c").status, Status::SyntaxError);
    }

    #[test]
    fn quit() {
        let mut protocol = protocol();
        let reply = run(&mut protocol, "QUIT");
        assert_eq!(reply.to_string(), "221 2.0.0 Bye");
        assert!(reply.close);
    }
}
