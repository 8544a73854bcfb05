//! Parsing submitted messages and composing outbound ones.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use courier_validator::domain_of;
use mailparse::{DispositionType, MailAddr, MailHeaderMap, ParsedMail};
use ulid::Ulid;

use crate::{error::ParseError, relay::OutboundMessage};

/// Host part used for generated Message-IDs when the sender has none.
const FALLBACK_ID_DOMAIN: &str = "courier.local";

/// The parts of a submitted message the relay cares about.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedMessage {
    /// Addresses from the `To` header, in order.
    pub to: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub message_id: Option<String>,
}

/// Parses a complete RFC 5322 message.
///
/// # Errors
///
/// Returns [`ParseError::Malformed`] if the headers, the `To` header or a
/// body part cannot be decoded.
pub fn parse(raw: &[u8]) -> Result<ParsedMessage, ParseError> {
    let mail = mailparse::parse_mail(raw)?;
    let headers = mail.get_headers();

    let to = match headers.get_first_header("To") {
        Some(header) => mailparse::addrparse_header(header)?
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(single) => vec![single.addr.clone()],
                MailAddr::Group(group) => group.addrs.iter().map(|s| s.addr.clone()).collect(),
            })
            .collect(),
        None => Vec::new(),
    };

    let mut message = ParsedMessage {
        to,
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        message_id: headers
            .get_first_value("Message-ID")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()),
        ..ParsedMessage::default()
    };

    collect_bodies(&mail, &mut message)?;
    Ok(message)
}

/// Walks the MIME tree, keeping the first inline `text/plain` and
/// `text/html` parts.
fn collect_bodies(part: &ParsedMail<'_>, message: &mut ParsedMessage) -> Result<(), ParseError> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_bodies(sub, message)?;
        }
        return Ok(());
    }

    if part.get_content_disposition().disposition == DispositionType::Attachment {
        return Ok(());
    }

    let slot = match part.ctype.mimetype.as_str() {
        "text/plain" => &mut message.text,
        "text/html" => &mut message.html,
        _ => return Ok(()),
    };

    if slot.is_none() {
        let body = part.get_body()?;
        *slot = Some(body.trim_end_matches(['\r', '\n']).to_string());
    }

    Ok(())
}

/// A fresh `<ulid@domain>` Message-ID for mail sent as `from`.
#[must_use]
pub fn message_id_for(from: &str) -> String {
    let domain = domain_of(from)
        .filter(|domain| !domain.is_empty())
        .unwrap_or(FALLBACK_ID_DOMAIN);
    format!("<{}@{}>", Ulid::new(), domain.trim_end_matches('>'))
}

/// Renders `message` as a complete RFC 5322 message with CRLF line endings.
///
/// Text and HTML become a `multipart/alternative`; a message with only one
/// of them is sent single-part. Bodies are base64 encoded, so the result is
/// safe for any transport regardless of line length or charset.
///
/// # Errors
///
/// Returns [`ParseError::NoRecipients`] if `message.to` is empty.
pub fn compose(message: &OutboundMessage, message_id: &str) -> Result<String, ParseError> {
    if message.to.is_empty() {
        return Err(ParseError::NoRecipients);
    }

    let mut out = String::new();
    header(&mut out, "From", &message.from);
    header(&mut out, "To", &message.to.join(", "));
    header(&mut out, "Subject", &encode_word(&message.subject));
    header(&mut out, "Date", &chrono::Utc::now().to_rfc2822());
    header(&mut out, "Message-ID", message_id);
    header(&mut out, "MIME-Version", "1.0");

    match (message.text.as_deref(), message.html.as_deref()) {
        (Some(text), Some(html)) => {
            let boundary = format!("courier-{}", Ulid::new());
            header(
                &mut out,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{boundary}\""),
            );
            out.push_str("\r\n");

            for (mimetype, body) in [("text/plain", text), ("text/html", html)] {
                out.push_str(&format!("--{boundary}\r\n"));
                leaf(&mut out, mimetype, body);
            }
            out.push_str(&format!("--{boundary}--\r\n"));
        }
        (None, Some(html)) => leaf(&mut out, "text/html", html),
        (text, None) => leaf(&mut out, "text/plain", text.unwrap_or_default()),
    }

    Ok(out)
}

fn header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(&value.replace(['\r', '\n'], " "));
    out.push_str("\r\n");
}

fn leaf(out: &mut String, mimetype: &str, body: &str) {
    header(out, "Content-Type", &format!("{mimetype}; charset=utf-8"));
    header(out, "Content-Transfer-Encoding", "base64");
    out.push_str("\r\n");

    let encoded = STANDARD.encode(body);
    for chunk in encoded.as_bytes().chunks(76) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
}

/// RFC 2047 encoded-word for non-ASCII header text.
fn encode_word(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn outbound(text: Option<&str>, html: Option<&str>) -> OutboundMessage {
        OutboundMessage {
            from: String::from("news@acme.com"),
            to: vec![String::from("a@good.com")],
            subject: String::from("Spring sale"),
            text: text.map(ToString::to_string),
            html: html.map(ToString::to_string),
            message_id: None,
        }
    }

    #[test]
    fn parse_single_part() {
        let raw = b"From: news@acme.com\r\n\
            To: \"Alice\" <alice@good.com>, bob@good.com\r\n\
            Subject: Hello\r\n\
            Message-ID: <abc@acme.com>\r\n\
            \r\n\
            Plain body\r\n";

        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.to, vec!["alice@good.com", "bob@good.com"]);
        assert_eq!(parsed.subject, "Hello");
        assert_eq!(parsed.text.as_deref(), Some("Plain body"));
        assert_eq!(parsed.html, None);
        assert_eq!(parsed.message_id.as_deref(), Some("<abc@acme.com>"));
    }

    #[test]
    fn parse_nested_multipart_skips_attachments() {
        let raw = b"To: a@good.com\r\n\
            Subject: Nested\r\n\
            Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
            \r\n\
            --outer\r\n\
            Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
            \r\n\
            --inner\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            text part\r\n\
            --inner\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>html part</p>\r\n\
            --inner--\r\n\
            --outer\r\n\
            Content-Type: text/plain\r\n\
            Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
            \r\n\
            attached\r\n\
            --outer--\r\n";

        let parsed = parse(raw).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("text part"));
        assert_eq!(parsed.html.as_deref(), Some("<p>html part</p>"));
    }

    #[test]
    fn parse_without_to() {
        let parsed = parse(b"Subject: x\r\n\r\nbody").unwrap();
        assert!(parsed.to.is_empty());
    }

    #[test]
    fn compose_alternative_is_readable_back() {
        let mut message = outbound(Some("Hi there"), Some("<b>Hi there</b>"));
        message.subject = String::from("Grüße aus Köln");

        let id = message_id_for(&message.from);
        let raw = compose(&message, &id).unwrap();
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("Subject: =?UTF-8?B?"));

        let parsed = parse(raw.as_bytes()).unwrap();
        assert_eq!(parsed.to, vec!["a@good.com"]);
        assert_eq!(parsed.subject, "Grüße aus Köln");
        assert_eq!(parsed.text.as_deref(), Some("Hi there"));
        assert_eq!(parsed.html.as_deref(), Some("<b>Hi there</b>"));
        assert_eq!(parsed.message_id, Some(id));
    }

    #[test]
    fn compose_single_part() {
        let raw = compose(&outbound(None, Some("<p>only html</p>")), "<x@acme.com>").unwrap();
        assert!(!raw.contains("multipart"));

        let parsed = parse(raw.as_bytes()).unwrap();
        assert_eq!(parsed.html.as_deref(), Some("<p>only html</p>"));
        assert_eq!(parsed.text, None);
    }

    #[test]
    fn compose_strips_header_injection() {
        let mut message = outbound(Some("body"), None);
        message.subject = String::from("Hi\r\nBcc: victim@evil.com");

        let raw = compose(&message, "<x@acme.com>").unwrap();
        assert!(!raw.contains("\r\nBcc:"));
    }

    #[test]
    fn compose_requires_recipients() {
        let mut message = outbound(Some("body"), None);
        message.to.clear();
        assert!(matches!(
            compose(&message, "<x@acme.com>"),
            Err(ParseError::NoRecipients)
        ));
    }

    #[test]
    fn message_ids_use_sender_domain() {
        let id = message_id_for("news@acme.com");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@acme.com>"));
        assert_ne!(id, message_id_for("news@acme.com"));

        assert!(message_id_for("nobody").ends_with("@courier.local>"));
    }
}
