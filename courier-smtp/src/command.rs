use core::fmt::{self, Display, Formatter};

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// `AUTH <mechanism> [initial-response]`. The mechanism is upper-cased.
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// `None` is the null reverse-path (`MAIL FROM:<>`). The second field is
    /// the `SIZE=` parameter, if the client declared one.
    MailFrom(Option<String>, Option<usize>),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Help,
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v @ (HeloVariant::Ehlo(id) | HeloVariant::Helo(id))) => {
                write!(fmt, "{v} {id}")
            }
            // Never echo the initial response, it carries credentials.
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::MailFrom(from, size) => {
                write!(fmt, "MAIL FROM:<{}>", from.as_deref().unwrap_or_default())?;
                if let Some(size) = size {
                    write!(fmt, " SIZE={size}")?;
                }
                Ok(())
            }
            Self::RcptTo(to) => write!(fmt, "RCPT TO:<{to}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Help => fmt.write_str("HELP"),
            Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

/// Case-insensitive prefix strip.
fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .and_then(|_| s.get(prefix.len()..))
}

/// Splits `<path> params...` into the bare path and the trailing parameters.
///
/// Angle brackets are optional, but a path that opens one must close it.
fn split_path(rest: &str) -> Result<(&str, &str), String> {
    let rest = rest.trim();

    if let Some(inner) = rest.strip_prefix('<') {
        let (path, params) = inner
            .split_once('>')
            .ok_or_else(|| format!("Unterminated path in {rest}"))?;
        Ok((path.trim(), params.trim()))
    } else {
        let (path, params) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        Ok((path, params.trim()))
    }
}

/// Extracts `SIZE=` from MAIL FROM parameters. Unknown parameters are ignored.
fn size_param(params: &str) -> Result<Option<usize>, String> {
    let mut size = None;

    for token in params.split_whitespace() {
        let (key, value) = token.split_once('=').unwrap_or((token, ""));
        if !key.eq_ignore_ascii_case("SIZE") {
            continue;
        }
        if size.is_some() {
            return Err(String::from("Duplicate parameter 'SIZE' not allowed"));
        }
        match value.parse::<usize>() {
            Ok(0) => return Err(String::from("SIZE=0 is not allowed")),
            Ok(value) => size = Some(value),
            Err(_) => return Err(format!("Invalid SIZE value: {value}")),
        }
    }

    Ok(size)
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if let Some(rest) = strip_prefix_ci(trimmed, "MAIL FROM:") {
            let (path, params) = split_path(rest).map_err(Self::Invalid)?;
            let size = size_param(params).map_err(Self::Invalid)?;

            Ok(Self::MailFrom(
                (!path.is_empty()).then(|| path.to_string()),
                size,
            ))
        } else if let Some(rest) = strip_prefix_ci(trimmed, "RCPT TO:") {
            let (path, _) = split_path(rest).map_err(Self::Invalid)?;
            if path.is_empty() {
                return Err(Self::Invalid(String::from("Empty forward-path")));
            }
            Ok(Self::RcptTo(path.to_string()))
        } else if let Some(rest) = strip_prefix_ci(trimmed, "AUTH") {
            let mut args = rest.split_whitespace();
            match (args.next(), args.next(), args.next()) {
                (Some(mechanism), initial, None) if rest.starts_with(' ') => Ok(Self::Auth {
                    mechanism: mechanism.to_ascii_uppercase(),
                    initial: initial.map(ToString::to_string),
                }),
                _ => Err(Self::Invalid(format!("Malformed AUTH command: {trimmed}"))),
            }
        } else if let Some(verb) = trimmed.get(..4)
            && (verb.eq_ignore_ascii_case("EHLO") || verb.eq_ignore_ascii_case("HELO"))
        {
            match trimmed.split_once(' ') {
                None => Err(Self::Invalid(format!("Expected hostname in {trimmed}"))),
                Some((cmd, host)) if cmd.eq_ignore_ascii_case("HELO") => {
                    Ok(Self::Helo(HeloVariant::Helo(host.trim().to_string())))
                }
                Some((_, host)) => Ok(Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))),
            }
        } else if trimmed.eq_ignore_ascii_case("DATA") {
            Ok(Self::Data)
        } else if trimmed.eq_ignore_ascii_case("RSET") {
            Ok(Self::Rset)
        } else if strip_prefix_ci(trimmed, "NOOP").is_some() {
            Ok(Self::Noop)
        } else if trimmed.eq_ignore_ascii_case("QUIT") {
            Ok(Self::Quit)
        } else if trimmed.eq_ignore_ascii_case("STARTTLS") {
            Ok(Self::StartTls)
        } else if strip_prefix_ci(trimmed, "HELP").is_some() {
            Ok(Self::Help)
        } else {
            Err(Self::Invalid(command.to_owned()))
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}
