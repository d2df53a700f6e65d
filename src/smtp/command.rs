//! SMTP command parsing.

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// `HELO <domain>`.
    Helo(String),
    /// `EHLO <domain>`.
    Ehlo(String),
    /// `MAIL FROM:<path> [SIZE=n]`.
    Mail {
        /// Reverse path; empty for the null sender.
        from: String,
        /// Declared message size, if given.
        size: Option<usize>,
    },
    /// `RCPT TO:<path>`.
    Rcpt(String),
    /// `DATA`.
    Data,
    /// `RSET`.
    Rset,
    /// `NOOP`.
    Noop,
    /// `QUIT`.
    Quit,
    /// `VRFY <anything>`.
    Vrfy,
    /// `AUTH <mechanism> [initial-response]`.
    Auth {
        /// Mechanism name, upper-cased.
        mechanism: String,
        /// Initial response, if sent inline.
        initial: Option<String>,
    },
    /// `STARTTLS`.
    StartTls,
    /// `HELP`.
    Help,
    /// Known verb with unusable arguments.
    Invalid(&'static str),
    /// Anything else.
    Unknown(String),
}

impl SmtpCommand {
    /// Parse one command line (terminator optional).
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" if rest.is_empty() => SmtpCommand::Invalid("HELO requires a domain"),
            "HELO" => SmtpCommand::Helo(rest.to_string()),
            "EHLO" if rest.is_empty() => SmtpCommand::Invalid("EHLO requires a domain"),
            "EHLO" => SmtpCommand::Ehlo(rest.to_string()),
            "MAIL" => match strip_keyword(rest, "FROM:") {
                Some(args) => {
                    let (from, params) = split_path(args);
                    SmtpCommand::Mail {
                        from,
                        size: size_param(params),
                    }
                }
                None => SmtpCommand::Invalid("syntax: MAIL FROM:<address>"),
            },
            "RCPT" => match strip_keyword(rest, "TO:") {
                Some(args) => {
                    let (to, _) = split_path(args);
                    if to.is_empty() {
                        SmtpCommand::Invalid("syntax: RCPT TO:<address>")
                    } else {
                        SmtpCommand::Rcpt(to)
                    }
                }
                None => SmtpCommand::Invalid("syntax: RCPT TO:<address>"),
            },
            "DATA" => SmtpCommand::Data,
            "RSET" => SmtpCommand::Rset,
            "NOOP" => SmtpCommand::Noop,
            "QUIT" => SmtpCommand::Quit,
            "VRFY" => SmtpCommand::Vrfy,
            "HELP" => SmtpCommand::Help,
            "STARTTLS" => SmtpCommand::StartTls,
            "AUTH" => {
                let mut parts = rest.split_whitespace();
                match parts.next() {
                    Some(mechanism) => SmtpCommand::Auth {
                        mechanism: mechanism.to_ascii_uppercase(),
                        initial: parts.next().map(str::to_string),
                    },
                    None => SmtpCommand::Invalid("AUTH requires a mechanism"),
                }
            }
            _ => SmtpCommand::Unknown(verb.to_string()),
        }
    }
}

fn strip_keyword<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let head = args.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(args[keyword.len()..].trim_start())
    } else {
        None
    }
}

/// Split `<path> params...` into the bare address and the parameter text.
fn split_path(args: &str) -> (String, &str) {
    if let Some(inner) = args.strip_prefix('<') {
        match inner.split_once('>') {
            Some((path, params)) => (path.trim().to_string(), params.trim()),
            None => (inner.trim().to_string(), ""),
        }
    } else {
        match args.split_once(char::is_whitespace) {
            Some((path, params)) => (path.to_string(), params.trim()),
            None => (args.to_string(), ""),
        }
    }
}

fn size_param(params: &str) -> Option<usize> {
    params.split_whitespace().find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.eq_ignore_ascii_case("SIZE") {
            value.parse().ok()
        } else {
            None
        }
    })
}
