//! One SMTP conversation.
//!
//! Implements the receiving side of the EHLO / MAIL / RCPT / DATA cycle
//! and hands each completed payload to the [`Ingestor`]. Every message is
//! accepted; authentication is offered for client compatibility and any
//! credentials succeed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::command::SmtpCommand;
use crate::config::SmtpConfig;
use crate::ingest::{Envelope, Ingestor};
use crate::MailsinkError;

/// Longest command line accepted.
const MAX_COMMAND_LINE: usize = 4096;

/// Chunk size for reading message content.
const MAX_DATA_CHUNK: usize = 64 * 1024;

/// Protocol phase of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Waiting for HELO/EHLO.
    #[default]
    Connected,
    /// Greeted; no transaction open.
    Ready,
    /// MAIL accepted, waiting for recipients.
    MailFrom,
    /// At least one recipient accepted.
    RcptTo,
}

/// What to do after a command.
enum Flow {
    Continue,
    Close,
}

/// Outcome of reading a DATA section.
enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
}

/// Settings a session needs, copied out of [`SmtpConfig`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Name announced in greetings.
    pub domain: String,
    /// Largest accepted message in bytes.
    pub max_message_size: usize,
    /// Recipients accepted per transaction.
    pub max_recipients: usize,
    /// Idle timeout per read.
    pub timeout: Duration,
}

impl From<&SmtpConfig> for SessionSettings {
    fn from(config: &SmtpConfig) -> Self {
        Self {
            domain: config.domain.clone(),
            max_message_size: config.max_message_size,
            max_recipients: config.max_recipients,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

/// An SMTP session over any byte stream.
pub struct SmtpSession<S> {
    stream: BufReader<S>,
    peer_addr: SocketAddr,
    settings: SessionSettings,
    ingestor: Arc<Ingestor>,
    state: SessionState,
    envelope: Envelope,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<S> SmtpSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session for an accepted connection.
    pub fn new(
        stream: S,
        peer_addr: SocketAddr,
        settings: SessionSettings,
        ingestor: Arc<Ingestor>,
    ) -> Self {
        Self {
            stream: BufReader::new(stream),
            peer_addr,
            settings,
            ingestor,
            state: SessionState::Connected,
            envelope: Envelope::default(),
            shutdown: None,
        }
    }

    /// Close the session with 421 once `shutdown` becomes `true`.
    ///
    /// Only checked while waiting for the next command, so a DATA section
    /// that has started is read, stored and answered first.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Current protocol phase.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the conversation until QUIT, disconnect or timeout.
    pub async fn run(mut self) {
        debug!(peer = %self.peer_addr, "SMTP session started");
        if let Err(e) = self.converse().await {
            debug!(peer = %self.peer_addr, error = %e, "SMTP session ended");
        } else {
            debug!(peer = %self.peer_addr, "SMTP session closed");
        }
    }

    async fn converse(&mut self) -> crate::Result<()> {
        let greeting = format!("{} ESMTP mailsink ready", self.settings.domain);
        self.reply(220, &greeting).await?;

        loop {
            let Some(line) = self.next_command().await? else {
                return Ok(());
            };
            let command = SmtpCommand::parse(&line);
            if let Flow::Close = self.handle(command).await? {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, command: SmtpCommand) -> crate::Result<Flow> {
        match command {
            SmtpCommand::Ehlo(client) => {
                self.reset_transaction();
                self.state = SessionState::Ready;
                let lines = [
                    format!("{} greets {}", self.settings.domain, client),
                    "8BITMIME".to_string(),
                    "AUTH PLAIN LOGIN".to_string(),
                    format!("SIZE {}", self.settings.max_message_size),
                ];
                self.reply_multiline(250, &lines).await?;
            }
            SmtpCommand::Helo(_) => {
                self.reset_transaction();
                self.state = SessionState::Ready;
                let domain = self.settings.domain.clone();
                self.reply(250, &domain).await?;
            }
            SmtpCommand::Mail { from, size } => match self.state {
                SessionState::Connected => self.reply(503, "Send HELO/EHLO first").await?,
                SessionState::MailFrom | SessionState::RcptTo => {
                    self.reply(503, "Nested MAIL command").await?
                }
                SessionState::Ready => {
                    if size.is_some_and(|size| size > self.settings.max_message_size) {
                        self.reply(552, "Message size exceeds fixed maximum message size")
                            .await?;
                    } else {
                        debug!(peer = %self.peer_addr, from = %from, "MAIL FROM");
                        self.envelope.sender = from;
                        self.state = SessionState::MailFrom;
                        self.reply(250, "OK").await?;
                    }
                }
            },
            SmtpCommand::Rcpt(to) => match self.state {
                SessionState::MailFrom | SessionState::RcptTo => {
                    if self.envelope.recipients.len() >= self.settings.max_recipients {
                        self.reply(452, "Too many recipients").await?;
                    } else {
                        debug!(peer = %self.peer_addr, to = %to, "RCPT TO");
                        self.envelope.recipients.push(to);
                        self.state = SessionState::RcptTo;
                        self.reply(250, "OK").await?;
                    }
                }
                _ => self.reply(503, "Need MAIL command").await?,
            },
            SmtpCommand::Data => {
                if self.state != SessionState::RcptTo {
                    self.reply(503, "Need RCPT command").await?;
                } else {
                    self.reply(354, "End data with <CR><LF>.<CR><LF>").await?;
                    self.receive_data().await?;
                }
            }
            SmtpCommand::Rset => {
                self.reset_transaction();
                self.reply(250, "OK").await?;
            }
            SmtpCommand::Noop => self.reply(250, "OK").await?,
            SmtpCommand::Vrfy => {
                self.reply(252, "Cannot VRFY user, but will accept message")
                    .await?
            }
            SmtpCommand::Help => self.reply(214, "See RFC 5321").await?,
            SmtpCommand::StartTls => self.reply(502, "TLS not supported").await?,
            SmtpCommand::Auth { mechanism, initial } => self.authenticate(&mechanism, initial).await?,
            SmtpCommand::Quit => {
                self.reply(221, "Bye").await?;
                return Ok(Flow::Close);
            }
            SmtpCommand::Invalid(reason) => self.reply(501, reason).await?,
            SmtpCommand::Unknown(verb) => {
                debug!(peer = %self.peer_addr, verb = %verb, "Unknown command");
                self.reply(500, "Command not recognized").await?
            }
        }
        Ok(Flow::Continue)
    }

    async fn receive_data(&mut self) -> crate::Result<()> {
        let outcome = self.read_data().await?;
        let envelope = std::mem::take(&mut self.envelope);
        self.state = SessionState::Ready;

        let raw = match outcome {
            DataOutcome::Complete(raw) => raw,
            DataOutcome::TooLarge => {
                warn!(peer = %self.peer_addr, "Message exceeds size limit");
                return self
                    .reply(552, "Message size exceeds fixed maximum message size")
                    .await;
            }
        };

        match self.ingestor.ingest(&raw, &envelope).await {
            Ok(id) => {
                let text = format!("OK: queued as {id}");
                self.reply(250, &text).await
            }
            Err(MailsinkError::Decode(e)) => {
                let text = format!("Message rejected: {e}");
                self.reply(554, &text).await
            }
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "Failed to store message");
                self.reply(451, "Local error in processing, try again later")
                    .await
            }
        }
    }

    /// Read the message content up to the lone-dot line, undoing dot
    /// stuffing. Content past the size limit is read and discarded.
    async fn read_data(&mut self) -> crate::Result<DataOutcome> {
        let mut body = Vec::new();
        let mut too_large = false;
        let mut at_line_start = true;
        let mut chunk = Vec::new();

        loop {
            chunk.clear();
            let n = self.read_bounded(&mut chunk, MAX_DATA_CHUNK).await?;
            if n == 0 {
                return Err(MailsinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during DATA",
                )));
            }

            if at_line_start && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }

            let content = if at_line_start && chunk.starts_with(b".") {
                &chunk[1..]
            } else {
                &chunk[..]
            };
            if too_large || body.len() + content.len() > self.settings.max_message_size {
                too_large = true;
                body.clear();
            } else {
                body.extend_from_slice(content);
            }
            at_line_start = chunk.ends_with(b"\n");
        }

        if too_large {
            Ok(DataOutcome::TooLarge)
        } else {
            Ok(DataOutcome::Complete(body))
        }
    }

    async fn authenticate(&mut self, mechanism: &str, initial: Option<String>) -> crate::Result<()> {
        match mechanism {
            "PLAIN" => {
                if initial.is_none() {
                    self.reply(334, "").await?;
                    self.read_command_line().await?;
                }
            }
            "LOGIN" => {
                if initial.is_none() {
                    self.reply(334, "VXNlcm5hbWU6").await?;
                    self.read_command_line().await?;
                }
                self.reply(334, "UGFzc3dvcmQ6").await?;
                self.read_command_line().await?;
            }
            _ => return self.reply(504, "Unrecognized authentication type").await,
        }
        self.reply(235, "Authentication successful").await
    }

    fn reset_transaction(&mut self) {
        self.envelope = Envelope::default();
        if self.state != SessionState::Connected {
            self.state = SessionState::Ready;
        }
    }

    /// Next command line, or `None` at end of stream or on shutdown.
    async fn next_command(&mut self) -> crate::Result<Option<String>> {
        let Some(mut shutdown) = self.shutdown.clone() else {
            return self.read_command_line().await;
        };
        tokio::select! {
            line = self.read_command_line() => line,
            _ = shutdown_requested(&mut shutdown) => {
                debug!(peer = %self.peer_addr, "Closing session for shutdown");
                self.reply(421, "Service shutting down, closing connection").await?;
                Ok(None)
            }
        }
    }

    /// Next command line, or `None` at end of stream.
    async fn read_command_line(&mut self) -> crate::Result<Option<String>> {
        let mut line = Vec::new();
        let n = self.read_bounded(&mut line, MAX_COMMAND_LINE).await?;
        if n == 0 {
            return Ok(None);
        }
        if !line.ends_with(b"\n") {
            // Overlong line: drop the rest of it and answer as unrecognized.
            let mut rest = Vec::new();
            while !rest.ends_with(b"\n") {
                rest.clear();
                if self.read_bounded(&mut rest, MAX_COMMAND_LINE).await? == 0 {
                    return Ok(None);
                }
            }
            return Ok(Some(String::new()));
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }

    /// Read up to and including `\n`, at most `limit` bytes, with the idle
    /// timeout applied.
    async fn read_bounded(&mut self, buf: &mut Vec<u8>, limit: usize) -> crate::Result<usize> {
        let result = {
            let mut limited = (&mut self.stream).take(limit as u64);
            tokio::time::timeout(self.settings.timeout, limited.read_until(b'\n', buf)).await
        };
        match result {
            Ok(result) => Ok(result?),
            Err(_) => {
                info!(peer = %self.peer_addr, "SMTP session timed out");
                let _ = self.reply(421, "Timeout, closing connection").await;
                Err(MailsinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "idle timeout",
                )))
            }
        }
    }

    async fn reply(&mut self, code: u16, text: &str) -> crate::Result<()> {
        let line = format!("{code} {text}\r\n");
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn reply_multiline(&mut self, code: u16, lines: &[String]) -> crate::Result<()> {
        let mut out = String::new();
        for (i, text) in lines.iter().enumerate() {
            let separator = if i + 1 == lines.len() { ' ' } else { '-' };
            out.push_str(&format!("{code}{separator}{text}\r\n"));
        }
        let stream = self.stream.get_mut();
        stream.write_all(out.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}

/// Resolves once `shutdown` is `true`. Never resolves if the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::hub::{EventSink, HubEvent};
    use crate::mail::MessageRepository;
    use tokio::io::{duplex, DuplexStream};

    struct NullSink;

    impl EventSink for NullSink {
        fn publish(&self, _event: HubEvent) {}
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            domain: "mailsink.test".to_string(),
            max_message_size: 1024,
            max_recipients: 2,
            timeout: Duration::from_secs(5),
        }
    }

    async fn start() -> (Database, BufReader<DuplexStream>) {
        start_session(None).await
    }

    async fn start_session(
        shutdown: Option<watch::Receiver<bool>>,
    ) -> (Database, BufReader<DuplexStream>) {
        let db = Database::open_in_memory().await.unwrap();
        let ingestor = Arc::new(Ingestor::new(db.clone(), Arc::new(NullSink)));
        let (client, server) = duplex(64 * 1024);
        let mut session = SmtpSession::new(
            server,
            "127.0.0.1:2525".parse().unwrap(),
            settings(),
            ingestor,
        );
        if let Some(shutdown) = shutdown {
            session = session.with_shutdown(shutdown);
        }
        tokio::spawn(session.run());
        (db, BufReader::new(client))
    }

    async fn read_reply(client: &mut BufReader<DuplexStream>) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            client.read_line(&mut line).await.unwrap();
            reply.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return reply;
            }
        }
    }

    async fn send(client: &mut BufReader<DuplexStream>, line: &str) -> String {
        client.get_mut().write_all(line.as_bytes()).await.unwrap();
        read_reply(client).await
    }

    #[tokio::test]
    async fn test_full_transaction() {
        let (db, mut client) = start().await;

        assert!(read_reply(&mut client).await.starts_with("220 mailsink.test"));
        let ehlo = send(&mut client, "EHLO client\r\n").await;
        assert!(ehlo.starts_with("250-mailsink.test"));
        assert!(ehlo.contains("SIZE 1024"));

        assert!(send(&mut client, "MAIL FROM:<a@example.com>\r\n").await.starts_with("250"));
        assert!(send(&mut client, "RCPT TO:<b@example.com>\r\n").await.starts_with("250"));
        assert!(send(&mut client, "DATA\r\n").await.starts_with("354"));

        let reply = send(
            &mut client,
            "Subject: Test\r\n\r\nHello\r\n..leading dot\r\n.\r\n",
        )
        .await;
        assert!(reply.starts_with("250 OK: queued as"), "{reply}");
        assert!(send(&mut client, "QUIT\r\n").await.starts_with("221"));

        let page = MessageRepository::new(&db)
            .list(&Default::default(), Default::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        let message = &page.messages[0];
        assert_eq!(message.sender, "a@example.com");
        assert_eq!(message.recipients, vec!["b@example.com"]);
        assert_eq!(message.plain_body, "Hello\r\n.leading dot\r\n");
    }

    #[tokio::test]
    async fn test_command_order_enforced() {
        let (_db, mut client) = start().await;
        read_reply(&mut client).await;

        assert!(send(&mut client, "MAIL FROM:<a@example.com>\r\n").await.starts_with("503"));
        send(&mut client, "HELO client\r\n").await;
        assert!(send(&mut client, "RCPT TO:<b@example.com>\r\n").await.starts_with("503"));
        assert!(send(&mut client, "DATA\r\n").await.starts_with("503"));
        send(&mut client, "MAIL FROM:<a@example.com>\r\n").await;
        assert!(send(&mut client, "MAIL FROM:<a@example.com>\r\n").await.starts_with("503"));
        assert!(send(&mut client, "DATA\r\n").await.starts_with("503"));
        assert!(send(&mut client, "RSET\r\n").await.starts_with("250"));
        assert!(send(&mut client, "RCPT TO:<b@example.com>\r\n").await.starts_with("503"));
    }

    #[tokio::test]
    async fn test_recipient_limit() {
        let (_db, mut client) = start().await;
        read_reply(&mut client).await;
        send(&mut client, "EHLO client\r\n").await;
        send(&mut client, "MAIL FROM:<a@example.com>\r\n").await;

        assert!(send(&mut client, "RCPT TO:<1@example.com>\r\n").await.starts_with("250"));
        assert!(send(&mut client, "RCPT TO:<2@example.com>\r\n").await.starts_with("250"));
        assert!(send(&mut client, "RCPT TO:<3@example.com>\r\n").await.starts_with("452"));
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (db, mut client) = start().await;
        read_reply(&mut client).await;
        send(&mut client, "EHLO client\r\n").await;

        assert!(send(&mut client, "MAIL FROM:<a@example.com> SIZE=4096\r\n")
            .await
            .starts_with("552"));

        send(&mut client, "MAIL FROM:<a@example.com>\r\n").await;
        send(&mut client, "RCPT TO:<b@example.com>\r\n").await;
        send(&mut client, "DATA\r\n").await;
        let big = format!("Subject: big\r\n\r\n{}\r\n.\r\n", "x".repeat(2048));
        assert!(send(&mut client, &big).await.starts_with("552"));

        // Session remains usable.
        assert!(send(&mut client, "NOOP\r\n").await.starts_with("250"));
        assert_eq!(MessageRepository::new(&db).count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_gets_554() {
        let (_db, mut client) = start().await;
        read_reply(&mut client).await;
        send(&mut client, "EHLO client\r\n").await;
        send(&mut client, "MAIL FROM:<a@example.com>\r\n").await;
        send(&mut client, "RCPT TO:<b@example.com>\r\n").await;
        send(&mut client, "DATA\r\n").await;

        assert!(send(&mut client, ".\r\n").await.starts_with("554"));
    }

    #[tokio::test]
    async fn test_storage_failure_gets_451() {
        let (db, mut client) = start().await;
        db.close(Duration::from_millis(50)).await;

        read_reply(&mut client).await;
        send(&mut client, "EHLO client\r\n").await;
        send(&mut client, "MAIL FROM:<a@example.com>\r\n").await;
        send(&mut client, "RCPT TO:<b@example.com>\r\n").await;
        send(&mut client, "DATA\r\n").await;

        assert!(send(&mut client, "Subject: x\r\n\r\nbody\r\n.\r\n")
            .await
            .starts_with("451"));
    }

    #[tokio::test]
    async fn test_auth_accepts_anything() {
        let (_db, mut client) = start().await;
        read_reply(&mut client).await;
        send(&mut client, "EHLO client\r\n").await;

        assert!(send(&mut client, "AUTH PLAIN AGZvbwBiYXI=\r\n").await.starts_with("235"));
        assert!(send(&mut client, "AUTH LOGIN\r\n").await.starts_with("334"));
        assert!(send(&mut client, "Zm9v\r\n").await.starts_with("334"));
        assert!(send(&mut client, "YmFy\r\n").await.starts_with("235"));
        assert!(send(&mut client, "AUTH CRAM-MD5\r\n").await.starts_with("504"));
    }

    #[tokio::test]
    async fn test_unknown_and_unsupported_commands() {
        let (_db, mut client) = start().await;
        read_reply(&mut client).await;

        assert!(send(&mut client, "XYZZY\r\n").await.starts_with("500"));
        assert!(send(&mut client, "STARTTLS\r\n").await.starts_with("502"));
        assert!(send(&mut client, "VRFY bob\r\n").await.starts_with("252"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_session() {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (_db, mut client) = start_session(Some(shutdown)).await;
        read_reply(&mut client).await;
        send(&mut client, "EHLO client\r\n").await;

        shutdown_tx.send(true).unwrap();
        assert!(read_reply(&mut client).await.starts_with("421"));
    }

    #[tokio::test]
    async fn test_shutdown_during_data_still_stores_message() {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (db, mut client) = start_session(Some(shutdown)).await;
        read_reply(&mut client).await;
        send(&mut client, "EHLO client\r\n").await;
        send(&mut client, "MAIL FROM:<a@example.com>\r\n").await;
        send(&mut client, "RCPT TO:<b@example.com>\r\n").await;
        send(&mut client, "DATA\r\n").await;

        client
            .get_mut()
            .write_all(b"Subject: in flight\r\n\r\n")
            .await
            .unwrap();
        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reply = send(&mut client, "body\r\n.\r\n").await;
        assert!(reply.starts_with("250"), "{reply}");
        assert!(read_reply(&mut client).await.starts_with("421"));
        assert_eq!(MessageRepository::new(&db).count().await.unwrap(), 1);
    }
}
