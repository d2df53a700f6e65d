//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

use mailsink::config::{HubConfig, SmtpConfig};
use mailsink::{Database, Hub, HubHandle, Ingestor, SmtpServer};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// An in-process pipeline: store, hub and ingestor.
pub struct TestPipeline {
    pub db: Database,
    pub hub: HubHandle,
    pub ingestor: Arc<Ingestor>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown: watch::Receiver<bool>,
}

impl TestPipeline {
    /// Build a pipeline over an in-memory database.
    pub async fn in_memory() -> Self {
        let db = Database::open_in_memory()
            .await
            .expect("Failed to create test database");
        Self::with_database(db)
    }

    /// Build a pipeline over an existing database.
    pub fn with_database(db: Database) -> Self {
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (hub, _task) = Hub::spawn(&HubConfig::default(), shutdown.clone());
        let ingestor = Arc::new(Ingestor::new(db.clone(), Arc::new(hub.clone())));
        Self {
            db,
            hub,
            ingestor,
            shutdown_tx,
            shutdown,
        }
    }

    /// Start an SMTP server on an ephemeral port.
    pub async fn start_smtp(&self) -> SocketAddr {
        let config = SmtpConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            domain: "mailsink.test".to_string(),
            ..SmtpConfig::default()
        };
        let server = SmtpServer::bind(&config, self.ingestor.clone())
            .await
            .expect("Failed to bind SMTP server");
        let addr = server.local_addr().expect("Failed to get local address");
        tokio::spawn(server.run(self.shutdown.clone()));
        addr
    }
}

/// Minimal SMTP client.
pub struct SmtpClient {
    stream: BufReader<TcpStream>,
}

impl SmtpClient {
    /// Connect and consume the greeting.
    pub async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let mut client = Self {
            stream: BufReader::new(stream),
        };
        let greeting = client.read_reply().await;
        (client, greeting)
    }

    /// Read one (possibly multi-line) reply.
    pub async fn read_reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            let n = timeout(DEFAULT_TIMEOUT, self.stream.read_line(&mut line))
                .await
                .expect("Timed out waiting for reply")
                .expect("Failed to read reply");
            if n == 0 {
                return reply;
            }
            reply.push_str(&line);
            if line.as_bytes().get(3) != Some(&b'-') {
                return reply;
            }
        }
    }

    /// Send raw text and read the reply.
    pub async fn send(&mut self, text: &str) -> String {
        self.stream
            .get_mut()
            .write_all(text.as_bytes())
            .await
            .expect("Failed to write");
        self.read_reply().await
    }

    /// Run a full transaction and return the final DATA reply.
    pub async fn deliver(&mut self, from: &str, to: &[&str], raw: &str) -> String {
        assert!(self.send(&format!("MAIL FROM:<{from}>\r\n")).await.starts_with("250"));
        for rcpt in to {
            assert!(self.send(&format!("RCPT TO:<{rcpt}>\r\n")).await.starts_with("250"));
        }
        assert!(self.send("DATA\r\n").await.starts_with("354"));

        let mut body = String::new();
        for line in raw.split("\r\n") {
            if line.starts_with('.') {
                body.push('.');
            }
            body.push_str(line);
            body.push_str("\r\n");
        }
        body.push_str(".\r\n");
        self.send(&body).await
    }
}

/// A single-part text message.
pub fn simple_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         Message-ID: <{subject}@test>\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}"
    )
}

/// A nested multipart message: mixed(alternative(plain, html), attachment).
pub fn nested_message(subject: &str, attachment_name: &str, payload: &[u8]) -> String {
    let encoded = STANDARD.encode(payload);
    format!(
        "From: Sender <sender@example.com>\r\n\
         To: Rcpt One <one@example.com>, two@example.com\r\n\
         Cc: cc@example.com\r\n\
         Subject: {subject}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
         \r\n\
         --outer\r\n\
         Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
         \r\n\
         --inner\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         Plain part\r\n\
         --inner\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         \r\n\
         <p>HTML part</p>\r\n\
         --inner--\r\n\
         --outer\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Disposition: attachment; filename=\"{attachment_name}\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         {encoded}\r\n\
         --outer--\r\n"
    )
}
