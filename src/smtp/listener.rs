//! TCP listener for the SMTP receiver.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::session::{SessionSettings, SmtpSession};
use crate::config::SmtpConfig;
use crate::ingest::Ingestor;
use crate::{MailsinkError, Result};

/// How long [`SmtpServer::run`] waits for open sessions after shutdown.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// SMTP server that accepts TCP connections.
pub struct SmtpServer {
    listener: TcpListener,
    semaphore: Arc<Semaphore>,
    max_connections: usize,
    settings: SessionSettings,
    ingestor: Arc<Ingestor>,
    shutdown_grace: Duration,
}

impl SmtpServer {
    /// Create a new SmtpServer bound to the configured address.
    pub async fn bind(config: &SmtpConfig, ingestor: Arc<Ingestor>) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        info!("SMTP server listening on {}", local_addr);

        Ok(Self {
            listener,
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
            settings: SessionSettings::from(config),
            ingestor,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// Set how long `run` waits for open sessions once shutdown starts.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get the number of active connections.
    pub fn active_connections(&self) -> usize {
        self.max_connections - self.semaphore.available_permits()
    }

    /// Accept a new connection.
    ///
    /// Waits for a free connection slot first, so at most
    /// `max_connections` sessions run at once.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit)> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MailsinkError::Io(std::io::Error::other("semaphore closed")))?;

        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted connection from {}", addr);

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    /// Accept connections until `shutdown` becomes `true`, running one
    /// session task per connection.
    ///
    /// After shutdown, idle sessions are closed with 421 and sessions in
    /// the middle of a transaction get up to the shutdown grace period to
    /// finish before they are aborted.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = self.accept() => match accepted {
                    Ok((stream, addr, permit)) => {
                        let session = SmtpSession::new(
                            stream,
                            addr,
                            self.settings.clone(),
                            self.ingestor.clone(),
                        )
                        .with_shutdown(shutdown.clone());
                        sessions.spawn(async move {
                            session.run().await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(
            sessions = sessions.len(),
            "SMTP server stopped accepting connections"
        );

        let drain = async { while sessions.join_next().await.is_some() {} };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            warn!(
                sessions = sessions.len(),
                "SMTP sessions still open after grace period, aborting"
            );
            sessions.shutdown().await;
        }

        Ok(())
    }
}

/// A permit that represents an active connection slot.
///
/// When this permit is dropped, the connection slot is released.
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::hub::{EventSink, HubEvent};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct NullSink;

    impl EventSink for NullSink {
        fn publish(&self, _event: HubEvent) {}
    }

    fn test_config(max_connections: usize) -> SmtpConfig {
        SmtpConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            ..SmtpConfig::default()
        }
    }

    async fn test_ingestor() -> Arc<Ingestor> {
        let db = Database::open_in_memory().await.unwrap();
        Arc::new(Ingestor::new(db, Arc::new(NullSink)))
    }

    #[tokio::test]
    async fn test_server_bind() {
        let server = SmtpServer::bind(&test_config(10), test_ingestor().await)
            .await
            .unwrap();

        assert!(server.local_addr().is_ok());
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_max_connections_limit() {
        let server = SmtpServer::bind(&test_config(2), test_ingestor().await)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let _client1 = TcpStream::connect(addr).await.unwrap();
        let (_stream1, _, permit1) = server.accept().await.unwrap();
        let _client2 = TcpStream::connect(addr).await.unwrap();
        let (_stream2, _, _permit2) = server.accept().await.unwrap();

        assert_eq!(server.active_connections(), 2);

        let _client3 = TcpStream::connect(addr).await.unwrap();
        drop(permit1);
        let (_stream3, _, _permit3) = server.accept().await.unwrap();
        assert_eq!(server.active_connections(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = SmtpServer::bind(&test_config(4), test_ingestor().await)
            .await
            .unwrap();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.run(shutdown));

        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_run_waits_for_session_in_data() {
        let db = Database::open_in_memory().await.unwrap();
        let ingestor = Arc::new(Ingestor::new(db.clone(), Arc::new(NullSink)));
        let server = SmtpServer::bind(&test_config(4), ingestor)
            .await
            .unwrap()
            .with_shutdown_grace(Duration::from_secs(5));
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(server.run(shutdown));

        let mut client = BufReader::new(TcpStream::connect(addr).await.unwrap());
        let mut line = String::new();
        for command in [
            "",
            "HELO client\r\n",
            "MAIL FROM:<a@example.com>\r\n",
            "RCPT TO:<b@example.com>\r\n",
            "DATA\r\n",
        ] {
            client.get_mut().write_all(command.as_bytes()).await.unwrap();
            line.clear();
            client.read_line(&mut line).await.unwrap();
        }
        assert!(line.starts_with("354"), "{line}");

        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        client
            .get_mut()
            .write_all(b"Subject: late\r\n\r\nbody\r\n.\r\n")
            .await
            .unwrap();
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("250"), "{line}");
        line.clear();
        client.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("421"), "{line}");

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            crate::mail::MessageRepository::new(&db).count().await.unwrap(),
            1
        );
    }
}
