use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use mailsink::{start_retention, Config, Database, Hub, Ingestor, SmtpServer, WebServer};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal: {e}");
        eprintln!("mailsink: {e}");
        std::process::exit(1);
    }
}

async fn run() -> mailsink::Result<()> {
    // Load configuration
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load_with_env(&path)?;
    config.validate()?;

    // Initialize logging
    if let Err(e) = mailsink::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        mailsink::logging::init_console_only(&config.logging.level);
    }

    info!("mailsink {}", env!("CARGO_PKG_VERSION"));

    let db = Database::open_with(&config.storage).await?;
    info!(
        path = %config.storage.path,
        search = ?db.search_mode(),
        "Message store opened"
    );

    let (shutdown_tx, shutdown) = watch::channel(false);

    let (hub, hub_task) = Hub::spawn(&config.hub, shutdown.clone());
    let ingestor = Arc::new(Ingestor::new(db.clone(), Arc::new(hub.clone())));
    let retention_task = start_retention(db.clone(), config.retention.clone(), shutdown.clone());

    let grace = Duration::from_secs(config.storage.shutdown_grace_secs);
    let smtp = SmtpServer::bind(&config.smtp, ingestor)
        .await?
        .with_shutdown_grace(grace);
    let smtp_task = tokio::spawn(smtp.run(shutdown.clone()));

    let web = WebServer::new(&config.http, db.clone(), hub);
    let web_task = tokio::spawn(web.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    // Sessions mid-transaction finish within the grace period before the
    // store closes.
    match smtp_task.await {
        Ok(Err(e)) => error!("SMTP server error: {e}"),
        Err(e) => error!("SMTP task failed: {e}"),
        Ok(Ok(())) => {}
    }
    match tokio::time::timeout(grace, web_task).await {
        Ok(Ok(Err(e))) => error!("Web server error: {e}"),
        Ok(Err(e)) => error!("Web task failed: {e}"),
        Err(_) => error!("Web server did not stop within {grace:?}"),
        Ok(Ok(Ok(()))) => {}
    }
    let _ = retention_task.await;
    let _ = hub_task.await;

    db.close(grace).await;
    info!("mailsink stopped");
    Ok(())
}
