//! SMTP receiver tests over real TCP connections.

mod common;

use std::time::Duration;

use tokio::time::timeout;

use common::{nested_message, simple_message, SmtpClient, TestPipeline, DEFAULT_TIMEOUT};
use mailsink::{HubEvent, MessageFilter, MessageRepository, Page};

fn queued_id(reply: &str) -> i64 {
    reply
        .trim()
        .rsplit(' ')
        .next()
        .and_then(|id| id.parse().ok())
        .unwrap_or_else(|| panic!("no id in reply: {reply}"))
}

#[tokio::test]
async fn test_delivery_over_tcp() {
    let pipeline = TestPipeline::in_memory().await;
    let mut subscription = pipeline.hub.subscribe().await.unwrap();
    let addr = pipeline.start_smtp().await;

    let (mut client, greeting) = SmtpClient::connect(addr).await;
    assert!(greeting.starts_with("220 mailsink.test"), "{greeting}");

    let ehlo = client.send("EHLO client.test\r\n").await;
    assert!(ehlo.contains("SIZE"), "{ehlo}");
    assert!(ehlo.contains("AUTH PLAIN LOGIN"), "{ehlo}");

    let raw = simple_message(
        "alice@example.com",
        "bob@example.com",
        "hello",
        "first line\r\n.leading dot\r\nlast line",
    );
    let reply = client
        .deliver("alice@example.com", &["bob@example.com"], &raw)
        .await;
    assert!(reply.starts_with("250 OK: queued as"), "{reply}");
    let id = queued_id(&reply);

    assert!(client.send("QUIT\r\n").await.starts_with("221"));

    let event = timeout(DEFAULT_TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, HubEvent::Arrival(ref s) if s.id == id));

    let message = MessageRepository::new(&pipeline.db).get(id).await.unwrap();
    assert_eq!(message.sender, "alice@example.com");
    assert_eq!(message.recipients, vec!["bob@example.com"]);
    assert!(message.plain_body.contains("\n.leading dot"));
}

#[tokio::test]
async fn test_multiple_transactions_on_one_connection() {
    let pipeline = TestPipeline::in_memory().await;
    let addr = pipeline.start_smtp().await;

    let (mut client, _) = SmtpClient::connect(addr).await;
    client.send("HELO client.test\r\n").await;

    for i in 0..3 {
        let raw = nested_message(&format!("batch {i}"), "data.bin", &[i as u8; 64]);
        let reply = client
            .deliver("sender@example.com", &["one@example.com"], &raw)
            .await;
        assert!(reply.starts_with("250"), "{reply}");
    }

    let page = MessageRepository::new(&pipeline.db)
        .list(&MessageFilter::new(), Page::default())
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.messages[0].subject, "batch 2");
    assert!(page.messages.iter().all(|m| m.attachments.len() == 1));
}

#[tokio::test]
async fn test_concurrent_clients() {
    let pipeline = TestPipeline::in_memory().await;
    let addr = pipeline.start_smtp().await;

    let mut tasks = Vec::new();
    for i in 0..8 {
        tasks.push(tokio::spawn(async move {
            let (mut client, _) = SmtpClient::connect(addr).await;
            client.send("EHLO client.test\r\n").await;
            let raw = simple_message("a@example.com", "b@example.com", &format!("c{i}"), "x");
            client.deliver("a@example.com", &["b@example.com"], &raw).await
        }));
    }
    for task in tasks {
        let reply = task.await.unwrap();
        assert!(reply.starts_with("250"), "{reply}");
    }

    assert_eq!(
        MessageRepository::new(&pipeline.db).count().await.unwrap(),
        8
    );
}

#[tokio::test]
async fn test_undecodable_payload_gets_554() {
    let pipeline = TestPipeline::in_memory().await;
    let addr = pipeline.start_smtp().await;

    let (mut client, _) = SmtpClient::connect(addr).await;
    client.send("EHLO client.test\r\n").await;
    let raw = "Content-Type: multipart/mixed\r\n\r\nno boundary here";
    let reply = client
        .deliver("a@example.com", &["b@example.com"], raw)
        .await;
    assert!(reply.starts_with("554"), "{reply}");

    // The session stays usable.
    assert!(client.send("NOOP\r\n").await.starts_with("250"));
    assert_eq!(
        MessageRepository::new(&pipeline.db).count().await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_server_stops_accepting_after_shutdown() {
    let pipeline = TestPipeline::in_memory().await;
    let addr = pipeline.start_smtp().await;

    pipeline.shutdown_tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let connected = timeout(Duration::from_millis(500), async {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let mut buf = [0u8; 1];
        stream.readable().await?;
        stream.try_read(&mut buf)
    })
    .await;
    assert!(!matches!(connected, Ok(Ok(n)) if n > 0));
}
