//! Ingestion pipeline tests.
//!
//! Raw payload -> decoder -> store -> hub, against in-memory and on-disk
//! databases.

mod common;

use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use common::{nested_message, simple_message, TestPipeline, DEFAULT_TIMEOUT};
use mailsink::{
    Database, Envelope, HubEvent, MailsinkError, MessageFilter, MessageRepository, Page,
    SearchMode,
};

#[tokio::test]
async fn test_ingest_stores_and_announces() {
    let pipeline = TestPipeline::in_memory().await;
    let mut subscription = pipeline.hub.subscribe().await.unwrap();

    let raw = nested_message("Quarterly report", "report.bin", b"\x00\x01binary\xff");
    let id = pipeline
        .ingestor
        .ingest(raw.as_bytes(), &Envelope::default())
        .await
        .unwrap();

    let event = timeout(DEFAULT_TIMEOUT, subscription.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        HubEvent::Arrival(summary) => {
            assert_eq!(summary.id, id);
            assert_eq!(summary.subject, "Quarterly report");
            assert_eq!(summary.sender, "sender@example.com");
        }
        other => panic!("unexpected event {other:?}"),
    }

    let repo = MessageRepository::new(&pipeline.db);
    let message = repo.get(id).await.unwrap();
    assert_eq!(message.recipients, vec!["one@example.com", "two@example.com"]);
    assert_eq!(message.cc_recipients, vec!["cc@example.com"]);
    assert_eq!(message.plain_body.trim(), "Plain part");
    assert_eq!(message.markup_body.trim(), "<p>HTML part</p>");
    assert_eq!(message.byte_size, raw.len() as i64);
    assert_eq!(message.attachments.len(), 1);

    let attachment = repo.get_attachment(message.attachments[0].id).await.unwrap();
    assert_eq!(attachment.meta.filename, "report.bin");
    assert_eq!(attachment.payload, b"\x00\x01binary\xff");
}

#[tokio::test]
async fn test_envelope_fills_missing_addresses() {
    let pipeline = TestPipeline::in_memory().await;
    let raw = "Subject: headerless\r\n\r\nbody";
    let envelope = Envelope::new("env@example.com", vec!["rcpt@example.com".to_string()]);

    let id = pipeline
        .ingestor
        .ingest(raw.as_bytes(), &envelope)
        .await
        .unwrap();

    let message = MessageRepository::new(&pipeline.db).get(id).await.unwrap();
    assert_eq!(message.sender, "env@example.com");
    assert_eq!(message.recipients, vec!["rcpt@example.com"]);
}

#[tokio::test]
async fn test_undecodable_message_is_rejected_without_side_effects() {
    let pipeline = TestPipeline::in_memory().await;
    let mut subscription = pipeline.hub.subscribe().await.unwrap();

    let err = pipeline
        .ingestor
        .ingest(b"", &Envelope::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MailsinkError::Decode(_)));

    assert_eq!(
        MessageRepository::new(&pipeline.db).count().await.unwrap(),
        0
    );
    assert!(timeout(Duration::from_millis(50), subscription.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_receive_times_follow_insert_order() {
    let pipeline = TestPipeline::in_memory().await;
    let mut ids = Vec::new();
    for i in 0..20 {
        let raw = simple_message("a@example.com", "b@example.com", &format!("m{i}"), "x");
        ids.push(
            pipeline
                .ingestor
                .ingest(raw.as_bytes(), &Envelope::default())
                .await
                .unwrap(),
        );
    }

    let page = MessageRepository::new(&pipeline.db)
        .list(&MessageFilter::new(), Page::new(100, 0).unwrap())
        .await
        .unwrap();
    let listed: Vec<i64> = page.messages.iter().map(|m| m.id).collect();
    ids.reverse();
    assert_eq!(listed, ids);
}

#[tokio::test]
async fn test_on_disk_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("mail.db");

    let id = {
        let db = Database::open(&path).await.unwrap();
        assert_eq!(db.search_mode(), SearchMode::FullText);
        let pipeline = TestPipeline::with_database(db.clone());
        let raw = simple_message("a@example.com", "b@example.com", "persisted", "kept body");
        let id = pipeline
            .ingestor
            .ingest(raw.as_bytes(), &Envelope::default())
            .await
            .unwrap();
        db.close(Duration::from_secs(1)).await;
        id
    };

    let db = Database::open(&path).await.unwrap();
    let repo = MessageRepository::new(&db);
    let message = repo.get(id).await.unwrap();
    assert_eq!(message.subject, "persisted");

    let found = repo.search("kept", Page::default()).await.unwrap();
    assert_eq!(found.total, 1);
}

#[tokio::test]
async fn test_closed_store_rejects_ingestion() {
    let pipeline = TestPipeline::in_memory().await;
    pipeline.db.close(Duration::from_millis(100)).await;

    let raw = simple_message("a@example.com", "b@example.com", "late", "x");
    let err = pipeline
        .ingestor
        .ingest(raw.as_bytes(), &Envelope::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MailsinkError::Shutdown));
}

#[tokio::test]
async fn test_search_modes_agree() {
    let indexed = Database::open_in_memory_with(true).await.unwrap();
    let fallback = Database::open_in_memory_with(false).await.unwrap();
    assert_eq!(fallback.search_mode(), SearchMode::Substring);

    let subjects = ["invoice march", "welcome aboard", "invoice april", "digest"];
    for db in [&indexed, &fallback] {
        let pipeline = TestPipeline::with_database(db.clone());
        for subject in subjects {
            let raw = simple_message("a@example.com", "b@example.com", subject, "hello");
            pipeline
                .ingestor
                .ingest(raw.as_bytes(), &Envelope::default())
                .await
                .unwrap();
        }
    }

    let subjects_of = |page: mailsink::mail::MessagePage| -> Vec<String> {
        page.messages.into_iter().map(|m| m.subject).collect()
    };
    let a = MessageRepository::new(&indexed)
        .search("invoice", Page::default())
        .await
        .unwrap();
    let b = MessageRepository::new(&fallback)
        .search("invoice", Page::default())
        .await
        .unwrap();
    assert_eq!(a.total, 2);
    assert_eq!(subjects_of(a), subjects_of(b));
}
