/*
 * smtp_server.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Integration tests for the SMTP receive engine: submission, size caps,
 * RSET, AUTH, duplicate handling, and connection admission, driven over
 * real TCP connections.
 */

mod common;

use common::*;

use fermoposta_core::config::SmtpServerConfig;
use fermoposta_core::sasl::{b64_encode, encode_plain};
use fermoposta_core::store::{ListFilter, Mailbox};

fn config() -> SmtpServerConfig {
    SmtpServerConfig {
        hostname: "mail.test.example".to_string(),
        limits: quick_limits(),
        ..Default::default()
    }
}

async fn ehlo(client: &mut WireClient) -> Vec<String> {
    client.send("EHLO client.example").await;
    let (code, lines) = client.smtp_reply().await;
    assert_eq!(code, 250);
    lines
}

#[tokio::test]
async fn plain_submission_creates_record_and_content() {
    let env = env();
    let server = start_smtp(&env, config()).await;
    let mut client = WireClient::connect(server.local_addr()).await;

    let (code, _) = client.smtp_reply().await;
    assert_eq!(code, 220);
    ehlo(&mut client).await;

    client.send("MAIL FROM:<a@x.example>").await;
    assert_eq!(client.smtp_reply().await.0, 250);
    client.send("RCPT TO:<b@y.example>").await;
    assert_eq!(client.smtp_reply().await.0, 250);
    client.send("DATA").await;
    assert_eq!(client.smtp_reply().await.0, 354);
    client.send("Subject: t").await;
    client.send("").await;
    client.send("hi").await;
    client.send(".").await;
    let (code, lines) = client.smtp_reply().await;
    assert_eq!(code, 250);
    let final_line = lines.last().unwrap();
    assert!(final_line.contains("queued as <"), "{}", final_line);
    let msg_id = format!(
        "<{}",
        final_line.split("queued as <").nth(1).unwrap().trim()
    );
    client.send("QUIT").await;
    assert_eq!(client.smtp_reply().await.0, 221);

    let rec = env
        .store
        .get_message(Mailbox::Inbox, &msg_id)
        .unwrap()
        .expect("record exists");
    assert_eq!(rec.from_addr, "a@x.example");
    assert_eq!(rec.to_addrs, vec!["b@y.example"]);
    assert_eq!(rec.subject, "t");
    let bytes = env.content.get(&msg_id, None).unwrap();
    assert_eq!(rec.size_bytes, bytes.len() as u64);
    // Received stamp precedes the client's headers.
    assert!(bytes.starts_with(b"Received: from client.example"));

    server.stop().await;
}

#[tokio::test]
async fn data_size_cap_rejects_and_resets() {
    let env = env();
    let mut cfg = config();
    cfg.max_message_size = 64;
    let server = start_smtp(&env, cfg).await;
    let mut client = WireClient::connect(server.local_addr()).await;
    client.smtp_reply().await;
    ehlo(&mut client).await;

    client.send("MAIL FROM:<a@x.example>").await;
    assert_eq!(client.smtp_reply().await.0, 250);
    client.send("RCPT TO:<b@y.example>").await;
    assert_eq!(client.smtp_reply().await.0, 250);
    client.send("DATA").await;
    assert_eq!(client.smtp_reply().await.0, 354);
    for _ in 0..8 {
        client.send("0123456789abcdef").await;
    }
    client.send(".").await;
    let (code, _) = client.smtp_reply().await;
    assert_eq!(code, 552);

    // Implicit RSET: a fresh envelope works on the same connection.
    client.send("MAIL FROM:<a@x.example>").await;
    assert_eq!(client.smtp_reply().await.0, 250);

    assert!(env
        .store
        .list_messages(Mailbox::Inbox, &ListFilter::default())
        .unwrap()
        .is_empty());
    server.stop().await;
}

#[tokio::test]
async fn declared_size_over_cap_rejected_at_mail() {
    let env = env();
    let mut cfg = config();
    cfg.max_message_size = 1024;
    let server = start_smtp(&env, cfg).await;
    let mut client = WireClient::connect(server.local_addr()).await;
    client.smtp_reply().await;
    ehlo(&mut client).await;

    client.send("MAIL FROM:<a@x.example> SIZE=2048").await;
    assert_eq!(client.smtp_reply().await.0, 552);
    server.stop().await;
}

#[tokio::test]
async fn rset_clears_envelope() {
    let env = env();
    let server = start_smtp(&env, config()).await;
    let mut client = WireClient::connect(server.local_addr()).await;
    client.smtp_reply().await;
    ehlo(&mut client).await;

    client.send("MAIL FROM:<a@x.example>").await;
    assert_eq!(client.smtp_reply().await.0, 250);
    client.send("RSET").await;
    assert_eq!(client.smtp_reply().await.0, 250);
    // Envelope is gone: RCPT now out of sequence, MAIL accepted again.
    client.send("RCPT TO:<b@y.example>").await;
    assert_eq!(client.smtp_reply().await.0, 503);
    client.send("MAIL FROM:<c@x.example>").await;
    assert_eq!(client.smtp_reply().await.0, 250);
    server.stop().await;
}

#[tokio::test]
async fn command_sequencing_is_enforced() {
    let env = env();
    let server = start_smtp(&env, config()).await;
    let mut client = WireClient::connect(server.local_addr()).await;
    client.smtp_reply().await;

    client.send("MAIL FROM:<a@x.example>").await;
    assert_eq!(client.smtp_reply().await.0, 503);
    client.send("DATA").await;
    assert_eq!(client.smtp_reply().await.0, 503);
    client.send("VRFY somebody").await;
    assert_eq!(client.smtp_reply().await.0, 252);
    client.send("EXPN list").await;
    assert_eq!(client.smtp_reply().await.0, 502);
    client.send("NONSENSE").await;
    assert_eq!(client.smtp_reply().await.0, 500);
    client.send("MAIL FROM:<not an address>").await;
    assert_eq!(client.smtp_reply().await.0, 503); // still no EHLO
    ehlo(&mut client).await;
    client.send("MAIL FROM:<not an address>").await;
    assert_eq!(client.smtp_reply().await.0, 501);
    server.stop().await;
}

#[tokio::test]
async fn auth_plain_and_policy() {
    let env = env();
    add_user(&env, "alice", "alice@x.example", "hunter2");
    let mut cfg = config();
    cfg.auth_required = true;
    cfg.allow_plaintext_auth = true;
    let server = start_smtp(&env, cfg).await;
    let mut client = WireClient::connect(server.local_addr()).await;
    client.smtp_reply().await;
    let caps = ehlo(&mut client).await;
    assert!(caps.iter().any(|l| l.contains("AUTH PLAIN LOGIN")));

    // Unauthenticated MAIL is refused under auth_required.
    client.send("MAIL FROM:<alice@x.example>").await;
    assert_eq!(client.smtp_reply().await.0, 530);

    // Wrong password.
    let bad = b64_encode(&encode_plain("", "alice", "wrong"));
    client.send(&format!("AUTH PLAIN {}", bad)).await;
    assert_eq!(client.smtp_reply().await.0, 535);

    // Right password.
    let good = b64_encode(&encode_plain("", "alice", "hunter2"));
    client.send(&format!("AUTH PLAIN {}", good)).await;
    assert_eq!(client.smtp_reply().await.0, 235);

    // AUTH no longer advertised once authenticated.
    let caps = ehlo(&mut client).await;
    assert!(!caps.iter().any(|l| l.contains("AUTH ")));

    client.send("MAIL FROM:<alice@x.example>").await;
    assert_eq!(client.smtp_reply().await.0, 250);
    server.stop().await;
}

#[tokio::test]
async fn auth_login_challenge_sequence() {
    let env = env();
    add_user(&env, "alice", "alice@x.example", "hunter2");
    let mut cfg = config();
    cfg.allow_plaintext_auth = true;
    let server = start_smtp(&env, cfg).await;
    let mut client = WireClient::connect(server.local_addr()).await;
    client.smtp_reply().await;
    ehlo(&mut client).await;

    client.send("AUTH LOGIN").await;
    let (code, lines) = client.smtp_reply().await;
    assert_eq!(code, 334);
    assert!(lines[0].contains("VXNlcm5hbWU6"));
    client.send(&b64_encode(b"alice")).await;
    let (code, lines) = client.smtp_reply().await;
    assert_eq!(code, 334);
    assert!(lines[0].contains("UGFzc3dvcmQ6"));
    client.send(&b64_encode(b"hunter2")).await;
    assert_eq!(client.smtp_reply().await.0, 235);
    server.stop().await;
}

#[tokio::test]
async fn plaintext_auth_refused_without_policy() {
    let env = env();
    add_user(&env, "alice", "alice@x.example", "hunter2");
    // allow_plaintext_auth stays false and there is no TLS on this listener.
    let server = start_smtp(&env, config()).await;
    let mut client = WireClient::connect(server.local_addr()).await;
    client.smtp_reply().await;
    ehlo(&mut client).await;

    let good = b64_encode(&encode_plain("", "alice", "hunter2"));
    client.send(&format!("AUTH PLAIN {}", good)).await;
    assert_eq!(client.smtp_reply().await.0, 538);
    server.stop().await;
}

#[tokio::test]
async fn duplicate_submission_idempotent_accept() {
    let env = env();
    let mut cfg = config();
    cfg.stamp_received = false; // identical bytes on both submissions
    let server = start_smtp(&env, cfg).await;

    let payload = [
        "Message-ID: <fixed.1@x.example>",
        "Subject: once",
        "",
        "body",
        ".",
    ];
    for expectation in [250u16, 250u16] {
        let mut client = WireClient::connect(server.local_addr()).await;
        client.smtp_reply().await;
        ehlo(&mut client).await;
        client.send("MAIL FROM:<a@x.example>").await;
        client.smtp_reply().await;
        client.send("RCPT TO:<b@y.example>").await;
        client.smtp_reply().await;
        client.send("DATA").await;
        client.smtp_reply().await;
        for line in payload {
            client.send(line).await;
        }
        let (code, _) = client.smtp_reply().await;
        assert_eq!(code, expectation);
    }

    // Same id with different content is refused as retryable.
    let mut client = WireClient::connect(server.local_addr()).await;
    client.smtp_reply().await;
    ehlo(&mut client).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.smtp_reply().await;
    client.send("RCPT TO:<b@y.example>").await;
    client.smtp_reply().await;
    client.send("DATA").await;
    client.smtp_reply().await;
    client.send("Message-ID: <fixed.1@x.example>").await;
    client.send("Subject: different").await;
    client.send("").await;
    client.send("other body").await;
    client.send(".").await;
    assert_eq!(client.smtp_reply().await.0, 451);

    let all = env
        .store
        .list_messages(Mailbox::Inbox, &ListFilter::default())
        .unwrap();
    assert_eq!(all.len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn dot_stuffed_payload_is_unstuffed() {
    let env = env();
    let mut cfg = config();
    cfg.stamp_received = false;
    let server = start_smtp(&env, cfg).await;
    let mut client = WireClient::connect(server.local_addr()).await;
    client.smtp_reply().await;
    ehlo(&mut client).await;
    client.send("MAIL FROM:<a@x.example>").await;
    client.smtp_reply().await;
    client.send("RCPT TO:<b@y.example>").await;
    client.smtp_reply().await;
    client.send("DATA").await;
    client.smtp_reply().await;
    client.send("Subject: dots").await;
    client.send("").await;
    client.send("..leading dot line").await;
    client.send("normal").await;
    client.send(".").await;
    let (code, lines) = client.smtp_reply().await;
    assert_eq!(code, 250);
    let msg_id = format!(
        "<{}",
        lines.last().unwrap().split("queued as <").nth(1).unwrap().trim()
    );

    let bytes = env.content.get(&msg_id, None).unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("\r\n.leading dot line\r\n"));
    assert!(!text.contains(".."));
    server.stop().await;
}

#[tokio::test]
async fn idle_session_gets_timeout_reply() {
    let env = env();
    let mut cfg = config();
    cfg.limits.idle_timeout_secs = 1;
    let server = start_smtp(&env, cfg).await;
    let mut client = WireClient::connect(server.local_addr()).await;
    assert_eq!(client.smtp_reply().await.0, 220);
    // Send nothing; the server should break the silence with a 421.
    let (code, _) = client.smtp_reply().await;
    assert_eq!(code, 421);
    server.stop().await;
}

#[tokio::test]
async fn over_capacity_connection_gets_421() {
    let env = env();
    let mut cfg = config();
    cfg.limits.max_connections = 1;
    let server = start_smtp(&env, cfg).await;

    let mut first = WireClient::connect(server.local_addr()).await;
    assert_eq!(first.smtp_reply().await.0, 220);

    let second = WireClient::connect(server.local_addr()).await;
    let bytes = second.read_to_end().await;
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with("421"), "{}", text);

    // The first session is unaffected by the rejection.
    first.send("NOOP").await;
    assert_eq!(first.smtp_reply().await.0, 250);
    assert_eq!(server.counters().rejected(), 1);
    server.stop().await;
}
