use mailwatch::message::{parse_message, RawMessage};

fn raw(uid: u32, body: &str) -> RawMessage {
    RawMessage {
        uid,
        size: Some(body.len() as u32),
        body: body.as_bytes().to_vec(),
    }
}

#[test]
fn multipart_message_with_attachment() {
    let body = concat!(
        "From: Alice <alice@example.com>\r\n",
        "To: bob@example.com\r\n",
        "Subject: Report\r\n",
        "Message-ID: <r1@example.com>\r\n",
        "Date: Tue, 1 Jul 2025 10:00:00 +0000\r\n",
        "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "\r\n",
        "Hello\r\n",
        "--b\r\n",
        "Content-Type: application/pdf; name=\"file.pdf\"\r\n",
        "Content-Disposition: attachment; filename=\"file.pdf\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "SGVsbG8=\r\n",
        "--b--\r\n",
    );

    let message = parse_message(&raw(9, body)).unwrap();

    assert_eq!(message.uid, 9);
    assert_eq!(message.subject.as_deref(), Some("Report"));
    assert_eq!(message.from.as_deref(), Some("Alice <alice@example.com>"));
    assert_eq!(message.to.as_deref(), Some("bob@example.com"));
    assert_eq!(message.message_id.as_deref(), Some("<r1@example.com>"));
    assert_eq!(message.date, Some(1_751_364_000));
    assert_eq!(message.text.as_deref().map(str::trim), Some("Hello"));
    assert!(message.html.is_none());
    assert!(message.has_attachments);
    assert_eq!(message.size, body.len());
    assert!(message.is_deliverable());
}

#[test]
fn html_only_message_gets_a_text_rendering() {
    let body = concat!(
        "From: news@example.com\r\n",
        "Subject: Weekly\r\n",
        "Content-Type: text/html; charset=utf-8\r\n",
        "\r\n",
        "<html><body><p>Big <b>news</b> today</p></body></html>\r\n",
    );

    let message = parse_message(&raw(1, body)).unwrap();

    assert!(message.html.as_deref().unwrap().contains("<b>news</b>"));
    let text = message.text.unwrap();
    assert!(text.contains("news"));
    assert!(!text.contains("<b>"));
    assert!(!message.has_attachments);
}

#[test]
fn alternative_parts_fill_both_bodies() {
    let body = concat!(
        "From: a@example.com\r\n",
        "Subject: Both\r\n",
        "Content-Type: multipart/alternative; boundary=\"x\"\r\n",
        "\r\n",
        "--x\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "plain version\r\n",
        "--x\r\n",
        "Content-Type: text/html\r\n",
        "\r\n",
        "<p>html version</p>\r\n",
        "--x--\r\n",
    );

    let message = parse_message(&raw(2, body)).unwrap();

    assert_eq!(message.text.as_deref().map(str::trim), Some("plain version"));
    assert!(message.html.as_deref().unwrap().contains("html version"));
}

#[test]
fn message_without_sender_is_not_deliverable() {
    let body = concat!("Subject: orphan\r\n", "\r\n", "text\r\n");

    let message = parse_message(&raw(3, body)).unwrap();

    assert!(message.from.is_none());
    assert!(!message.is_deliverable());
}

#[test]
fn message_with_sender_but_no_content_is_not_deliverable() {
    let body = concat!("From: a@example.com\r\n", "\r\n", "   \r\n");

    let message = parse_message(&raw(4, body)).unwrap();

    assert!(!message.is_deliverable());
}
