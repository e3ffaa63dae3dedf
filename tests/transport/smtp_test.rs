//! Tests for the SMTP client against an in-process fake server.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use mailspool::config::SecurityMode;
use mailspool::ledger::Message;
use mailspool::transport::{SmtpTransport, Transport, TransportError};

/// Fake server behavior knobs.
struct ServerScript {
    /// Reply to RCPT TO (e.g. "250 ok" or "550 no such user").
    rcpt_reply: &'static str,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            rcpt_reply: "250 ok",
        }
    }
}

/// Spawn a one-connection SMTP server; returns its address and a handle
/// resolving to every line the client sent.
async fn fake_server(script: ServerScript) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake server");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut received = Vec::new();
        let mut in_data = false;

        write_half
            .write_all(b"220 fake.test ESMTP ready\r\n")
            .await
            .expect("greeting");

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.expect("read line");
            if n == 0 {
                break;
            }
            let line = line.trim_end().to_owned();
            received.push(line.clone());

            if in_data {
                if line == "." {
                    in_data = false;
                    write_half.write_all(b"250 queued\r\n").await.expect("250");
                }
                continue;
            }

            let reply: String = if line.starts_with("EHLO") {
                // Multiline reply to exercise continuation parsing.
                "250-fake.test greets you\r\n250 AUTH LOGIN".to_owned()
            } else if line == "AUTH LOGIN" {
                "334 VXNlcm5hbWU6".to_owned()
            } else if line == "Ym90" {
                // base64("bot")
                "334 UGFzc3dvcmQ6".to_owned()
            } else if line == "c2VjcmV0" {
                // base64("secret")
                "235 authenticated".to_owned()
            } else if line.starts_with("MAIL FROM") {
                "250 ok".to_owned()
            } else if line.starts_with("RCPT TO") {
                script.rcpt_reply.to_owned()
            } else if line == "DATA" {
                in_data = true;
                "354 go ahead".to_owned()
            } else if line == "QUIT" {
                write_half.write_all(b"221 bye\r\n").await.expect("221");
                break;
            } else {
                "500 unrecognized".to_owned()
            };

            write_half
                .write_all(format!("{reply}\r\n").as_bytes())
                .await
                .expect("reply");
        }

        received
    });

    (addr, handle)
}

#[tokio::test]
async fn delivers_a_message_over_the_socket() {
    let (addr, server) = fake_server(ServerScript::default()).await;
    let mut transport = SmtpTransport::new("mailspool-test");

    transport
        .connect(&addr.ip().to_string(), addr.port(), SecurityMode::None)
        .await
        .expect("connect");

    let message = Message::new("rcpt@example.com", "greetings", "hello\n.starts with dot");
    transport
        .send("sender@example.com", &message)
        .await
        .expect("send");
    transport.disconnect().await.expect("disconnect");

    let received = server.await.expect("server task");
    assert!(received
        .iter()
        .any(|l| l.starts_with("EHLO mailspool-test")));
    assert!(received.contains(&"MAIL FROM:<sender@example.com>".to_owned()));
    assert!(received.contains(&"RCPT TO:<rcpt@example.com>".to_owned()));
    assert!(received.contains(&"Subject: greetings".to_owned()));
    assert!(received.contains(&"hello".to_owned()));
    // Leading dot in the body is stuffed on the wire.
    assert!(received.contains(&"..starts with dot".to_owned()));
    assert!(received.contains(&"QUIT".to_owned()));
}

#[tokio::test]
async fn auth_login_exchanges_base64_credentials() {
    let (addr, server) = fake_server(ServerScript::default()).await;
    let mut transport = SmtpTransport::new("mailspool-test");

    transport
        .connect(&addr.ip().to_string(), addr.port(), SecurityMode::None)
        .await
        .expect("connect");
    transport
        .authenticate("bot", "secret")
        .await
        .expect("authenticate");
    transport.disconnect().await.expect("disconnect");

    let received = server.await.expect("server task");
    assert!(received.contains(&"AUTH LOGIN".to_owned()));
    assert!(received.contains(&"Ym90".to_owned()));
    assert!(received.contains(&"c2VjcmV0".to_owned()));
}

#[tokio::test]
async fn rejected_recipient_surfaces_as_transport_error() {
    let (addr, _server) = fake_server(ServerScript {
        rcpt_reply: "550 no such user",
    })
    .await;
    let mut transport = SmtpTransport::new("mailspool-test");

    transport
        .connect(&addr.ip().to_string(), addr.port(), SecurityMode::None)
        .await
        .expect("connect");

    let message = Message::new("nobody@example.com", "s", "b");
    let result = transport.send("sender@example.com", &message).await;
    assert!(matches!(result, Err(TransportError::Rejected { .. })));
}

#[tokio::test]
async fn start_tls_is_reported_unsupported() {
    let mut transport = SmtpTransport::new("mailspool-test");
    let result = transport
        .connect("localhost", 587, SecurityMode::StartTls)
        .await;
    assert!(matches!(
        result,
        Err(TransportError::UnsupportedSecurity(_))
    ));
}

#[tokio::test]
async fn send_before_connect_is_rejected() {
    let mut transport = SmtpTransport::new("mailspool-test");
    let message = Message::new("rcpt@example.com", "s", "b");
    let result = transport.send("sender@example.com", &message).await;
    assert!(matches!(result, Err(TransportError::NotConnected)));
}
