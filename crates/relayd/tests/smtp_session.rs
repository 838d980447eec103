//! Drives full inbound sessions over an in-memory duplex stream,
//! with a canned upstream SMTP server listening on an ephemeral
//! local port to receive the forwarded messages.

use relayd::config::Config;
use relayd::metrics::RelayMetrics;
use relayd::smtp_server::SmtpServer;
use smtp_client::EnvelopeAddress;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};

struct MockUpstream {
    host: String,
    port: u16,
    commands: Arc<Mutex<Vec<String>>>,
    message: Arc<Mutex<Option<String>>>,
}

impl MockUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(vec![]));
        let message = Arc::new(Mutex::new(None));

        let conn_commands = Arc::clone(&commands);
        let conn_message = Arc::clone(&message);
        tokio::spawn(async move {
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::spawn(serve_mock_connection(
                    socket,
                    Arc::clone(&conn_commands),
                    Arc::clone(&conn_message),
                ));
            }
        });

        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            commands,
            message,
        }
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn message(&self) -> Option<String> {
        self.message.lock().unwrap().clone()
    }
}

async fn serve_mock_connection(
    socket: TcpStream,
    commands: Arc<Mutex<Vec<String>>>,
    message: Arc<Mutex<Option<String>>>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(b"220 mock.test ESMTP\r\n").await.unwrap();

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await.unwrap() == 0 {
            return;
        }
        let cmd = line.trim_end().to_string();
        let verb = cmd.to_ascii_uppercase();
        commands.lock().unwrap().push(cmd);

        let reply: &[u8] = if verb.starts_with("EHLO") {
            b"250-mock.test\r\n250-PIPELINING\r\n250 AUTH PLAIN LOGIN\r\n"
        } else if verb.starts_with("AUTH") {
            b"235 2.7.0 Authentication successful\r\n"
        } else if verb == "DATA" {
            write_half
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await
                .unwrap();

            let mut body = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    return;
                }
                if line == ".\r\n" {
                    break;
                }
                body.push_str(line.strip_prefix('.').unwrap_or(&line));
            }
            message.lock().unwrap().replace(body);
            b"250 2.0.0 OK: accepted\r\n"
        } else if verb == "QUIT" {
            write_half.write_all(b"221 2.0.0 Bye\r\n").await.unwrap();
            return;
        } else {
            b"250 2.1.0 OK\r\n"
        };
        write_half.write_all(reply).await.unwrap();
    }
}

struct TestClient {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl TestClient {
    fn new(io: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Read one (possibly multi-line) reply and return it verbatim
    async fn read_reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed while awaiting a reply");
            let is_final = line.as_bytes().get(3) == Some(&b' ');
            reply.push_str(&line);
            if is_final {
                return reply;
            }
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.read_reply().await
    }

    async fn send_data(&mut self, payload: &str) -> String {
        self.writer.write_all(payload.as_bytes()).await.unwrap();
        self.writer.write_all(b".\r\n").await.unwrap();
        self.read_reply().await
    }
}

fn test_config(host: &str, port: u16) -> Arc<Config> {
    Arc::new(Config {
        debug: false,
        metrics_port: 2112,
        smtp_port: 0,
        email_server_host: host.to_string(),
        email_server_port: port,
        email_server_user: "relay-user".to_string(),
        email_server_pass: "hunter2".to_string(),
        from_address: EnvelopeAddress::parse("relay@relay.test").unwrap(),
    })
}

fn start_session(
    config: Arc<Config>,
    metrics: Arc<RelayMetrics>,
) -> (TestClient, tokio::task::JoinHandle<()>) {
    let (client_io, server_io) = tokio::io::duplex(1024 * 1024);
    let handle = SmtpServer::run(server_io, "relay.test".to_string(), config, metrics);
    (TestClient::new(client_io), handle)
}

#[tokio::test]
async fn forwards_and_overrides_sender() {
    let upstream = MockUpstream::start().await;
    let config = test_config(&upstream.host, upstream.port);
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let (mut client, session) = start_session(config, Arc::clone(&metrics));

    assert!(client.read_reply().await.starts_with("220 "));
    assert!(client.send("HELO client.test").await.starts_with("250 "));
    assert!(client
        .send("MAIL FROM:<a@test.com>")
        .await
        .starts_with("250 "));
    assert!(client
        .send("RCPT TO:<b@test.com>")
        .await
        .starts_with("250 "));
    assert!(client.send("DATA").await.starts_with("354 "));
    assert!(client
        .send_data("Subject: hi\r\n\r\nbody\r\n")
        .await
        .starts_with("250 "));
    assert!(client.send("QUIT").await.starts_with("221 "));
    session.await.unwrap();

    assert_eq!(metrics.received.get(), 1);
    assert_eq!(metrics.forwarded.get(), 1);
    assert_eq!(metrics.failed.get(), 0);

    let commands = upstream.commands();
    // The envelope sender upstream is the override, not a@test.com
    assert!(commands.contains(&"MAIL FROM:<relay@relay.test>".to_string()));
    assert!(commands.contains(&"RCPT TO:<b@test.com>".to_string()));
    assert!(commands.contains(&"AUTH PLAIN AHJlbGF5LXVzZXIAaHVudGVyMg==".to_string()));
    assert!(!commands.iter().any(|c| c.contains("a@test.com")));

    assert_eq!(
        upstream.message().unwrap(),
        "From: relay@relay.test\r\nTo: b@test.com\r\nSubject: hi\r\n\r\nbody\r\n"
    );
}

#[tokio::test]
async fn recipients_keep_order_and_duplicates() {
    let upstream = MockUpstream::start().await;
    let config = test_config(&upstream.host, upstream.port);
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let (mut client, session) = start_session(config, Arc::clone(&metrics));

    assert!(client.read_reply().await.starts_with("220 "));
    client.send("MAIL FROM:<a@test.com>").await;
    client.send("RCPT TO:<b@test.com>").await;
    client.send("RCPT TO:<a@test.com>").await;
    client.send("RCPT TO:<b@test.com>").await;
    assert!(client.send("DATA").await.starts_with("354 "));
    assert!(client
        .send_data("Subject: hi\r\n\r\nbody\r\n")
        .await
        .starts_with("250 "));
    client.send("QUIT").await;
    session.await.unwrap();

    let rcpts: Vec<String> = upstream
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("RCPT"))
        .collect();
    assert_eq!(
        rcpts,
        vec![
            "RCPT TO:<b@test.com>".to_string(),
            "RCPT TO:<a@test.com>".to_string(),
            "RCPT TO:<b@test.com>".to_string(),
        ]
    );

    let message = upstream.message().unwrap();
    assert!(message.starts_with("From: relay@relay.test\r\nTo: b@test.com,a@test.com,b@test.com\r\n"));
}

#[tokio::test]
async fn unreachable_upstream_rejects_transaction() {
    // Grab a local port that nothing is listening on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = test_config("127.0.0.1", dead_port);
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let (mut client, session) = start_session(config, Arc::clone(&metrics));

    assert!(client.read_reply().await.starts_with("220 "));
    client.send("MAIL FROM:<a@test.com>").await;
    client.send("RCPT TO:<b@test.com>").await;
    assert!(client.send("DATA").await.starts_with("354 "));
    let reply = client.send_data("Subject: hi\r\n\r\nbody\r\n").await;
    assert!(reply.starts_with("451"), "got: {reply}");

    assert_eq!(metrics.received.get(), 1);
    assert_eq!(metrics.forwarded.get(), 0);
    assert_eq!(metrics.failed.get(), 1);

    // The session stays usable for a retry by the client
    assert!(client.send("NOOP").await.starts_with("250 "));
    assert!(client.send("QUIT").await.starts_with("221 "));
    session.await.unwrap();
}

#[tokio::test]
async fn protocol_ordering_and_reset() {
    // The forwarder is never reached in this test
    let config = test_config("127.0.0.1", 1);
    let metrics = Arc::new(RelayMetrics::new().unwrap());
    let (mut client, session) = start_session(config, Arc::clone(&metrics));

    assert!(client.read_reply().await.starts_with("220 "));

    assert!(client
        .send("RCPT TO:<b@test.com>")
        .await
        .starts_with("503 "));
    assert!(client.send("DATA").await.starts_with("503 "));

    assert!(client
        .send("MAIL FROM:<a@test.com>")
        .await
        .starts_with("250 "));
    assert!(client
        .send("MAIL FROM:<c@test.com>")
        .await
        .starts_with("503 "));

    // Zero recipients at DATA time is rejected up front
    assert!(client.send("DATA").await.starts_with("503 "));

    // RSET is idempotent: twice in a row behaves like once
    assert!(client.send("RSET").await.starts_with("250 "));
    assert!(client.send("RSET").await.starts_with("250 "));
    assert!(client
        .send("RCPT TO:<b@test.com>")
        .await
        .starts_with("503 "));
    assert!(client
        .send("MAIL FROM:<a@test.com>")
        .await
        .starts_with("250 "));

    assert!(client.send("QUIT").await.starts_with("221 "));
    session.await.unwrap();

    assert_eq!(metrics.received.get(), 0);
    assert_eq!(metrics.forwarded.get(), 0);
    assert_eq!(metrics.failed.get(), 0);
}
