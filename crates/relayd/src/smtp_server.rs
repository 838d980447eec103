use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::metrics::RelayMetrics;
use smtp_client::EnvelopeAddress;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::task::JoinHandle;
use tracing::{error, instrument};

pub struct SmtpServer<T> {
    reader: BufReader<ReadHalf<T>>,
    writer: BufWriter<WriteHalf<T>>,
    state: TransactionState,
    said_hello: Option<String>,
    config: Arc<Config>,
    metrics: Arc<RelayMetrics>,
    hostname: String,
}

/// Explicit transaction states. Every command either advances the
/// state or is answered with 503; RSET returns to Idle from anywhere.
///
/// The sender recorded in SenderSet is always the configured override
/// address. The address the client supplied in MAIL FROM is logged
/// and then discarded.
#[derive(Debug)]
enum TransactionState {
    Idle,
    SenderSet {
        sender: EnvelopeAddress,
    },
    RecipientsSet {
        sender: EnvelopeAddress,
        recipients: Vec<EnvelopeAddress>,
    },
}

impl<T: AsyncRead + AsyncWrite + Debug + Send + 'static> SmtpServer<T> {
    pub fn run(
        socket: T,
        hostname: String,
        config: Arc<Config>,
        metrics: Arc<RelayMetrics>,
    ) -> JoinHandle<()> {
        let (reader, writer) = tokio::io::split(socket);
        let reader = BufReader::new(reader);
        let writer = BufWriter::new(writer);
        let mut server = SmtpServer {
            reader,
            writer,
            state: TransactionState::Idle,
            said_hello: None,
            config,
            metrics,
            hostname,
        };

        tokio::spawn(async move {
            if let Err(err) = server.process().await {
                error!("Error in SmtpServer: {err:#}");
                server
                    .write_response(421, "technical difficulties")
                    .await
                    .ok();
            }
        })
    }

    async fn write_response<S: AsRef<str>>(
        &mut self,
        status: u16,
        message: S,
    ) -> anyhow::Result<()> {
        let mut lines = message.as_ref().lines().peekable();
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            let sep = if is_last { ' ' } else { '-' };
            let text = format!("{status}{sep}{line}\r\n");
            self.writer.write_all(text.as_bytes()).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> anyhow::Result<String> {
        let mut line = String::new();
        self.reader.read_line(&mut line).await?;
        Ok(line)
    }

    #[instrument(skip(self))]
    async fn process(&mut self) -> anyhow::Result<()> {
        self.write_response(220, format!("{} smtp-relayd", self.hostname))
            .await?;
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                // EOF: the client went away without QUIT
                return Ok(());
            }
            let line = line.trim_end();

            match Command::parse(line) {
                Err(err) => {
                    self.write_response(
                        501,
                        format!("Syntax error in command or arguments: {err}"),
                    )
                    .await?;
                }
                Ok(Command::Quit) => {
                    self.write_response(221, "OK, bye").await?;
                    return Ok(());
                }
                Ok(Command::Ehlo(domain)) => {
                    self.write_response(250, format!("{} Hello {domain}", self.hostname))
                        .await?;
                    self.said_hello.replace(domain);
                }
                Ok(Command::Helo(domain)) => {
                    self.write_response(250, format!("Hello {domain}!")).await?;
                    self.said_hello.replace(domain);
                }
                Ok(Command::Mail(address)) => self.handle_mail(address).await?,
                Ok(Command::Rcpt(address)) => self.handle_rcpt(address).await?,
                Ok(Command::Data) => self.handle_data().await?,
                Ok(Command::Rset) => {
                    self.state = TransactionState::Idle;
                    self.write_response(250, "Reset state").await?;
                }
                Ok(Command::Noop) => {
                    self.write_response(250, "the goggles do nothing").await?;
                }
                Ok(Command::Unknown(cmd)) => {
                    self.write_response(502, format!("Command unrecognized/unimplemented: {cmd}"))
                        .await?;
                }
            }
        }
    }

    async fn handle_mail(&mut self, address: EnvelopeAddress) -> anyhow::Result<()> {
        if !matches!(self.state, TransactionState::Idle) {
            return self
                .write_response(503, "MAIL FROM already issued; you must RSET first")
                .await;
        }

        // Record the declared sender for observability, but forward
        // with the configured override address regardless.
        let sender = self.config.from_address.clone();
        tracing::info!("MAIL FROM:<{address}> (sender overridden to <{sender}>)");

        self.state = TransactionState::SenderSet { sender };
        self.write_response(250, "OK").await
    }

    async fn handle_rcpt(&mut self, address: EnvelopeAddress) -> anyhow::Result<()> {
        tracing::info!("RCPT TO:<{address}>");
        match std::mem::replace(&mut self.state, TransactionState::Idle) {
            TransactionState::Idle => {
                self.write_response(503, "MAIL FROM must be issued first")
                    .await
            }
            TransactionState::SenderSet { sender } => {
                self.state = TransactionState::RecipientsSet {
                    sender,
                    recipients: vec![address],
                };
                self.write_response(250, "OK").await
            }
            TransactionState::RecipientsSet {
                sender,
                mut recipients,
            } => {
                // Arrival order is preserved and duplicates are kept
                recipients.push(address);
                self.state = TransactionState::RecipientsSet { sender, recipients };
                self.write_response(250, "OK").await
            }
        }
    }

    async fn handle_data(&mut self) -> anyhow::Result<()> {
        match std::mem::replace(&mut self.state, TransactionState::Idle) {
            TransactionState::Idle => {
                self.write_response(503, "MAIL FROM must be issued first")
                    .await
            }
            state @ TransactionState::SenderSet { .. } => {
                // Accepting DATA with no recipients would leave the
                // upstream transaction with nowhere to go; reject it
                // here instead of delegating that ambiguity upstream.
                self.state = state;
                self.write_response(503, "RCPT TO must be issued first")
                    .await
            }
            TransactionState::RecipientsSet { sender, recipients } => {
                self.write_response(354, "Send body; end with CRLF.CRLF")
                    .await?;

                let data = self.read_data().await?;
                self.metrics.received.inc();

                let forwarder = Forwarder::new(Arc::clone(&self.config));
                match forwarder.forward(&sender, &recipients, &data).await {
                    Ok(response) => {
                        self.metrics.forwarded.inc();
                        tracing::info!(
                            "forwarded message for {} recipient(s); upstream said: {}",
                            recipients.len(),
                            response.to_single_line()
                        );
                        self.write_response(250, "OK: queued").await
                    }
                    Err(err) => {
                        self.metrics.failed.inc();
                        error!("failed to forward message: {err:#}");
                        self.write_response(451, format!("forwarding failed: {err:#}"))
                            .await
                    }
                }
            }
        }
    }

    /// Read the message payload into memory, un-stuffing leading dots,
    /// until the lone `.` terminator. A disconnect mid-payload
    /// propagates as an error without any forward attempt.
    async fn read_data(&mut self) -> anyhow::Result<Vec<u8>> {
        let mut data = vec![];

        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                anyhow::bail!("connection closed while receiving message data");
            }
            if line == ".\r\n" {
                return Ok(data);
            }

            let line = if let Some(stripped) = line.strip_prefix('.') {
                stripped
            } else {
                &line
            };

            data.extend_from_slice(line.as_bytes());
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Ehlo(String),
    Helo(String),
    Mail(EnvelopeAddress),
    Rcpt(EnvelopeAddress),
    Data,
    Rset,
    Noop,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> anyhow::Result<Self> {
        fn prefix_match(line: &str, candidate: &str) -> bool {
            if line.len() < candidate.len() {
                false
            } else {
                line[..candidate.len()].eq_ignore_ascii_case(candidate)
            }
        }

        fn extract_envelope(line: &str) -> anyhow::Result<(&str, &str)> {
            if !line.starts_with('<') {
                anyhow::bail!("expected <: {line:?}");
            }
            let rangle = line
                .bytes()
                .position(|c| c == b'>')
                .ok_or_else(|| anyhow::anyhow!("expected >: {line:?}"))?;

            Ok((&line[1..rangle], &line[rangle + 1..]))
        }

        Ok(if line.eq_ignore_ascii_case("QUIT") {
            Self::Quit
        } else if line.eq_ignore_ascii_case("DATA") {
            Self::Data
        } else if line.eq_ignore_ascii_case("RSET") {
            Self::Rset
        } else if line.eq_ignore_ascii_case("NOOP") {
            Self::Noop
        } else if prefix_match(line, "EHLO ") {
            Self::Ehlo(line[5..].to_string())
        } else if prefix_match(line, "HELO ") {
            Self::Helo(line[5..].to_string())
        } else if prefix_match(line, "MAIL FROM:") {
            let (address, _params) = extract_envelope(&line[10..])?;
            Self::Mail(EnvelopeAddress::parse(address)?)
        } else if prefix_match(line, "RCPT TO:") {
            let (address, _params) = extract_envelope(&line[8..])?;
            if address.is_empty() {
                anyhow::bail!("Null sender not permitted as a recipient");
            }
            Self::Rcpt(EnvelopeAddress::parse(address)?)
        } else {
            Self::Unknown(line.to_string())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn command_parser() {
        assert_equal!(Command::parse("QUIT").unwrap(), Command::Quit);
        assert_equal!(Command::parse("quit").unwrap(), Command::Quit);
        assert_equal!(
            Command::parse("quite").unwrap(),
            Command::Unknown("quite".to_string())
        );
        assert_equal!(
            Command::parse("flibble").unwrap(),
            Command::Unknown("flibble".to_string())
        );
        assert_equal!(
            Command::parse("MAIL From:<>").unwrap(),
            Command::Mail(EnvelopeAddress::null_sender())
        );
        assert_equal!(
            Command::parse("MAIL From:<user@example.com>").unwrap(),
            Command::Mail(EnvelopeAddress::parse("user@example.com").unwrap())
        );
        assert_equal!(
            Command::parse("rcpt to:<>").unwrap_err().to_string(),
            "Null sender not permitted as a recipient"
        );
        assert_equal!(
            Command::parse("rcpt TO:<user@example.com>").unwrap(),
            Command::Rcpt(EnvelopeAddress::parse("user@example.com").unwrap())
        );
    }
}
