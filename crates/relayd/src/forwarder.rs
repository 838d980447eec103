use crate::config::Config;
use anyhow::Context;
use smtp_client::{EnvelopeAddress, Response, SmtpClient, SmtpClientTimeouts};
use std::sync::Arc;

/// Delivers one message per call over a fresh connection to the
/// configured upstream. No connection pooling, no retry: the whole
/// call either fully succeeds or fully fails, and the inbound client
/// is the only party that may retry.
pub struct Forwarder {
    config: Arc<Config>,
}

impl Forwarder {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub async fn forward(
        &self,
        sender: &EnvelopeAddress,
        recipients: &[EnvelopeAddress],
        body: &[u8],
    ) -> anyhow::Result<Response> {
        let message = build_message(sender, recipients, body);

        let addr = self.config.upstream_addr();
        let timeouts = SmtpClientTimeouts::default();
        let mut client = SmtpClient::new(addr.clone(), timeouts)
            .await
            .with_context(|| format!("connect to upstream {addr}"))?;

        let banner = client
            .read_response(None, timeouts.connect_timeout)
            .await
            .with_context(|| format!("read banner from upstream {addr}"))?;
        anyhow::ensure!(
            banner.code == 220,
            "unexpected banner from upstream {addr}: {}",
            banner.to_single_line()
        );

        let ehlo_name = gethostname::gethostname()
            .to_str()
            .unwrap_or("localhost")
            .to_string();
        client
            .ehlo(&ehlo_name)
            .await
            .with_context(|| format!("EHLO to upstream {addr}"))?;

        if !self.config.email_server_user.is_empty() {
            client
                .auth_plain(
                    &self.config.email_server_user,
                    Some(&self.config.email_server_pass),
                )
                .await
                .with_context(|| format!("AUTH PLAIN to upstream {addr}"))?;
        }

        let response = client
            .send_mail(sender, recipients, &message)
            .await
            .with_context(|| format!("send message to upstream {addr}"))?;

        // The message is accepted at this point; failure to QUIT
        // cleanly is not a delivery failure.
        client.quit().await.ok();

        Ok(response)
    }
}

/// Prepend literal From/To headers to the raw body. The body is
/// trusted to carry its own headers and blank-line separator; nothing
/// is validated or escaped here.
fn build_message(
    sender: &EnvelopeAddress,
    recipients: &[EnvelopeAddress],
    body: &[u8],
) -> Vec<u8> {
    let to = recipients
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<String>>()
        .join(",");

    let mut message = format!("From: {sender}\r\nTo: {to}\r\n").into_bytes();
    message.extend_from_slice(body);
    message
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn message_headers() {
        let sender = EnvelopeAddress::parse("relay@example.com").unwrap();
        let recipients = vec![
            EnvelopeAddress::parse("one@example.com").unwrap(),
            EnvelopeAddress::parse("two@example.com").unwrap(),
        ];
        let message = build_message(&sender, &recipients, b"Subject: hi\r\n\r\nbody\r\n");
        assert_equal!(
            String::from_utf8(message).unwrap(),
            "From: relay@example.com\r\n\
             To: one@example.com,two@example.com\r\n\
             Subject: hi\r\n\r\nbody\r\n"
        );
    }
}
