//! Email transport: IMAP polling for inbound, SMTP via lettre for replies.
//!
//! IMAP is spoken directly over a rustls stream. Each poll logs in, fetches
//! every unseen message in INBOX, marks it `\Seen` and logs out. The
//! blocking network work runs on `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::MessageParser;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::email_types::{
    angle_id, bare_id, references, reply_subject, strip_html, strip_quoted_text, thread_id,
};
use crate::channels::{InboundMessage, InboundStream, MailTransport, OutgoingReply};
use crate::error::ChannelError;

const CHANNEL: &str = "email";

// ── Configuration ───────────────────────────────────────────────────

/// Email transport configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub from_name: String,
    pub poll_interval_secs: u64,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set.
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("EMAIL_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());
        let from_name = std::env::var("EMAIL_FROM_NAME").unwrap_or_else(|_| "The Frog".to_string());

        let poll_interval_secs: u64 = std::env::var("EMAIL_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60)
            .max(1);

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password: SecretString::from(password),
            from_address,
            from_name,
            poll_interval_secs,
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────

pub struct EmailTransport {
    config: EmailConfig,
}

impl EmailTransport {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailTransport for EmailTransport {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn connect(&self) -> Result<InboundStream, ChannelError> {
        let cfg = self.config.clone();
        tokio::task::spawn_blocking(move || check_login(&cfg))
            .await
            .map_err(|e| startup_failed(format!("IMAP check task failed: {e}")))?
            .map_err(|e| startup_failed(format!("IMAP login to {} failed: {e}", self.config.imap_host)))?;
        info!(host = %self.config.imap_host, "IMAP login verified");

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let config = self.config.clone();

        tokio::spawn(async move {
            info!(
                "Email transport polling every {}s on {}",
                config.poll_interval_secs, config.imap_host
            );
            let mut tick = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));

            loop {
                tick.tick().await;

                let cfg = config.clone();
                match tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg)).await {
                    Ok(Ok(raw_messages)) => {
                        for raw in raw_messages {
                            let Some(msg) = parse_inbound(&raw) else {
                                warn!("Discarded email without sender or Message-ID");
                                continue;
                            };
                            debug!(sender = %msg.sender, subject = %msg.subject, "Email received");
                            if tx.send(msg).is_err() {
                                info!("Email listener closed");
                                return;
                            }
                        }
                    }
                    Ok(Err(e)) => error!("Email poll failed: {e}"),
                    Err(e) => error!("Email poll task panicked: {e}"),
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send_reply(
        &self,
        original: &InboundMessage,
        reply: OutgoingReply,
    ) -> Result<bool, ChannelError> {
        let email = build_reply(&self.config, original, &reply)?;
        let config = self.config.clone();
        let to = original.sender.clone();

        let delivered = tokio::task::spawn_blocking(move || {
            let response = smtp_transport(&config)?
                .send(&email)
                .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
            Ok::<_, ChannelError>(response.is_positive())
        })
        .await
        .map_err(|e| send_failed(format!("SMTP task failed: {e}")))??;

        info!(%to, delivered, "Email reply sent");
        Ok(delivered)
    }
}

fn startup_failed(reason: String) -> ChannelError {
    ChannelError::StartupFailed {
        name: CHANNEL.into(),
        reason,
    }
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: CHANNEL.into(),
        reason,
    }
}

fn smtp_transport(config: &EmailConfig) -> Result<SmtpTransport, ChannelError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );
    // 465 is implicit TLS; anything else negotiates STARTTLS.
    let builder = if config.smtp_port == 465 {
        SmtpTransport::relay(&config.smtp_host)
    } else {
        SmtpTransport::starttls_relay(&config.smtp_host)
    }
    .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?;

    Ok(builder.port(config.smtp_port).credentials(creds).build())
}

/// Build a threaded reply to `original`.
fn build_reply(
    config: &EmailConfig,
    original: &InboundMessage,
    reply: &OutgoingReply,
) -> Result<Message, ChannelError> {
    let from = Mailbox::new(
        Some(config.from_name.clone()),
        config
            .from_address
            .parse()
            .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
    );
    let to: Mailbox = original
        .sender
        .parse()
        .map_err(|e| send_failed(format!("Invalid to address: {e}")))?;
    let content_type = if reply.is_html {
        ContentType::TEXT_HTML
    } else {
        ContentType::TEXT_PLAIN
    };

    Message::builder()
        .from(from)
        .to(to)
        .subject(reply_subject(&original.subject))
        .in_reply_to(angle_id(&original.message_id))
        .references(format!(
            "{} {}",
            angle_id(&original.thread_id),
            angle_id(&original.message_id)
        ))
        .header(content_type)
        .body(reply.body.clone())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))
}

// ── Inbound parsing ─────────────────────────────────────────────────

/// Normalize a raw RFC 822 message. `None` when the sender or the
/// Message-ID is missing.
pub fn parse_inbound(raw: &[u8]) -> Option<InboundMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed.from().and_then(|addr| addr.first())?;
    let sender = from.address()?.to_string();
    let sender_name = from.name().unwrap_or_default().to_string();

    let message_id = bare_id(parsed.message_id()?);
    let refs = references(parsed.references());
    let thread_id = thread_id(&message_id, &refs);

    let text = match parsed.body_text(0) {
        Some(text) => text.to_string(),
        None => parsed
            .body_html(0)
            .map(|html| strip_html(&html))
            .unwrap_or_default(),
    };

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(InboundMessage {
        id: Uuid::new_v4(),
        channel: CHANNEL.into(),
        sender,
        sender_name,
        thread_id,
        message_id,
        subject: parsed.subject().unwrap_or_default().to_string(),
        body: strip_quoted_text(&text),
        received_at,
    })
}

// ── IMAP ────────────────────────────────────────────────────────────

/// Error type for IMAP operations.
type ImapError = Box<dyn std::error::Error + Send + Sync>;

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Tagged responses of one IMAP command.
struct ImapResponse {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// A blocking IMAP connection over TLS.
struct ImapSession {
    stream: BufReader<TlsStream>,
    next_tag: u32,
}

impl ImapSession {
    fn open(config: &EmailConfig) -> Result<Self, ImapError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(config.imap_host.clone())?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)?;

        let mut session = Self {
            stream: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
        };
        let greeting = session.read_line()?;
        if !greeting.starts_with("* OK") {
            return Err(format!("unexpected IMAP greeting: {}", greeting.trim_end()).into());
        }
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, ImapError> {
        let mut buf = Vec::new();
        if self.stream.read_until(b'\n', &mut buf)? == 0 {
            return Err("IMAP connection closed".into());
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Send a command and read until its tagged completion, which must be OK.
    fn run(&mut self, command: &str) -> Result<ImapResponse, ImapError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream.write_all(format!("{tag} {command}\r\n").as_bytes())?;
        stream.flush()?;

        let mut response = ImapResponse {
            lines: Vec::new(),
            literals: Vec::new(),
        };
        loop {
            let line = self.read_line()?;
            if let Some(size) = literal_size(&line) {
                let mut literal = vec![0u8; size];
                self.stream.read_exact(&mut literal)?;
                response.literals.push(literal);
            }
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                if !status.starts_with("OK") {
                    let verb = command.split_whitespace().next().unwrap_or(command);
                    return Err(format!("IMAP {verb} failed: {}", status.trim_end()).into());
                }
                response.lines.push(line);
                return Ok(response);
            }
            response.lines.push(line);
        }
    }

    fn login(&mut self, config: &EmailConfig) -> Result<(), ImapError> {
        self.run(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))
        .map(|_| ())
    }

    fn logout(mut self) {
        let _ = self.run("LOGOUT");
    }
}

/// Log in and out once, to fail fast on bad settings.
fn check_login(config: &EmailConfig) -> Result<(), ImapError> {
    let mut session = ImapSession::open(config)?;
    session.login(config)?;
    session.logout();
    Ok(())
}

/// Fetch unseen INBOX messages as raw RFC 822 bytes, marking each `\Seen`.
fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<Vec<u8>>, ImapError> {
    let mut session = ImapSession::open(config)?;
    session.login(config)?;
    session.run("SELECT \"INBOX\"")?;

    let search = session.run("SEARCH UNSEEN")?;
    let ids = parse_search(&search.lines);

    let messages = collect_unseen(&ids, |id| {
        // PEEK leaves the message unseen until it is safely in hand.
        let fetched = session.run(&format!("FETCH {id} BODY.PEEK[]"))?;
        let raw = fetched.literals.into_iter().next();
        if let Err(e) = session.run(&format!("STORE {id} +FLAGS (\\Seen)")) {
            warn!(id = %id, "Failed to mark email seen: {e}");
        }
        Ok(raw)
    });

    session.logout();
    Ok(messages)
}

/// Fetch each id in order, stopping at the first failure.
///
/// Messages fetched before the failure are kept; the rest stay unseen and
/// are picked up by the next poll.
fn collect_unseen<F>(ids: &[String], mut fetch: F) -> Vec<Vec<u8>>
where
    F: FnMut(&str) -> Result<Option<Vec<u8>>, ImapError>,
{
    let mut messages = Vec::with_capacity(ids.len());
    for id in ids {
        match fetch(id) {
            Ok(Some(raw)) => messages.push(raw),
            Ok(None) => warn!(id = %id, "FETCH returned no message body"),
            Err(e) => {
                warn!(id = %id, "Failed to fetch email, retrying next poll: {e}");
                break;
            }
        }
    }
    messages
}

/// Message numbers from `* SEARCH` lines.
fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

/// Size of a `{N}` literal announced at the end of a response line.
fn literal_size(line: &str) -> Option<usize> {
    let line = line.trim_end();
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EmailConfig {
        EmailConfig {
            imap_host: "imap.pond.test".into(),
            imap_port: 993,
            smtp_host: "smtp.pond.test".into(),
            smtp_port: 587,
            username: "frog@pond.test".into(),
            password: SecretString::from("pass"),
            from_address: "frog@pond.test".into(),
            from_name: "The Frog".into(),
            poll_interval_secs: 60,
        }
    }

    const FIRST_MAIL: &str = "From: Alice Lee <alice@example.com>\r\n\
To: frog@pond.test\r\n\
Subject: Lily pads\r\n\
Message-ID: <first@example.com>\r\n\
Date: Tue, 3 Mar 2026 09:12:00 +0000\r\n\
\r\n\
How many lily pads can a frog sit on?\r\n";

    const FOLLOW_UP: &str = "From: alice@example.com\r\n\
To: frog@pond.test\r\n\
Subject: Re: Lily pads\r\n\
Message-ID: <third@example.com>\r\n\
In-Reply-To: <second@pond.test>\r\n\
References: <first@example.com> <second@pond.test>\r\n\
\r\n\
And on a log?\r\n\
\r\n\
On Tue, Mar 3, 2026 at 9:15 AM The Frog <frog@pond.test> wrote:\r\n\
> One at a time.\r\n";

    #[test]
    fn parses_first_message_of_thread() {
        let msg = parse_inbound(FIRST_MAIL.as_bytes()).unwrap();
        assert_eq!(msg.sender, "alice@example.com");
        assert_eq!(msg.sender_name, "Alice Lee");
        assert_eq!(msg.message_id, "first@example.com");
        assert_eq!(msg.thread_id, "first@example.com");
        assert_eq!(msg.subject, "Lily pads");
        assert_eq!(msg.body.trim(), "How many lily pads can a frog sit on?");
        assert_eq!(msg.received_at.timestamp(), 1_772_529_120);
    }

    #[test]
    fn follow_up_joins_thread_and_drops_quote() {
        let msg = parse_inbound(FOLLOW_UP.as_bytes()).unwrap();
        assert_eq!(msg.thread_id, "first@example.com");
        assert_eq!(msg.message_id, "third@example.com");
        assert_eq!(msg.sender_name, "");
        assert_eq!(msg.body, "And on a log?");
    }

    #[test]
    fn message_without_id_is_discarded() {
        let raw = "From: a@example.com\r\nSubject: hi\r\n\r\nbody\r\n";
        assert!(parse_inbound(raw.as_bytes()).is_none());
    }

    #[test]
    fn reply_carries_threading_headers() {
        let original = parse_inbound(FOLLOW_UP.as_bytes()).unwrap();
        let email = build_reply(&config(), &original, &OutgoingReply::html("<p>Yes</p>")).unwrap();
        let formatted = String::from_utf8(email.formatted()).unwrap();

        assert!(formatted.contains("Subject: Re: Lily pads"));
        assert!(formatted.contains("In-Reply-To: <third@example.com>"));
        assert!(formatted.contains("References: <first@example.com> <third@example.com>"));
        assert!(formatted.contains("Content-Type: text/html"));
        assert!(formatted.contains("The Frog"));
        assert!(formatted.contains("<frog@pond.test>"));
    }

    #[test]
    fn plain_reply_is_text_plain() {
        let original = InboundMessage::new("email", "alice@example.com", "command", "x");
        let email = build_reply(&config(), &original, &OutgoingReply::plain("done")).unwrap();
        let formatted = String::from_utf8(email.formatted()).unwrap();
        assert!(formatted.contains("Content-Type: text/plain"));
        assert!(formatted.contains("Subject: Re: command"));
    }

    #[test]
    fn bad_recipient_is_send_error() {
        let original = InboundMessage::new("email", "not an address", "hi", "x");
        let err = build_reply(&config(), &original, &OutgoingReply::plain("x")).unwrap_err();
        assert!(matches!(err, ChannelError::SendFailed { .. }));
    }

    #[test]
    fn search_response_parsing() {
        let lines = vec![
            "* SEARCH 3 7 12\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(parse_search(&lines), vec!["3", "7", "12"]);
        assert!(parse_search(&["* SEARCH\r\n".to_string()]).is_empty());
    }

    #[test]
    fn literal_size_parsing() {
        assert_eq!(literal_size("* 1 FETCH (RFC822 {342}\r\n"), Some(342));
        assert_eq!(literal_size("* 1 FETCH (FLAGS (\\Seen))\r\n"), None);
        assert_eq!(literal_size("{oops}\r\n"), None);
    }

    #[test]
    fn fetch_failure_keeps_earlier_messages() {
        let ids: Vec<String> = ["1", "2", "3"].map(String::from).to_vec();
        let mut attempted = Vec::new();
        let messages = collect_unseen(&ids, |id| {
            attempted.push(id.to_string());
            match id {
                "2" => Err("read timed out".into()),
                _ => Ok(Some(format!("mail {id}").into_bytes())),
            }
        });
        assert_eq!(messages, vec![b"mail 1".to_vec()]);
        assert_eq!(attempted, vec!["1", "2"]);
    }

    #[test]
    fn fetch_without_body_is_skipped() {
        let ids: Vec<String> = ["1", "2"].map(String::from).to_vec();
        let messages = collect_unseen(&ids, |id| {
            Ok((id == "2").then(|| b"second".to_vec()))
        });
        assert_eq!(messages, vec![b"second".to_vec()]);
    }

    #[test]
    fn quoting_escapes() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn transport_name() {
        assert_eq!(EmailTransport::new(config()).name(), "email");
    }
}
