//! Raw IMAP over rustls: fetch unseen mail, mark it \Seen.
//!
//! Blocking; run inside `spawn_blocking`. Bodies are fetched with
//! `BODY.PEEK[]` so a message only becomes \Seen once the poller has dealt
//! with it.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::error::InboxError;

/// Socket read/write timeout.
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single literal; anything larger is treated as a broken
/// server response.
const MAX_LITERAL_BYTES: usize = 25 * 1024 * 1024;

/// IMAP settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub mailbox: String,
    /// Our own address; mail from it is never processed.
    pub own_address: String,
    pub poll_interval: Duration,
}

impl ImapConfig {
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (inbox polling disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let mailbox = std::env::var("EMAIL_IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".to_string());
        let own_address = std::env::var("EXEC_ASSIST_FROM_ADDRESS")
            .or_else(|_| std::env::var("EMAIL_FROM_ADDRESS"))
            .unwrap_or_else(|_| username.clone());

        let poll_interval_secs: u64 = std::env::var("EXEC_ASSIST_POLL_INTERVAL_SECS")
            .or_else(|_| std::env::var("EMAIL_POLL_INTERVAL_SECS"))
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(60);

        Some(Self {
            host,
            port,
            username,
            password,
            mailbox,
            own_address,
            poll_interval: Duration::from_secs(poll_interval_secs),
        })
    }
}

/// One unseen message as raw RFC 822 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMail {
    pub uid: u32,
    pub raw: Vec<u8>,
}

/// Fetch every unseen message in the configured mailbox without marking it.
pub fn fetch_unseen_imap(config: &ImapConfig) -> Result<Vec<FetchedMail>, InboxError> {
    let mut session = connect(config)?;
    let mail = fetch_unseen(&mut session, config)?;
    session.logout();
    Ok(mail)
}

/// Set \Seen on `uids`.
pub fn mark_seen_imap(config: &ImapConfig, uids: &[u32]) -> Result<(), InboxError> {
    if uids.is_empty() {
        return Ok(());
    }
    let mut session = connect(config)?;
    mark_seen(&mut session, config, uids)?;
    session.logout();
    Ok(())
}

fn fetch_unseen<S: Read + Write>(
    session: &mut Session<S>,
    config: &ImapConfig,
) -> Result<Vec<FetchedMail>, InboxError> {
    session.login(&config.username, &config.password)?;
    session.command(&format!("SELECT {}", quote(&config.mailbox)))?;

    let search = session.command("UID SEARCH UNSEEN")?;
    let uids = parse_search(&search.lines);
    debug!(count = uids.len(), mailbox = %config.mailbox, "Unseen messages");

    let mut mail = Vec::with_capacity(uids.len());
    for uid in uids {
        let response = session.command(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        match response.literals.into_iter().next() {
            Some(raw) => mail.push(FetchedMail { uid, raw }),
            None => warn!(uid, "FETCH returned no message body"),
        }
    }
    Ok(mail)
}

fn mark_seen<S: Read + Write>(
    session: &mut Session<S>,
    config: &ImapConfig,
    uids: &[u32],
) -> Result<(), InboxError> {
    session.login(&config.username, &config.password)?;
    session.command(&format!("SELECT {}", quote(&config.mailbox)))?;
    let set: Vec<String> = uids.iter().map(u32::to_string).collect();
    session.command(&format!("UID STORE {} +FLAGS (\\Seen)", set.join(",")))?;
    Ok(())
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect(config: &ImapConfig) -> Result<Session<TlsStream>, InboxError> {
    let failed = |reason: String| InboxError::Connection {
        host: format!("{}:{}", config.host, config.port),
        reason,
    };

    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .map_err(|e| failed(e.to_string()))?;
    tcp.set_read_timeout(Some(IO_TIMEOUT))
        .and_then(|()| tcp.set_write_timeout(Some(IO_TIMEOUT)))
        .map_err(|e| failed(e.to_string()))?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
        .map_err(|e| failed(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| failed(e.to_string()))?;

    let mut session = Session::new(rustls::StreamOwned::new(conn, tcp));
    session.greeting()?;
    Ok(session)
}

/// Untagged lines and literal payloads of one completed command.
#[derive(Debug, Default)]
struct Response {
    lines: Vec<String>,
    literals: Vec<Vec<u8>>,
}

/// Tagged command/response exchange over any byte stream.
struct Session<S> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> Session<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        }
    }

    fn greeting(&mut self) -> Result<(), InboxError> {
        let mut literals = Vec::new();
        let line = self.read_response_line(&mut literals)?;
        if line.starts_with("* OK") || line.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(InboxError::Protocol(format!("unexpected greeting: {}", line.trim_end())))
        }
    }

    fn login(&mut self, username: &str, password: &SecretString) -> Result<(), InboxError> {
        let command = format!("LOGIN {} {}", quote(username), quote(password.expose_secret()));
        self.command(&command).map(|_| ()).map_err(|e| match e {
            // Keep credentials out of the error text.
            InboxError::Rejected { response, .. } => InboxError::Rejected {
                command: "LOGIN".to_string(),
                response,
            },
            other => other,
        })
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout failed");
        }
    }

    /// Send `command` and read until its tagged completion. Anything but
    /// `OK` is a rejection.
    fn command(&mut self, command: &str) -> Result<Response, InboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let writer = self.stream.get_mut();
        writer
            .write_all(format!("{tag} {command}\r\n").as_bytes())
            .and_then(|()| writer.flush())
            .map_err(|e| InboxError::Protocol(format!("write failed: {e}")))?;

        let verb = command.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let mut response = Response::default();
        loop {
            let line = self.read_response_line(&mut response.literals)?;
            if let Some(status) = line.strip_prefix(&format!("{tag} ")) {
                let status = status.trim_end();
                if status.get(..2).is_some_and(|s| s.eq_ignore_ascii_case("OK")) {
                    return Ok(response);
                }
                return Err(InboxError::Rejected {
                    command: verb,
                    response: status.to_string(),
                });
            }
            response.lines.push(line);
        }
    }

    /// One logical response line. Literals announced with `{N}` are read
    /// into `literals` and the line continues after them.
    fn read_response_line(&mut self, literals: &mut Vec<Vec<u8>>) -> Result<String, InboxError> {
        let mut line = String::new();
        loop {
            let mut buf = Vec::new();
            let n = self
                .stream
                .read_until(b'\n', &mut buf)
                .map_err(|e| InboxError::Protocol(format!("read failed: {e}")))?;
            if n == 0 {
                return Err(InboxError::Protocol("connection closed by server".to_string()));
            }
            let part = String::from_utf8_lossy(&buf);
            line.push_str(&part);

            let Some(size) = literal_size(&part) else {
                return Ok(line);
            };
            if size > MAX_LITERAL_BYTES {
                return Err(InboxError::Protocol(format!("literal of {size} bytes is too large")));
            }
            let mut literal = vec![0; size];
            self.stream
                .read_exact(&mut literal)
                .map_err(|e| InboxError::Protocol(format!("literal read failed: {e}")))?;
            literals.push(literal);
        }
    }
}

/// Size of the literal announced at the end of `line`, e.g. `... {342}\r\n`.
fn literal_size(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

/// UIDs listed in `* SEARCH` responses.
fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|line| line.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect()
}

/// IMAP quoted string.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
