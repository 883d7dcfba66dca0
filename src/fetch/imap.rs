//! IMAP4rev1 fetcher over rustls.
//!
//! Speaks just enough of RFC 3501 for the sync pipeline: LOGIN, SELECT
//! INBOX, `UID SEARCH` bounded by a UID range and `SINCE`, and per-UID
//! `UID FETCH (RFC822)`. Blocking I/O, run under `spawn_blocking`; the
//! three timeouts (connect, greeting, socket) apply to the underlying
//! TCP stream. No IDLE.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::fetch::message::parse_raw;
use crate::fetch::{FetchBatch, FetchOptions, MessageSource};
use crate::model::Mailbox;

/// IMAP-backed [`MessageSource`].
pub struct ImapFetcher {
    options: FetchOptions,
}

impl ImapFetcher {
    pub fn new(options: FetchOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl MessageSource for ImapFetcher {
    async fn fetch(
        &self,
        mailbox: &Mailbox,
        password: &SecretString,
        last_uid: u32,
    ) -> Result<FetchBatch, FetchError> {
        let options = self.options.clone();
        let mailbox = mailbox.clone();
        let password = password.clone();

        tokio::task::spawn_blocking(move || fetch_blocking(&options, &mailbox, &password, last_uid))
            .await
            .map_err(|e| FetchError::Protocol(format!("fetch task panicked: {e}")))?
    }
}

/// One full fetch cycle over a fresh connection (blocking).
fn fetch_blocking(
    options: &FetchOptions,
    mailbox: &Mailbox,
    password: &SecretString,
    last_uid: u32,
) -> Result<FetchBatch, FetchError> {
    let mut conn = ImapConnection::open(&mailbox.imap_host, mailbox.imap_port, options)?;
    let result = run_fetch(&mut conn, options, mailbox, password, last_uid);
    // Close cleanly on success and failure alike.
    conn.logout();
    result
}

fn run_fetch(
    conn: &mut ImapConnection,
    options: &FetchOptions,
    mailbox: &Mailbox,
    password: &SecretString,
    last_uid: u32,
) -> Result<FetchBatch, FetchError> {
    conn.login(&mailbox.imap_username, password.expose_secret())?;
    conn.select_inbox()?;

    let criteria = search_criteria(last_uid, &since_date(Utc::now().date_naive(), options.since_days));
    let mut uids = conn.uid_search(&criteria)?;

    // A `UID n:*` range always matches the highest existing UID, even when
    // nothing is new; drop anything at or below the checkpoint.
    uids.retain(|&uid| uid > last_uid);
    uids.sort_unstable();

    let truncated = uids.len() > options.batch_size;
    uids.truncate(options.batch_size);

    debug!(
        mailbox_id = %mailbox.id,
        matched = uids.len(),
        truncated,
        "UID search complete"
    );

    let mut messages = Vec::with_capacity(uids.len());
    for uid in uids {
        match conn.uid_fetch_source(uid)? {
            Some(raw) => match parse_raw(uid, &mailbox.imap_host, &raw) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(uid, error = %e, "Skipping unparseable message"),
            },
            None => warn!(uid, "Server returned no source for UID"),
        }
    }

    Ok(FetchBatch {
        messages,
        truncated,
    })
}

/// `SINCE` operand in RFC 3501 date format (`DD-Mon-YYYY`).
fn since_date(today: chrono::NaiveDate, since_days: u32) -> String {
    let date = today - chrono::Days::new(u64::from(since_days));
    date.format("%d-%b-%Y").to_string()
}

/// Search criteria per the checkpoint: first sync uses only `SINCE`,
/// incremental syncs add the UID range above the checkpoint.
fn search_criteria(last_uid: u32, since: &str) -> String {
    if last_uid > 0 {
        format!("UID {}:* SINCE {}", last_uid.saturating_add(1), since)
    } else {
        format!("SINCE {since}")
    }
}

// ── Connection ──────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// One tagged response line, with an attached literal when the server
/// sent one (`{n}` continuation).
struct ResponseLine {
    text: String,
    literal: Option<Vec<u8>>,
}

struct ImapConnection {
    stream: TlsStream,
    tag_seq: u32,
}

impl ImapConnection {
    fn open(host: &str, port: u16, options: &FetchOptions) -> Result<Self, FetchError> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| FetchError::Connect(format!("resolve {host}:{port}: {e}")))?;

        let mut tcp = None;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, options.connect_timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let tcp = tcp.ok_or_else(|| match last_error {
            Some(e) if is_timeout(&e) => FetchError::Timeout(format!("connect to {host}:{port}")),
            Some(e) => FetchError::Connect(format!("{host}:{port}: {e}")),
            None => FetchError::Connect(format!("{host}:{port}: no addresses")),
        })?;

        tcp.set_read_timeout(Some(options.greeting_timeout))?;
        tcp.set_write_timeout(Some(options.socket_timeout))?;

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| FetchError::Tls(format!("invalid server name {host}: {e}")))?;
        let client = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| FetchError::Tls(e.to_string()))?;

        let mut conn = Self {
            stream: rustls::StreamOwned::new(client, tcp),
            tag_seq: 0,
        };

        let greeting = conn
            .read_line()
            .map_err(|e| match e {
                FetchError::Timeout(_) => FetchError::Timeout("server greeting".into()),
                other => other,
            })?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(FetchError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }

        // Greeting received; all further round-trips use the socket timeout.
        conn.stream.sock.set_read_timeout(Some(options.socket_timeout))?;

        Ok(conn)
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), FetchError> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        self.command(&cmd).map_err(|e| match e {
            FetchError::Protocol(msg) => FetchError::Auth(msg),
            other => other,
        })?;
        Ok(())
    }

    fn select_inbox(&mut self) -> Result<(), FetchError> {
        self.command("SELECT \"INBOX\"")?;
        Ok(())
    }

    fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>, FetchError> {
        let lines = self.command(&format!("UID SEARCH {criteria}"))?;
        let mut uids = Vec::new();
        for line in &lines {
            if let Some(rest) = line.text.strip_prefix("* SEARCH") {
                uids.extend(rest.split_whitespace().filter_map(|tok| tok.parse::<u32>().ok()));
            }
        }
        Ok(uids)
    }

    /// Full raw source for one UID, when the server returns it as a literal.
    fn uid_fetch_source(&mut self, uid: u32) -> Result<Option<Vec<u8>>, FetchError> {
        let lines = self.command(&format!("UID FETCH {uid} (RFC822)"))?;
        Ok(lines
            .into_iter()
            .find(|line| line.text.contains("FETCH") && line.literal.is_some())
            .and_then(|line| line.literal))
    }

    /// Best-effort LOGOUT; connection drops either way.
    fn logout(&mut self) {
        let _ = self.command("LOGOUT");
    }

    /// Send one tagged command and collect response lines until the tagged
    /// status line. Non-OK status is a protocol error carrying the server's
    /// text.
    fn command(&mut self, cmd: &str) -> Result<Vec<ResponseLine>, FetchError> {
        self.tag_seq += 1;
        let tag = format!("A{}", self.tag_seq);
        let full = format!("{tag} {cmd}\r\n");
        self.stream.write_all(full.as_bytes())?;
        self.stream.flush()?;

        let tag_prefix = format!("{tag} ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_response_line()?;
            let done = line.text.starts_with(&tag_prefix);
            lines.push(line);
            if done {
                break;
            }
        }

        // lines is non-empty by construction.
        let status = lines[lines.len() - 1].text.trim_end().to_string();
        if !status[tag_prefix.len()..].starts_with("OK") {
            return Err(FetchError::Protocol(status));
        }
        Ok(lines)
    }

    /// Read one logical response line, consuming `{n}` literal
    /// continuations along the way.
    fn read_response_line(&mut self) -> Result<ResponseLine, FetchError> {
        let mut text = self.read_line()?;
        let mut literal = None;
        while let Some(len) = trailing_literal_len(&text) {
            // Our commands request at most one literal per response.
            literal = Some(self.read_literal(len)?);
            let rest = self.read_line()?;
            text.push_str(&rest);
        }
        Ok(ResponseLine { text, literal })
    }

    fn read_line(&mut self) -> Result<String, FetchError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => return Err(FetchError::Protocol("connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) if is_timeout(&e) => {
                    return Err(FetchError::Timeout("read timed out".into()));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn read_literal(&mut self, len: usize) -> Result<Vec<u8>, FetchError> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).map_err(|e| {
            if is_timeout(&e) {
                FetchError::Timeout("read timed out".into())
            } else {
                FetchError::Io(e)
            }
        })?;
        Ok(buf)
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// RFC 3501 quoted string, escaping backslash and double quote.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Length of a trailing `{n}` literal marker, if the line ends with one.
fn trailing_literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let open = trimmed.rfind('{')?;
    if !trimmed.ends_with('}') {
        return None;
    }
    trimmed[open + 1..trimmed.len() - 1].parse().ok()
}

// ── Tests ───────────────────────────────────────────────────────────
