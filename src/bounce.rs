//! Bounce parsing — failed recipient, SMTP status, and diagnostic
//! extraction from delivery reports.
//!
//! Accepts RFC 3464 multipart/report payloads plus the non-standard bounce
//! formats Gmail, Outlook/Exchange, and generic SMTP servers emit. No
//! extraction is guaranteed for non-English bounces; those still produce an
//! aggregate with the sentinel diagnostic.

use regex::Regex;

use crate::fetch::RawMessage;
use crate::model::BounceType;

/// Sentinel used when no diagnostic pattern yields a valid result.
pub const NO_DIAGNOSTIC: &str = "No diagnostic information available";

/// Diagnostics are capped at this many characters.
const MAX_DIAGNOSTIC_LEN: usize = 300;

/// Address fragment shared by the extraction patterns.
const ADDR: &str = r"[A-Za-z0-9._+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}";

/// File extensions that mark an "address" as an asset reference, not a
/// recipient (image names in HTML bounce bodies match the address shape).
const BINARY_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".mp4", ".pdf", ".doc", ".zip",
];

/// Addresses the reporting infrastructure uses about itself.
const SYSTEM_PREFIXES: &[&str] = &["mailer-daemon@", "postmaster@", "noreply@", "no-reply@"];

/// Boilerplate that marks the end of useful diagnostic text.
const DISCLAIMER_PHRASES: &[&str] = &[
    "this email and any attachments",
    "confidentiality notice",
    "if you are not the intended recipient",
    "unsubscribe",
    "gdpr",
    "privacy policy",
];

/// Marketing fragments that disqualify a candidate diagnostic outright.
const MARKETING_PHRASES: &[&str] = &[
    "view this email in your browser",
    "click here",
    "special offer",
    "limited time",
    "free shipping",
    "shop now",
    "% off",
    "update your preferences",
    "add us to your address book",
];

/// Terms a real diagnostic is expected to contain.
const BOUNCE_TERMS: &[&str] = &[
    "deliver",
    "bounce",
    "fail",
    "reject",
    "error",
    "invalid",
    "exist",
    "quota",
    "full",
    "unknown",
    "temporary",
    "permanent",
];

const RECIPIENT_TERMS: &[&str] = &["recipient", "mailbox", "address", "user", "account"];

/// Parsed bounce facts for one delivery report.
#[derive(Debug, Clone)]
pub struct BounceData {
    /// Validated failed recipient, or `None` when nothing plausible was
    /// found (the message is then not recorded as a bounce).
    pub recipient: Option<String>,
    /// Three-digit SMTP status as text, or `"UNKNOWN"`.
    pub error_code: String,
    /// Cleaned diagnostic, or [`NO_DIAGNOSTIC`].
    pub diagnostic: String,
    pub bounce_type: BounceType,
}

/// Bounce parser with pre-compiled extraction patterns.
pub struct BounceParser {
    /// Whether the subject line is also scanned for a recipient.
    subject_fallback: bool,
    recipient_patterns: Vec<Regex>,
    address_shape: Regex,
    hex_local: Regex,
    uuid_local: Regex,
    mx_host: Regex,
    smtp_code: Regex,
    smtp_code_bounded: Regex,
    diagnostic_patterns: Vec<Regex>,
    url: Regex,
    html_tag: Regex,
    html_entity: Regex,
    decoration: Regex,
    hard_hint: Regex,
    soft_hint: Regex,
}

impl Default for BounceParser {
    fn default() -> Self {
        Self::new(true)
    }
}

impl BounceParser {
    pub fn new(subject_fallback: bool) -> Self {
        // Recipient sources in priority order: explicit failure phrasing,
        // RFC 3464 fields, angle-bracketed, labeled, then any bare address.
        let recipient_patterns = vec![
            Regex::new(&format!(
                r"(?is)(?:failed|undelivered).{{0,120}}?(?:to|for|recipient)[:\s]+<?({ADDR})>?"
            ))
            .unwrap(),
            Regex::new(&format!(r"(?i)final-recipient:\s*rfc822;\s*({ADDR})")).unwrap(),
            Regex::new(&format!(r"(?i)original-recipient:\s*(?:rfc822;\s*)?({ADDR})")).unwrap(),
            Regex::new(&format!(r"<({ADDR})>")).unwrap(),
            Regex::new(&format!(r"(?i)\b(?:to|for|recipient|user):\s*({ADDR})")).unwrap(),
            Regex::new(&format!(r"\b({ADDR})\b")).unwrap(),
        ];

        let diagnostic_patterns = vec![
            // "550 5.1.1 The email account does not exist ..."
            Regex::new(r"(?i)\b\d{3}[ -]\d\.\d{1,3}\.\d{1,3}\s+([^\r\n]{10,300})").unwrap(),
            Regex::new(r"(?i)diagnostic-code:\s*smtp;\s*([^\r\n]{5,300})").unwrap(),
            Regex::new(r"(?i)status:\s*\d\.\d{1,3}\.\d{1,3}\s*\(([^)]{5,200})\)").unwrap(),
            // Gmail: "Address not found ... because the address couldn't be found"
            Regex::new(r"(?i)address not found[\s\S]{0,200}?because\s+([^\r\n]{10,300})").unwrap(),
            // Outlook/Exchange
            Regex::new(r"(?i)did not reach the following recipients?[:\s]+([^\r\n]{10,300})")
                .unwrap(),
            // Bare SMTP response line
            Regex::new(r"(?i)\b([45]\d{2}[ -][^\r\n]{10,300})").unwrap(),
        ];

        Self {
            subject_fallback,
            recipient_patterns,
            address_shape: Regex::new(&format!(r"^{ADDR}$")).unwrap(),
            hex_local: Regex::new(r"^[0-9a-fA-F]{8}").unwrap(),
            uuid_local: Regex::new(
                r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
            )
            .unwrap(),
            mx_host: Regex::new(r"@mx\.(google|yahoo|outlook)\.com$").unwrap(),
            smtp_code: Regex::new(r"[245]\d{2}").unwrap(),
            smtp_code_bounded: Regex::new(r"\b[245]\d{2}\b").unwrap(),
            diagnostic_patterns,
            url: Regex::new(r"(?i)https?://\S+").unwrap(),
            html_tag: Regex::new(r"<[^>]*>").unwrap(),
            html_entity: Regex::new(r"&[a-zA-Z]{2,8};|&#\d{1,6};").unwrap(),
            decoration: Regex::new(r"[*=\-_]{3,}").unwrap(),
            hard_hint: Regex::new(r"(?is)(user|mailbox).{0,80}not.{0,40}found|account.{0,40}disabled")
                .unwrap(),
            soft_hint: Regex::new(r"(?is)mailbox.{0,40}full|quota.{0,60}exceeded|temporarily")
                .unwrap(),
        }
    }

    /// Parse one bounce-classified message into its delivery facts.
    pub fn parse(&self, msg: &RawMessage) -> BounceData {
        let recipient = self.extract_recipient(msg);
        let error_code = self.extract_error_code(&msg.body);
        let diagnostic = self.extract_diagnostic(&msg.body);
        let bounce_type = self.classify_type(&error_code, &msg.body);
        BounceData {
            recipient,
            error_code,
            diagnostic,
            bounce_type,
        }
    }

    /// Find the failed recipient: run each pattern over the body (and the
    /// subject, when the fallback is enabled) and return the first
    /// candidate that passes the validity predicate.
    pub fn extract_recipient(&self, msg: &RawMessage) -> Option<String> {
        let mut haystack = msg.body.clone();
        if self.subject_fallback {
            haystack.push('\n');
            haystack.push_str(&msg.subject);
        }

        for pattern in &self.recipient_patterns {
            for captures in pattern.captures_iter(&haystack) {
                if let Some(candidate) = captures.get(1) {
                    let addr = candidate.as_str().to_lowercase();
                    if self.is_valid_recipient(&addr) {
                        return Some(addr);
                    }
                }
            }
        }
        None
    }

    /// The address validity predicate. Rejects message-id-shaped locals,
    /// UUID locals, MX hosts, asset filenames, and reporting-system
    /// addresses so the aggregate only ever tracks plausible end users.
    pub fn is_valid_recipient(&self, addr: &str) -> bool {
        let addr = addr.to_lowercase();
        if addr.len() < 5 || addr.len() > 254 {
            return false;
        }
        if !self.address_shape.is_match(&addr) {
            return false;
        }
        if addr.contains("..") {
            return false;
        }

        let Some((local, domain)) = addr.rsplit_once('@') else {
            return false;
        };
        if local.len() > 64 {
            return false;
        }
        if self.hex_local.is_match(local) || self.uuid_local.is_match(local) {
            return false;
        }

        if domain.len() < 3 || domain.len() > 253 {
            return false;
        }
        // The part before the TLD must not be purely numeric ("123.com"
        // shows up in tracking pixels, not in recipient lists).
        if let Some((sub, _tld)) = domain.rsplit_once('.') {
            if !sub.is_empty() && sub.chars().all(|c| c.is_ascii_digit() || c == '.') {
                return false;
            }
        }

        if BINARY_EXTENSIONS.iter().any(|ext| addr.ends_with(ext)) {
            return false;
        }
        if self.mx_host.is_match(&addr) {
            return false;
        }
        if SYSTEM_PREFIXES.iter().any(|p| addr.starts_with(p)) {
            return false;
        }
        true
    }

    /// First SMTP status code in the body, else `"UNKNOWN"`.
    fn extract_error_code(&self, body: &str) -> String {
        self.smtp_code
            .find(body)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }

    /// Try the diagnostic patterns in priority order; the first match that
    /// survives cleaning and validation wins.
    fn extract_diagnostic(&self, body: &str) -> String {
        for pattern in &self.diagnostic_patterns {
            for captures in pattern.captures_iter(body) {
                if let Some(candidate) = captures.get(1) {
                    let cleaned = self.clean_diagnostic(candidate.as_str());
                    if self.is_valid_diagnostic(&cleaned) {
                        return cleaned.chars().take(MAX_DIAGNOSTIC_LEN).collect();
                    }
                }
            }
        }
        NO_DIAGNOSTIC.to_string()
    }

    /// Strip URLs, markup, decorations, and trailing boilerplate; collapse
    /// whitespace; trim surrounding punctuation.
    fn clean_diagnostic(&self, raw: &str) -> String {
        let s = self.url.replace_all(raw, " ");
        let s = self.html_tag.replace_all(&s, " ");
        let s = self.html_entity.replace_all(&s, " ");
        let mut s = self.decoration.replace_all(&s, " ").into_owned();

        let lower = s.to_lowercase();
        let mut cut = s.len();
        for phrase in DISCLAIMER_PHRASES {
            if let Some(pos) = lower.find(phrase) {
                cut = cut.min(pos);
            }
        }
        s.truncate(cut);

        let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string()
    }

    fn is_valid_diagnostic(&self, text: &str) -> bool {
        if text.len() < 10 {
            return false;
        }
        if !text.chars().any(|c| c.is_alphabetic()) {
            return false;
        }

        let symbols = text
            .chars()
            .filter(|c| !c.is_alphanumeric() && !c.is_whitespace())
            .count();
        if symbols * 100 > text.chars().count() * 40 {
            return false;
        }

        let lower = text.to_lowercase();
        if MARKETING_PHRASES.iter().any(|p| lower.contains(p)) {
            return false;
        }

        BOUNCE_TERMS.iter().any(|t| lower.contains(t))
            || RECIPIENT_TERMS.iter().any(|t| lower.contains(t))
            || self.smtp_code_bounded.is_match(text)
    }

    /// Hard/soft/unknown from the SMTP code, with body heuristics when the
    /// code is unknown.
    fn classify_type(&self, code: &str, body: &str) -> BounceType {
        match code {
            "550" | "551" | "552" | "553" | "554" => return BounceType::Hard,
            "450" | "451" | "452" | "453" => return BounceType::Soft,
            _ => {}
        }

        if code.len() == 3 && code.chars().all(|c| c.is_ascii_digit()) {
            return match code.as_bytes()[0] {
                b'5' => BounceType::Hard,
                b'4' => BounceType::Soft,
                _ => BounceType::Unknown,
            };
        }

        if self.hard_hint.is_match(body) {
            BounceType::Hard
        } else if self.soft_hint.is_match(body) {
            BounceType::Soft
        } else {
            BounceType::Unknown
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
