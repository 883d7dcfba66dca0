//! Message classifier — pure rule evaluation, no I/O.
//!
//! Rules are evaluated in a fixed priority order; the first match wins and
//! carries a fixed confidence. BOUNCE dominates because the downstream
//! bounce branch depends on it; TRANSACTIONAL precedes NOTIFICATION because
//! its patterns are narrower; NEWSLETTER precedes MARKETING because
//! newsletters are list mail with additional list headers; HUMAN comes last
//! because its definition is negative.

use regex::Regex;

use crate::fetch::RawMessage;
use crate::model::Category;

/// Classification result: category plus fixed confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub confidence: f64,
}

/// Senders that mark a message as a delivery report.
const BOUNCE_SENDERS: &[&str] = &["mailer-daemon", "postmaster", "mail-daemon"];

/// Subject fragments that mark a message as a delivery report.
const BOUNCE_SUBJECTS: &[&str] = &[
    "undelivered",
    "failure notice",
    "returned mail",
    "delivery status notification",
    "mail delivery failed",
    "undeliverable",
    "bounce",
    "permanent error",
    "delivery failure",
];

/// From-address fragments that rule out a human sender.
const AUTOMATED_SENDER_MARKERS: &[&str] = &[
    "noreply",
    "no-reply",
    "notifications",
    "alert",
    "updates",
    "newsletter",
    "marketing",
    "info",
    "support",
];

/// Classifier with pre-compiled rule tables.
pub struct Classifier {
    transactional_from: Regex,
    transactional_subject: Regex,
    notification_from: Regex,
    notification_subject: Regex,
    newsletter_subject: Regex,
    marketing_subject: Regex,
    url: Regex,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            transactional_from: Regex::new(
                r"(?i)^(no-?reply|notifications?|notify|support|security|billing|invoices?|receipts?|orders?|accounts?|team)@",
            )
            .unwrap(),
            transactional_subject: Regex::new(
                r"(?i)(password reset|reset your password|(verify|confirm) your email|email verification|order confirmation|order #\d+|receipt|invoice|payment received|subscription|welcome to|account created|security alert|suspicious activity)",
            )
            .unwrap(),
            notification_from: Regex::new(
                r"(?i)^(notifications?|alerts?|updates?|activity|digest)@",
            )
            .unwrap(),
            notification_subject: Regex::new(
                r"(?i)(activity on|you have \d+ new|new (comment|reply|message|mention)|reminder:|upcoming|(daily|weekly|monthly) (summary|digest|report)|someone (liked|commented|shared)|\d+ new notifications?)",
            )
            .unwrap(),
            newsletter_subject: Regex::new(
                r"(?i)(newsletter|weekly roundup|this week in|edition #?\d+|volume \d+)",
            )
            .unwrap(),
            marketing_subject: Regex::new(
                r"(?i)(\bsale\b|\d+% off|discount|limited time|exclusive offer|deal of the day|free shipping|(buy|shop) now|don't miss|last chance|special offer|promotion)",
            )
            .unwrap(),
            url: Regex::new(r"(?i)https?://").unwrap(),
        }
    }

    /// Classify a message. Pure: same input, same output.
    pub fn classify(&self, msg: &RawMessage) -> Classification {
        let from = msg.from_address.as_str();
        let subject_lower = msg.subject.to_lowercase();

        // 1. BOUNCE
        let bounce_sender = BOUNCE_SENDERS.iter().any(|m| from.contains(m));
        let bounce_subject = BOUNCE_SUBJECTS.iter().any(|m| subject_lower.contains(m));
        if bounce_sender || bounce_subject {
            return Classification {
                category: Category::Bounce,
                confidence: 1.00,
            };
        }

        let has_list_unsubscribe = msg.has_header("list-unsubscribe");
        let has_list_post = msg.has_header("list-post");
        let has_list_id = msg.has_header("list-id");

        // 2. TRANSACTIONAL — narrow sender/subject patterns, and never list mail.
        if (self.transactional_from.is_match(from)
            || self.transactional_subject.is_match(&msg.subject))
            && !has_list_unsubscribe
        {
            return Classification {
                category: Category::Transactional,
                confidence: 0.90,
            };
        }

        // 3. NOTIFICATION
        if self.notification_from.is_match(from)
            || self.notification_subject.is_match(&msg.subject)
        {
            return Classification {
                category: Category::Notification,
                confidence: 0.85,
            };
        }

        // 4. NEWSLETTER
        if (has_list_unsubscribe && has_list_post)
            || self.newsletter_subject.is_match(&msg.subject)
        {
            return Classification {
                category: Category::Newsletter,
                confidence: 0.75,
            };
        }

        // 5. MARKETING
        if has_list_unsubscribe
            || (self.marketing_subject.is_match(&msg.subject) && self.count_urls(&msg.body) > 5)
        {
            return Classification {
                category: Category::Marketing,
                confidence: 0.80,
            };
        }

        // 6. HUMAN
        let automated_sender = AUTOMATED_SENDER_MARKERS.iter().any(|m| from.contains(m));
        let personal_reply_to = msg
            .header("reply-to")
            .map(|v| {
                let v = v.to_lowercase();
                !v.contains("noreply") && !v.contains("no-reply")
            })
            .unwrap_or(false);
        let single_recipient = msg.to.len() + msg.cc.len() == 1;
        if !automated_sender
            && (personal_reply_to || single_recipient)
            && !has_list_unsubscribe
            && !has_list_id
        {
            return Classification {
                category: Category::Human,
                confidence: 0.70,
            };
        }

        // 7. UNKNOWN
        Classification {
            category: Category::Unknown,
            confidence: 0.00,
        }
    }

    fn count_urls(&self, body: &str) -> usize {
        self.url.find_iter(body).count()
    }
}
