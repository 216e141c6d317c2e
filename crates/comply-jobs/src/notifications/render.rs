//! Channel rendering and recipient validation.

use once_cell::sync::Lazy;
use regex::Regex;

use comply_core::defaults::SMS_MAX_CHARS;
use comply_core::{Channel, DigestType, JobError, NotificationRecord, Recipient, RenderedMessage};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern compiles"));

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+[1-9][0-9]{6,14}$").expect("phone pattern compiles"));

/// Address to deliver to on `channel`. In-app delivery needs none.
pub fn validate_recipient(recipient: &Recipient, channel: Channel) -> Result<Option<String>, JobError> {
    let address = || {
        recipient
            .address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                JobError::InvalidRecipient(format!(
                    "user {} has no {} address",
                    recipient.user_id,
                    channel.as_str()
                ))
            })
    };

    match channel {
        Channel::InApp => Ok(None),
        Channel::Email => {
            let addr = address()?;
            if !EMAIL_RE.is_match(addr) {
                return Err(JobError::InvalidRecipient(format!("invalid email address: {addr}")));
            }
            Ok(Some(addr.to_string()))
        }
        Channel::Sms => {
            let addr = address()?;
            let normalized: String = addr.chars().filter(|c| !matches!(c, ' ' | '-' | '(' | ')')).collect();
            if !PHONE_RE.is_match(&normalized) {
                return Err(JobError::InvalidRecipient(format!("invalid phone number: {addr}")));
            }
            Ok(Some(normalized))
        }
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Truncate to the SMS limit, marking the cut with an ellipsis.
pub fn truncate_sms(text: &str) -> String {
    if text.chars().count() <= SMS_MAX_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(SMS_MAX_CHARS - 3).collect();
    out.push_str("...");
    out
}

fn html_paragraphs(text: &str) -> String {
    text.lines()
        .map(|line| format!("<p>{}</p>", escape_html(line)))
        .collect::<Vec<_>>()
        .join("")
}

fn entity_link(record: &NotificationRecord) -> Option<String> {
    match (&record.entity_type, record.entity_id) {
        (Some(kind), Some(id)) => Some(format!("/{kind}/{id}")),
        _ => None,
    }
}

/// Render one notification for its channel.
pub fn render(record: &NotificationRecord) -> Result<RenderedMessage, JobError> {
    let to = validate_recipient(&record.recipient, record.channel)?;
    Ok(match (record.channel, to) {
        (Channel::Email, Some(to)) => RenderedMessage::Email {
            to,
            subject: record.subject.clone(),
            text: record.body.clone(),
            html: format!(
                "<h2>{}</h2>{}",
                escape_html(&record.subject),
                html_paragraphs(&record.body)
            ),
        },
        (Channel::Sms, Some(to)) => RenderedMessage::Sms {
            to,
            text: truncate_sms(&format!("{}: {}", record.subject, record.body)),
        },
        _ => RenderedMessage::InApp {
            user_id: record.recipient.user_id,
            title: record.subject.clone(),
            body: record.body.clone(),
            link: entity_link(record),
        },
    })
}

/// Render one compiled message for a recipient's digest members.
///
/// Members are listed highest priority first, then oldest first.
pub fn render_digest(
    digest: DigestType,
    channel: Channel,
    recipient: &Recipient,
    records: &[NotificationRecord],
) -> Result<RenderedMessage, JobError> {
    let to = validate_recipient(recipient, channel)?;

    let mut ordered: Vec<&NotificationRecord> = records.iter().collect();
    ordered.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
    });

    let cadence = match digest {
        DigestType::Daily => "daily",
        DigestType::Weekly => "weekly",
    };
    let title = format!(
        "Your {cadence} digest: {} notification{}",
        ordered.len(),
        if ordered.len() == 1 { "" } else { "s" }
    );
    let lines: Vec<String> = ordered
        .iter()
        .map(|n| format!("- {}: {}", n.subject, n.body))
        .collect();

    Ok(match (channel, to) {
        (Channel::Email, Some(to)) => RenderedMessage::Email {
            to,
            subject: title.clone(),
            text: lines.join("\n"),
            html: format!(
                "<h2>{}</h2><ul>{}</ul>",
                escape_html(&title),
                ordered
                    .iter()
                    .map(|n| format!(
                        "<li><strong>{}</strong> {}</li>",
                        escape_html(&n.subject),
                        escape_html(&n.body)
                    ))
                    .collect::<String>()
            ),
        },
        (Channel::Sms, Some(to)) => RenderedMessage::Sms {
            to,
            text: truncate_sms(&format!(
                "{title}. {}",
                ordered
                    .iter()
                    .map(|n| n.subject.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            )),
        },
        _ => RenderedMessage::InApp {
            user_id: recipient.user_id,
            title,
            body: lines.join("\n"),
            link: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use comply_core::NotificationPriority;
    use uuid::Uuid;

    fn record(channel: Channel, address: Option<&str>) -> NotificationRecord {
        let mut recipient = Recipient::user(Uuid::new_v4());
        recipient.address = address.map(String::from);
        NotificationRecord::new(recipient, "deadline_reminder", channel, "Due <soon>", "Line one\nLine & two")
    }

    #[test]
    fn test_email_render_escapes_html() {
        let msg = render(&record(Channel::Email, Some("ops@example.com"))).unwrap();
        match msg {
            RenderedMessage::Email { to, subject, text, html } => {
                assert_eq!(to, "ops@example.com");
                assert_eq!(subject, "Due <soon>");
                assert_eq!(text, "Line one\nLine & two");
                assert_eq!(
                    html,
                    "<h2>Due &lt;soon&gt;</h2><p>Line one</p><p>Line &amp; two</p>"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_email_requires_valid_address() {
        assert!(matches!(
            render(&record(Channel::Email, Some("not-an-address"))),
            Err(JobError::InvalidRecipient(_))
        ));
        assert!(matches!(
            render(&record(Channel::Email, None)),
            Err(JobError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn test_address_patterns_accept_and_reject() {
        let r = Recipient::user(Uuid::new_v4());
        for ok in ["ops@example.com", "a.b+c@sub.example.co"] {
            assert!(validate_recipient(&r.clone().with_address(ok), Channel::Email).is_ok(), "{ok}");
        }
        for bad in ["ops@example", "ops @example.com", "@example.com", "a@b@c.com"] {
            assert!(validate_recipient(&r.clone().with_address(bad), Channel::Email).is_err(), "{bad}");
        }
        assert!(validate_recipient(&r.clone().with_address("+442071838750"), Channel::Sms).is_ok());
        for bad in ["+0123456789", "+12345", "+1555010999999999"] {
            assert!(validate_recipient(&r.clone().with_address(bad), Channel::Sms).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_sms_normalizes_and_validates_number() {
        let msg = render(&record(Channel::Sms, Some("+1 (555) 010-9999"))).unwrap();
        assert!(matches!(msg, RenderedMessage::Sms { ref to, .. } if to == "+15550109999"));
        assert!(render(&record(Channel::Sms, Some("5550109999"))).is_err());
    }

    #[test]
    fn test_sms_is_truncated_to_limit() {
        let mut n = record(Channel::Sms, Some("+15550109999"));
        n.body = "x".repeat(400);
        match render(&n).unwrap() {
            RenderedMessage::Sms { text, .. } => {
                assert_eq!(text.chars().count(), SMS_MAX_CHARS);
                assert!(text.ends_with("..."));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_in_app_links_entity() {
        let id = Uuid::new_v4();
        let n = record(Channel::InApp, None).with_entity("obligation", id);
        match render(&n).unwrap() {
            RenderedMessage::InApp { link, .. } => {
                assert_eq!(link, Some(format!("/obligation/{id}")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_digest_orders_by_priority_then_age() {
        let user = Recipient::user(Uuid::new_v4()).with_address("ops@example.com");
        let now = chrono::Utc::now();
        let low = NotificationRecord::new(user.clone(), "t", Channel::Email, "low", "b")
            .with_priority(NotificationPriority::Low)
            .with_created_at(now - chrono::Duration::hours(3));
        let urgent = NotificationRecord::new(user.clone(), "t", Channel::Email, "urgent", "b")
            .with_priority(NotificationPriority::Urgent)
            .with_created_at(now - chrono::Duration::hours(1));
        let older_urgent = NotificationRecord::new(user.clone(), "t", Channel::Email, "older", "b")
            .with_priority(NotificationPriority::Urgent)
            .with_created_at(now - chrono::Duration::hours(2));

        let msg = render_digest(DigestType::Daily, Channel::Email, &user, &[low, urgent, older_urgent])
            .unwrap();
        match msg {
            RenderedMessage::Email { subject, text, .. } => {
                assert_eq!(subject, "Your daily digest: 3 notifications");
                assert_eq!(text, "- older: b\n- urgent: b\n- low: b");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
