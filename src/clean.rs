//! Text cleanup and header heuristics shared by every export decoder.
//!
//! Everything here is pure and infallible: malformed input degrades to an
//! empty or default value rather than an error, so one bad header never
//! costs the whole record.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

use crate::models::SenderInfo;

/// Vocabulary for the cheap job-search pre-filter.
pub const JOB_KEYWORDS: &[&str] = &[
    "application",
    "interview",
    "position",
    "job",
    "career",
    "opportunity",
    "recruiter",
    "hiring",
    "candidate",
    "resume",
    "cv",
    "offer",
    "rejection",
    "thank you for applying",
    "next steps",
    "screening",
];

const HIGH_PRIORITY_KEYWORDS: &[&str] = &["offer", "interview", "urgent", "immediate"];
const MEDIUM_PRIORITY_KEYWORDS: &[&str] = &["application", "position", "opportunity", "recruiter"];

static SIGNATURE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // "-- " delimiter line and everything after it
        r"(?ms)^--[ \t]*$.*",
        r"(?is)\bsent from my\b.*",
        r"(?is)\bbest regards\b.*",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("static whitespace pattern"));

static HTML_BLOCKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head)[^>]*>.*?</(script|style|head)>")
        .expect("static html block pattern")
});

static HTML_TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("static html tag pattern"));

/// Strip signatures and collapse whitespace.
///
/// Signature removal runs on the raw text so line-anchored delimiters
/// (`-- `) still match; whitespace is normalized afterwards.
pub fn clean_content(content: &str) -> String {
    if content.trim().is_empty() {
        return String::new();
    }

    let mut text = content.to_string();
    for pattern in SIGNATURE_PATTERNS.iter() {
        text = pattern.replace(&text, "").into_owned();
    }

    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Remove tags and the handful of entities that show up in mail bodies.
pub fn strip_html(html: &str) -> String {
    let without_blocks = HTML_BLOCKS.replace_all(html, " ");
    let text = HTML_TAGS.replace_all(&without_blocks, " ");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Split a `From:` style header into display name and lowercased address.
///
/// Handles `Name <addr>`, `"Quoted, Name" <addr>`, `<addr>` and a bare
/// `addr`. Anything without an `@` is treated as a display name only.
pub fn parse_sender(raw: &str) -> SenderInfo {
    let raw = raw.trim();
    if raw.is_empty() {
        return SenderInfo::default();
    }

    if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>')) {
        if open < close {
            let address = raw[open + 1..close].trim().to_lowercase();
            let name = raw[..open].trim().trim_matches('"').trim().to_string();
            return SenderInfo { name, address };
        }
    }

    if raw.contains('@') && !raw.contains(char::is_whitespace) {
        return SenderInfo {
            name: String::new(),
            address: raw.to_lowercase(),
        };
    }

    SenderInfo {
        name: raw.trim_matches('"').to_string(),
        address: String::new(),
    }
}

/// Guess an organisation name from the sender's domain.
///
/// `hr@techcorp.com` becomes `Techcorp`, `jobs@mail.acme.io` becomes
/// `Acme Io`. Returns an empty string when there is no domain.
pub fn company_from_address(address: &str) -> String {
    let Some((_, domain)) = address.rsplit_once('@') else {
        return String::new();
    };
    let mut domain = domain.trim().to_lowercase();
    if domain.is_empty() {
        return String::new();
    }

    for suffix in [".com", ".org", ".net", ".edu", ".gov"] {
        if let Some(stripped) = domain.strip_suffix(suffix) {
            domain = stripped.to_string();
            break;
        }
    }
    if let Some(stripped) = domain.strip_prefix("mail.") {
        domain = stripped.to_string();
    }

    title_case(&domain.replace('.', " "))
}

/// Uppercase the first letter of every alphabetic run, lowercase the rest.
fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_alpha = false;
    for c in text.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Best-effort date parsing: RFC 2822 first, then ISO-8601 variants.
///
/// Returns `None` when nothing matches; callers substitute ingestion time.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // Trailing comments like "(UTC)" or "(PST)" trip the RFC 2822 parser.
    let without_comment = match raw.rfind(" (") {
        Some(pos) if raw.ends_with(')') => &raw[..pos],
        _ => raw,
    };

    if let Ok(dt) = DateTime::parse_from_rfc2822(without_comment) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Cheap keyword heuristic over subject, sender, and snippet.
pub fn is_job_related(subject: &str, sender: &str, snippet: &str) -> bool {
    let text = format!("{} {} {}", subject, sender, snippet).to_lowercase();
    JOB_KEYWORDS.iter().any(|kw| text.contains(kw))
}

/// Processing priority for an email (higher is more urgent, floor 0).
pub fn priority_score(subject: &str, sender: &str) -> u32 {
    let subject = subject.to_lowercase();
    let sender = sender.to_lowercase();
    let mut score: i32 = 0;

    for kw in HIGH_PRIORITY_KEYWORDS {
        if subject.contains(kw) {
            score += 10;
        }
    }
    for kw in MEDIUM_PRIORITY_KEYWORDS {
        if subject.contains(kw) {
            score += 5;
        }
    }
    if sender.contains("noreply") || sender.contains("no-reply") {
        score -= 3;
    }
    if ["hr", "recruiter", "talent"]
        .iter()
        .any(|word| sender.contains(word))
    {
        score += 7;
    }

    score.max(0) as u32
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Decode bytes as UTF-8, dropping anything that is not valid.
pub fn decode_utf8_lossy_drop(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn clean_collapses_whitespace() {
        assert_eq!(clean_content("  hello \n\n  world\t!  "), "hello world !");
        assert_eq!(clean_content("   "), "");
    }

    #[test]
    fn clean_strips_signatures() {
        let text = "We would like to schedule a call.\n-- \nJane Smith\nRecruiter";
        assert_eq!(clean_content(text), "We would like to schedule a call.");

        let mobile = "Thanks for the update. Sent from my iPhone";
        assert_eq!(clean_content(mobile), "Thanks for the update.");

        let regards = "See you Monday.\n\nBest regards,\nHR Team";
        assert_eq!(clean_content(regards), "See you Monday.");
    }

    #[test]
    fn strip_html_removes_tags_and_styles() {
        let html = "<html><head><style>p{}</style></head><body><p>Hi &amp; welcome</p></body></html>";
        let text = clean_content(&strip_html(html));
        assert_eq!(text, "Hi & welcome");
    }

    #[test]
    fn sender_with_display_name() {
        let info = parse_sender("John Doe <John@Company.com>");
        assert_eq!(info.name, "John Doe");
        assert_eq!(info.address, "john@company.com");
    }

    #[test]
    fn sender_bare_and_quoted() {
        let bare = parse_sender("jane@company.com");
        assert_eq!(bare.name, "");
        assert_eq!(bare.address, "jane@company.com");

        let quoted = parse_sender("\"Smith, Jane\" <jane@company.com>");
        assert_eq!(quoted.name, "Smith, Jane");

        let empty = parse_sender("");
        assert!(empty.address.is_empty());
    }

    #[test]
    fn company_from_domain() {
        assert_eq!(company_from_address("hr@techcorp.com"), "Techcorp");
        assert_eq!(company_from_address("jobs@mail.acme.org"), "Acme");
        assert_eq!(company_from_address("x@careers.big-co.io"), "Careers Big-Co Io");
        assert_eq!(company_from_address("not-an-address"), "");
    }

    #[test]
    fn parse_rfc2822_and_iso() {
        let d = parse_date("Mon, 15 Jan 2024 10:30:00 +0000").unwrap();
        assert_eq!((d.year(), d.month(), d.day(), d.hour()), (2024, 1, 15, 10));

        let with_comment = parse_date("Mon, 15 Jan 2024 10:30:00 +0000 (UTC)").unwrap();
        assert_eq!(with_comment, d);

        let iso = parse_date("2024-01-15T10:30:00Z").unwrap();
        assert_eq!(iso, d);

        assert!(parse_date("2024-01-15").is_some());
        assert!(parse_date("not a date").is_none());
        assert!(parse_date("").is_none());
    }

    #[test]
    fn job_related_heuristic() {
        assert!(is_job_related("Application Received", "hr@x.com", ""));
        assert!(is_job_related("Hello", "someone@x.com", "next steps for your interview"));
        assert!(!is_job_related("Weekly newsletter", "news@x.com", "Top stories this week"));
    }

    #[test]
    fn priority_weights() {
        assert_eq!(priority_score("Offer letter", "hr@acme.com"), 17);
        assert_eq!(priority_score("Newsletter", "noreply@acme.com"), 0);
        assert_eq!(priority_score("Application update", "jobs@acme.com"), 5);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn lossy_decode_drops_invalid_bytes() {
        assert_eq!(decode_utf8_lossy_drop(b"ab\xffcd"), "abcd");
    }
}
