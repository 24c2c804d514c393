//! Flat header-block (RFC 822 style) decoding, plus a minimal mbox splitter.
//!
//! Covers what mailbox exports actually contain: folded headers,
//! RFC 2047 encoded words, `multipart/*` bodies, and base64 or
//! quoted-printable transfer encodings. It is not a full MIME
//! implementation; anything it does not understand is skipped.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::clean::{decode_utf8_lossy_drop, strip_html};
use crate::error::NormalizeError;
use crate::normalize::EmailDraft;
use crate::parse_json::decode_base64;

static ENCODED_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=").expect("static encoded-word pattern")
});

/// Header list in file order, names as written.
type Headers = Vec<(String, String)>;

fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Decode a single `.eml` message.
///
/// Headers and body stay bytes until each text leaf is decoded with its
/// own declared charset.
pub fn parse_eml(raw: &[u8]) -> Result<EmailDraft, NormalizeError> {
    let (headers, body) = split_headers(raw);
    if headers.is_empty() {
        return Err(NormalizeError::Malformed("no header block".to_string()));
    }

    let external_id = match header(&headers, "Message-ID") {
        Some(id) if !id.trim().is_empty() => id.trim().trim_matches(['<', '>']).to_string(),
        _ => content_id(raw),
    };

    let mut plain = Vec::new();
    let mut html = Vec::new();
    collect_text(&headers, body, &mut plain, &mut html, 0);
    let body = if plain.iter().any(|t| !t.trim().is_empty()) {
        plain.join("\n")
    } else {
        html.iter().map(|h| strip_html(h)).collect::<Vec<_>>().join("\n")
    };

    let decoded = |name: &str| {
        header(&headers, name)
            .map(decode_encoded_words)
            .unwrap_or_default()
    };

    Ok(EmailDraft {
        external_id,
        subject: decoded("Subject"),
        from: decoded("From"),
        to: decoded("To"),
        snippet: String::new(),
        body,
        date: header(&headers, "Date").unwrap_or_default().to_string(),
        fallback_received_at: None,
        thread_id: header(&headers, "Thread-Index")
            .or_else(|| header(&headers, "In-Reply-To"))
            .unwrap_or_default()
            .trim()
            .to_string(),
        labels: Vec::new(),
    })
}

/// Split an mbox file on its `From ` separator lines and decode each message.
pub fn parse_mbox(raw: &[u8]) -> Vec<Result<EmailDraft, NormalizeError>> {
    let mut messages: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut prev_blank = true;

    for line in raw.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b"From ") && prev_blank {
            if let Some(done) = current.take() {
                messages.push(done);
            }
            current = Some(Vec::new());
        } else if let Some(buf) = current.as_mut() {
            // ">From " quoting in message bodies
            let line = match line.strip_prefix(b">") {
                Some(rest) if rest.starts_with(b"From ") => rest,
                _ => line,
            };
            buf.extend_from_slice(line);
        }
        prev_blank = line.trim_ascii().is_empty();
    }
    if let Some(done) = current {
        messages.push(done);
    }

    messages
        .into_iter()
        .filter(|m| !m.trim_ascii().is_empty())
        .map(|m| parse_eml(&m))
        .collect()
}

/// Stable id for messages without a `Message-ID` header.
fn content_id(raw: &[u8]) -> String {
    let digest = format!("{:x}", Sha256::digest(raw));
    format!("eml_{}", &digest[..16])
}

/// Unfold the header block and return it with the remaining body.
fn split_headers(raw: &[u8]) -> (Headers, &[u8]) {
    let mut headers: Headers = Vec::new();
    let mut offset = 0;

    for line in raw.split_inclusive(|&b| b == b'\n') {
        offset += line.len();
        let line = decode_utf8_lossy_drop(line);
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return (headers, &raw[offset..]);
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            if !name.is_empty() && !name.contains(char::is_whitespace) {
                headers.push((name.to_string(), value.trim().to_string()));
            }
        }
    }
    (headers, &raw[raw.len()..])
}

/// `text/plain; charset="utf-8"` into a lowercase type and its parameters.
fn content_type(headers: &Headers) -> (String, HashMap<String, String>) {
    let raw = header(headers, "Content-Type").unwrap_or("text/plain");
    let mut pieces = raw.split(';');
    let mime = pieces
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let params = pieces
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().to_ascii_lowercase(),
                v.trim().trim_matches('"').to_string(),
            )
        })
        .collect();
    (mime, params)
}

const MAX_MIME_DEPTH: usize = 8;

fn collect_text(
    headers: &Headers,
    body: &[u8],
    plain: &mut Vec<String>,
    html: &mut Vec<String>,
    depth: usize,
) {
    if depth > MAX_MIME_DEPTH {
        return;
    }
    let (mime, params) = content_type(headers);

    if mime.starts_with("multipart/") {
        let Some(boundary) = params.get("boundary") else {
            return;
        };
        for part in split_multipart(body, boundary) {
            let (part_headers, part_body) = split_headers(part);
            collect_text(&part_headers, part_body, plain, html, depth + 1);
        }
        return;
    }

    let is_attachment = header(headers, "Content-Disposition")
        .map(|d| d.trim().to_ascii_lowercase().starts_with("attachment"))
        .unwrap_or(false);
    if is_attachment || !mime.starts_with("text/") {
        return;
    }

    let encoding = header(headers, "Content-Transfer-Encoding")
        .unwrap_or("7bit")
        .trim()
        .to_ascii_lowercase();
    let bytes = match encoding.as_str() {
        "base64" => decode_base64(&decode_utf8_lossy_drop(body)).unwrap_or_default(),
        "quoted-printable" => decode_quoted_printable(body, false),
        _ => body.to_vec(),
    };
    let charset = params.get("charset").map(String::as_str).unwrap_or("utf-8");
    let text = decode_charset(&bytes, charset).replace("\r\n", "\n");

    if mime == "text/html" {
        html.push(text);
    } else {
        plain.push(text);
    }
}

fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{}", boundary);
    let mut parts = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in body.split_inclusive(|&b| b == b'\n') {
        let trimmed = line.trim_ascii_end();
        if trimmed.starts_with(delimiter.as_bytes()) {
            if let Some(s) = start {
                parts.push(&body[s..offset]);
            }
            if trimmed[delimiter.len()..].starts_with(b"--") {
                return parts;
            }
            start = Some(offset + line.len());
        }
        offset += line.len();
    }
    if let Some(s) = start {
        parts.push(&body[s..]);
    }
    parts
}

/// Quoted-printable body (`=XX`, soft line breaks) or, with `underscores`,
/// the Q encoding used in headers.
fn decode_quoted_printable(bytes: &[u8], underscores: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'=' => {
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 2;
                    continue;
                }
                if bytes.get(i + 1) == Some(&b'\r') && bytes.get(i + 2) == Some(&b'\n') {
                    i += 3;
                    continue;
                }
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'=');
                        i += 1;
                    }
                }
            }
            b'_' if underscores => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn decode_charset(bytes: &[u8], charset: &str) -> String {
    match charset.trim().to_ascii_lowercase().as_str() {
        "iso-8859-1" | "latin1" | "latin-1" | "windows-1252" | "cp1252" => {
            bytes.iter().map(|&b| b as char).collect()
        }
        _ => decode_utf8_lossy_drop(bytes),
    }
}

/// Decode RFC 2047 encoded words, dropping anything that will not decode.
///
/// Whitespace between two adjacent encoded words is removed, as the RFC
/// requires.
pub fn decode_encoded_words(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_end = 0;
    let mut prev_was_word = false;

    for caps in ENCODED_WORD.captures_iter(value) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let gap = &value[last_end..whole.start()];
        if !(prev_was_word && gap.trim().is_empty()) {
            out.push_str(gap);
        }

        let charset = &caps[1];
        let text = &caps[3];
        let bytes = if caps[2].eq_ignore_ascii_case("b") {
            decode_base64(text).unwrap_or_default()
        } else {
            decode_quoted_printable(text.as_bytes(), true)
        };
        out.push_str(&decode_charset(&bytes, charset));

        last_end = whole.end();
        prev_was_word = true;
    }
    out.push_str(&value[last_end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "Message-ID: <abc123@mail.acme.com>\r\n\
Subject: Interview\r\n invitation\r\n\
From: Jane Recruiter <jane@acme.com>\r\n\
To: me@example.com\r\n\
Date: Tue, 16 Jan 2024 09:00:00 +0000\r\n\
\r\n\
Hi, we'd like to schedule an interview.\r\n";

    #[test]
    fn simple_message() {
        let draft = parse_eml(SIMPLE.as_bytes()).unwrap();
        assert_eq!(draft.external_id, "abc123@mail.acme.com");
        assert_eq!(draft.subject, "Interview invitation");
        assert_eq!(draft.from, "Jane Recruiter <jane@acme.com>");
        assert_eq!(draft.to, "me@example.com");
        assert!(draft.body.contains("schedule an interview"));
    }

    #[test]
    fn missing_message_id_gets_content_hash() {
        let raw = "Subject: Hello\n\nBody\n";
        let a = parse_eml(raw.as_bytes()).unwrap();
        let b = parse_eml(raw.as_bytes()).unwrap();
        assert!(a.external_id.starts_with("eml_"));
        assert_eq!(a.external_id, b.external_id);
    }

    #[test]
    fn encoded_word_headers() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?Q2Fmw6k=?="), "Café");
        assert_eq!(
            decode_encoded_words("=?iso-8859-1?Q?Caf=E9_offer?= today"),
            "Café offer today"
        );
        assert_eq!(decode_encoded_words("=?utf-8?Q?a?= =?utf-8?Q?b?="), "ab");
        // undecodable payload is dropped, not raised
        assert_eq!(decode_encoded_words("x =?utf-8?B?!!!?= y"), "x  y");
    }

    #[test]
    fn multipart_prefers_plain() {
        let raw = "Message-ID: <m@x>\n\
Content-Type: multipart/alternative; boundary=\"BOUND\"\n\
\n\
preamble\n\
--BOUND\n\
Content-Type: text/html; charset=utf-8\n\
\n\
<p>html version</p>\n\
--BOUND\n\
Content-Type: text/plain; charset=utf-8\n\
Content-Transfer-Encoding: quoted-printable\n\
\n\
plain =3D version with soft=\n\
break\n\
--BOUND--\n";
        let draft = parse_eml(raw.as_bytes()).unwrap();
        assert_eq!(draft.body.trim(), "plain = version with softbreak");
    }

    #[test]
    fn html_only_is_stripped() {
        let raw = "Message-ID: <h@x>\n\
Content-Type: text/html\n\
Content-Transfer-Encoding: base64\n\
\n\
PGI+T2ZmZXI8L2I+IGxldHRlcg==\n";
        let draft = parse_eml(raw.as_bytes()).unwrap();
        assert!(draft.body.contains("Offer"));
        assert!(!draft.body.contains("<b>"));
    }

    #[test]
    fn attachments_are_skipped() {
        let raw = "Message-ID: <a@x>\n\
Content-Type: multipart/mixed; boundary=XX\n\
\n\
--XX\n\
Content-Type: text/plain\n\
\n\
cover letter attached\n\
--XX\n\
Content-Type: text/plain\n\
Content-Disposition: attachment; filename=\"cv.txt\"\n\
\n\
SECRET CV CONTENT\n\
--XX--\n";
        let draft = parse_eml(raw.as_bytes()).unwrap();
        assert!(draft.body.contains("cover letter"));
        assert!(!draft.body.contains("SECRET"));
    }

    #[test]
    fn eight_bit_latin1_body_keeps_accents() {
        let mut raw = b"Message-ID: <l@x>\r\n\
Subject: =?iso-8859-1?Q?R=E9sum=E9?=\r\n\
Content-Type: text/plain; charset=iso-8859-1\r\n\
Content-Transfer-Encoding: 8bit\r\n\
\r\n"
            .to_vec();
        raw.extend_from_slice(b"Merci pour votre candidature, \xe0 bient\xf4t.\r\n");

        let draft = parse_eml(&raw).unwrap();
        assert_eq!(draft.subject, "Résumé");
        assert_eq!(draft.body.trim(), "Merci pour votre candidature, à bientôt.");
    }

    #[test]
    fn empty_input_is_malformed() {
        assert!(parse_eml(b"").is_err());
    }

    #[test]
    fn mbox_splits_messages() {
        let raw = "From a@x Mon Jan 15 10:00:00 2024\n\
Message-ID: <one@x>\n\
Subject: First\n\
\n\
>From the team\n\
\n\
From b@x Mon Jan 15 11:00:00 2024\n\
Message-ID: <two@x>\n\
Subject: Second\n\
\n\
Body two\n";
        let drafts: Vec<_> = parse_mbox(raw.as_bytes())
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].external_id, "one@x");
        assert!(drafts[0].body.contains("From the team"));
        assert_eq!(drafts[1].subject, "Second");
    }
}
