//! Email helpers: quote stripping, threading, reply subjects.

use mail_parser::HeaderValue;

/// Strip quoted text from an email body.
///
/// Drops `>` lines and everything after an "On ... wrote:" attribution or
/// an "Original Message" separator.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

/// Basic tag stripping for HTML-only mail.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Message ids listed in a `References` header, oldest first.
pub fn references(header: &HeaderValue<'_>) -> Vec<String> {
    let ids: Vec<String> = match header {
        HeaderValue::Text(id) => vec![bare_id(id)],
        HeaderValue::TextList(ids) => ids.iter().map(|id| bare_id(id)).collect(),
        _ => Vec::new(),
    };
    ids.into_iter().filter(|id| !id.is_empty()).collect()
}

/// Conversation identity: the thread root from `References`, else the
/// message's own id.
pub fn thread_id(message_id: &str, references: &[String]) -> String {
    references
        .first()
        .cloned()
        .unwrap_or_else(|| message_id.to_string())
}

/// `Re: <subject>`, without stacking prefixes.
pub fn reply_subject(subject: &str) -> String {
    let subject = subject.trim();
    if subject
        .get(..3)
        .is_some_and(|p| p.eq_ignore_ascii_case("re:"))
    {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

/// Message id without surrounding whitespace or angle brackets.
pub fn bare_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// Message id in header form, `<id>`.
pub fn angle_id(id: &str) -> String {
    format!("<{}>", bare_id(id))
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    #[test]
    fn strips_quoted_lines() {
        let body = "Ribbit?\n\n> earlier frog wisdom\n>> older wisdom\nThanks";
        assert_eq!(strip_quoted_text(body), "Ribbit?\n\nThanks");
    }

    #[test]
    fn stops_at_attribution_line() {
        let body = "Tell me more.\n\nOn Tue, Mar 3, 2026 at 9:12 AM The Frog <frog@pond.io> wrote:\n<p>Old answer</p>";
        assert_eq!(strip_quoted_text(body), "Tell me more.");
    }

    #[test]
    fn stops_at_original_message_separator() {
        let body = "Follow-up\n\n----- Original Message -----\nFrom: frog";
        assert_eq!(strip_quoted_text(body), "Follow-up");
    }

    #[test]
    fn unquoted_body_is_unchanged() {
        let body = "password: x\ncommand: info";
        assert_eq!(strip_quoted_text(body), body);
        assert_eq!(strip_quoted_text(""), "");
    }

    #[test]
    fn html_is_flattened() {
        assert_eq!(strip_html("<p>Hello <b>pond</b></p>\n<p>bye</p>"), "Hello pond bye");
    }

    #[test]
    fn references_header_variants() {
        let single = HeaderValue::Text(Cow::Borrowed("<root@x>"));
        assert_eq!(references(&single), vec!["root@x".to_string()]);

        let list = HeaderValue::TextList(vec![Cow::Borrowed("root@x"), Cow::Borrowed("<mid@x>")]);
        assert_eq!(references(&list), vec!["root@x".to_string(), "mid@x".to_string()]);

        assert!(references(&HeaderValue::Empty).is_empty());
    }

    #[test]
    fn thread_id_prefers_first_reference() {
        let refs = vec!["root@x".to_string(), "mid@x".to_string()];
        assert_eq!(thread_id("leaf@x", &refs), "root@x");
        assert_eq!(thread_id("leaf@x", &[]), "leaf@x");
    }

    #[test]
    fn reply_subject_adds_single_prefix() {
        assert_eq!(reply_subject("Lily pads"), "Re: Lily pads");
        assert_eq!(reply_subject("RE: Lily pads"), "RE: Lily pads");
    }

    #[test]
    fn ids_normalize() {
        assert_eq!(bare_id(" <a@b> "), "a@b");
        assert_eq!(angle_id("a@b"), "<a@b>");
        assert_eq!(angle_id("<a@b>"), "<a@b>");
    }
}
