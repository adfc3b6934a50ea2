use once_cell::sync::Lazy;
use regex::Regex;

static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)</?[A-Za-z][^<>]*>").expect("tag"));

/// Spaces that render as blanks but are not ASCII whitespace.
const SPACE_VARIANTS: [char; 5] = ['\u{00A0}', '\u{2007}', '\u{202F}', '\u{2060}', '\u{FEFF}'];

/// Collapse a block's raw text into the form that is measured, chunked and sent out.
pub fn normalize_text(raw: &str) -> String {
    let spaced: String = raw
        .chars()
        .map(|c| if SPACE_VARIANTS.contains(&c) { ' ' } else { c })
        .collect();
    WS_RE.replace_all(spaced.trim(), " ").into_owned()
}

/// Drop any markup the generation service slipped into a translated string.
pub fn strip_markup(text: &str) -> String {
    let no_tags = TAG_RE.replace_all(text, "");
    unescape_basic(no_tags.trim())
}

/// Escape text for placement inside an element body.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape text for a double-quoted attribute value.
pub fn escape_attr(text: &str) -> String {
    escape_text(text).replace('"', "&quot;")
}

fn unescape_basic(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Truncate for log lines, on a char boundary.
pub fn preview(text: &str, max_chars: usize) -> String {
    if char_len(text) <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}…")
}
