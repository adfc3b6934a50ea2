use anyhow::Context;
use quick_xml::escape::{resolve_html5_entity, unescape_with};
use quick_xml::events::{BytesDecl, BytesStart, BytesText, Event};
use quick_xml::Reader;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XmlEvent {
    Decl {
        version: String,
        encoding: Option<String>,
        standalone: Option<String>,
    },
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Empty {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text {
        text: String,
    },
    CData {
        text: String,
    },
    Comment {
        text: String,
    },
    PI {
        content: String,
    },
    DocType {
        text: String,
    },
}

const FRAGMENT_WRAPPER: &str = "epub-translator-fragment";

pub fn parse_xml_events(xml: &str) -> anyhow::Result<Vec<XmlEvent>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut events: Vec<XmlEvent> = Vec::new();
    loop {
        let ev = reader.read_event().context("read xml event")?;
        match ev {
            Event::Eof => break,
            Event::Decl(d) => {
                let version = bytes_to_string(d.version().context("decl version")?);
                let encoding = d
                    .encoding()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                let standalone = d
                    .standalone()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                events.push(XmlEvent::Decl {
                    version,
                    encoding,
                    standalone,
                });
            }
            Event::Start(s) => {
                events.push(XmlEvent::Start {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::End(e) => {
                events.push(XmlEvent::End {
                    name: bytes_to_string(e.name().as_ref()),
                });
            }
            Event::Empty(s) => {
                events.push(XmlEvent::Empty {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(&s)?,
                });
            }
            Event::Text(t) => {
                events.push(XmlEvent::Text {
                    text: unescape_text(&t),
                });
            }
            Event::CData(t) => {
                events.push(XmlEvent::CData {
                    text: bytes_to_string(t.into_inner()),
                });
            }
            Event::Comment(t) => {
                events.push(XmlEvent::Comment {
                    text: bytes_to_string(t.into_inner()),
                });
            }
            Event::PI(t) => {
                let target = bytes_to_string(t.target());
                let content = bytes_to_string(t.content());
                events.push(XmlEvent::PI {
                    content: format!("{target}{content}"),
                });
            }
            Event::DocType(t) => {
                events.push(XmlEvent::DocType {
                    text: bytes_to_string(t.into_inner()),
                });
            }
        }
    }
    Ok(events)
}

/// Parse a markup fragment (mixed text and elements, no single root) into events.
pub fn parse_fragment_events(markup: &str) -> anyhow::Result<Vec<XmlEvent>> {
    let wrapped = format!("<{FRAGMENT_WRAPPER}>{markup}</{FRAGMENT_WRAPPER}>");
    let mut events = parse_xml_events(&wrapped).context("parse markup fragment")?;
    // Drop the synthetic wrapper start/end.
    events.remove(0);
    events.pop();
    Ok(events)
}

fn unescape_text(t: &BytesText<'_>) -> String {
    unescape_lenient(&bytes_to_string(&**t))
}

/// Resolve character references and the HTML5 named entities XHTML content documents use
/// without declaring a DTD. An unknown or malformed reference is kept as literal text.
pub fn unescape_lenient(raw: &str) -> String {
    if let Ok(txt) = unescape_with(raw, resolve_html5_entity) {
        return txt.into_owned();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let reference = tail[1..]
            .find(|c: char| c == ';' || c == '&' || c.is_whitespace())
            .filter(|&end| tail.as_bytes()[end + 1] == b';')
            .map(|end| &tail[..end + 2]);
        match reference {
            Some(r) => {
                match unescape_with(r, resolve_html5_entity) {
                    Ok(txt) => out.push_str(&txt),
                    Err(e) => {
                        tracing::debug!(reference = r, error = %e, "unresolved entity kept as text");
                        out.push_str(r);
                    }
                }
                rest = &tail[r.len()..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn collect_attrs(s: &BytesStart<'_>) -> anyhow::Result<Vec<(String, String)>> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    for a in s.attributes() {
        let a = a.context("attr")?;
        let key = bytes_to_string(a.key.as_ref());
        // Keep raw (already-escaped) attribute bytes so values round-trip untouched.
        let val = bytes_to_string(a.value.as_ref());
        attrs.push((key, val));
    }
    Ok(attrs)
}

fn bytes_to_string(bytes: impl AsRef<[u8]>) -> String {
    String::from_utf8_lossy(bytes.as_ref()).into_owned()
}

pub fn escape_text_into(out: &mut Vec<u8>, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.extend_from_slice(b"&amp;"),
            '<' => out.extend_from_slice(b"&lt;"),
            '>' => out.extend_from_slice(b"&gt;"),
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

pub fn write_start_like(out: &mut Vec<u8>, name: &str, attrs: &[(String, String)], empty: bool) {
    out.extend_from_slice(b"<");
    out.extend_from_slice(name.as_bytes());
    // Attribute values are stored as raw (already-escaped) XML bytes. Do NOT escape again.
    for (k, v) in attrs {
        out.extend_from_slice(b" ");
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(b"=\"");
        out.extend_from_slice(v.as_bytes());
        out.extend_from_slice(b"\"");
    }
    if empty {
        out.extend_from_slice(b"/>");
    } else {
        out.extend_from_slice(b">");
    }
}

pub fn write_end(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(b"</");
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b">");
}

/// Serialize a single event. Start/End pairing is the caller's concern.
pub fn write_event(out: &mut Vec<u8>, ev: &XmlEvent) -> anyhow::Result<()> {
    match ev {
        XmlEvent::Decl {
            version,
            encoding,
            standalone,
        } => {
            let d = BytesDecl::new(version.as_str(), encoding.as_deref(), standalone.as_deref());
            let mut writer = quick_xml::Writer::new(Vec::new());
            writer.write_event(Event::Decl(d)).context("write decl")?;
            out.extend_from_slice(&writer.into_inner());
        }
        XmlEvent::Start { name, attrs } => write_start_like(out, name, attrs, false),
        XmlEvent::End { name } => write_end(out, name),
        XmlEvent::Empty { name, attrs } => write_start_like(out, name, attrs, true),
        XmlEvent::Text { text } => escape_text_into(out, text),
        XmlEvent::CData { text } => {
            // CDATA must remain unescaped.
            out.extend_from_slice(b"<![CDATA[");
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"]]>");
        }
        XmlEvent::Comment { text } => {
            out.extend_from_slice(b"<!--");
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"-->");
        }
        XmlEvent::PI { content } => {
            out.extend_from_slice(b"<?");
            out.extend_from_slice(content.as_bytes());
            out.extend_from_slice(b"?>");
        }
        XmlEvent::DocType { text } => {
            out.extend_from_slice(b"<!DOCTYPE ");
            out.extend_from_slice(text.trim_start().as_bytes());
            out.extend_from_slice(b">");
        }
    }
    Ok(())
}

/// Extract the local part of a possibly prefixed name (`html:p` -> `p`).
pub fn local_name(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, local)| local).unwrap_or(name)
}
