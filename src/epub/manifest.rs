//! Package pointer (`META-INF/container.xml`) and package document (OPF) parsing.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::package::EpubArchive;
use super::tree::strip_bom;
use super::xml::local_name;
use crate::error::{TranslateError, TranslateResult};

pub const CONTAINER_PATH: &str = "META-INF/container.xml";

/// Reading order of content documents, as archive entry paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpineOrder {
    paths: Vec<String>,
}

impl SpineOrder {
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestItem {
    pub href: String,
}

/// Parsed package document.
#[derive(Clone, Debug, Default)]
pub struct OpfData {
    /// Manifest id -> item.
    pub manifest: HashMap<String, ManifestItem>,
    pub spine_ids: Vec<String>,
}

/// Resolve the archive's spine into entry paths. Unresolvable spine ids are dropped.
pub fn resolve_spine(archive: &EpubArchive) -> TranslateResult<SpineOrder> {
    let container = archive
        .read_entry(CONTAINER_PATH)
        .ok_or_else(|| TranslateError::MalformedArchive(format!("missing {CONTAINER_PATH}")))?;
    let opf_path = parse_container_xml(container)?;
    let opf_bytes = archive.read_entry(&opf_path).ok_or_else(|| {
        TranslateError::MalformedArchive(format!("missing package document {opf_path}"))
    })?;
    let opf_text = std::str::from_utf8(strip_bom(opf_bytes)).map_err(|e| {
        TranslateError::MalformedArchive(format!("package document {opf_path} is not UTF-8: {e}"))
    })?;
    let opf = parse_opf(opf_text)?;

    let base = opf_path
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or("");
    let mut paths = Vec::with_capacity(opf.spine_ids.len());
    for id in &opf.spine_ids {
        match opf.manifest.get(id) {
            Some(item) => paths.push(resolve_href(base, &item.href)),
            None => tracing::warn!(idref = %id, "spine item has no manifest entry; dropped"),
        }
    }
    Ok(SpineOrder::new(paths))
}

/// Locate the package document from the container pointer entry.
pub fn parse_container_xml(bytes: &[u8]) -> TranslateResult<String> {
    let content = std::str::from_utf8(strip_bom(bytes))
        .map_err(|e| TranslateError::MalformedArchive(format!("container.xml: {e}")))?;
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if local_name(&String::from_utf8_lossy(e.name().as_ref())) == "rootfile" =>
            {
                if let Some(path) = attr_value(&e, "full-path").filter(|p| !p.is_empty()) {
                    return Ok(path);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(TranslateError::MalformedArchive(format!(
                    "container.xml: {e}"
                )))
            }
            _ => {}
        }
    }
    Err(TranslateError::MalformedArchive(
        "container.xml has no rootfile full-path".to_string(),
    ))
}

pub fn parse_opf(content: &str) -> TranslateResult<OpfData> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut opf = OpfData::default();
    let mut saw_package = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match local_name(&name) {
                    "package" => saw_package = true,
                    "item" => {
                        let id = attr_value(&e, "id").unwrap_or_default();
                        let href = attr_value(&e, "href").unwrap_or_default();
                        if !id.is_empty() && !href.is_empty() {
                            opf.manifest.insert(id, ManifestItem { href });
                        }
                    }
                    "itemref" => {
                        if let Some(idref) = attr_value(&e, "idref") {
                            opf.spine_ids.push(idref);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(TranslateError::MalformedArchive(format!(
                    "package document: {e}"
                )))
            }
            _ => {}
        }
    }
    if !saw_package {
        return Err(TranslateError::MalformedArchive(
            "package document has no <package> root".to_string(),
        ));
    }
    Ok(opf)
}

fn attr_value(e: &BytesStart<'_>, key: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.as_ref() == key.as_bytes() {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Resolve a manifest href against the package document's directory.
fn resolve_href(base: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let decoded = percent_decode_str(href).decode_utf8_lossy();
    let joined = if base.is_empty() || decoded.starts_with('/') {
        decoded.trim_start_matches('/').to_string()
    } else {
        format!("{base}/{decoded}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for seg in joined.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    parts.join("/")
}
