use std::{collections::HashMap, fs, path::Path};

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::info;

use crate::error::ScriptError;

/// Tag-keep table produced from the rule script: normalized tag
/// (8 uppercase hex digits) to operation text. An empty operation means
/// "keep value as-is"; tags absent from the table are removed outright.
pub type TagKeep = HashMap<String, String>;

/// Load and parse an RSNA/CTP-compatible anonymizer script.
///
/// Only `<e t="GGGGEEEE">operation</e>` entries are honored; entries whose
/// operation contains `@remove` are left out of the table so the element
/// falls back to the default remove behavior. `<k>` and `<r>` group
/// directives are ignored: the one mandatory group rule, removal of all
/// private groups, is applied unconditionally by the transformer.
pub fn load_script(path: &Path) -> Result<TagKeep, ScriptError> {
    let raw = fs::read_to_string(path).map_err(|_| ScriptError::NotFound {
        path: path.to_path_buf(),
    })?;
    let tag_keep = parse_script(&raw).map_err(|reason| ScriptError::Parse {
        path: path.to_path_buf(),
        reason,
    })?;
    let operations = tag_keep.values().filter(|op| !op.is_empty()).count();
    info!(
        "Loaded anonymizer script {} with {} kept tags, {} operations",
        path.display(),
        tag_keep.len(),
        operations
    );
    Ok(tag_keep)
}

fn parse_script(raw: &str) -> Result<TagKeep, String> {
    let mut reader = Reader::from_reader(raw.as_bytes());
    let mut buf = Vec::new();
    let mut tag_keep = TagKeep::new();
    // (normalized tag, accumulated operation text) of the open <e> element
    let mut current: Option<(String, String)> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Err(e) => return Err(e.to_string()),
            Ok(Event::Eof) => break,
            Ok(Event::Start(start)) => {
                if start.name().as_ref() == b"e" {
                    current = element_tag(&start)?.map(|tag| (tag, String::new()));
                }
            }
            Ok(Event::Empty(empty)) => {
                if empty.name().as_ref() == b"e" {
                    if let Some(tag) = element_tag(&empty)? {
                        tag_keep.insert(tag, String::new());
                    }
                }
            }
            Ok(Event::Text(text)) => {
                if let Some((_, op)) = current.as_mut() {
                    op.push_str(&text.unescape().map_err(|e| e.to_string())?);
                }
            }
            Ok(Event::End(end)) => {
                if end.name().as_ref() == b"e" {
                    if let Some((tag, op)) = current.take() {
                        let op = op.trim().to_string();
                        if !op.contains("@remove") {
                            tag_keep.insert(tag, op);
                        }
                    }
                }
            }
            Ok(_) => {}
        }
        buf.clear();
    }

    Ok(tag_keep)
}

fn element_tag(start: &quick_xml::events::BytesStart) -> Result<Option<String>, String> {
    let attr = start
        .try_get_attribute("t")
        .map_err(|e| e.to_string())?
        .map(|a| a.unescape_value().map(|v| v.into_owned()))
        .transpose()
        .map_err(|e| e.to_string())?;
    Ok(attr.map(|t| normalize_script_tag(&t)))
}

/// Strip parentheses, spaces and commas from a script tag attribute and
/// uppercase the hex digits: `(0010,0020)` becomes `00100020`.
fn normalize_script_tag(tag: &str) -> String {
    tag.chars()
        .filter(|c| !matches!(c, '(' | ')' | ' ' | ','))
        .collect::<String>()
        .to_uppercase()
}
