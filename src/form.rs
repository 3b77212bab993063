//! Text forms for editing elements by hand.
//!
//! A form holds one block per element, separated by `---` lines:
//!
//! ```text
//! element_name: Host:web1.pod1.sjc1
//! -id: 4
//! -revision: 2
//! -changeset: 7
//! name: web1
//! pod: Pod:pod1
//! notes: |
//!   racked by hand
//!   second line
//! interfaces: [ Interface:web1.pod1.sjc1_eth0 ]
//! ```
//!
//! Keys prefixed with `-` are informational and ignored when a form is applied.
//! A block whose element name is a form id (`Host:<1>`) creates a new element;
//! other blocks in the same form may refer to it by that form id.

use tracing::debug;

use crate::SeaMap;
use crate::datatype::{NULL_SENTINEL, Value, quoted};
use crate::describe::ChangeDescription;
use crate::element::{AttributeValue, ElementKey};
use crate::error::{DinoError, Result};
use crate::objectspec::{self, ObjectSpec, SpecKind};
use crate::schema::Property;
use crate::session::{FormId, Session};

const SEPARATOR: &str = "---";
const ELEMENT_NAME: &str = "element_name";

// ------------- Rendering -------------
/// Renders the elements as a form.
pub fn to_form(session: &mut Session, elements: &[ElementKey]) -> Result<String> {
    let mut blocks = Vec::with_capacity(elements.len());
    for key in elements {
        blocks.push(render_block(session, *key)?);
    }
    Ok(blocks.join(&format!("{SEPARATOR}\n")))
}

fn render_block(session: &mut Session, key: ElementKey) -> Result<String> {
    let element = session.element(key)?;
    let entity = std::sync::Arc::clone(element.entity());
    let mut out = format!("{ELEMENT_NAME}: {}\n", element.element_name());
    if let Some(id) = element.id() {
        out.push_str(&format!("-id: {id}\n"));
    }
    if let Some(revision) = element.revision() {
        out.push_str(&format!("-revision: {revision}\n"));
    }
    if let Some(changeset) = element.changeset_id() {
        out.push_str(&format!("-changeset: {changeset}\n"));
    }
    for field in entity.fields() {
        let value = session.element(key)?.value(&field.name).clone();
        out.push_str(&render_value(&field.name, &value));
    }
    for relation in entity.relations() {
        let text = session.get_text(key, &relation.name)?;
        out.push_str(&format!("{}: {text}\n", relation.name));
    }
    Ok(out)
}

fn render_value(key: &str, value: &Value) -> String {
    let Some(text) = value.as_text() else {
        return format!("{key}: {value}\n");
    };
    if text.contains('\n') {
        let mut out = format!("{key}: |\n");
        for line in text.lines() {
            out.push_str(&format!("  {line}\n"));
        }
        return out;
    }
    // quoted so that reading the form back gives the same text
    if text.is_empty() || text == NULL_SENTINEL || text.trim() != text || quoted(text).is_some() {
        format!("{key}: '{text}'\n")
    } else {
        format!("{key}: {text}\n")
    }
}

// ------------- Parsing -------------
#[derive(Debug)]
struct Block {
    element: String,
    entries: Vec<(String, String)>,
}

fn malformed(line_no: usize, line: &str, expected: &str) -> DinoError {
    DinoError::InvalidValue {
        attribute: format!("form line {line_no}"),
        value: line.to_string(),
        expected: expected.to_string(),
    }
}

fn parse_blocks(text: &str) -> Result<Vec<Block>> {
    let mut blocks = Vec::new();
    let mut entries: Vec<(String, String)> = Vec::new();
    let mut block_start = 0;
    let mut lines = text.lines().enumerate().peekable();
    while let Some((index, line)) = lines.next() {
        let line_no = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed == SEPARATOR {
            close_block(&mut blocks, &mut entries, block_start)?;
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(malformed(line_no, line, "key: value"));
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() {
            return Err(malformed(line_no, line, "key: value"));
        }
        if entries.is_empty() {
            block_start = line_no;
        }
        if value == "|" {
            let mut block_lines = Vec::new();
            let mut indent = None;
            while let Some((_, next)) = lines.peek() {
                if !next.starts_with([' ', '\t']) && !next.trim().is_empty() {
                    break;
                }
                let width = *indent.get_or_insert_with(|| next.len() - next.trim_start().len());
                block_lines.push(next.get(width..).unwrap_or("").to_string());
                lines.next();
            }
            while block_lines.last().is_some_and(String::is_empty) {
                block_lines.pop();
            }
            entries.push((key.to_string(), format!("'{}'", block_lines.join("\n"))));
        } else {
            entries.push((key.to_string(), value.to_string()));
        }
    }
    close_block(&mut blocks, &mut entries, block_start)?;
    Ok(blocks)
}

fn close_block(blocks: &mut Vec<Block>, entries: &mut Vec<(String, String)>, line_no: usize) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut taken = std::mem::take(entries);
    if taken[0].0 != ELEMENT_NAME {
        return Err(malformed(line_no, &taken[0].0, "element_name as the first key of a block"));
    }
    let (_, element) = taken.remove(0);
    blocks.push(Block { element, entries: taken });
    Ok(())
}

// ------------- Applying -------------
/// Applies a form to the session and describes the resulting pending changes.
/// Nothing is committed; on error the caller should revert the changeset.
pub fn apply_form(session: &mut Session, text: &str) -> Result<ChangeDescription> {
    let blocks = parse_blocks(text)?;
    debug!(parent: &session.span, blocks = blocks.len(), "applying form");

    // new elements first, so that blocks can refer to each other
    let mut created: SeaMap<(String, u64), ElementKey> = SeaMap::default();
    let mut targets = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let spec = objectspec::parse(&block.element, SpecKind::ELEMENTS)?;
        if let ObjectSpec::ElementFormId { entity, form_id } = &spec {
            let entity = session.entity_type(entity)?;
            if created.contains_key(&(entity.name().to_string(), *form_id)) {
                return Err(DinoError::InvalidValue {
                    attribute: ELEMENT_NAME.to_string(),
                    value: block.element.clone(),
                    expected: "each form id once".to_string(),
                });
            }
            let key = session.create(entity.name())?;
            renumber(session, key, entity.name(), *form_id)?;
            created.insert((entity.name().to_string(), *form_id), key);
        }
        targets.push(spec);
    }

    for (block, spec) in blocks.iter().zip(&targets) {
        let key = match spec {
            ObjectSpec::ElementFormId { entity, form_id } => {
                let entity = session.entity_type(entity)?;
                created[&(entity.name().to_string(), *form_id)]
            }
            other => session.element_for(other)?,
        };
        for (attribute, value) in &block.entries {
            if attribute.starts_with('-') {
                continue;
            }
            apply_entry(session, key, attribute, value)?;
        }
    }
    session.change_description()
}

fn apply_entry(session: &mut Session, key: ElementKey, attribute: &str, value: &str) -> Result<()> {
    let handle = session.attribute(key, attribute)?;
    let is_field = matches!(handle.entity().property(attribute), Some(Property::Field(_)));
    if !is_field {
        // rewriting an unchanged relation would only produce noise
        let current = handle.get_text(session)?;
        if current == value {
            return Ok(());
        }
        if let AttributeValue::Element(Some(linked)) = handle.get(session)? {
            if session.resolve_element_spec(value).ok().flatten() == Some(linked) {
                return Ok(());
            }
        }
    }
    handle.set(session, value)
}

/// Gives a freshly created element the form number chosen by the form author.
fn renumber(session: &mut Session, key: ElementKey, entity: &str, number: u64) -> Result<()> {
    let wanted = FormId {
        entity: entity.to_string(),
        number,
    };
    if session.form_ids.get_by_left(&wanted).is_some_and(|k| *k != key) {
        return Err(DinoError::InvalidValue {
            attribute: ELEMENT_NAME.to_string(),
            value: format!("{entity}:<{number}>"),
            expected: "a form id not used by another unsaved element".to_string(),
        });
    }
    session.form_ids.remove_by_right(&key);
    session.form_ids.insert(wanted, key);
    session.bump_form_ids(number);
    if let Some(element) = session.elements.get_mut(&key) {
        element.form_id = Some(number);
    }
    Ok(())
}
