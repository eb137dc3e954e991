//! Per-directory sidecar parsing and rendering.
//!
//! The sidecar is a single `dr` element with an optional `dir` attribute and
//! one `fr` child per file. Known `fr` attributes map onto [`FileRecord`]
//! fields; unknown attributes are carried through [`FileRecord::extra`] so a
//! parse/render cycle round-trips files written by other versions. `tag` and
//! `bd` child elements hold the tag set and the backup-destination labels.
//!
//! Parse failures split into two kinds with different policies: recoverable
//! XML syntax errors (truncated or garbled documents) are reported as
//! [`SidecarError::Syntax`] and suppressed by the store, which loads empty;
//! schema violations (missing `fname`, unparseable integers) are
//! [`SidecarError::Schema`] and propagate.

use crate::record::FileRecord;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Sidecar filename carried by every managed directory.
pub const SIDECAR_NAME: &str = ".medorg.xml";
/// Volume-label sidecar at a destination volume root.
pub const VOLUME_SIDECAR_NAME: &str = ".mdbackup.xml";
/// Sentinel file excluding a directory's subtree from walks.
pub const SKIP_SENTINEL: &str = ".mdSkipDir";

#[derive(Debug, thiserror::Error)]
pub enum SidecarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Recoverable XML syntax error; the loading store logs and suppresses it.
    #[error("malformed sidecar: {0}")]
    Syntax(String),
    /// Structural unmarshal failure; propagated.
    #[error("invalid sidecar structure: {0}")]
    Schema(String),
    #[error("failed to render sidecar: {0}")]
    Render(String),
}

/// Parse sidecar bytes into a name-keyed record map. Every record's
/// back-reference is set to `dir` regardless of the document's own `dir`
/// attribute, which may describe a directory that has since moved.
pub fn parse_dir_sidecar(
    content: &[u8],
    dir: &Path,
) -> Result<BTreeMap<String, FileRecord>, SidecarError> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);

    let mut records = BTreeMap::new();
    let mut saw_root = false;

    loop {
        match reader.read_event().map_err(syntax)? {
            Event::Start(e) => {
                if saw_root || e.name().as_ref() != b"dr" {
                    return Err(SidecarError::Schema(format!(
                        "unexpected element <{}> at document root",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                saw_root = true;
                parse_dr_children(&mut reader, dir, &mut records)?;
            }
            Event::Empty(e) => {
                if saw_root || e.name().as_ref() != b"dr" {
                    return Err(SidecarError::Schema(format!(
                        "unexpected element <{}> at document root",
                        String::from_utf8_lossy(e.name().as_ref())
                    )));
                }
                saw_root = true;
            }
            Event::End(_) => {
                return Err(SidecarError::Syntax(
                    "unexpected closing tag at document root".to_string(),
                ));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        // Covers empty and prelude-only documents; treated like any other
        // truncated input.
        return Err(SidecarError::Syntax("document has no root element".to_string()));
    }

    Ok(records)
}

fn parse_dr_children(
    reader: &mut Reader<&[u8]>,
    dir: &Path,
    records: &mut BTreeMap<String, FileRecord>,
) -> Result<(), SidecarError> {
    loop {
        match reader.read_event().map_err(syntax)? {
            Event::Start(e) => {
                if e.name().as_ref() == b"fr" {
                    let mut record = record_from_attrs(&e, dir)?;
                    parse_fr_children(reader, &mut record)?;
                    records.insert(record.name.clone(), record);
                } else {
                    skip_element(reader, &e)?;
                }
            }
            Event::Empty(e) => {
                if e.name().as_ref() == b"fr" {
                    let record = record_from_attrs(&e, dir)?;
                    records.insert(record.name.clone(), record);
                }
            }
            Event::End(_) => return Ok(()),
            Event::Eof => {
                return Err(SidecarError::Syntax("truncated document".to_string()));
            }
            _ => {}
        }
    }
}

fn parse_fr_children(
    reader: &mut Reader<&[u8]>,
    record: &mut FileRecord,
) -> Result<(), SidecarError> {
    loop {
        match reader.read_event().map_err(syntax)? {
            Event::Start(e) => match e.name().as_ref() {
                b"tag" => {
                    let text = read_element_text(reader, &e)?;
                    record.tags.insert(text);
                }
                b"bd" => {
                    let text = read_element_text(reader, &e)?;
                    record.backup_dests.insert(text);
                }
                _ => skip_element(reader, &e)?,
            },
            Event::Empty(_) => {}
            Event::End(_) => return Ok(()),
            Event::Eof => {
                return Err(SidecarError::Syntax("truncated document".to_string()));
            }
            _ => {}
        }
    }
}

fn read_element_text(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart<'_>,
) -> Result<String, SidecarError> {
    reader
        .read_text(start.name())
        .map(|cow| cow.into_owned())
        .map_err(syntax)
}

fn skip_element(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> Result<(), SidecarError> {
    reader.read_to_end(start.name()).map_err(syntax)?;
    Ok(())
}

fn record_from_attrs(start: &BytesStart<'_>, dir: &Path) -> Result<FileRecord, SidecarError> {
    let mut record = FileRecord {
        name: String::new(),
        size: 0,
        mtime: 0,
        checksum: String::new(),
        tags: Default::default(),
        backup_dests: Default::default(),
        extra: Default::default(),
        directory: dir.to_path_buf(),
    };

    for attr in start.attributes() {
        let attr = attr.map_err(syntax)?;
        let value = attr.unescape_value().map_err(syntax)?.into_owned();
        match attr.key.as_ref() {
            b"fname" => record.name = value,
            b"size" => {
                record.size = value.parse().map_err(|_| {
                    SidecarError::Schema(format!("unparseable size attribute: {value:?}"))
                })?;
            }
            b"mtime" => {
                record.mtime = value.parse().map_err(|_| {
                    SidecarError::Schema(format!("unparseable mtime attribute: {value:?}"))
                })?;
            }
            b"checksum" => record.checksum = value,
            other => {
                record
                    .extra
                    .insert(String::from_utf8_lossy(other).into_owned(), value);
            }
        }
    }

    if record.name.is_empty() {
        return Err(SidecarError::Schema(
            "fr element without an fname attribute".to_string(),
        ));
    }
    if record.name.contains('/') {
        return Err(SidecarError::Schema(format!(
            "fname contains a path separator: {:?}",
            record.name
        )));
    }

    Ok(record)
}

fn syntax(e: impl std::fmt::Display) -> SidecarError {
    SidecarError::Syntax(e.to_string())
}

/// Render records into sidecar bytes. Records are emitted in the iteration
/// order of the map, which keeps output stable for unchanged stores.
pub fn render_dir_sidecar<'a>(
    dir: &Path,
    records: impl Iterator<Item = &'a FileRecord>,
) -> Result<Vec<u8>, SidecarError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(render)?;

    let mut root = BytesStart::new("dr");
    root.push_attribute(("dir", dir.to_string_lossy().as_ref()));
    writer.write_event(Event::Start(root)).map_err(render)?;

    for record in records {
        let mut fr = BytesStart::new("fr");
        fr.push_attribute(("fname", record.name.as_str()));
        fr.push_attribute(("size", record.size.to_string().as_str()));
        fr.push_attribute(("mtime", record.mtime.to_string().as_str()));
        if !record.checksum.is_empty() {
            fr.push_attribute(("checksum", record.checksum.as_str()));
        }
        for (key, value) in &record.extra {
            fr.push_attribute((key.as_str(), value.as_str()));
        }

        if record.tags.is_empty() && record.backup_dests.is_empty() {
            writer.write_event(Event::Empty(fr)).map_err(render)?;
            continue;
        }

        writer.write_event(Event::Start(fr)).map_err(render)?;
        for tag in &record.tags {
            write_text_element(&mut writer, "tag", tag)?;
        }
        for label in &record.backup_dests {
            write_text_element(&mut writer, "bd", label)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("fr")))
            .map_err(render)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("dr")))
        .map_err(render)?;

    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), SidecarError> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(render)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(render)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(render)?;
    Ok(())
}

fn render(e: impl std::fmt::Display) -> SidecarError {
    SidecarError::Render(e.to_string())
}

/// Write `content` to `path` atomically: temp file in the same directory,
/// fsync, rename into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<(), std::io::Error> {
    let parent = path.parent().unwrap_or(Path::new("."));

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.write_all(content)?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    Ok(())
}
