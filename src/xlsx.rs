use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use zip::ZipArchive;

use crate::error::StationError;

/// Rows queued between the decompressing producer thread and the consuming
/// iterator. Keeps peak memory at a small multiple of one row.
const ROW_CHANNEL_BOUND: usize = 64;

/// One worksheet row: the declared row index plus column-letter → resolved
/// cell value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyRow {
    pub index: u32,
    pub values: BTreeMap<String, String>,
}

/// Maps sheet name → worksheet part path ("xl/worksheets/…") by combining the
/// workbook part with the workbook relationships part.
pub fn worksheet_paths(path: &Path) -> Result<BTreeMap<String, String>, StationError> {
    let mut archive = open_archive(path)?;
    let workbook = read_part(&mut archive, "xl/workbook.xml")?;
    let rels = read_part(&mut archive, "xl/_rels/workbook.xml.rels")?;

    let sheet_rids = sheet_name_rid_pairs(&workbook);
    let rid_targets = rels_rid_targets(&rels);

    let mut paths = BTreeMap::new();
    for (name, rid) in sheet_rids {
        if let Some(target) = rid_targets.get(&rid) {
            paths.insert(name, target.clone());
        }
    }
    Ok(paths)
}

/// Loads the shared-strings part fully into an indexed list. A missing part
/// means the workbook simply has no shared strings.
pub fn shared_strings(path: &Path) -> Result<Vec<String>, StationError> {
    let mut archive = open_archive(path)?;
    let data = match archive.by_name("xl/sharedStrings.xml") {
        Ok(mut entry) => {
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|err| StationError::Archive(err.to_string()))?;
            data
        }
        Err(_) => return Ok(Vec::new()),
    };

    let mut reader = Reader::from_reader(data.as_slice());
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut text = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == b"t" => {
                in_text = true;
                text.clear();
            }
            Ok(Event::Empty(ref e)) if e.name().as_ref() == b"t" => {
                strings.push(String::new());
            }
            Ok(Event::Text(ref t)) if in_text => {
                if let Ok(chunk) = t.unescape() {
                    text.push_str(&chunk);
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"t" => {
                in_text = false;
                strings.push(std::mem::take(&mut text));
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Lazy, finite, non-restartable sequence of worksheet rows.
///
/// The worksheet entry is decompressed incrementally on a background thread
/// and rows travel through a bounded channel; the sequence ends at
/// end-of-document or on the first parse error, so callers must treat
/// premature termination as "no more rows".
pub struct RowIter {
    rx: Receiver<LazyRow>,
}

impl RowIter {
    pub fn open(
        path: &Path,
        worksheet_path: &str,
        shared_strings: Vec<String>,
    ) -> Result<Self, StationError> {
        let mut archive = open_archive(path)?;
        if archive.index_for_name(worksheet_path).is_none() {
            return Err(StationError::MissingArchivePart(worksheet_path.to_string()));
        }

        let (tx, rx) = mpsc::sync_channel(ROW_CHANNEL_BOUND);
        let worksheet = worksheet_path.to_string();
        thread::Builder::new()
            .name("xlsx-rows".to_string())
            .spawn(move || {
                let Ok(entry) = archive.by_name(&worksheet) else {
                    return;
                };
                stream_rows(BufReader::new(entry), &shared_strings, &tx);
            })
            .map_err(|err| StationError::Filesystem(err.to_string()))?;

        Ok(Self { rx })
    }
}

impl Iterator for RowIter {
    type Item = LazyRow;

    fn next(&mut self) -> Option<LazyRow> {
        self.rx.recv().ok()
    }
}

fn stream_rows(reader: impl std::io::BufRead, shared: &[String], tx: &SyncSender<LazyRow>) {
    let mut xml = Reader::from_reader(reader);
    let mut buf = Vec::new();

    let mut row_index: u32 = 0;
    let mut values: BTreeMap<String, String> = BTreeMap::new();
    let mut cell_column: Option<String> = None;
    let mut cell_type: Option<String> = None;
    let mut text = String::new();
    let mut in_value = false;

    loop {
        match xml.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"row" => {
                    row_index = attribute(e, b"r")
                        .and_then(|raw| raw.parse().ok())
                        .unwrap_or(row_index + 1);
                    values.clear();
                }
                b"c" => {
                    cell_column = attribute(e, b"r").map(|r| column_letter(&r));
                    cell_type = attribute(e, b"t");
                    text.clear();
                }
                b"v" => {
                    in_value = true;
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"row" => {
                    row_index = attribute(e, b"r")
                        .and_then(|raw| raw.parse().ok())
                        .unwrap_or(row_index + 1);
                    if tx.send(LazyRow::empty(row_index)).is_err() {
                        return;
                    }
                }
                b"c" => {
                    // Valueless cell: stored as the empty string.
                    if let Some(raw) = attribute(e, b"r") {
                        values.insert(column_letter(&raw), String::new());
                    }
                }
                _ => {}
            },
            Ok(Event::Text(ref t)) => {
                if in_value {
                    if let Ok(chunk) = t.unescape() {
                        text.push_str(&chunk);
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"v" => {
                    in_value = false;
                }
                b"c" => {
                    if let Some(column) = cell_column.take() {
                        let raw = text.trim();
                        let value = if cell_type.as_deref() == Some("s") {
                            resolve_shared(raw, shared)
                        } else {
                            raw.to_string()
                        };
                        values.insert(column, value);
                    }
                    cell_type = None;
                    text.clear();
                }
                b"row" => {
                    let row = LazyRow {
                        index: row_index,
                        values: std::mem::take(&mut values),
                    };
                    if tx.send(row).is_err() {
                        return;
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => return,
            // Parse errors end the sequence early instead of surfacing.
            Err(_) => return,
            _ => {}
        }
        buf.clear();
    }
}

impl LazyRow {
    fn empty(index: u32) -> Self {
        Self {
            index,
            values: BTreeMap::new(),
        }
    }
}

fn resolve_shared(raw: &str, shared: &[String]) -> String {
    match raw.parse::<usize>() {
        Ok(idx) if idx < shared.len() => shared[idx].clone(),
        _ => String::new(),
    }
}

/// Column letter of a cell reference: the reference minus its trailing digits.
fn column_letter(cell_ref: &str) -> String {
    cell_ref
        .trim_end_matches(|ch: char| ch.is_ascii_digit())
        .to_string()
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>, StationError> {
    let file = File::open(path)
        .map_err(|err| StationError::Filesystem(format!("open {}: {err}", path.display())))?;
    ZipArchive::new(file).map_err(|err| StationError::Archive(err.to_string()))
}

fn read_part(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>, StationError> {
    let mut entry = archive
        .by_name(name)
        .map_err(|_| StationError::MissingArchivePart(name.to_string()))?;
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .map_err(|err| StationError::Archive(err.to_string()))?;
    Ok(data)
}

fn sheet_name_rid_pairs(xml: &[u8]) -> Vec<(String, String)> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut pairs = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e) | Event::Empty(ref e)) if e.name().as_ref() == b"sheet" => {
                let name = attribute(e, b"name");
                let rid = attribute(e, b"r:id");
                if let (Some(name), Some(rid)) = (name, rid) {
                    pairs.push((name, rid));
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    pairs
}

fn rels_rid_targets(xml: &[u8]) -> BTreeMap<String, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut map = BTreeMap::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e) | Event::Empty(ref e))
                if e.name().as_ref() == b"Relationship" =>
            {
                let id = attribute(e, b"Id");
                let target = attribute(e, b"Target");
                if let (Some(id), Some(target)) = (id, target) {
                    if target.starts_with("worksheets/") {
                        map.insert(id, format!("xl/{target}"));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    map
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok())
        .map(|value| value.into_owned())
}
