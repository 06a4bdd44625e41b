use calamine::{open_workbook_auto_from_rs, Data, DataType, Reader};
use std::collections::BTreeMap;
use std::io::Cursor;
use tracing::{debug, warn};

use crate::error::{FileError, RowError};
use crate::field::CanonicalField;
use crate::format::{CompiledFormat, FileKind};
use crate::transform::{apply_all, check_order, Header, Row};

/// Canonical field values of one source row, before normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    /// 1-based position in the source file, counting skipped rows.
    pub row: usize,
    pub fields: BTreeMap<CanonicalField, String>,
}

impl RawRecord {
    /// Trimmed value, `None` when absent or blank.
    pub fn get(&self, field: CanonicalField) -> Option<&str> {
        self.fields
            .get(&field)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, field: CanonicalField, value: impl Into<String>) {
        self.fields.insert(field, value.into());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub emitted: usize,
    /// Blank, skip-pattern and empty rows.
    pub filtered: usize,
    pub failed: usize,
}

enum RowSource {
    Csv(csv::StringRecordsIntoIter<Cursor<Vec<u8>>>),
    Sheet(std::vec::IntoIter<Vec<String>>),
}

impl RowSource {
    fn next_row(&mut self) -> Option<Result<Vec<String>, String>> {
        match self {
            RowSource::Csv(records) => records
                .next()
                .map(|r| r.map(|rec| rec.iter().map(str::to_string).collect()).map_err(|e| e.to_string())),
            RowSource::Sheet(rows) => rows.next().map(Ok),
        }
    }
}

/// Decodes `bytes` with the descriptor's encoding. A byte-order mark overrides it.
pub fn decode(format: &CompiledFormat, bytes: &[u8]) -> String {
    let (text, used, had_errors) = format.encoding.decode(bytes);
    if had_errors {
        warn!("{}: input is not valid {}, undecodable bytes replaced", format.id(), used.name());
    }
    text.into_owned()
}

/// Lazy sequence of raw records from one uploaded file.
pub struct RecordStream<'f> {
    format: &'f CompiledFormat,
    source: RowSource,
    header: Header,
    line: usize,
    stats: ParseStats,
}

impl<'f> RecordStream<'f> {
    /// Opens the file, skips leading rows and resolves the header. Rows are
    /// only read as the stream is consumed.
    pub fn open(format: &'f CompiledFormat, bytes: &[u8]) -> Result<Self, FileError> {
        let source = match format.kind() {
            FileKind::Csv => {
                let text = decode(format, bytes);
                let reader = csv::ReaderBuilder::new()
                    .delimiter(format.descriptor.format.delimiter as u8)
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(Cursor::new(text.into_bytes()));
                RowSource::Csv(reader.into_records())
            }
            FileKind::Sheet => RowSource::Sheet(read_sheet(bytes, format.descriptor.format.sheet_name.as_deref())?.into_iter()),
        };

        let mut stream = Self {
            format,
            source,
            header: Header::new(),
            line: 0,
            stats: ParseStats::default(),
        };
        for _ in 0..format.descriptor.format.skip_rows {
            if stream.pull().is_none() {
                break;
            }
        }
        if format.descriptor.format.has_header {
            if let Some(Ok(cells)) = stream.pull() {
                stream.header = cells
                    .iter()
                    .enumerate()
                    .map(|(i, name)| (name.trim().trim_start_matches('\u{feff}').to_string(), i))
                    .collect();
                debug!("{}: header {:?}", format.id(), cells);
            }
        }
        if !format.order_checked {
            check_order(&format.transforms, Some(&stream.header)).map_err(FileError::Transforms)?;
        }
        Ok(stream)
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    fn pull(&mut self) -> Option<Result<Vec<String>, String>> {
        let next = self.source.next_row();
        if next.is_some() {
            self.line += 1;
        }
        next
    }

    fn is_filtered(&self, cells: &[String]) -> bool {
        let patterns = &self.format.descriptor.filtering.skip_if_contains;
        cells.iter().any(|cell| patterns.iter().any(|p| cell.contains(p.as_str())))
    }

    fn process(&self, cells: Vec<String>) -> Result<Option<RawRecord>, RowError> {
        let mut row = Row::new(self.line, cells, &self.header);
        if row.is_blank() || self.is_filtered(row.cells()) {
            return Ok(None);
        }
        apply_all(&self.format.transforms, &mut row)?;

        let mut record = RawRecord { row: self.line, fields: BTreeMap::new() };
        for (field, column) in &self.format.columns {
            let value = row.get(column).ok_or_else(|| RowError::MissingColumn {
                row: self.line,
                column: column.to_string(),
            })?;
            record.set(*field, value.trim());
        }
        if record.get(CanonicalField::Date).is_none() && record.get(CanonicalField::Amount).is_none() {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

impl Iterator for RecordStream<'_> {
    type Item = Result<RawRecord, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cells = match self.pull()? {
                Ok(cells) => cells,
                Err(message) => {
                    self.stats.failed += 1;
                    let err = RowError::Decode { row: self.line, message };
                    warn!("{}: {err}", self.format.id());
                    return Some(Err(err));
                }
            };
            match self.process(cells) {
                Ok(Some(record)) => {
                    self.stats.emitted += 1;
                    return Some(Ok(record));
                }
                Ok(None) => {
                    self.stats.filtered += 1;
                    debug!("{}: row {} filtered", self.format.id(), self.line);
                }
                Err(err) => {
                    self.stats.failed += 1;
                    warn!("{}: {err}", self.format.id());
                    return Some(Err(err));
                }
            }
        }
    }
}

fn read_sheet(bytes: &[u8], sheet_name: Option<&str>) -> Result<Vec<Vec<String>>, FileError> {
    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(bytes.to_vec())).map_err(|e| FileError::Workbook(e.to_string()))?;
    let name = match sheet_name {
        Some(name) => {
            if !workbook.sheet_names().iter().any(|n| n == name) {
                return Err(FileError::SheetNotFound(name.to_string()));
            }
            name.to_string()
        }
        None => workbook.sheet_names().first().cloned().ok_or(FileError::NoSheets)?,
    };
    let range = workbook
        .worksheet_range(&name)
        .map_err(|e| FileError::Workbook(e.to_string()))?;
    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_text).collect())
        .collect())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::DateTime(_) => match cell.as_datetime() {
            Some(dt) if dt.time() == chrono::NaiveTime::MIN => dt.format("%Y-%m-%d").to_string(),
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => cell.to_string(),
        },
        other => other.to_string().trim().to_string(),
    }
}
