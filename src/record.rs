use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::Path,
};

use compact_str::CompactString;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::unidiff::{self, DiffDecomposition};

/// One article state or one edit, as stored in the JSON-lines revision files.
///
/// The `version` key selects the variant. Keys that are not modelled explicitly are kept in the
/// `extra` map of each variant and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version")]
pub enum RevisionRecord {
    #[serde(rename = "first_version")]
    FirstVersion(FirstVersion),
    #[serde(rename = "diff")]
    Diff(DiffRevision),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstVersion {
    /// Full article text
    #[serde(rename = "Content", default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffRevision {
    #[serde(rename = "Timestamp", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    // aka. contributor
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<CompactString>,
    #[serde(rename = "Comment", default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Raw unified diff against the previous revision
    #[serde(rename = "Diff", default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    /// Only present after [`RevisionRecord::enrich`]
    #[serde(flatten)]
    pub decomposition: Option<DiffDecomposition>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RevisionRecord {
    /// The value of the `version` discriminant.
    pub fn version(&self) -> &'static str {
        match self {
            RevisionRecord::FirstVersion(_) => "first_version",
            RevisionRecord::Diff(_) => "diff",
        }
    }

    /// Attach the decomposition of the `Diff` field. First versions are left untouched.
    pub fn enrich(&mut self) {
        if let RevisionRecord::Diff(revision) = self {
            let diff_text = revision.diff.as_deref().unwrap_or_default();
            revision.decomposition = Some(unidiff::decompose(diff_text));
        }
    }

    pub fn as_diff(&self) -> Option<&DiffRevision> {
        match self {
            RevisionRecord::Diff(revision) => Some(revision),
            RevisionRecord::FirstVersion(_) => None,
        }
    }
}

impl DiffRevision {
    /// Parse the `Timestamp` field.
    ///
    /// Accepts RFC 3339 as well as the long (`2003-12-05T06:41:50Z`) and short (`20031205064150`)
    /// MediaWiki formats. Anything else is reported and treated as absent.
    pub fn parsed_timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        const TIMESTAMP_FORMAT_LONG: &str = "%Y-%m-%dT%H:%M:%SZ";
        const TIMESTAMP_FORMAT_SHORT: &str = "%Y%m%d%H%M%S";

        let text = self.timestamp.as_deref()?;

        let parsed = chrono::DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT_LONG)
                    .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT_SHORT))
                    .map(|dt| chrono::DateTime::from_naive_utc_and_offset(dt, chrono::Utc))
            });

        match parsed {
            Ok(timestamp) => Some(timestamp),
            Err(_) => {
                tracing::warn!(message = "Found invalid revision timestamp", timestamp = text);
                None
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("malformed record on line {line}")]
    MalformedJson {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed CSV")]
    Csv(#[from] csv::Error),
    #[error("missing mandatory field `{field}` in record on line {line}")]
    MissingField { field: &'static str, line: usize },
}

/// Read one JSON object per line. Blank lines are skipped.
pub fn read_jsonl<T: DeserializeOwned, R: BufRead>(reader: R) -> Result<Vec<T>, LoadError> {
    let mut records = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let record = serde_json::from_str(&line).map_err(|source| LoadError::MalformedJson {
            line: index + 1,
            source,
        })?;
        records.push(record);
    }

    Ok(records)
}

/// Load all revision records of a JSON-lines file.
///
/// Diff records without a `Diff` field are treated as having an empty diff, unless the `strict`
/// feature is enabled, in which case they fail the whole file.
pub fn load_jsonl(path: &Path) -> Result<Vec<RevisionRecord>, LoadError> {
    let reader = BufReader::new(File::open(path)?);
    let records: Vec<RevisionRecord> = read_jsonl(reader)?;

    let missing_diff = records.iter().position(|record| {
        matches!(record, RevisionRecord::Diff(DiffRevision { diff: None, .. }))
    });
    if let Some(index) = missing_diff {
        if cfg!(feature = "strict") {
            return Err(LoadError::MissingField {
                field: "Diff",
                line: index + 1,
            });
        } else {
            tracing::warn!(
                message = "Diff record without `Diff` field, treating it as an empty diff",
                file = %path.display(),
                record = index + 1
            );
        }
    }

    Ok(records)
}

/// Serialize records as JSON lines (non-ASCII characters are written as is).
pub fn write_jsonl<T: Serialize, W: Write>(writer: W, records: &[T]) -> Result<(), std::io::Error> {
    let mut writer = BufWriter::new(writer);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()
}

/// A revision that an earlier detection pass already judged, as exported to CSV.
///
/// Every column of the row is kept in `fields`, in column order, so the row serializes back to
/// the same object it was exported from. Cells are kept as text and an empty cell becomes `null`.
/// `Source` is stored already normalized.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct JudgedRevision {
    #[serde(skip)]
    pub source: CompactString,
    #[serde(skip)]
    pub judgment: String,
    pub fields: Map<String, Value>,
}

impl JudgedRevision {
    /// Text of the cell in column `column`, if the column exists and the cell is not empty.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(Value::as_str)
    }

    /// The `version` cell, for exports that carry one.
    pub fn version(&self) -> Option<&str> {
        self.get("version")
    }

    pub fn is_weaponised(&self) -> bool {
        self.judgment.eq_ignore_ascii_case("weaponised")
    }
}

/// Reduce a `Source` value (usually the path of the revision file it came from) to the article
/// base name.
pub fn normalize_source(source: &str) -> CompactString {
    const SOURCE_SUFFIX: &str = "_enriched_subsampled.jsonl";

    let file_name = Path::new(source)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(source);

    CompactString::from(file_name.strip_suffix(SOURCE_SUFFIX).unwrap_or(file_name))
}

pub fn read_judged_csv<R: Read>(reader: R) -> Result<Vec<JudgedRevision>, LoadError> {
    let table = Table::read(reader)?;
    let source_column = table.column("Source").ok_or(LoadError::MissingField {
        field: "Source",
        line: 1,
    })?;
    let judgment_column = table.column("Judgment").ok_or(LoadError::MissingField {
        field: "Judgment",
        line: 1,
    })?;

    let mut records = Vec::with_capacity(table.rows.len());
    for (index, row) in table.rows.iter().enumerate() {
        // header is line 1
        let line = index + 2;
        let source = normalize_source(row.get(source_column).ok_or(LoadError::MissingField {
            field: "Source",
            line,
        })?);
        let judgment = row
            .get(judgment_column)
            .ok_or(LoadError::MissingField {
                field: "Judgment",
                line,
            })?
            .to_string();

        let fields = table
            .headers
            .iter()
            .enumerate()
            .map(|(column, header)| {
                let value = match row.get(column) {
                    _ if column == source_column => Value::String(source.to_string()),
                    Some(cell) if !cell.is_empty() => Value::String(cell.to_string()),
                    _ => Value::Null,
                };
                (header.to_string(), value)
            })
            .collect();

        records.push(JudgedRevision {
            source,
            judgment,
            fields,
        });
    }

    Ok(records)
}

pub fn load_judged_csv(path: &Path) -> Result<Vec<JudgedRevision>, LoadError> {
    read_judged_csv(File::open(path)?)
}

/// A CSV file kept as raw text cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub headers: csv::StringRecord,
    pub rows: Vec<csv::StringRecord>,
}

impl Table {
    pub fn read<R: Read>(reader: R) -> Result<Self, LoadError> {
        let mut csv_reader = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = csv_reader.headers()?.clone();
        let rows = csv_reader.records().collect::<Result<Vec<_>, _>>()?;

        Ok(Self { headers, rows })
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        Self::read(File::open(path)?)
    }

    /// Index of the column called `name`.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|header| header == name)
    }

    /// Write the table with one extra column appended. `values` holds one cell per row.
    pub fn write_with_column<W: Write>(
        &self,
        writer: W,
        header: &str,
        values: &[String],
    ) -> Result<(), csv::Error> {
        debug_assert_eq!(values.len(), self.rows.len());

        let mut csv_writer = csv::Writer::from_writer(writer);

        let mut headers = self.headers.clone();
        headers.push_field(header);
        csv_writer.write_record(&headers)?;

        for (row, value) in self.rows.iter().zip(values) {
            let mut row = row.clone();
            row.push_field(value);
            csv_writer.write_record(&row)?;
        }

        csv_writer.flush()?;
        Ok(())
    }
}
