//! Native payload format
//!
//! A payload is a block of lines. `metadata->key->value` lines describe how
//! the data lines after them are read; every other non-blank line is a data
//! row: an ISO-8601 UTC timestamp followed by one value per declared column,
//! separated by the declared delimiter.
//!
//! ```text
//! metadata->datadelimiter->^
//! metadata->make->Contec
//! metadata->model->CMS50D+
//! metadata->displayname->Finger Oximeter
//! metadata->columns->iso8601time^pulse^spo2
//! metadata->format->DATE^INTEGER^INTEGER
//! metadata->units->NONE^BPM^%
//! 2024-01-01T08:00:00Z^72^98
//! ```

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::iter::Enumerate;
use std::str::Lines;
use thiserror::Error;

use crate::model::ScheduleWindow;

const DIRECTIVE_SEPARATOR: &str = "->";
const METADATA: &str = "metadata";
const TIME_COLUMN: &str = "iso8601time";
const TIME_FORMAT: &str = "DATE";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line {line}: unknown metadata directive '{directive}'")]
    UnknownDirective { line: usize, directive: String },
    #[error("line {line}: malformed metadata: {reason}")]
    MalformedMetadata { line: usize, reason: String },
    #[error("line {line}: insufficient metadata: {missing}")]
    InsufficientMetadata { line: usize, missing: String },
    #[error("line {line}: invalid timestamp '{value}'")]
    InvalidTimestamp { line: usize, value: String },
    #[error("line {line}: row has {fields} fields but {columns} columns are declared")]
    TooManyFields { line: usize, fields: usize, columns: usize },
    #[error("line {line}: no units declared for column '{column}'")]
    MissingUnits { line: usize, column: String },
}

/// Identity of the device that produced the rows, as declared by metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub make: String,
    pub model: String,
    pub display_name: String,
}

/// Metadata seen so far in a payload
#[derive(Debug, Clone, Default)]
pub struct PayloadMetadata {
    pub delimiter: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub display_name: Option<String>,
    pub columns: Option<Vec<String>>,
    pub format: Option<Vec<String>>,
    pub units: Option<Vec<String>>,
    pub schedule: ScheduleWindow,
    /// `metadata->persist->key->value` pairs, kept verbatim
    pub persist: BTreeMap<String, String>,
}

impl PayloadMetadata {
    /// Names of the required directives that are still missing
    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.make.is_none() {
            missing.push("make");
        }
        if self.model.is_none() {
            missing.push("model");
        }
        if self.display_name.is_none() {
            missing.push("displayname");
        }
        if self.delimiter.is_none() {
            missing.push("datadelimiter");
        }
        if self.columns.is_none() {
            missing.push("columns");
        }
        if self.format.is_none() {
            missing.push("format");
        }
        if self.units.is_none() {
            missing.push("units");
        }
        missing
    }

    fn check_complete(&self, line: usize) -> Result<(), ParseError> {
        let mut problems: Vec<String> = self.missing()
            .into_iter()
            .map(|key| format!("{}{}{}", METADATA, DIRECTIVE_SEPARATOR, key))
            .collect();
        if let (Some(columns), Some(format)) = (&self.columns, &self.format) {
            if columns.len() != format.len() {
                problems.push(format!(
                    "columns ({}) and format ({}) have different number of elements",
                    columns.len(),
                    format.len()
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ParseError::InsufficientMetadata { line, missing: problems.join(", ") })
        }
    }

    fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            make: self.make.clone().unwrap_or_default(),
            model: self.model.clone().unwrap_or_default(),
            display_name: self.display_name.clone().unwrap_or_default(),
        }
    }
}

/// One value of a data row together with its column declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataField {
    pub attribute_name: String,
    pub units: String,
    pub format: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    pub line: usize,
    pub time: DateTime<Utc>,
    pub device: DeviceIdentity,
    pub schedule: ScheduleWindow,
    pub fields: Vec<DataField>,
}

/// Streaming parser over one payload.
///
/// Yields data rows in payload order. The first error ends the stream.
pub struct NativeParser<'a> {
    lines: Enumerate<Lines<'a>>,
    metadata: PayloadMetadata,
    complete: bool,
    failed: bool,
}

impl<'a> NativeParser<'a> {
    pub fn new(payload: &'a str) -> Self {
        NativeParser {
            lines: payload.lines().enumerate(),
            metadata: PayloadMetadata::default(),
            complete: false,
            failed: false,
        }
    }

    pub fn metadata(&self) -> &PayloadMetadata {
        &self.metadata
    }

    fn apply_metadata(&mut self, line: usize, parts: &[&str]) -> Result<(), ParseError> {
        let directive = parts.get(1).copied().unwrap_or("");
        let value = || directive_value(line, parts);

        // Any change of metadata re-opens the completeness check
        self.complete = false;

        match directive {
            "persist" => {
                if parts.len() != 4 {
                    return Err(ParseError::MalformedMetadata {
                        line,
                        reason: "persist expects exactly one key and one value".to_string(),
                    });
                }
                self.metadata.persist.insert(parts[2].to_string(), parts[3].to_string());
            }
            "datadelimiter" => {
                let delimiter = value()?;
                if delimiter.is_empty() {
                    return Err(ParseError::MalformedMetadata {
                        line,
                        reason: "datadelimiter is empty".to_string(),
                    });
                }
                self.metadata.delimiter = Some(delimiter.to_string());
            }
            "make" => self.metadata.make = Some(value()?.to_string()),
            "model" => self.metadata.model = Some(value()?.to_string()),
            "displayname" => self.metadata.display_name = Some(value()?.to_string()),
            "columns" => {
                let columns = self.split_declared(line, directive, value()?)?;
                if columns.first().map(String::as_str) != Some(TIME_COLUMN) {
                    return Err(ParseError::MalformedMetadata {
                        line,
                        reason: format!("first column must be {}", TIME_COLUMN),
                    });
                }
                self.metadata.columns = Some(columns);
            }
            "format" => {
                let format = self.split_declared(line, directive, value()?)?;
                if format.first().map(String::as_str) != Some(TIME_FORMAT) {
                    return Err(ParseError::MalformedMetadata {
                        line,
                        reason: format!("first format must be {}", TIME_FORMAT),
                    });
                }
                self.metadata.format = Some(format);
            }
            "units" => self.metadata.units = Some(self.split_declared(line, directive, value()?)?),
            "scheduleeffectivedate" => {
                self.metadata.schedule.effective = Some(parse_time(line, value()?)?);
            }
            "scheduleexpirydate" => {
                self.metadata.schedule.expiry = Some(parse_time(line, value()?)?);
            }
            other => {
                return Err(ParseError::UnknownDirective { line, directive: other.to_string() });
            }
        }
        Ok(())
    }

    fn split_declared(&self, line: usize, directive: &str, value: &str) -> Result<Vec<String>, ParseError> {
        let delimiter = self.metadata.delimiter.as_deref().ok_or_else(|| ParseError::MalformedMetadata {
            line,
            reason: format!("{} declared before datadelimiter", directive),
        })?;
        Ok(split_fields(value, delimiter).into_iter().map(str::to_string).collect())
    }

    fn parse_row(&mut self, line: usize, text: &str) -> Result<DataRow, ParseError> {
        if !self.complete {
            self.metadata.check_complete(line)?;
            self.complete = true;
        }

        let meta = &self.metadata;
        let (delimiter, columns, format, units) = match (&meta.delimiter, &meta.columns, &meta.format, &meta.units) {
            (Some(d), Some(c), Some(f), Some(u)) => (d, c, f, u),
            _ => return Err(ParseError::InsufficientMetadata { line, missing: meta.missing().join(", ") }),
        };

        let values = split_fields(text, delimiter);
        if values.len() > columns.len() {
            return Err(ParseError::TooManyFields { line, fields: values.len(), columns: columns.len() });
        }

        let time = parse_time(line, values.first().copied().unwrap_or(""))?;
        let mut fields = Vec::with_capacity(values.len().saturating_sub(1));
        for (i, value) in values.iter().enumerate().skip(1) {
            let units = units.get(i).ok_or_else(|| ParseError::MissingUnits {
                line,
                column: columns[i].clone(),
            })?;
            fields.push(DataField {
                attribute_name: columns[i].clone(),
                units: units.clone(),
                format: format[i].clone(),
                value: value.to_string(),
            });
        }

        Ok(DataRow {
            line,
            time,
            device: meta.identity(),
            schedule: meta.schedule,
            fields,
        })
    }
}

impl<'a> Iterator for NativeParser<'a> {
    type Item = Result<DataRow, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        while let Some((idx, text)) = self.lines.next() {
            let line = idx + 1;
            if text.trim().is_empty() {
                continue;
            }

            let parts = split_fields(text, DIRECTIVE_SEPARATOR);
            let result = if parts.first() == Some(&METADATA) {
                self.apply_metadata(line, &parts).map(|_| None)
            } else {
                self.parse_row(line, text).map(Some)
            };

            match result {
                Ok(None) => continue,
                Ok(Some(row)) => return Some(Ok(row)),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

fn directive_value<'p>(line: usize, parts: &[&'p str]) -> Result<&'p str, ParseError> {
    parts.get(2).copied().ok_or_else(|| ParseError::MalformedMetadata {
        line,
        reason: format!("{} has no value", parts.get(1).copied().unwrap_or("")),
    })
}

/// Split on a literal separator, dropping trailing empty fields
fn split_fields<'s>(text: &'s str, separator: &str) -> Vec<&'s str> {
    let mut fields: Vec<&str> = text.split(separator).collect();
    while fields.len() > 1 && fields.last().map_or(false, |f| f.is_empty()) {
        fields.pop();
    }
    fields
}

/// RFC 3339 with any offset; the result is normalised to UTC
fn parse_time(line: usize, value: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ParseError::InvalidTimestamp { line, value: value.to_string() })
}
