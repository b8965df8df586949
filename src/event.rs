//! Replay log rows and the operations they carry
//!
//! A log is a comma-delimited file with the columns
//! `datetime, function, payer, receiver, days, net_frac, cpu_frac, max_payment, queue_max`.
//! Extra trailing columns are ignored. Rows whose `function` is not a known
//! operation are annotation rows and are never interpreted further.

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines, Write};
use std::path::Path;
use std::str::FromStr;
use crate::error::ParseError;
use crate::types::{AccountName, Asset, OperationKind};

/// Calendar format of the `datetime` column
pub const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

/// Column order of the replay log
pub const COLUMNS: [&str; 9] = [
    "datetime",
    "function",
    "payer",
    "receiver",
    "days",
    "net_frac",
    "cpu_frac",
    "max_payment",
    "queue_max",
];

/// One raw log row, fields still unparsed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRow {
    pub line: usize,
    pub datetime: String,
    pub function: String,
    pub payer: String,
    pub receiver: String,
    pub days: String,
    pub net_frac: String,
    pub cpu_frac: String,
    pub max_payment: String,
    pub queue_max: String,
}

impl LogRow {
    /// Split one delimited line into its columns
    pub fn parse_line(line: usize, text: &str) -> Self {
        let mut fields = text.split(',').map(clean_field);
        let mut next = || fields.next().unwrap_or_default();
        Self {
            line,
            datetime: next(),
            function: next(),
            payer: next(),
            receiver: next(),
            days: next(),
            net_frac: next(),
            cpu_frac: next(),
            max_payment: next(),
            queue_max: next(),
        }
    }

    /// Operation kind named by the row, `None` for annotation rows
    pub fn kind(&self) -> Option<OperationKind> {
        OperationKind::from_function(&self.function)
    }

    /// Parse the `datetime` column as a local wall-clock time
    pub fn timestamp(&self) -> Result<NaiveDateTime, ParseError> {
        NaiveDateTime::parse_from_str(self.datetime.trim(), TIMESTAMP_FORMAT).map_err(|e| {
            ParseError::InvalidTimestamp {
                line: self.line,
                input: self.datetime.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Build the typed event; annotation rows yield `Ok(None)` without touching other fields
    pub fn to_event(&self, directory: &AccountDirectory) -> Result<Option<Event>, ParseError> {
        let kind = match self.kind() {
            Some(kind) => kind,
            None => return Ok(None),
        };
        let timestamp = self.timestamp()?;
        let payer = self.account("payer", &self.payer, directory)?;
        let receiver = self.account("receiver", &self.receiver, directory)?;

        let operation = match kind {
            OperationKind::Rent => Operation::Rent(RentRequest {
                payer,
                receiver,
                days: self.field("days", &self.days)?,
                net_frac: self.field("net_frac", &self.net_frac)?,
                cpu_frac: self.field("cpu_frac", &self.cpu_frac)?,
                max_payment: self.field("max_payment", &self.max_payment)?,
            }),
            OperationKind::ExecuteQueue => Operation::ExecuteQueue(QueueRequest {
                payer,
                receiver,
                max: self.field("queue_max", &self.queue_max)?,
            }),
        };

        Ok(Some(Event {
            line: self.line,
            timestamp,
            operation,
        }))
    }

    fn account(
        &self,
        column: &str,
        value: &str,
        directory: &AccountDirectory,
    ) -> Result<AccountName, ParseError> {
        if value.is_empty() {
            return Err(ParseError::MissingColumn {
                line: self.line,
                column: column.to_string(),
            });
        }
        directory.resolve(value).map_err(|e| ParseError::InvalidField {
            line: self.line,
            field: column.to_string(),
            input: value.to_string(),
            reason: e.to_string(),
        })
    }

    fn field<T>(&self, column: &str, value: &str) -> Result<T, ParseError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if value.is_empty() {
            return Err(ParseError::MissingColumn {
                line: self.line,
                column: column.to_string(),
            });
        }
        value.parse().map_err(|e: T::Err| ParseError::InvalidField {
            line: self.line,
            field: column.to_string(),
            input: value.to_string(),
            reason: e.to_string(),
        })
    }
}

fn clean_field(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

/// Lease purchase parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RentRequest {
    pub payer: AccountName,
    pub receiver: AccountName,
    pub days: u32,
    pub net_frac: i64,
    pub cpu_frac: i64,
    pub max_payment: Asset,
}

/// Queue processing parameters; payer and receiver are the accounts observed around the call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRequest {
    pub payer: AccountName,
    pub receiver: AccountName,
    pub max: u32,
}

/// Operation payload of a recognized row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Rent(RentRequest),
    ExecuteQueue(QueueRequest),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Rent(_) => OperationKind::Rent,
            Operation::ExecuteQueue(_) => OperationKind::ExecuteQueue,
        }
    }

    pub fn payer(&self) -> &AccountName {
        match self {
            Operation::Rent(r) => &r.payer,
            Operation::ExecuteQueue(q) => &q.payer,
        }
    }

    pub fn receiver(&self) -> &AccountName {
        match self {
            Operation::Rent(r) => &r.receiver,
            Operation::ExecuteQueue(q) => &q.receiver,
        }
    }
}

/// A recognized, fully parsed log row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub line: usize,
    pub timestamp: NaiveDateTime,
    pub operation: Operation,
}

impl Event {
    /// Render back into the log's column layout
    pub fn to_log_row(&self) -> LogRow {
        let datetime = self.timestamp.format(TIMESTAMP_FORMAT).to_string();
        match &self.operation {
            Operation::Rent(r) => LogRow {
                line: self.line,
                datetime,
                function: OperationKind::Rent.as_str().to_string(),
                payer: r.payer.to_string(),
                receiver: r.receiver.to_string(),
                days: r.days.to_string(),
                net_frac: r.net_frac.to_string(),
                cpu_frac: r.cpu_frac.to_string(),
                max_payment: r.max_payment.to_string(),
                queue_max: String::new(),
            },
            Operation::ExecuteQueue(q) => LogRow {
                line: self.line,
                datetime,
                function: OperationKind::ExecuteQueue.as_str().to_string(),
                payer: q.payer.to_string(),
                receiver: q.receiver.to_string(),
                queue_max: q.max.to_string(),
                ..LogRow::default()
            },
        }
    }
}

/// Maps display names used in logs to canonical accounts
#[derive(Debug, Clone, Default)]
pub struct AccountDirectory {
    aliases: BTreeMap<String, AccountName>,
}

impl AccountDirectory {
    pub fn new(aliases: BTreeMap<String, AccountName>) -> Self {
        Self { aliases }
    }

    pub fn insert(&mut self, display: impl Into<String>, account: AccountName) {
        self.aliases.insert(display.into(), account);
    }

    /// Alias table first, otherwise the name itself in canonical form
    pub fn resolve(&self, display: &str) -> Result<AccountName, ParseError> {
        match self.aliases.get(display.trim()) {
            Some(account) => Ok(account.clone()),
            None => display.parse(),
        }
    }
}

/// Streaming reader over a replay log; yields rows in file order
pub struct EventLog<R> {
    lines: Lines<R>,
    line: usize,
}

impl EventLog<BufReader<File>> {
    /// Open a log file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ParseError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ParseError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: BufRead> EventLog<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

impl<R: BufRead> Iterator for EventLog<R> {
    type Item = Result<LogRow, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => {
                    return Some(Err(ParseError::Io {
                        reason: e.to_string(),
                    }))
                }
            };
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            let row = LogRow::parse_line(self.line, &text);
            if self.line == 1 && row.datetime.eq_ignore_ascii_case(COLUMNS[0]) {
                continue;
            }
            return Some(Ok(row));
        }
    }
}

/// Write events as a replay log, header included
pub fn write_log<W: Write>(writer: &mut W, events: &[Event]) -> io::Result<()> {
    writeln!(writer, "{}", COLUMNS.join(","))?;
    for event in events {
        let row = event.to_log_row();
        writeln!(
            writer,
            "{},{},{},{},{},{},{},{},{}",
            row.datetime,
            row.function,
            row.payer,
            row.receiver,
            row.days,
            row.net_frac,
            row.cpu_frac,
            row.max_payment,
            row.queue_max
        )?;
    }
    writer.flush()
}
