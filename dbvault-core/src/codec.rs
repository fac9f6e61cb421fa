/*!
Dump codec.

Encodes table structure and row data into a textual, replayable SQL statement
stream, and parses such a stream back into discrete statements.

Layout of a dump:

```text
-- DBVAULT DUMP v1 | tables=1 structure=true data=true compress=true | created=... | nightly
SET FOREIGN_KEY_CHECKS=0;

-- Structure for table `products`
DROP TABLE IF EXISTS `products`;
CREATE TABLE products (id INTEGER PRIMARY KEY, name TEXT);

-- Data for table `products`
INSERT INTO `products` (`id`,`name`) VALUES ('1','widget'),
('2',NULL);

-- DBVAULT DUMP COMPLETE
SET FOREIGN_KEY_CHECKS=1;
```

Parsing is done by [`StatementReader`], a byte-level state machine that
reassembles `;`-terminated statements across lines and buffer boundaries while
honouring quoted strings, quoted identifiers and comments.
*/

use crate::storage::{Row, SqlValue};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use std::io::{self, BufRead, Write};

/// First bytes of every dump
pub const HEADER_MARKER: &str = "-- DBVAULT DUMP v1";

/// Line written after the last table block
pub const COMPLETION_MARKER: &str = "-- DBVAULT DUMP COMPLETE";

/// Quote an identifier with backticks, doubling embedded backticks
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Append the SQL literal for `value` to `out`
///
/// `NULL` stays distinct from every string; other scalars become escaped
/// text literals and binary values become hex literals.
pub fn encode_value(value: &SqlValue, out: &mut String) {
    match value {
        SqlValue::Null => out.push_str("NULL"),
        SqlValue::Integer(i) => push_text_literal(&i.to_string(), out),
        SqlValue::Real(f) => push_text_literal(&f.to_string(), out),
        SqlValue::Text(s) => push_text_literal(s, out),
        SqlValue::Blob(bytes) => {
            out.push_str("X'");
            for byte in bytes {
                out.push_str(&format!("{byte:02X}"));
            }
            out.push('\'');
        }
    }
}

fn push_text_literal(text: &str, out: &mut String) {
    out.push('\'');
    for ch in text.chars() {
        if ch == '\'' {
            out.push_str("''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
}

/// Encode one row as a parenthesised value tuple
pub fn encode_row(row: &Row) -> String {
    let mut out = String::with_capacity(row.len() * 8 + 2);
    out.push('(');
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        encode_value(value, &mut out);
    }
    out.push(')');
    out
}

/// Options and provenance recorded on the first line of a dump
#[derive(Debug, Clone, PartialEq)]
pub struct DumpHeader {
    pub table_count: usize,
    pub include_structure: bool,
    pub include_data: bool,
    pub compress: bool,
    pub created_at: DateTime<Utc>,
    pub description: String,
}

impl DumpHeader {
    /// Render the header line (without trailing newline)
    pub fn to_line(&self) -> String {
        let description: String = self
            .description
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        format!(
            "{HEADER_MARKER} | tables={} structure={} data={} compress={} | created={} | {}",
            self.table_count,
            self.include_structure,
            self.include_data,
            self.compress,
            self.created_at.to_rfc3339(),
            description.trim()
        )
    }

    /// Parse a header line; `None` when the marker or a field is missing
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line
            .trim_end_matches(['\r', '\n'])
            .strip_prefix(HEADER_MARKER)?;
        let mut parts = rest.splitn(4, " | ");
        if !parts.next()?.is_empty() {
            return None;
        }

        let mut header = DumpHeader {
            table_count: 0,
            include_structure: false,
            include_data: false,
            compress: false,
            created_at: Utc::now(),
            description: String::new(),
        };
        for field in parts.next()?.split_whitespace() {
            let (key, value) = field.split_once('=')?;
            match key {
                "tables" => header.table_count = value.parse().ok()?,
                "structure" => header.include_structure = value.parse().ok()?,
                "data" => header.include_data = value.parse().ok()?,
                "compress" => header.compress = value.parse().ok()?,
                _ => {}
            }
        }
        let created = parts.next()?.strip_prefix("created=")?;
        header.created_at = DateTime::parse_from_rfc3339(created)
            .ok()?
            .with_timezone(&Utc);
        header.description = parts.next().unwrap_or_default().to_string();
        Some(header)
    }
}

/// Counters accumulated while writing a dump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpStats {
    pub structures: usize,
    pub rows: u64,
    pub chunks: u64,
}

/// Streaming writer for the dump format
pub struct DumpWriter<W: Write> {
    out: W,
    stats: DumpStats,
    /// Rendered ` (`a`,`b`)` list for the current data section
    column_list: String,
}

impl<W: Write> DumpWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            stats: DumpStats::default(),
            column_list: String::new(),
        }
    }

    /// Header line followed by the directive disabling referential checks
    pub fn write_header(&mut self, header: &DumpHeader) -> Result<()> {
        writeln!(self.out, "{}", header.to_line())?;
        writeln!(self.out, "SET FOREIGN_KEY_CHECKS=0;")?;
        writeln!(self.out)?;
        Ok(())
    }

    /// Drop + create pair for one table
    pub fn write_structure(&mut self, table: &str, definition: &str) -> Result<()> {
        let definition = definition.trim().trim_end_matches(';').trim_end();
        if definition.is_empty() {
            return Err(VaultError::codec(
                self.stats.structures + 1,
                format!("empty create definition for table {table}"),
            ));
        }

        let quoted = quote_identifier(table);
        writeln!(self.out, "-- Structure for table {quoted}")?;
        writeln!(self.out, "DROP TABLE IF EXISTS {quoted};")?;
        writeln!(self.out, "{definition};")?;
        writeln!(self.out)?;
        self.stats.structures += 1;
        Ok(())
    }

    /// Comment introducing a table's data section
    ///
    /// Following inserts name `columns` explicitly; an empty list emits
    /// positional inserts.
    pub fn begin_data(&mut self, table: &str, columns: &[String]) -> Result<()> {
        self.column_list = if columns.is_empty() {
            String::new()
        } else {
            let quoted: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
            format!(" ({})", quoted.join(","))
        };
        writeln!(self.out, "-- Data for table {}", quote_identifier(table))?;
        Ok(())
    }

    /// One multi-row insert for a page of rows; empty pages write nothing
    pub fn write_rows(&mut self, table: &str, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        write!(
            self.out,
            "INSERT INTO {}{} VALUES ",
            quote_identifier(table),
            self.column_list
        )?;
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                self.out.write_all(b",\n")?;
            }
            self.out.write_all(encode_row(row).as_bytes())?;
        }
        self.out.write_all(b";\n")?;

        self.stats.rows += rows.len() as u64;
        self.stats.chunks += 1;
        Ok(())
    }

    /// Completion marker followed by the directive re-enabling checks
    pub fn write_footer(&mut self) -> Result<()> {
        writeln!(self.out)?;
        writeln!(self.out, "{COMPLETION_MARKER}")?;
        writeln!(self.out, "SET FOREIGN_KEY_CHECKS=1;")?;
        Ok(())
    }

    pub fn stats(&self) -> DumpStats {
        self.stats
    }

    /// Flush and return the underlying writer
    pub fn into_inner(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// What a parsed statement does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    DropTable,
    CreateTable,
    CreateIndex,
    Insert,
    /// `SET`, `LOCK`, `BEGIN` and friends; never yielded by the reader
    SessionControl,
    Other,
}

/// One executable statement reassembled from a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based ordinal among the statements yielded
    pub position: usize,
    /// Statement text without the terminator; truncated in capture mode
    pub text: String,
    pub kind: StatementKind,
    /// Table the statement targets, as written in the dump
    pub table: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexState {
    Normal,
    Dash,
    Slash,
    LineComment,
    BlockComment,
    BlockStar,
    Quoted(u8),
}

/// Longest comment text kept for marker detection
const COMMENT_CAPTURE: usize = 64;

/// Streaming statement parser over a dump
///
/// Yields statements in artifact order. Comment lines and session-control
/// statements are skipped. A stream that ends inside a quoted string, a block
/// comment or an unterminated statement yields a codec error.
pub struct StatementReader<R: BufRead> {
    reader: R,
    state: LexState,
    current: Vec<u8>,
    captured: usize,
    comment: Vec<u8>,
    capture_limit: Option<usize>,
    position: usize,
    saw_completion: bool,
    finished: bool,
}

impl<R: BufRead> StatementReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: LexState::Normal,
            current: Vec::new(),
            captured: 0,
            comment: Vec::new(),
            capture_limit: None,
            position: 0,
            saw_completion: false,
            finished: false,
        }
    }

    /// Keep only the first `limit` bytes of each statement
    ///
    /// Enough to classify statements and find target tables while keeping
    /// memory bounded when only the shape of a dump is needed.
    pub fn with_capture_limit(reader: R, limit: usize) -> Self {
        let mut parser = Self::new(reader);
        parser.capture_limit = Some(limit.max(64));
        parser
    }

    /// True once the completion marker comment has been read
    pub fn saw_completion_marker(&self) -> bool {
        self.saw_completion
    }

    /// Number of statements yielded so far
    pub fn position(&self) -> usize {
        self.position
    }

    fn push(&mut self, byte: u8) {
        self.captured += 1;
        match self.capture_limit {
            Some(limit) if self.current.len() >= limit => {}
            _ => self.current.push(byte),
        }
    }

    fn end_comment(&mut self) {
        let marker = &COMPLETION_MARKER.as_bytes()[2..];
        let end = self
            .comment
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        if &self.comment[..end] == marker {
            self.saw_completion = true;
        }
        self.comment.clear();
    }

    /// Feed one byte; returns true when a statement terminator was consumed
    fn lex(&mut self, byte: u8) -> bool {
        match self.state {
            LexState::Normal => match byte {
                b';' => return true,
                b'-' => self.state = LexState::Dash,
                b'/' => self.state = LexState::Slash,
                b'\'' | b'"' | b'`' => {
                    self.push(byte);
                    self.state = LexState::Quoted(byte);
                }
                b'[' => {
                    self.push(byte);
                    self.state = LexState::Quoted(b']');
                }
                _ => self.push(byte),
            },
            LexState::Dash => {
                if byte == b'-' {
                    self.state = LexState::LineComment;
                } else {
                    self.state = LexState::Normal;
                    self.push(b'-');
                    return self.lex(byte);
                }
            }
            LexState::Slash => {
                if byte == b'*' {
                    self.state = LexState::BlockComment;
                } else {
                    self.state = LexState::Normal;
                    self.push(b'/');
                    return self.lex(byte);
                }
            }
            LexState::LineComment => {
                if byte == b'\n' {
                    self.end_comment();
                    self.state = LexState::Normal;
                    self.push(b'\n');
                } else if self.comment.len() < COMMENT_CAPTURE {
                    self.comment.push(byte);
                }
            }
            LexState::BlockComment => {
                if byte == b'*' {
                    self.state = LexState::BlockStar;
                }
            }
            LexState::BlockStar => match byte {
                b'/' => {
                    self.state = LexState::Normal;
                    self.push(b' ');
                }
                b'*' => {}
                _ => self.state = LexState::BlockComment,
            },
            LexState::Quoted(close) => {
                self.push(byte);
                if byte == close {
                    self.state = LexState::Normal;
                }
            }
        }
        false
    }

    /// Turn the buffered bytes into a statement; `None` when there is nothing to yield
    fn take_statement(&mut self) -> Option<Result<Statement>> {
        let truncated = self.captured > self.current.len();
        let bytes = std::mem::take(&mut self.current);
        self.captured = 0;

        let text = if truncated {
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => {
                    return Some(Err(VaultError::codec(
                        self.position + 1,
                        format!("statement is not valid UTF-8: {e}"),
                    )))
                }
            }
        };

        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let (kind, table) = classify(text);
        if kind == StatementKind::SessionControl {
            return None;
        }

        self.position += 1;
        let needs_table = matches!(
            kind,
            StatementKind::DropTable
                | StatementKind::CreateTable
                | StatementKind::CreateIndex
                | StatementKind::Insert
        );
        if needs_table && table.is_none() {
            return Some(Err(VaultError::codec(
                self.position,
                "cannot determine the target table",
            )));
        }

        Some(Ok(Statement {
            position: self.position,
            text: text.to_string(),
            kind,
            table,
        }))
    }

    fn finish(&mut self) -> Option<Result<Statement>> {
        self.finished = true;
        match self.state {
            LexState::Dash => self.push(b'-'),
            LexState::Slash => self.push(b'/'),
            LexState::LineComment => self.end_comment(),
            LexState::Quoted(_) => {
                return Some(Err(VaultError::codec(
                    self.position + 1,
                    "stream ended inside a quoted string or identifier",
                )))
            }
            LexState::BlockComment | LexState::BlockStar => {
                return Some(Err(VaultError::codec(
                    self.position + 1,
                    "stream ended inside a block comment",
                )))
            }
            LexState::Normal => {}
        }

        if self.current.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(Err(VaultError::codec(
            self.position + 1,
            "stream ended before the statement terminator",
        )))
    }
}

impl<R: BufRead> Iterator for StatementReader<R> {
    type Item = Result<Statement>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let chunk = match self.reader.fill_buf() {
                Ok(buf) if buf.is_empty() => return self.finish(),
                Ok(buf) => buf.to_vec(),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            };

            let mut consumed = 0;
            let mut terminated = false;
            for &byte in &chunk {
                consumed += 1;
                if self.lex(byte) {
                    terminated = true;
                    break;
                }
            }
            self.reader.consume(consumed);

            if terminated {
                if let Some(item) = self.take_statement() {
                    return Some(item);
                }
            }
        }
        None
    }
}

/// Classify a statement and extract its target table
pub fn classify(text: &str) -> (StatementKind, Option<String>) {
    if let Some(rest) = keyword(text, "DROP") {
        return match keyword(rest, "TABLE") {
            Some(rest) => {
                let rest = keywords(rest, &["IF", "EXISTS"]).unwrap_or(rest);
                (StatementKind::DropTable, identifier(rest).map(|(name, _)| name))
            }
            None => (StatementKind::Other, None),
        };
    }

    if let Some(rest) = keyword(text, "CREATE") {
        let rest = keyword(rest, "TEMPORARY")
            .or_else(|| keyword(rest, "TEMP"))
            .unwrap_or(rest);
        if let Some(rest) = keyword(rest, "TABLE") {
            let rest = keywords(rest, &["IF", "NOT", "EXISTS"]).unwrap_or(rest);
            return (StatementKind::CreateTable, identifier(rest).map(|(name, _)| name));
        }

        let rest = keyword(rest, "UNIQUE").unwrap_or(rest);
        if let Some(rest) = keyword(rest, "INDEX") {
            let rest = keywords(rest, &["IF", "NOT", "EXISTS"]).unwrap_or(rest);
            let table = identifier(rest)
                .and_then(|(_, rest)| keyword(rest, "ON"))
                .and_then(identifier)
                .map(|(name, _)| name);
            return (StatementKind::CreateIndex, table);
        }
        return (StatementKind::Other, None);
    }

    if let Some(mut rest) = keyword(text, "INSERT").or_else(|| keyword(text, "REPLACE")) {
        // INSERT OR REPLACE INTO, INSERT IGNORE INTO, ...
        for _ in 0..3 {
            if let Some(after_into) = keyword(rest, "INTO") {
                return (StatementKind::Insert, identifier(after_into).map(|(name, _)| name));
            }
            match bare_word(rest) {
                Some((_, after)) => rest = after,
                None => break,
            }
        }
        return (StatementKind::Insert, None);
    }

    const SESSION: [&str; 8] = [
        "SET", "LOCK", "UNLOCK", "START", "BEGIN", "COMMIT", "PRAGMA", "USE",
    ];
    if SESSION.iter().any(|kw| keyword(text, kw).is_some()) {
        return (StatementKind::SessionControl, None);
    }

    (StatementKind::Other, None)
}

fn is_word_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'$' || byte >= 0x80
}

/// Case-insensitive keyword match at the start of `text`
fn keyword<'a>(text: &'a str, kw: &str) -> Option<&'a str> {
    let text = text.trim_start();
    let head = text.get(..kw.len())?;
    if !head.eq_ignore_ascii_case(kw) {
        return None;
    }
    let rest = &text[kw.len()..];
    match rest.as_bytes().first() {
        Some(&b) if is_word_byte(b) => None,
        _ => Some(rest),
    }
}

fn keywords<'a>(text: &'a str, kws: &[&str]) -> Option<&'a str> {
    kws.iter().try_fold(text, |rest, kw| keyword(rest, kw))
}

fn bare_word(text: &str) -> Option<(&str, &str)> {
    let text = text.trim_start();
    let end = text
        .as_bytes()
        .iter()
        .position(|&b| !is_word_byte(b))
        .unwrap_or(text.len());
    if end == 0 {
        None
    } else {
        Some((&text[..end], &text[end..]))
    }
}

/// Read a possibly quoted, possibly schema-qualified identifier
///
/// Returns the last name component and the remaining text.
fn identifier(text: &str) -> Option<(String, &str)> {
    let text = text.trim_start();
    let (name, rest) = match *text.as_bytes().first()? {
        open @ (b'`' | b'"' | b'[') => {
            let close = if open == b'[' { ']' } else { open as char };
            let mut name = String::new();
            let mut chars = text[1..].char_indices().peekable();
            let mut end = None;
            while let Some((i, ch)) = chars.next() {
                if ch == close {
                    if close != ']' && chars.peek().map(|&(_, next)| next) == Some(close) {
                        name.push(ch);
                        chars.next();
                        continue;
                    }
                    end = Some(1 + i + ch.len_utf8());
                    break;
                }
                name.push(ch);
            }
            (name, &text[end?..])
        }
        _ => {
            let (word, rest) = bare_word(text)?;
            (word.to_string(), rest)
        }
    };

    match rest.strip_prefix('.') {
        Some(qualified) => identifier(qualified),
        None if name.is_empty() => None,
        None => Some((name, rest)),
    }
}
