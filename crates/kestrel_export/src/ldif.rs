//! LDIF serialization and parsing.
//!
//! The writer emits a `version: 1` header, one record per entry (dn line,
//! attribute lines, blank separator), base64-encodes values that LDIF
//! cannot carry verbatim, and folds long lines at a configurable column
//! with single-space continuations. The reader accepts the same dialect:
//! comments, folded lines, `::` base64 values.

use std::io::{self, BufRead, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use kestrel_common::dn::Dn;
use kestrel_common::entry::Entry;
use kestrel_common::error::ParseError;

/// Whether a value can appear verbatim after `attr: `.
/// Mirrors the LDIF SAFE-STRING rule: printable ASCII, no leading
/// space/colon/less-than, no trailing space.
fn is_safe_string(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    let bytes = value.as_bytes();
    if matches!(bytes[0], b' ' | b':' | b'<') {
        return false;
    }
    if bytes[bytes.len() - 1] == b' ' {
        return false;
    }
    bytes.iter().all(|&b| (0x20..=0x7e).contains(&b))
}

pub struct LdifWriter<W: Write> {
    out: W,
    /// Column at which lines are folded; 0 disables folding.
    wrap_column: usize,
    wrote_header: bool,
}

impl<W: Write> LdifWriter<W> {
    pub fn new(out: W, wrap_column: usize) -> Self {
        Self {
            out,
            wrap_column,
            wrote_header: false,
        }
    }

    pub fn write_entry(&mut self, entry: &Entry) -> io::Result<()> {
        if !self.wrote_header {
            self.out.write_all(b"version: 1\n")?;
            self.wrote_header = true;
        }
        self.write_line("dn", &entry.dn().to_string())?;
        for attr in entry.attributes() {
            if attr.values().is_empty() {
                // types-only projection: the bare attribute type.
                self.write_line(attr.name(), "")?;
            }
            for value in attr.values() {
                self.write_line(attr.name(), value)?;
            }
        }
        self.out.write_all(b"\n")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, name: &str, value: &str) -> io::Result<()> {
        let line = if is_safe_string(value) {
            if value.is_empty() {
                format!("{name}:")
            } else {
                format!("{name}: {value}")
            }
        } else {
            format!("{name}:: {}", BASE64.encode(value.as_bytes()))
        };
        self.write_folded(&line)
    }

    fn write_folded(&mut self, line: &str) -> io::Result<()> {
        if self.wrap_column == 0 || line.len() <= self.wrap_column {
            self.out.write_all(line.as_bytes())?;
            return self.out.write_all(b"\n");
        }
        let bytes = line.as_bytes();
        let mut written = 0;
        let mut width = self.wrap_column;
        while written < bytes.len() {
            let take = width.min(bytes.len() - written);
            if written > 0 {
                self.out.write_all(b" ")?;
            }
            self.out.write_all(&bytes[written..written + take])?;
            self.out.write_all(b"\n")?;
            written += take;
            // Continuation lines lose one column to the leading space.
            width = self.wrap_column.saturating_sub(1).max(1);
        }
        Ok(())
    }
}

/// Streaming LDIF reader producing entries in file order.
pub struct LdifReader<R: BufRead> {
    input: R,
    line_no: usize,
    /// One lookahead line (already unfolded consumption handles this).
    pending: Option<String>,
    done: bool,
}

impl<R: BufRead> LdifReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line_no: 0,
            pending: None,
            done: false,
        }
    }

    /// Read every remaining entry.
    pub fn read_all(mut self) -> Result<Vec<Entry>, ParseError> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next_entry()? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Next entry, or `None` at end of input.
    pub fn next_entry(&mut self) -> Result<Option<Entry>, ParseError> {
        let mut record: Vec<String> = Vec::new();
        loop {
            let Some(raw) = self.next_raw_line()? else {
                break;
            };
            if raw.is_empty() {
                if record.is_empty() {
                    continue; // leading blank lines
                }
                break;
            }
            if raw.starts_with('#') {
                continue;
            }
            if let Some(folded) = raw.strip_prefix(' ') {
                match record.last_mut() {
                    Some(last) => last.push_str(folded),
                    None => return Err(self.err("continuation line with nothing to continue")),
                }
                continue;
            }
            record.push(raw);
        }
        if record.is_empty() {
            return Ok(None);
        }
        self.build_entry(record).map(Some)
    }

    fn next_raw_line(&mut self) -> Result<Option<String>, ParseError> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }
        if self.done {
            return Ok(None);
        }
        let mut buf = String::new();
        let read = self
            .input
            .read_line(&mut buf)
            .map_err(|e| self.err(&format!("read failed: {e}")))?;
        if read == 0 {
            self.done = true;
            return Ok(None);
        }
        self.line_no += 1;
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn build_entry(&self, record: Vec<String>) -> Result<Entry, ParseError> {
        let mut lines = record.into_iter();
        let dn_line = lines.next().expect("record is non-empty");

        // The version header may precede the first record.
        let dn_line = if dn_line.starts_with("version:") {
            lines
                .next()
                .ok_or_else(|| self.err("version header without a record"))?
        } else {
            dn_line
        };

        let (name, value) = self.split_line(&dn_line)?;
        if !name.eq_ignore_ascii_case("dn") {
            return Err(self.err("record does not start with a dn line"));
        }
        let dn = Dn::parse(&value)?;
        let mut entry = Entry::new(dn);

        for line in lines {
            let (name, value) = self.split_line(&line)?;
            if name.eq_ignore_ascii_case("dn") {
                return Err(self.err("unexpected dn line inside a record"));
            }
            entry.add_value(&name, value);
        }
        Ok(entry)
    }

    /// Split `attr: value` / `attr:: base64` / bare `attr:`.
    fn split_line(&self, line: &str) -> Result<(String, String), ParseError> {
        let colon = line
            .find(':')
            .ok_or_else(|| self.err("line is missing ':'"))?;
        let name = line[..colon].trim().to_string();
        if name.is_empty() {
            return Err(self.err("line has an empty attribute name"));
        }
        let rest = &line[colon + 1..];
        if let Some(b64) = rest.strip_prefix(':') {
            let decoded = BASE64
                .decode(b64.trim())
                .map_err(|e| self.err(&format!("invalid base64 value: {e}")))?;
            let text = String::from_utf8(decoded)
                .map_err(|_| self.err("base64 value is not valid UTF-8"))?;
            Ok((name, text))
        } else {
            Ok((name, rest.strip_prefix(' ').unwrap_or(rest).to_string()))
        }
    }

    fn err(&self, reason: &str) -> ParseError {
        ParseError::MalformedLdif {
            line: self.line_no,
            reason: reason.to_string(),
        }
    }
}
