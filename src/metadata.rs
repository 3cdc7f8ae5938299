//! Metadata record log
//!
//! Every session writes exactly one append-only log of [`FileRecord`]s,
//! `retrace-data/metadata.<session>.log`, in walk order. The log of the
//! current session describes the mirror; older logs describe what the tree
//! looked like when each earlier session finalized.
//!
//! ## Record format
//!
//! One record per line, fields separated by tabs:
//!
//! ```text
//! <quoted index>\t<type tag>\t<key>=<value>\t<key>=<value>...
//! ```
//!
//! - The quoted index is `.` for the root and the `/`-joined quoted
//!   components otherwise.
//! - Quoting escapes `\` as `\\`, newline as `\n` and tab as `\t`. Every other
//!   byte, including non-UTF-8 bytes, is written as is. Quoting is a
//!   bijection, and an unknown escape is a parse error.
//! - Unknown keys are ignored on read.
//!
//! ## Durability
//!
//! [`MetadataWriter::append`] flushes every record to the OS before it
//! returns; [`MetadataWriter::checkpoint`] and [`MetadataWriter::finish`]
//! fsync. A trailing line without its newline (a record cut short by a crash)
//! is reported as corrupt, never returned as a record.
//!
//! ## Example
//!
//! ```rust,no_run
//! use retrace::metadata::{records_of, MetadataWriter};
//! use retrace::record::{FileAttrs, FileRecord, Index};
//!
//! # fn main() -> retrace::Result<()> {
//! let mut writer = MetadataWriter::create("metadata.log".as_ref(), true)?;
//! writer.append(&FileRecord::missing(Index::from_components(["gone"])))?;
//! writer.finish()?;
//!
//! for record in records_of("metadata.log".as_ref())? {
//!     println!("{}", record?.index);
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, RetraceError};
use crate::record::{DeviceKind, FileAttrs, FileRecord, Index, Owner};
use crate::types::SessionId;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOG_PREFIX: &str = "metadata.";
const LOG_SUFFIX: &str = ".log";

/// File name of the metadata log for `session`
pub fn log_file_name(session: &SessionId) -> String {
    format!("{}{}{}", LOG_PREFIX, session.quoted(), LOG_SUFFIX)
}

/// Session id encoded in a metadata log file name, if it is one
pub fn parse_log_name(name: &str) -> Option<SessionId> {
    name.strip_prefix(LOG_PREFIX)
        .and_then(|rest| rest.strip_suffix(LOG_SUFFIX))
        .and_then(|quoted| SessionId::parse(quoted).ok())
}

/// Escape `\`, newline and tab
pub fn quote(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    for &byte in raw {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\t' => out.extend_from_slice(b"\\t"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`quote`]
pub fn unquote(quoted: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(quoted.len());
    let mut bytes = quoted.iter();
    while let Some(&byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(other) => return Err(format!("unknown escape \\{}", *other as char)),
            None => return Err("dangling escape at end of field".to_string()),
        }
    }
    Ok(out)
}

fn quote_index(index: &Index) -> Vec<u8> {
    if index.is_root() {
        return b".".to_vec();
    }
    let mut out = Vec::new();
    for (i, component) in index.components().iter().enumerate() {
        if i > 0 {
            out.push(b'/');
        }
        out.extend_from_slice(&quote(component));
    }
    out
}

fn unquote_index(field: &[u8]) -> std::result::Result<Index, String> {
    if field == b"." {
        return Ok(Index::root());
    }
    let components = field
        .split(|&b| b == b'/')
        .map(|c| {
            if c.is_empty() {
                Err("empty path component".to_string())
            } else {
                unquote(c)
            }
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Index::from_components(components))
}

fn push_field(line: &mut Vec<u8>, key: &str, value: &[u8]) {
    line.push(b'\t');
    line.extend_from_slice(key.as_bytes());
    line.push(b'=');
    line.extend_from_slice(value);
}

fn push_owner(line: &mut Vec<u8>, owner: &Owner) {
    push_field(line, "uid", owner.uid.to_string().as_bytes());
    push_field(line, "gid", owner.gid.to_string().as_bytes());
}

/// Serialize one record as a log line (without the trailing newline)
pub fn encode_record(record: &FileRecord) -> Vec<u8> {
    let mut line = quote_index(&record.index);
    line.push(b'\t');
    line.extend_from_slice(record.file_type().tag().as_bytes());

    match &record.attrs {
        FileAttrs::Regular {
            size,
            mtime,
            perms,
            owner,
            xattrs,
            fingerprint,
        } => {
            push_field(&mut line, "size", size.to_string().as_bytes());
            push_field(&mut line, "mtime", mtime.to_string().as_bytes());
            push_field(&mut line, "perms", format!("{:o}", perms).as_bytes());
            push_owner(&mut line, owner);
            if let Some(xattrs) = xattrs {
                push_field(&mut line, "xattrs", hex::encode(xattrs).as_bytes());
            }
            if let Some(hash) = fingerprint {
                push_field(&mut line, "sha256", hash.as_bytes());
            }
        }
        FileAttrs::Directory {
            mtime,
            perms,
            owner,
            xattrs,
        } => {
            push_field(&mut line, "mtime", mtime.to_string().as_bytes());
            push_field(&mut line, "perms", format!("{:o}", perms).as_bytes());
            push_owner(&mut line, owner);
            if let Some(xattrs) = xattrs {
                push_field(&mut line, "xattrs", hex::encode(xattrs).as_bytes());
            }
        }
        FileAttrs::Symlink { target, owner } => {
            push_field(&mut line, "target", &quote(target));
            push_owner(&mut line, owner);
        }
        FileAttrs::Fifo { perms, owner } | FileAttrs::Socket { perms, owner } => {
            push_field(&mut line, "perms", format!("{:o}", perms).as_bytes());
            push_owner(&mut line, owner);
        }
        FileAttrs::Device {
            kind,
            major,
            minor,
            perms,
            owner,
        } => {
            let kind = match kind {
                DeviceKind::Char => b"c",
                DeviceKind::Block => b"b",
            };
            push_field(&mut line, "kind", kind);
            push_field(&mut line, "major", major.to_string().as_bytes());
            push_field(&mut line, "minor", minor.to_string().as_bytes());
            push_field(&mut line, "perms", format!("{:o}", perms).as_bytes());
            push_owner(&mut line, owner);
        }
        FileAttrs::Missing => {}
    }
    line
}

/// Key/value fields of one line
struct Fields<'a> {
    map: BTreeMap<&'a [u8], &'a [u8]>,
    line: usize,
}

impl<'a> Fields<'a> {
    fn raw(&self, key: &str) -> Result<&'a [u8]> {
        self.map
            .get(key.as_bytes())
            .copied()
            .ok_or_else(|| RetraceError::corrupt(self.line, format!("missing field {}", key)))
    }

    fn text(&self, key: &str) -> Result<&'a str> {
        std::str::from_utf8(self.raw(key)?)
            .map_err(|_| RetraceError::corrupt(self.line, format!("field {} is not text", key)))
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        self.text(key)?
            .parse()
            .map_err(|_| RetraceError::corrupt(self.line, format!("field {} is not a number", key)))
    }

    fn perms(&self) -> Result<u32> {
        u32::from_str_radix(self.text("perms")?, 8)
            .map_err(|_| RetraceError::corrupt(self.line, "perms is not octal"))
    }

    fn owner(&self) -> Result<Owner> {
        Ok(Owner {
            uid: self.number("uid")?,
            gid: self.number("gid")?,
        })
    }

    fn xattrs(&self) -> Result<Option<Vec<u8>>> {
        match self.map.get(b"xattrs".as_slice()) {
            None => Ok(None),
            Some(value) => hex::decode(value)
                .map(Some)
                .map_err(|_| RetraceError::corrupt(self.line, "xattrs is not hex")),
        }
    }
}

/// Parse one log line (without its newline); `line_no` is used in errors
pub fn decode_record(line: &[u8], line_no: usize) -> Result<FileRecord> {
    let mut parts = line.split(|&b| b == b'\t');
    let index_field = parts
        .next()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| RetraceError::corrupt(line_no, "empty line"))?;
    let index = unquote_index(index_field).map_err(|reason| RetraceError::corrupt(line_no, reason))?;
    let tag = parts
        .next()
        .ok_or_else(|| RetraceError::corrupt(line_no, "missing type tag"))?;

    let mut map = BTreeMap::new();
    for part in parts {
        let split = part
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| RetraceError::corrupt(line_no, "field without '='"))?;
        map.insert(&part[..split], &part[split + 1..]);
    }
    let fields = Fields { map, line: line_no };

    let attrs = match tag {
        b"reg" => FileAttrs::Regular {
            size: fields.number("size")?,
            mtime: fields.number("mtime")?,
            perms: fields.perms()?,
            owner: fields.owner()?,
            xattrs: fields.xattrs()?,
            fingerprint: match fields.map.get(b"sha256".as_slice()) {
                Some(_) => Some(fields.text("sha256")?.to_string()),
                None => None,
            },
        },
        b"dir" => FileAttrs::Directory {
            mtime: fields.number("mtime")?,
            perms: fields.perms()?,
            owner: fields.owner()?,
            xattrs: fields.xattrs()?,
        },
        b"sym" => FileAttrs::Symlink {
            target: unquote(fields.raw("target")?)
                .map_err(|reason| RetraceError::corrupt(line_no, reason))?,
            owner: fields.owner()?,
        },
        b"fifo" => FileAttrs::Fifo {
            perms: fields.perms()?,
            owner: fields.owner()?,
        },
        b"sock" => FileAttrs::Socket {
            perms: fields.perms()?,
            owner: fields.owner()?,
        },
        b"dev" => FileAttrs::Device {
            kind: match fields.raw("kind")? {
                b"c" => DeviceKind::Char,
                b"b" => DeviceKind::Block,
                _ => return Err(RetraceError::corrupt(line_no, "unknown device kind")),
            },
            major: fields.number("major")?,
            minor: fields.number("minor")?,
            perms: fields.perms()?,
            owner: fields.owner()?,
        },
        b"missing" => FileAttrs::Missing,
        other => {
            return Err(RetraceError::corrupt(
                line_no,
                format!("unknown type tag {}", String::from_utf8_lossy(other)),
            ))
        }
    };
    Ok(FileRecord::new(index, attrs))
}

/// Append-only writer for one session's log
#[derive(Debug)]
pub struct MetadataWriter {
    path: PathBuf,
    file: BufWriter<File>,
    records: usize,
    fsync: bool,
}

impl MetadataWriter {
    /// Create (or truncate) the log at `path`
    pub fn create(path: &Path, fsync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| RetraceError::durability(format!("cannot create {:?}: {}", path, e)))?;
        debug!("Opened metadata log {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            file: BufWriter::new(file),
            records: 0,
            fsync,
        })
    }

    /// Append one record and flush it to the OS
    ///
    /// # Errors
    ///
    /// - [`RetraceError::Durability`] if the record cannot be written
    pub fn append(&mut self, record: &FileRecord) -> Result<()> {
        let mut line = encode_record(record);
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .map_err(|e| RetraceError::durability(format!("metadata append failed: {}", e)))?;
        self.records += 1;
        Ok(())
    }

    /// Make everything appended so far durable
    pub fn checkpoint(&mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| RetraceError::durability(format!("metadata flush failed: {}", e)))?;
        if self.fsync {
            self.file
                .get_ref()
                .sync_all()
                .map_err(|e| RetraceError::durability(format!("metadata fsync failed: {}", e)))?;
        }
        Ok(())
    }

    /// Checkpoint and close; returns the number of records written
    pub fn finish(mut self) -> Result<usize> {
        self.checkpoint()?;
        debug!("Closed metadata log {:?} ({} records)", self.path, self.records);
        Ok(self.records)
    }

    /// Records appended so far
    pub fn len(&self) -> usize {
        self.records
    }

    /// Whether nothing has been appended yet
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Location of the log
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Lazy reader over a log, one `Result` per line
///
/// A line that fails to parse yields [`RetraceError::CorruptMetadata`] and
/// iteration continues with the next line.
#[derive(Debug)]
pub struct MetadataReader {
    reader: BufReader<File>,
    line: usize,
    done: bool,
}

/// Open a log for reading, in append order
///
/// Call again to restart from the beginning.
pub fn records_of(path: &Path) -> Result<MetadataReader> {
    let file = File::open(path)?;
    Ok(MetadataReader {
        reader: BufReader::new(file),
        line: 0,
        done: false,
    })
}

impl Iterator for MetadataReader {
    type Item = Result<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = Vec::new();
        match self.reader.read_until(b'\n', &mut buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                self.line += 1;
                if buf.last() != Some(&b'\n') {
                    self.done = true;
                    return Some(Err(RetraceError::corrupt(self.line, "truncated record")));
                }
                buf.pop();
                Some(decode_record(&buf, self.line))
            }
            Err(e) => {
                self.done = true;
                Some(Err(RetraceError::Io(e)))
            }
        }
    }
}

/// Forward-only lookup into the previous session's log
///
/// Lookups must be made in increasing index order, which is the order the
/// walker yields entries and the order the log was written in.
#[derive(Debug, Default)]
pub struct PriorRecords {
    records: Option<Peekable<MetadataReader>>,
    corrupt: usize,
}

impl PriorRecords {
    /// No previous session
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read the log at `path`
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            records: Some(records_of(path)?.peekable()),
            corrupt: 0,
        })
    }

    /// Record logged for `index`, if any
    pub fn lookup(&mut self, index: &Index) -> Option<FileRecord> {
        let records = self.records.as_mut()?;
        loop {
            match records.peek() {
                None => return None,
                Some(Err(_)) => {
                    if let Some(Err(e)) = records.next() {
                        warn!("Skipping unreadable metadata record: {}", e);
                    }
                    self.corrupt += 1;
                }
                Some(Ok(record)) if record.index < *index => {
                    records.next();
                }
                Some(Ok(record)) if record.index == *index => {
                    return records.next().and_then(|r| r.ok());
                }
                Some(Ok(_)) => return None,
            }
        }
    }

    /// Records logged for `index` and everything below it
    ///
    /// Carries a part of the tree forward unchanged when it could not be
    /// walked. The same ordering rule as [`PriorRecords::lookup`] applies.
    pub fn take_subtree(&mut self, index: &Index) -> Vec<FileRecord> {
        let mut taken = Vec::new();
        let Some(records) = self.records.as_mut() else {
            return taken;
        };
        loop {
            match records.peek() {
                None => break,
                Some(Err(_)) => {
                    if let Some(Err(e)) = records.next() {
                        warn!("Skipping unreadable metadata record: {}", e);
                    }
                    self.corrupt += 1;
                }
                Some(Ok(record)) if record.index < *index => {
                    records.next();
                }
                Some(Ok(record)) if record.index == *index || index.is_ancestor_of(&record.index) => {
                    if let Some(Ok(record)) = records.next() {
                        taken.push(record);
                    }
                }
                Some(Ok(_)) => break,
            }
        }
        taken
    }

    /// Corrupt records skipped so far
    pub fn corrupt_count(&self) -> usize {
        self.corrupt
    }
}

/// Find the record for `index` in a log by scanning it
pub fn find_record(path: &Path, index: &Index) -> Result<Option<FileRecord>> {
    let mut prior = PriorRecords::open(path)?;
    Ok(prior.lookup(index))
}
