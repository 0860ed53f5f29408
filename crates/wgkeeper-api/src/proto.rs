// ── RouterOS API sentence codec ──
//
// A word is a length-prefixed byte string; a sentence is a run of words
// terminated by a zero-length word. Requests carry a command path followed
// by `=key=value` attribute words and `?key=value` query words. Replies start
// with `!re`, `!done`, `!trap`, or `!fatal`.

use std::collections::HashMap;
use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Words longer than this are treated as a framing error.
const MAX_WORD_LEN: usize = 16 * 1024 * 1024;

/// Attribute names whose values must never reach logs.
const SENSITIVE_KEYS: &[&str] = &["password", "preshared-key", "private-key"];

// ── Length prefix ───────────────────────────────────────────────────

/// Append the variable-length prefix for a word of `len` bytes.
pub fn encode_length(len: usize, out: &mut Vec<u8>) -> Result<(), Error> {
    let len = u32::try_from(len)
        .map_err(|_| Error::Protocol(format!("word of {len} bytes is too long")))?;
    let bytes = len.to_be_bytes();
    match len {
        0..0x80 => out.push(bytes[3]),
        0x80..0x4000 => out.extend_from_slice(&(len | 0x8000).to_be_bytes()[2..]),
        0x4000..0x20_0000 => out.extend_from_slice(&(len | 0xC0_0000).to_be_bytes()[1..]),
        0x20_0000..0x1000_0000 => out.extend_from_slice(&(len | 0xE000_0000).to_be_bytes()),
        _ => {
            out.push(0xF0);
            out.extend_from_slice(&bytes);
        }
    }
    Ok(())
}

async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, Error> {
    let first = reader.read_u8().await?;
    let (mut value, extra) = match first {
        b if b & 0x80 == 0 => (u32::from(b), 0),
        b if b & 0xC0 == 0x80 => (u32::from(b & 0x3F), 1),
        b if b & 0xE0 == 0xC0 => (u32::from(b & 0x1F), 2),
        b if b & 0xF0 == 0xE0 => (u32::from(b & 0x0F), 3),
        0xF0 => (0, 4),
        b => return Err(Error::Protocol(format!("unexpected control byte {b:#04x}"))),
    };
    for _ in 0..extra {
        value = (value << 8) | u32::from(reader.read_u8().await?);
    }
    usize::try_from(value).map_err(|_| Error::Protocol("word length overflow".into()))
}

// ── Sentence I/O ────────────────────────────────────────────────────

/// Encode and write one sentence, terminated by an empty word.
pub async fn write_sentence<W, S>(writer: &mut W, words: &[S]) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    let mut buf = Vec::new();
    for word in words {
        let bytes = word.as_ref().as_bytes();
        encode_length(bytes.len(), &mut buf)?;
        buf.extend_from_slice(bytes);
    }
    buf.push(0);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one non-empty sentence.
pub async fn read_sentence<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<String>, Error> {
    loop {
        let mut words = Vec::new();
        loop {
            let len = read_length(reader).await?;
            if len == 0 {
                break;
            }
            if len > MAX_WORD_LEN {
                return Err(Error::Protocol(format!("word of {len} bytes exceeds limit")));
            }
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            words.push(String::from_utf8_lossy(&buf).into_owned());
        }
        if !words.is_empty() {
            return Ok(words);
        }
    }
}

// ── Command ─────────────────────────────────────────────────────────

/// A request sentence: command path plus ordered attribute and query words.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    path: String,
    attributes: Vec<(String, String)>,
    queries: Vec<(String, String)>,
}

impl Command {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            attributes: Vec::new(),
            queries: Vec::new(),
        }
    }

    /// Append an `=key=value` attribute word.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Append an attribute only when a value is present.
    pub fn attr_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.attr(key, v),
            None => self,
        }
    }

    /// Append a `?key=value` query word.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.queries.push((key.into(), value.into()));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Look up the value of an attribute word.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn queries(&self) -> &[(String, String)] {
        &self.queries
    }

    /// Flatten into wire words.
    pub fn words(&self) -> Vec<String> {
        let mut words = Vec::with_capacity(1 + self.attributes.len() + self.queries.len());
        words.push(self.path.clone());
        words.extend(self.attributes.iter().map(|(k, v)| format!("={k}={v}")));
        words.extend(self.queries.iter().map(|(k, v)| format!("?{k}={v}")));
        words
    }

    /// Parse a request sentence back into a command (used by device fakes).
    pub fn from_words(words: &[String]) -> Result<Self, Error> {
        let (path, rest) = words
            .split_first()
            .ok_or_else(|| Error::Protocol("empty request sentence".into()))?;
        let mut cmd = Self::new(path.clone());
        for word in rest {
            if let Some((k, v)) = split_attribute(word, '=') {
                cmd = cmd.attr(k, v);
            } else if let Some((k, v)) = split_attribute(word, '?') {
                cmd = cmd.query(k, v);
            }
        }
        Ok(cmd)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        for (k, v) in &self.attributes {
            if SENSITIVE_KEYS.contains(&k.as_str()) {
                write!(f, " ={k}=<redacted>")?;
            } else {
                write!(f, " ={k}={v}")?;
            }
        }
        for (k, v) in &self.queries {
            write!(f, " ?{k}={v}")?;
        }
        Ok(())
    }
}

fn split_attribute(word: &str, prefix: char) -> Option<(&str, &str)> {
    let body = word.strip_prefix(prefix)?;
    Some(body.split_once('=').unwrap_or((body, "")))
}

// ── Replies ─────────────────────────────────────────────────────────

/// One `!re` row (or the attributes of a `!done` / `!trap`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record(HashMap<String, String>);

impl Record {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// RouterOS booleans are spelled `true` / `false` (older firmware: `yes` / `no`).
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.parse().ok()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A decoded reply sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Re(Record),
    Done(Record),
    Trap(Record),
    Fatal(String),
}

impl Reply {
    pub fn parse(words: &[String]) -> Result<Self, Error> {
        let (kind, rest) = words
            .split_first()
            .ok_or_else(|| Error::Protocol("empty reply sentence".into()))?;
        if kind == "!fatal" {
            return Ok(Self::Fatal(rest.join(" ")));
        }
        let record: Record = rest
            .iter()
            .filter_map(|w| split_attribute(w, '='))
            .collect();
        match kind.as_str() {
            "!re" => Ok(Self::Re(record)),
            "!done" => Ok(Self::Done(record)),
            "!trap" => Ok(Self::Trap(record)),
            other => Err(Error::Protocol(format!("unexpected reply word '{other}'"))),
        }
    }

    /// Encode into wire words (used by device fakes).
    pub fn words(&self) -> Vec<String> {
        let (kind, record) = match self {
            Self::Re(r) => ("!re", r),
            Self::Done(r) => ("!done", r),
            Self::Trap(r) => ("!trap", r),
            Self::Fatal(msg) => return vec!["!fatal".into(), msg.clone()],
        };
        let mut words = vec![kind.to_string()];
        let mut attrs: Vec<_> = record.0.iter().collect();
        attrs.sort();
        words.extend(attrs.into_iter().map(|(k, v)| format!("={k}={v}")));
        words
    }
}
