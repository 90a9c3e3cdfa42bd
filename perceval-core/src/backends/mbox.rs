//! # MBox connector
//!
//! Reads the messages stored in a directory of mbox files (or in a single
//! mbox file). Each mbox file is one raw page; gzip and bzip2 compressed
//! files are decompressed before they become pages.
//!
//! Every message becomes a JSON object holding its headers, the envelope
//! line as `unixfrom`, and the body under `body.plain` (or `body.html` for
//! `text/html` messages). Messages that are not valid UTF-8 are decoded with
//! the charset they declare, or as Windows-1252 when they declare none.
//! The `Message-ID` and `Date` headers are stored under
//! those exact names whatever their case in the source. Messages without a
//! usable `Message-ID` or `Date` are still parsed; they fail metadata
//! extraction and the session counts them as ignored.
//!
//! An mbox file that cannot be read is skipped with a warning; a missing path
//! ends the session.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use bzip2::read::BzDecoder;
use chrono::{DateTime, Utc};
use encoding_rs::{Encoding, WINDOWS_1252};
use flate2::read::GzDecoder;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use serde_json::{json, Map};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::contract::{Connector, Item, PageSource, RawPage};
use crate::dates::{datetime_to_timestamp, str_to_datetime};
use crate::error::{SourceError, ValidationError};

use super::{identifier, required};

pub const MESSAGE_ID_FIELD: &str = "Message-ID";
pub const DATE_FIELD: &str = "Date";

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const BZIP2_MAGIC: &[u8] = b"BZh";

fn from_line() -> &'static BytesRegex {
    static RE: OnceLock<BytesRegex> = OnceLock::new();
    RE.get_or_init(|| BytesRegex::new(r"(?m)^From ").expect("valid mbox separator pattern"))
}

fn charset_param() -> &'static BytesRegex {
    static RE: OnceLock<BytesRegex> = OnceLock::new();
    RE.get_or_init(|| {
        BytesRegex::new(r#"(?i)charset\s*=\s*"?([A-Za-z0-9_.:-]+)"#).expect("valid charset pattern")
    })
}

fn header_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([!-9;-~]+):[ \t]*(.*)$").expect("valid header pattern"))
}

fn escaped_from() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^>(>*From )").expect("valid escaped From pattern"))
}

#[derive(Debug, Clone)]
pub struct MBox {
    dirpath: PathBuf,
}

impl MBox {
    pub fn new(dirpath: impl Into<PathBuf>) -> Self {
        MBox {
            dirpath: dirpath.into(),
        }
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    /// Files to read, sorted by name within each directory.
    fn mboxes(&self) -> Result<Vec<PathBuf>, SourceError> {
        if self.dirpath.is_file() {
            return Ok(vec![self.dirpath.clone()]);
        }
        if !self.dirpath.is_dir() {
            return Err(SourceError::NotFound(self.dirpath.display().to_string()));
        }

        let mut mboxes = Vec::new();
        for entry in WalkDir::new(&self.dirpath).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() => mboxes.push(entry.into_path()),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Ignoring mbox entry that cannot be listed"),
            }
        }
        Ok(mboxes)
    }
}

#[async_trait]
impl Connector for MBox {
    fn name(&self) -> &'static str {
        "MBox"
    }

    fn version(&self) -> &'static str {
        "0.8.0"
    }

    fn has_caching(&self) -> bool {
        false
    }

    fn has_resuming(&self) -> bool {
        true
    }

    async fn fetch_pages(
        &self,
        from_date: DateTime<Utc>,
    ) -> Result<Box<dyn PageSource>, SourceError> {
        let mboxes = self.mboxes()?;
        info!(
            dirpath = %self.dirpath.display(),
            mboxes = mboxes.len(),
            from_date = %from_date,
            "Looking for messages"
        );
        Ok(Box::new(MBoxPages {
            mboxes: mboxes.into(),
        }))
    }

    fn parse_page(&self, page: &RawPage) -> Result<Vec<Item>, SourceError> {
        Ok(split_messages(page.as_bytes())
            .map(|raw| parse_message(&decode_message(raw).replace("\r\n", "\n")))
            .collect())
    }

    fn metadata_id(&self, item: &Item) -> Result<String, ValidationError> {
        identifier(item, MESSAGE_ID_FIELD)
    }

    fn metadata_updated_on(&self, item: &Item) -> Result<f64, ValidationError> {
        let date = required(item, DATE_FIELD)?
            .as_str()
            .ok_or_else(|| ValidationError::unexpected_type(DATE_FIELD))?;
        if date.trim().is_empty() {
            return Err(ValidationError::empty(DATE_FIELD));
        }
        Ok(datetime_to_timestamp(&str_to_datetime(date)?))
    }

    fn metadata_category(&self, _item: &Item) -> String {
        "message".to_string()
    }
}

struct MBoxPages {
    mboxes: VecDeque<PathBuf>,
}

#[async_trait]
impl PageSource for MBoxPages {
    async fn next_page(&mut self) -> Result<Option<RawPage>, SourceError> {
        let Some(path) = self.mboxes.pop_front() else {
            return Ok(None);
        };
        let unreadable = |source: io::Error| SourceError::Unreadable {
            location: path.display().to_string(),
            source,
        };

        let raw = tokio::fs::read(&path).await.map_err(unreadable)?;
        let content = decompress(raw).map_err(unreadable)?;
        debug!(path = %path.display(), bytes = content.len(), "Read mbox");
        Ok(Some(RawPage::new(content)))
    }
}

fn decompress(raw: Vec<u8>) -> io::Result<Vec<u8>> {
    if raw.starts_with(GZIP_MAGIC) {
        let mut content = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut content)?;
        return Ok(content);
    }
    if raw.starts_with(BZIP2_MAGIC) {
        let mut content = Vec::new();
        BzDecoder::new(raw.as_slice()).read_to_end(&mut content)?;
        return Ok(content);
    }
    Ok(raw)
}

/// Messages of an mbox, each starting at its `From ` line. Text before the
/// first separator is not a message.
fn split_messages(text: &[u8]) -> impl Iterator<Item = &[u8]> {
    let starts: Vec<usize> = from_line().find_iter(text).map(|m| m.start()).collect();
    let ends: Vec<usize> = starts
        .iter()
        .skip(1)
        .copied()
        .chain(std::iter::once(text.len()))
        .collect();
    starts
        .into_iter()
        .zip(ends)
        .map(move |(start, end)| &text[start..end])
}

/// Message text; bytes that are not UTF-8 go through the declared charset.
fn decode_message(raw: &[u8]) -> Cow<'_, str> {
    if let Ok(text) = std::str::from_utf8(raw) {
        return Cow::Borrowed(text);
    }
    let encoding = charset_param()
        .captures(raw)
        .and_then(|caps| Encoding::for_label(&caps[1]))
        .unwrap_or(WINDOWS_1252);
    let (text, malformed) = encoding.decode_without_bom_handling(raw);
    if malformed {
        debug!(charset = encoding.name(), "Message has bytes outside its charset");
    }
    text
}

fn parse_message(message: &str) -> Item {
    let (envelope, rest) = message.split_once('\n').unwrap_or((message, ""));
    let (head, body) = match rest.find("\n\n") {
        Some(idx) => (&rest[..idx], &rest[idx + 2..]),
        None if rest.starts_with('\n') => ("", &rest[1..]),
        None => (rest, ""),
    };

    let mut fields = Map::new();
    fields.insert(
        "unixfrom".to_string(),
        Item::String(envelope.trim_start_matches("From ").trim_end().to_string()),
    );

    let mut content_type = None;
    for (name, value) in unfold_headers(head) {
        let name = canonical_name(&name);
        if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_ascii_lowercase());
        }
        fields.insert(name, Item::String(value));
    }

    let body = escaped_from().replace_all(body, "$1").into_owned();
    let kind = match content_type {
        Some(ct) if ct.starts_with("text/html") => "html",
        _ => "plain",
    };
    fields.insert("body".to_string(), json!({ kind: body }));

    Item::Object(fields)
}

/// Header lines with continuation lines folded into their header.
fn unfold_headers(head: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                let continuation = line.trim();
                if !continuation.is_empty() {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(continuation);
                }
            }
            continue;
        }
        if let Some(caps) = header_line().captures(line) {
            headers.push((caps[1].to_string(), caps[2].trim_end().to_string()));
        }
    }
    headers
}

fn canonical_name(name: &str) -> String {
    if name.eq_ignore_ascii_case(MESSAGE_ID_FIELD) {
        MESSAGE_ID_FIELD.to_string()
    } else if name.eq_ignore_ascii_case(DATE_FIELD) {
        DATE_FIELD.to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use bzip2::write::BzEncoder;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    const TWO_MESSAGES: &str = "From alice@example.com Tue Jan  5 10:00:00 2016\n\
Message-ID: <1@example.com>\n\
Date: Tue, 05 Jan 2016 10:00:00 +0000\n\
Subject: A folded\n\
\x20 subject line\n\
\n\
Hello\n\
>From the past\n\
\n\
From bob@example.com Wed Jan  6 10:00:00 2016\n\
message-id: <2@example.com>\n\
DATE: Wed, 06 Jan 2016 10:00:00 +0000\n\
Content-Type: text/html; charset=utf-8\n\
\n\
<p>Hi</p>\n";

    fn connector() -> MBox {
        MBox::new("unused")
    }

    #[test]
    fn splits_messages_and_parses_headers() {
        let items = connector()
            .parse_page(&RawPage::from(TWO_MESSAGES))
            .unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["unixfrom"], "alice@example.com Tue Jan  5 10:00:00 2016");
        assert_eq!(items[0]["Message-ID"], "<1@example.com>");
        assert_eq!(items[0]["Subject"], "A folded subject line");
        assert_eq!(items[0]["body"]["plain"], "Hello\nFrom the past\n\n");
        assert_eq!(items[1]["Message-ID"], "<2@example.com>");
        assert_eq!(items[1]["Date"], "Wed, 06 Jan 2016 10:00:00 +0000");
        assert_eq!(items[1]["body"]["html"], "<p>Hi</p>\n");
    }

    #[test]
    fn metadata_from_canonical_headers() {
        let mbox = connector();
        let items = mbox.parse_page(&RawPage::from(TWO_MESSAGES)).unwrap();

        assert_eq!(mbox.metadata_id(&items[1]).unwrap(), "<2@example.com>");
        assert_eq!(mbox.metadata_updated_on(&items[0]).unwrap(), 1451988000.0);
        assert_eq!(mbox.metadata_category(&items[0]), "message");
    }

    #[test]
    fn invalid_messages_fail_metadata() {
        let mbox = connector();
        let page = "From a\nSubject: no id\nDate: not a date\n\nbody\n\
From b\nMessage-ID:\nDate: Tue, 05 Jan 2016 10:00:00 +0000\n\nbody\n";
        let items = mbox.parse_page(&RawPage::from(page)).unwrap();

        assert_eq!(
            mbox.metadata_id(&items[0]),
            Err(ValidationError::missing(MESSAGE_ID_FIELD))
        );
        assert!(matches!(
            mbox.metadata_updated_on(&items[0]),
            Err(ValidationError::InvalidDate { .. })
        ));
        assert_eq!(
            mbox.metadata_id(&items[1]),
            Err(ValidationError::empty(MESSAGE_ID_FIELD))
        );
    }

    #[test]
    fn leading_garbage_is_not_a_message() {
        let items = connector()
            .parse_page(&RawPage::from("junk\nmore junk\n"))
            .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn gzip_content_is_decompressed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(TWO_MESSAGES.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress(compressed).unwrap(), TWO_MESSAGES.as_bytes());
        assert_eq!(decompress(b"From x\n".to_vec()).unwrap(), b"From x\n");
    }

    #[test]
    fn bzip2_content_is_decompressed() {
        let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::default());
        encoder.write_all(TWO_MESSAGES.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress(compressed).unwrap(), TWO_MESSAGES.as_bytes());
        assert!(decompress(b"BZh91AY&SY".to_vec()).is_err());
    }

    #[test]
    fn non_utf8_messages_use_their_charset() {
        let mut page = b"From a Tue Jan  5 10:00:00 2016\n\
Message-ID: <1@example.com>\n\
Date: Tue, 05 Jan 2016 10:00:00 +0000\n\
Subject: Caf\xe9\n\
Content-Type: text/plain; charset=\"iso-8859-15\"\n\
\n\
Prix: 5 \xa4\n"
            .to_vec();
        page.extend_from_slice(
            b"From b Wed Jan  6 10:00:00 2016\nMessage-ID: <2@example.com>\n\nNa\xefve\n",
        );

        let items = connector().parse_page(&RawPage::new(page)).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["Subject"], "Caf\u{e9}");
        assert_eq!(items[0]["body"]["plain"], "Prix: 5 \u{20ac}\n");
        assert_eq!(items[1]["body"]["plain"], "Na\u{ef}ve\n");
    }
}
