use std::fs;
use std::io::Write;
use std::path::Path;

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::tempdir;

use perceval_core::backends::MBox;
use perceval_core::dates::str_to_datetime;
use perceval_core::{Backend, Fetch, FetchError, FetchSummary, Record, SourceError};

const PLAIN: &str = "From alice@example.com Fri Jan  1 10:00:00 2016
Message-ID: <a1@example.com>
Date: Fri, 01 Jan 2016 10:00:00 +0000
Subject: first

Hi all
From bob@example.com Mon Jun  1 10:00:00 2015
Message-ID: <b1@example.com>
Date: Mon, 01 Jun 2015 10:00:00 +0000
Subject: old one

Old news
";

const COMPRESSED: &str = "From carol@example.com Sat Jan  2 10:00:00 2016
Message-ID: <c1@example.com>
Date: Sat, 02 Jan 2016 10:00:00 +0000

Compressed
From dave@example.com Sun Jan  3 10:00:00 2016
Subject: no identifier here
Date: Sun, 03 Jan 2016 10:00:00 +0000

Lost
";

fn write_gz(path: &Path, content: &str) {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content.as_bytes()).unwrap();
    fs::write(path, encoder.finish().unwrap()).unwrap();
}

const BZIPPED: &str = "From erin@example.com Mon Jan  4 10:00:00 2016
Message-ID: <e1@example.com>
Date: Mon, 04 Jan 2016 10:00:00 +0000

Bzipped
";

fn write_bz2(path: &Path, content: &str) {
    let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(content.as_bytes()).unwrap();
    fs::write(path, encoder.finish().unwrap()).unwrap();
}

fn mailing_list(dir: &Path) {
    fs::write(dir.join("2016-01.mbox"), PLAIN).unwrap();
    write_gz(&dir.join("2016-02.mbox.gz"), COMPRESSED);
    write_bz2(&dir.join("2016-03.mbox.bz2"), BZIPPED);
    // Truncated bzip2 stream.
    fs::write(dir.join("2016-04.mbox.bz2"), b"BZh91AY&SY").unwrap();
}

async fn drain(mut fetch: Fetch<'_>) -> (Vec<Record>, FetchSummary) {
    let mut records = Vec::new();
    while let Some(record) = fetch.next_record().await.unwrap() {
        records.push(record);
    }
    (records, fetch.summary().clone())
}

fn message_ids(records: &[Record]) -> Vec<&str> {
    records
        .iter()
        .map(|r| r.data["Message-ID"].as_str().unwrap())
        .collect()
}

#[tokio::test]
async fn test_mbox_fetches_messages_from_every_file() {
    let dir = tempdir().unwrap();
    mailing_list(dir.path());

    let origin = "http://example.com/mailing-list";
    let mut backend = Backend::new(origin, Box::new(MBox::new(dir.path()))).unwrap();
    let (records, summary) = drain(backend.fetch(None).unwrap()).await;

    assert_eq!(
        message_ids(&records),
        vec![
            "<a1@example.com>",
            "<b1@example.com>",
            "<c1@example.com>",
            "<e1@example.com>"
        ]
    );
    assert!(records.iter().all(|r| r.category == "message"));
    assert!(records.iter().all(|r| r.backend_name == "MBox"));
    assert_eq!(records[0].origin, origin);
    assert_eq!(records[2].data["body"]["plain"], "Compressed\n");
    assert_eq!(records[3].data["body"]["plain"], "Bzipped\n");
    assert_eq!(summary.pages, 3);
    assert_eq!(summary.skipped_pages, 1, "truncated bzip2 mbox is skipped");
    assert_eq!(summary.seen, 5);
    assert_eq!(summary.ignored, 1);
    assert_eq!(summary.fetched, 4);
}

#[tokio::test]
async fn test_mbox_skips_messages_sent_before_from_date() {
    let dir = tempdir().unwrap();
    mailing_list(dir.path());

    let mut backend = Backend::new("list", Box::new(MBox::new(dir.path()))).unwrap();
    let from_date = str_to_datetime("2016-01-01").unwrap();
    let (records, summary) = drain(backend.fetch(Some(from_date)).unwrap()).await;

    assert_eq!(
        message_ids(&records),
        vec!["<a1@example.com>", "<c1@example.com>", "<e1@example.com>"]
    );
    assert_eq!(summary.filtered, 1);
}

#[tokio::test]
async fn test_mbox_accepts_a_single_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("single.mbox");
    fs::write(&path, PLAIN).unwrap();

    let mut backend = Backend::new("list", Box::new(MBox::new(&path))).unwrap();
    let (records, _) = drain(backend.fetch(None).unwrap()).await;
    assert_eq!(records.len(), 2);
}

#[tokio::test]
async fn test_mbox_missing_directory_is_fatal() {
    let dir = tempdir().unwrap();
    let mut backend =
        Backend::new("list", Box::new(MBox::new(dir.path().join("missing")))).unwrap();
    let mut fetch = backend.fetch(None).unwrap();

    let err = fetch.next_record().await.unwrap_err();
    assert!(matches!(err, FetchError::Source(SourceError::NotFound(_))));
}
