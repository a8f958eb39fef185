//! Streaming parsers for the gzipped XML dumps
//!
//! The dumps are far too large to hold in memory, so each parser walks
//! quick-xml events and emits fixed-size [`RecordBatch`]es through a sink
//! callback. The callback keeps the parser transport-agnostic: production
//! code forwards batches over a channel from a blocking task, tests collect
//! them into a `Vec`.
//!
//! Records missing their natural key (no id, or no name/title) are skipped
//! with a warning rather than failing the whole dump; malformed XML fails
//! the parse.

use flate2::read::GzDecoder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use spinlog_common::{Result, SpinlogError};
use std::io::BufRead;
use std::path::Path;
use tracing::warn;

use super::models::{
    ArtistRecord, LabelRecord, MasterRecord, RecordBatch, ReleaseLabelRef, ReleaseRecord,
};
use super::types::DumpKind;

/// Sink receiving parsed batches; returning an error aborts the parse
pub type BatchSink<'a> = &'a mut dyn FnMut(RecordBatch) -> Result<()>;

/// Parse a gzipped dump file from disk, dispatching on kind
///
/// Returns the total number of records emitted.
pub fn parse_dump_file(
    kind: DumpKind,
    path: &Path,
    batch_size: usize,
    sink: BatchSink<'_>,
) -> Result<usize> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));
    parse_dump(kind, reader, batch_size, sink)
}

/// Parse an uncompressed dump from any buffered reader
pub fn parse_dump<R: BufRead>(
    kind: DumpKind,
    reader: R,
    batch_size: usize,
    sink: BatchSink<'_>,
) -> Result<usize> {
    match kind {
        DumpKind::Labels => parse_labels(reader, batch_size, sink),
        DumpKind::Artists => parse_artists(reader, batch_size, sink),
        DumpKind::Masters => parse_masters(reader, batch_size, sink),
        DumpKind::Releases => parse_releases(reader, batch_size, sink),
    }
}

fn xml_reader<R: BufRead>(reader: R) -> Reader<R> {
    let mut reader = Reader::from_reader(reader);
    reader.config_mut().trim_text(true);
    reader
}

fn parse_error(e: impl std::fmt::Display) -> SpinlogError {
    SpinlogError::Parse(format!("invalid dump XML: {e}"))
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Joins the element path below the document root, e.g. `master/year`
fn rel_path(stack: &[String]) -> String {
    stack[1..].join("/")
}

/// Parse the labels dump (`<labels><label>...`)
pub fn parse_labels<R: BufRead>(
    reader: R,
    batch_size: usize,
    sink: BatchSink<'_>,
) -> Result<usize> {
    let mut reader = xml_reader(reader);
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();

    let mut total = 0usize;
    let mut batch: Vec<LabelRecord> = Vec::with_capacity(batch_size);

    let mut id: Option<i64> = None;
    let mut name = String::new();
    let mut contact_info = String::new();
    let mut profile = String::new();
    let mut data_quality = String::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_error)? {
            Event::Start(ref e) => {
                stack.push(element_name(e));
                text.clear();
                if rel_path(&stack) == "label" {
                    id = None;
                    name.clear();
                    contact_info.clear();
                    profile.clear();
                    data_quality.clear();
                }
            },
            Event::Text(ref t) => {
                text.push_str(&t.unescape().map_err(parse_error)?);
            },
            Event::End(_) => {
                match rel_path(&stack).as_str() {
                    "label/id" => id = text.parse().ok(),
                    "label/name" => name = text.clone(),
                    "label/contactinfo" => contact_info = text.clone(),
                    "label/profile" => profile = text.clone(),
                    "label/data_quality" => data_quality = text.clone(),
                    "label" => {
                        match id {
                            Some(id) if !name.is_empty() => {
                                batch.push(LabelRecord {
                                    id,
                                    name: name.clone(),
                                    contact_info: non_empty(contact_info.clone()),
                                    profile: non_empty(profile.clone()),
                                    data_quality: non_empty(data_quality.clone()),
                                });
                                total += 1;
                                if batch.len() >= batch_size {
                                    sink(RecordBatch::Labels(std::mem::take(&mut batch)))?;
                                }
                            },
                            _ => warn!("Skipping label record without id or name"),
                        }
                    },
                    _ => {},
                }
                stack.pop();
                text.clear();
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    if !batch.is_empty() {
        sink(RecordBatch::Labels(batch))?;
    }
    Ok(total)
}

/// Parse the artists dump (`<artists><artist>...`)
pub fn parse_artists<R: BufRead>(
    reader: R,
    batch_size: usize,
    sink: BatchSink<'_>,
) -> Result<usize> {
    let mut reader = xml_reader(reader);
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();

    let mut total = 0usize;
    let mut batch: Vec<ArtistRecord> = Vec::with_capacity(batch_size);

    let mut id: Option<i64> = None;
    let mut name = String::new();
    let mut real_name = String::new();
    let mut profile = String::new();
    let mut data_quality = String::new();

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_error)? {
            Event::Start(ref e) => {
                stack.push(element_name(e));
                text.clear();
                if rel_path(&stack) == "artist" {
                    id = None;
                    name.clear();
                    real_name.clear();
                    profile.clear();
                    data_quality.clear();
                }
            },
            Event::Text(ref t) => {
                text.push_str(&t.unescape().map_err(parse_error)?);
            },
            Event::End(_) => {
                match rel_path(&stack).as_str() {
                    "artist/id" => id = text.parse().ok(),
                    "artist/name" => name = text.clone(),
                    "artist/realname" => real_name = text.clone(),
                    "artist/profile" => profile = text.clone(),
                    "artist/data_quality" => data_quality = text.clone(),
                    "artist" => {
                        match id {
                            Some(id) if !name.is_empty() => {
                                batch.push(ArtistRecord {
                                    id,
                                    name: name.clone(),
                                    real_name: non_empty(real_name.clone()),
                                    profile: non_empty(profile.clone()),
                                    data_quality: non_empty(data_quality.clone()),
                                });
                                total += 1;
                                if batch.len() >= batch_size {
                                    sink(RecordBatch::Artists(std::mem::take(&mut batch)))?;
                                }
                            },
                            _ => warn!("Skipping artist record without id or name"),
                        }
                    },
                    _ => {},
                }
                stack.pop();
                text.clear();
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    if !batch.is_empty() {
        sink(RecordBatch::Artists(batch))?;
    }
    Ok(total)
}

/// Parse the masters dump (`<masters><master id="..">...`)
pub fn parse_masters<R: BufRead>(
    reader: R,
    batch_size: usize,
    sink: BatchSink<'_>,
) -> Result<usize> {
    let mut reader = xml_reader(reader);
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();

    let mut total = 0usize;
    let mut batch: Vec<MasterRecord> = Vec::with_capacity(batch_size);

    let mut record = MasterRecord {
        id: 0,
        title: String::new(),
        year: None,
        main_release_id: None,
        data_quality: None,
        genres: Vec::new(),
        styles: Vec::new(),
        artist_ids: Vec::new(),
    };
    let mut id: Option<i64> = None;

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_error)? {
            Event::Start(ref e) => {
                stack.push(element_name(e));
                text.clear();
                if rel_path(&stack) == "master" {
                    id = read_id_attribute(e)?;
                    record = MasterRecord {
                        id: 0,
                        title: String::new(),
                        year: None,
                        main_release_id: None,
                        data_quality: None,
                        genres: Vec::new(),
                        styles: Vec::new(),
                        artist_ids: Vec::new(),
                    };
                }
            },
            Event::Text(ref t) => {
                text.push_str(&t.unescape().map_err(parse_error)?);
            },
            Event::End(_) => {
                match rel_path(&stack).as_str() {
                    "master/title" => record.title = text.clone(),
                    "master/year" => record.year = text.parse().ok(),
                    "master/main_release" => record.main_release_id = text.parse().ok(),
                    "master/data_quality" => record.data_quality = non_empty(text.clone()),
                    "master/genres/genre" => record.genres.push(text.clone()),
                    "master/styles/style" => record.styles.push(text.clone()),
                    "master/artists/artist/id" => {
                        if let Ok(artist_id) = text.parse() {
                            record.artist_ids.push(artist_id);
                        }
                    },
                    "master" => {
                        match id {
                            Some(id) if !record.title.is_empty() => {
                                record.id = id;
                                batch.push(record.clone());
                                total += 1;
                                if batch.len() >= batch_size {
                                    sink(RecordBatch::Masters(std::mem::take(&mut batch)))?;
                                }
                            },
                            _ => warn!("Skipping master record without id or title"),
                        }
                    },
                    _ => {},
                }
                stack.pop();
                text.clear();
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    if !batch.is_empty() {
        sink(RecordBatch::Masters(batch))?;
    }
    Ok(total)
}

/// Parse the releases dump (`<releases><release id="..">...`)
pub fn parse_releases<R: BufRead>(
    reader: R,
    batch_size: usize,
    sink: BatchSink<'_>,
) -> Result<usize> {
    let mut reader = xml_reader(reader);
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut text = String::new();

    let mut total = 0usize;
    let mut batch: Vec<ReleaseRecord> = Vec::with_capacity(batch_size);

    let mut record = empty_release();
    let mut id: Option<i64> = None;

    loop {
        match reader.read_event_into(&mut buf).map_err(parse_error)? {
            Event::Start(ref e) => {
                stack.push(element_name(e));
                text.clear();
                if rel_path(&stack) == "release" {
                    id = read_id_attribute(e)?;
                    record = empty_release();
                }
            },
            Event::Empty(ref e) => {
                // Release label credits are self-closing elements carrying
                // their data in attributes.
                let mut path = rel_path(&stack);
                if !path.is_empty() {
                    path.push('/');
                }
                path.push_str(&element_name(e));

                if path == "release/labels/label" {
                    if let Some(label) = read_label_ref(e)? {
                        record.labels.push(label);
                    }
                }
            },
            Event::Text(ref t) => {
                text.push_str(&t.unescape().map_err(parse_error)?);
            },
            Event::End(_) => {
                match rel_path(&stack).as_str() {
                    "release/title" => record.title = text.clone(),
                    "release/country" => record.country = non_empty(text.clone()),
                    "release/released" => record.released = non_empty(text.clone()),
                    "release/master_id" => record.master_id = text.parse().ok(),
                    "release/data_quality" => record.data_quality = non_empty(text.clone()),
                    "release/genres/genre" => record.genres.push(text.clone()),
                    "release/styles/style" => record.styles.push(text.clone()),
                    "release/artists/artist/id" => {
                        if let Ok(artist_id) = text.parse() {
                            record.artist_ids.push(artist_id);
                        }
                    },
                    "release" => {
                        match id {
                            Some(id) if !record.title.is_empty() => {
                                record.id = id;
                                batch.push(record.clone());
                                total += 1;
                                if batch.len() >= batch_size {
                                    sink(RecordBatch::Releases(std::mem::take(&mut batch)))?;
                                }
                            },
                            _ => warn!("Skipping release record without id or title"),
                        }
                    },
                    _ => {},
                }
                stack.pop();
                text.clear();
            },
            Event::Eof => break,
            _ => {},
        }
        buf.clear();
    }

    if !batch.is_empty() {
        sink(RecordBatch::Releases(batch))?;
    }
    Ok(total)
}

fn empty_release() -> ReleaseRecord {
    ReleaseRecord {
        id: 0,
        title: String::new(),
        country: None,
        released: None,
        master_id: None,
        data_quality: None,
        genres: Vec::new(),
        styles: Vec::new(),
        artist_ids: Vec::new(),
        labels: Vec::new(),
    }
}

/// Read the numeric `id` attribute carried by `<master>`/`<release>`
fn read_id_attribute(e: &BytesStart<'_>) -> Result<Option<i64>> {
    for attr in e.attributes() {
        let attr = attr.map_err(parse_error)?;
        if attr.key.as_ref() == b"id" {
            let value = attr.unescape_value().map_err(parse_error)?;
            return Ok(value.parse().ok());
        }
    }
    Ok(None)
}

/// Read a `<label name=".." catno=".."/>` credit
fn read_label_ref(e: &BytesStart<'_>) -> Result<Option<ReleaseLabelRef>> {
    let mut name = None;
    let mut catalog_number = None;

    for attr in e.attributes() {
        let attr = attr.map_err(parse_error)?;
        let value = attr.unescape_value().map_err(parse_error)?.into_owned();
        match attr.key.as_ref() {
            b"name" => name = non_empty(value),
            b"catno" => catalog_number = non_empty(value),
            _ => {},
        }
    }

    Ok(name.map(|name| ReleaseLabelRef {
        name,
        catalog_number,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(kind: DumpKind, xml: &str, batch_size: usize) -> (usize, Vec<RecordBatch>) {
        let mut batches = Vec::new();
        let mut sink = |batch: RecordBatch| {
            batches.push(batch);
            Ok(())
        };
        let total = parse_dump(kind, Cursor::new(xml.as_bytes()), batch_size, &mut sink).unwrap();
        (total, batches)
    }

    #[test]
    fn test_parse_labels() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <labels>
              <label>
                <id>1</id>
                <name>Svek</name>
                <contactinfo>Stockholm</contactinfo>
                <profile>Swedish house label</profile>
                <data_quality>Correct</data_quality>
              </label>
              <label>
                <id>2</id>
                <name>Planet E</name>
              </label>
            </labels>"#;

        let (total, batches) = collect(DumpKind::Labels, xml, 100);
        assert_eq!(total, 2);
        assert_eq!(batches.len(), 1);

        let RecordBatch::Labels(records) = &batches[0] else {
            panic!("wrong batch kind");
        };
        assert_eq!(records[0].id, 1);
        assert_eq!(records[0].name, "Svek");
        assert_eq!(records[0].contact_info.as_deref(), Some("Stockholm"));
        assert_eq!(records[0].data_quality.as_deref(), Some("Correct"));
        assert_eq!(records[1].id, 2);
        assert_eq!(records[1].profile, None);
    }

    #[test]
    fn test_parse_artists_skips_records_without_id() {
        let xml = r#"<artists>
              <artist>
                <id>45</id>
                <name>Aphex Twin</name>
                <realname>Richard D. James</realname>
              </artist>
              <artist>
                <name>Unknown Artist</name>
              </artist>
            </artists>"#;

        let (total, batches) = collect(DumpKind::Artists, xml, 100);
        assert_eq!(total, 1);

        let RecordBatch::Artists(records) = &batches[0] else {
            panic!("wrong batch kind");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 45);
        assert_eq!(records[0].real_name.as_deref(), Some("Richard D. James"));
    }

    #[test]
    fn test_parse_masters_with_genres_and_artists() {
        let xml = r#"<masters>
              <master id="18500">
                <main_release>155102</main_release>
                <artists>
                  <artist><id>212070</id><name>Samuel L Session</name></artist>
                  <artist><id>212071</id><name>Van Der Vleuten</name></artist>
                </artists>
                <genres><genre>Electronic</genre></genres>
                <styles><style>Techno</style><style>Tech House</style></styles>
                <year>2001</year>
                <title>New Soil</title>
                <data_quality>Correct</data_quality>
              </master>
            </masters>"#;

        let (total, batches) = collect(DumpKind::Masters, xml, 100);
        assert_eq!(total, 1);

        let RecordBatch::Masters(records) = &batches[0] else {
            panic!("wrong batch kind");
        };
        let master = &records[0];
        assert_eq!(master.id, 18500);
        assert_eq!(master.title, "New Soil");
        assert_eq!(master.year, Some(2001));
        assert_eq!(master.main_release_id, Some(155102));
        assert_eq!(master.genres, vec!["Electronic"]);
        assert_eq!(master.styles, vec!["Techno", "Tech House"]);
        assert_eq!(master.artist_ids, vec![212070, 212071]);
    }

    #[test]
    fn test_parse_releases_with_label_credits() {
        let xml = r#"<releases>
              <release id="1" status="Accepted">
                <artists><artist><id>1</id><name>Persuader</name></artist></artists>
                <title>Stockholm</title>
                <labels>
                  <label catno="SK032" id="5" name="Svek"/>
                  <label catno="SK 32" id="5" name="Svek"/>
                </labels>
                <country>Sweden</country>
                <released>1999-03-00</released>
                <genres><genre>Electronic</genre></genres>
                <styles><style>Deep House</style></styles>
                <master_id is_main_release="true">5427</master_id>
              </release>
            </releases>"#;

        let (total, batches) = collect(DumpKind::Releases, xml, 100);
        assert_eq!(total, 1);

        let RecordBatch::Releases(records) = &batches[0] else {
            panic!("wrong batch kind");
        };
        let release = &records[0];
        assert_eq!(release.id, 1);
        assert_eq!(release.title, "Stockholm");
        assert_eq!(release.country.as_deref(), Some("Sweden"));
        assert_eq!(release.released.as_deref(), Some("1999-03-00"));
        assert_eq!(release.master_id, Some(5427));
        assert_eq!(release.artist_ids, vec![1]);
        assert_eq!(release.labels.len(), 2);
        assert_eq!(release.labels[0].name, "Svek");
        assert_eq!(release.labels[0].catalog_number.as_deref(), Some("SK032"));
    }

    #[test]
    fn test_batching_splits_output() {
        let mut xml = String::from("<artists>");
        for i in 1..=5 {
            xml.push_str(&format!(
                "<artist><id>{i}</id><name>Artist {i}</name></artist>"
            ));
        }
        xml.push_str("</artists>");

        let (total, batches) = collect(DumpKind::Artists, &xml, 2);
        assert_eq!(total, 5);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 2);
        assert_eq!(batches[2].len(), 1);
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        let xml = "<artists><artist><id>1</wrong></artist></artists>";
        let mut sink = |_batch: RecordBatch| Ok(());
        let result = parse_dump(DumpKind::Artists, Cursor::new(xml.as_bytes()), 10, &mut sink);
        assert!(result.is_err());
    }

    #[test]
    fn test_unescapes_entities() {
        let xml = r#"<labels><label><id>7</id><name>Mo Wax &amp; Friends</name></label></labels>"#;
        let (_, batches) = collect(DumpKind::Labels, xml, 10);
        let RecordBatch::Labels(records) = &batches[0] else {
            panic!("wrong batch kind");
        };
        assert_eq!(records[0].name, "Mo Wax & Friends");
    }

    #[test]
    fn test_parse_gzipped_file_round_trip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let xml = r#"<labels><label><id>1</id><name>Svek</name></label></labels>"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(xml.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.xml.gz");
        std::fs::write(&path, compressed).unwrap();

        let mut batches = Vec::new();
        let mut sink = |batch: RecordBatch| {
            batches.push(batch);
            Ok(())
        };
        let total = parse_dump_file(DumpKind::Labels, &path, 10, &mut sink).unwrap();
        assert_eq!(total, 1);
    }
}
