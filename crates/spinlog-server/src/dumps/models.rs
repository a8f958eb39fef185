//! Parsed dump records
//!
//! Minimal projections of the provider's XML records: just the fields the
//! catalog schema keeps. Natural keys are the provider's numeric ids.

use serde::{Deserialize, Serialize};

/// One `<label>` record from the labels dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub id: i64,
    pub name: String,
    pub contact_info: Option<String>,
    pub profile: Option<String>,
    pub data_quality: Option<String>,
}

/// One `<artist>` record from the artists dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistRecord {
    pub id: i64,
    pub name: String,
    pub real_name: Option<String>,
    pub profile: Option<String>,
    pub data_quality: Option<String>,
}

/// One `<master>` record from the masters dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub id: i64,
    pub title: String,
    pub year: Option<i32>,
    pub main_release_id: Option<i64>,
    pub data_quality: Option<String>,
    pub genres: Vec<String>,
    pub styles: Vec<String>,
    pub artist_ids: Vec<i64>,
}

/// A label credit on a release (`<label name=".." catno=".."/>`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseLabelRef {
    pub name: String,
    pub catalog_number: Option<String>,
}

/// One `<release>` record from the releases dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
    pub id: i64,
    pub title: String,
    pub country: Option<String>,
    pub released: Option<String>,
    pub master_id: Option<i64>,
    pub data_quality: Option<String>,
    pub genres: Vec<String>,
    pub styles: Vec<String>,
    pub artist_ids: Vec<i64>,
    pub labels: Vec<ReleaseLabelRef>,
}

/// A batch of parsed records flowing from the parser to the upsert layer
#[derive(Debug, Clone)]
pub enum RecordBatch {
    Labels(Vec<LabelRecord>),
    Artists(Vec<ArtistRecord>),
    Masters(Vec<MasterRecord>),
    Releases(Vec<ReleaseRecord>),
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Labels(v) => v.len(),
            RecordBatch::Artists(v) => v.len(),
            RecordBatch::Masters(v) => v.len(),
            RecordBatch::Releases(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
