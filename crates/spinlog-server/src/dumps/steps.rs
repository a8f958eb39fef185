//! The 13 processing steps and their dependency table
//!
//! The ETL order is data-driven: entity tables load first, then the genre
//! chains (collect distinct names, upsert the genre table, write join rows),
//! then the cross-entity association tables. Encoding prerequisites here
//! keeps the ordering contract in one place and testable in isolation.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::DumpKind;

/// One named unit of the processing pipeline
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStep {
    LabelsProcessing,
    ArtistsProcessing,
    MastersProcessing,
    ReleasesProcessing,
    MasterGenresCollection,
    MasterGenresUpsert,
    MasterGenreAssociations,
    ReleaseGenresCollection,
    ReleaseGenresUpsert,
    ReleaseGenreAssociations,
    ReleaseLabelAssociations,
    MasterArtistAssociations,
    ReleaseArtistAssociations,
}

use ProcessingStep::*;

impl ProcessingStep {
    pub const ALL: [ProcessingStep; 13] = [
        LabelsProcessing,
        ArtistsProcessing,
        MastersProcessing,
        ReleasesProcessing,
        MasterGenresCollection,
        MasterGenresUpsert,
        MasterGenreAssociations,
        ReleaseGenresCollection,
        ReleaseGenresUpsert,
        ReleaseGenreAssociations,
        ReleaseLabelAssociations,
        MasterArtistAssociations,
        ReleaseArtistAssociations,
    ];

    /// Steps that must be completed before this one may start
    pub fn prerequisites(&self) -> &'static [ProcessingStep] {
        match self {
            LabelsProcessing => &[],
            ArtistsProcessing => &[],
            MastersProcessing => &[],
            ReleasesProcessing => &[],
            MasterGenresCollection => &[MastersProcessing],
            MasterGenresUpsert => &[MasterGenresCollection],
            MasterGenreAssociations => &[MasterGenresUpsert],
            ReleaseGenresCollection => &[ReleasesProcessing],
            ReleaseGenresUpsert => &[ReleaseGenresCollection],
            ReleaseGenreAssociations => &[ReleaseGenresUpsert],
            ReleaseLabelAssociations => &[ReleasesProcessing, LabelsProcessing],
            MasterArtistAssociations => &[MastersProcessing, ArtistsProcessing],
            ReleaseArtistAssociations => &[ReleasesProcessing, ArtistsProcessing],
        }
    }

    /// The dump file this step ingests, for the four entity-load steps
    pub fn dump_kind(&self) -> Option<DumpKind> {
        match self {
            LabelsProcessing => Some(DumpKind::Labels),
            ArtistsProcessing => Some(DumpKind::Artists),
            MastersProcessing => Some(DumpKind::Masters),
            ReleasesProcessing => Some(DumpKind::Releases),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LabelsProcessing => "labels_processing",
            ArtistsProcessing => "artists_processing",
            MastersProcessing => "masters_processing",
            ReleasesProcessing => "releases_processing",
            MasterGenresCollection => "master_genres_collection",
            MasterGenresUpsert => "master_genres_upsert",
            MasterGenreAssociations => "master_genre_associations",
            ReleaseGenresCollection => "release_genres_collection",
            ReleaseGenresUpsert => "release_genres_upsert",
            ReleaseGenreAssociations => "release_genre_associations",
            ReleaseLabelAssociations => "release_label_associations",
            MasterArtistAssociations => "master_artist_associations",
            ReleaseArtistAssociations => "release_artist_associations",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.as_str() == s)
    }
}

impl fmt::Display for ProcessingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
