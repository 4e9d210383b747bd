pub mod ena;
pub mod errors;
pub mod mgnify;
pub mod ncbi;

use std::collections::HashSet;
use std::path::PathBuf;

use serde::Deserialize;


/// The public archives the pipeline ingests from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Ncbi,
    Ena,
    Mgnify,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Ncbi => "ncbi",
            Source::Ena => "ena",
            Source::Mgnify => "mgnify",
        }
    }

    /// Metagenome sources go through contig filtering and the metagenomic
    /// prediction mode instead of the single-genome path.
    pub fn is_metagenome(&self) -> bool {
        matches!(self, Source::Mgnify)
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}


/// A downloaded payload sitting in the workspace, ready for the per-item
/// pipeline.
#[derive(Debug, Clone)]
pub struct LocalItem {
    pub path: PathBuf,
}

/// Archive-provided context for an accession. Kingdom applies to genomes,
/// origin to metagenomes; an adapter never populates both.
#[derive(Debug, Clone, Default)]
pub struct SourceMetadata {
    pub kingdom: Option<String>,
    pub origin: Option<String>,
    pub species: Option<String>,
}


/// Capability set shared by all archive adapters.
///
/// Adapters record every token they decide to download into `seen` so that
/// later batches and other adapters skip in-flight accessions whose catalog
/// rows have not landed yet.
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Fetch up to `limit` new items into the workspace.
    fn download_batch(&mut self, limit: usize, seen: &mut HashSet<String>) -> Vec<LocalItem>;

    fn metadata(&self, accession: &str) -> Option<SourceMetadata>;

    /// True once the adapter knows its enumeration has nothing further to
    /// offer in this run.
    fn exhausted(&self) -> bool {
        false
    }
}
