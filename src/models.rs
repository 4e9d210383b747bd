use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};

use crate::schema::{entries, filtering_stats};


/// A catalog row for a successfully ingested genome or metagenome.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = entries)]
pub struct NewEntry {
    pub source: String,
    pub accession: String,
    pub s3_genome_path: String,
    pub s3_protein_path: String,
    pub sequence_hash: Option<String>,
    pub total_bp: i64,
    pub species: Option<String>,
    pub kingdom: Option<String>,
    pub origin: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = filtering_stats)]
pub struct NewFilteringStat {
    pub source: String,
    pub accession: String,
    pub total_contigs: i32,
    pub contigs_kept: i32,
    pub contigs_removed: i32,
}


/// Why an insert found no room in the catalog.
///
/// The insert itself never raises on conflict; the reason is recovered by
/// probing the two unique indexes afterwards, hash first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    Hash,
    Accession,
    Unknown,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::Hash => "hash_conflict",
            ConflictReason::Accession => "accession_conflict",
            ConflictReason::Unknown => "conflict",
        }
    }
}


#[derive(Debug, QueryableByName)]
pub struct SourceStats {
    #[diesel(sql_type = Text)]
    pub source: String,
    #[diesel(sql_type = BigInt)]
    pub entries: i64,
    #[diesel(sql_type = BigInt)]
    pub total_bp: i64,
    #[diesel(sql_type = BigInt)]
    pub species_count: i64,
}

/// A per-kingdom or per-origin rollup row.
#[derive(Debug, QueryableByName)]
pub struct GroupStats {
    #[diesel(sql_type = Text)]
    pub label: String,
    #[diesel(sql_type = BigInt)]
    pub entries: i64,
    #[diesel(sql_type = BigInt)]
    pub total_bp: i64,
    #[diesel(sql_type = BigInt)]
    pub species_count: i64,
}

#[derive(Debug, QueryableByName)]
pub struct DedupStats {
    #[diesel(sql_type = BigInt)]
    pub total_entries: i64,
    #[diesel(sql_type = BigInt)]
    pub unique_entries: i64,
    #[diesel(sql_type = BigInt)]
    pub duplicate_entries: i64,
}

#[derive(Debug, QueryableByName)]
pub struct FilteringTotals {
    #[diesel(sql_type = BigInt)]
    pub total_contigs: i64,
    #[diesel(sql_type = BigInt)]
    pub contigs_kept: i64,
    #[diesel(sql_type = BigInt)]
    pub contigs_removed: i64,
}
