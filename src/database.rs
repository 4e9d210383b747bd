use std::collections::HashSet;

use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::DatabaseErrorKind;
use diesel::*;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::Error;
use crate::extractors::Source;
use crate::models::{
    ConflictReason,
    DedupStats,
    FilteringTotals,
    GroupStats,
    NewEntry,
    NewFilteringStat,
    SourceStats,
};
use crate::utils::accession_root;


type PgPool = Pool<ConnectionManager<PgConnection>>;


const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS entries (
        id SERIAL PRIMARY KEY,
        source VARCHAR(50),
        accession VARCHAR(100),
        s3_genome_path TEXT,
        s3_protein_path TEXT,
        sequence_hash VARCHAR(64),
        total_bp BIGINT,
        species TEXT,
        kingdom TEXT,
        origin TEXT,
        status VARCHAR(50),
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS filtering_stats (
        id SERIAL PRIMARY KEY,
        source VARCHAR(50),
        accession VARCHAR(100),
        total_contigs INT,
        contigs_kept INT,
        contigs_removed INT,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )",
    // additive migration for catalogs created before these columns existed
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS source VARCHAR(50)",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS accession VARCHAR(100)",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS s3_genome_path TEXT",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS s3_protein_path TEXT",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS sequence_hash VARCHAR(64)",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS total_bp BIGINT",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS species TEXT",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS kingdom TEXT",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS origin TEXT",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS status VARCHAR(50)",
    "ALTER TABLE entries ADD COLUMN IF NOT EXISTS created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP",
    "CREATE INDEX IF NOT EXISTS idx_entries_accession ON entries(accession)",
    "CREATE INDEX IF NOT EXISTS idx_entries_species ON entries(species)",
    "CREATE INDEX IF NOT EXISTS idx_entries_kingdom ON entries(kingdom)",
    "CREATE INDEX IF NOT EXISTS idx_entries_origin ON entries(origin)",
    "CREATE INDEX IF NOT EXISTS idx_entries_source ON entries(source)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_entries_sequence_hash ON entries(sequence_hash)",
];

const UNIQUE_SOURCE_ACCESSION: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_entries_source_accession ON entries(source, accession)";

// keep the lowest primary key per duplicated (source, accession) group
const DEDUPLICATE_LEGACY_ROWS: &str = "DELETE FROM entries e
    USING (
        SELECT source, accession, MIN(id) AS keep_id
        FROM entries
        WHERE source IS NOT NULL AND accession IS NOT NULL
        GROUP BY source, accession
        HAVING COUNT(*) > 1
    ) d
    WHERE e.source = d.source
      AND e.accession = d.accession
      AND e.id <> d.keep_id";


#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the catalog and bring the schema up to date.
    ///
    /// The pool must fit all pipeline workers plus the stats reader and the
    /// migration connection, otherwise a saturated batch can deadlock waiting
    /// on itself.
    pub fn connect(config: &Config) -> Result<Database, Error> {
        let url = dotenvy::var("DATABASE_URL").unwrap_or_else(|_| config.aws.rds.connection_string.clone());

        let max_connections = config.processing.db_max_connections.max(config.processing.workers as u32 + 2);
        let manager = ConnectionManager::<PgConnection>::new(url);
        let pool = Pool::builder().max_size(max_connections).build(manager)?;

        let database = Database { pool };
        database.ensure_schema()?;

        info!(max_connections, "Database connected");
        Ok(database)
    }

    /// Additive, idempotent schema migration. Every statement runs in
    /// autocommit so a partial failure leaves previously applied statements
    /// in place for the next start.
    fn ensure_schema(&self) -> Result<(), Error> {
        let mut conn = self.pool.get()?;

        for statement in SCHEMA_STATEMENTS {
            sql_query(*statement).execute(&mut conn)?;
        }

        if let Err(err) = sql_query(UNIQUE_SOURCE_ACCESSION).execute(&mut conn) {
            match err {
                result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    // legacy catalogs can carry duplicate rows from before the
                    // unique index existed. one-time cleanup, then retry.
                    warn!("Duplicate (source, accession) rows found, deduplicating");
                    sql_query(DEDUPLICATE_LEGACY_ROWS).execute(&mut conn)?;
                    sql_query(UNIQUE_SOURCE_ACCESSION).execute(&mut conn)?;
                    info!("Legacy rows deduplicated and unique index created");
                }
                other => return Err(other.into()),
            }
        }

        Ok(())
    }

    /// Insert a catalog entry, tolerating races on both uniqueness keys.
    ///
    /// Concurrent writers competing on the same sequence hash or the same
    /// (source, accession) pair see exactly one success; the losers get the
    /// conflict reason instead of an error.
    pub fn insert_entry(&self, entry: &NewEntry) -> Result<(bool, Option<ConflictReason>), Error> {
        use crate::schema::entries::dsl::*;
        let mut conn = self.pool.get()?;

        let inserted = diesel::insert_into(entries)
            .values(entry)
            .on_conflict_do_nothing()
            .execute(&mut conn)?;

        if inserted > 0 {
            return Ok((true, None));
        }

        if let Some(hash) = &entry.sequence_hash {
            let hash_hit = entries
                .filter(sequence_hash.eq(hash))
                .select(id)
                .first::<i32>(&mut conn)
                .optional()?;
            if hash_hit.is_some() {
                return Ok((false, Some(ConflictReason::Hash)));
            }
        }

        let accession_hit = entries
            .filter(source.eq(&entry.source))
            .filter(accession.eq(&entry.accession))
            .select(id)
            .first::<i32>(&mut conn)
            .optional()?;
        if accession_hit.is_some() {
            return Ok((false, Some(ConflictReason::Accession)));
        }

        Ok((false, Some(ConflictReason::Unknown)))
    }

    /// True when any row carries this accession, regardless of source.
    pub fn entry_exists(&self, token: &str) -> Result<bool, Error> {
        use crate::schema::entries::dsl::*;
        let mut conn = self.pool.get()?;

        let hit = entries
            .filter(accession.eq(token))
            .select(id)
            .first::<i32>(&mut conn)
            .optional()?;

        Ok(hit.is_some())
    }

    pub fn insert_filtering_stat(&self, stat: &NewFilteringStat) -> Result<(), Error> {
        use crate::schema::filtering_stats::dsl::*;
        let mut conn = self.pool.get()?;

        diesel::insert_into(filtering_stats).values(stat).execute(&mut conn)?;
        Ok(())
    }

    /// Snapshot of every known sequence hash, materialized once at startup
    /// into the in-process dedup set.
    pub fn existing_hashes(&self) -> Result<HashSet<String>, Error> {
        use crate::schema::entries::dsl::*;
        let mut conn = self.pool.get()?;

        let hashes = entries
            .filter(sequence_hash.is_not_null())
            .select(sequence_hash)
            .load::<Option<String>>(&mut conn)?;

        Ok(hashes.into_iter().flatten().collect())
    }

    /// All accessions previously ingested for a source, in both their full
    /// and version-stripped forms. Adapters consult this before paying for a
    /// per-accession existence probe.
    pub fn existing_accessions(&self, for_source: Source) -> Result<HashSet<String>, Error> {
        use crate::schema::entries::dsl::*;
        let mut conn = self.pool.get()?;

        let rows = entries
            .filter(source.eq(for_source.as_str()))
            .select(accession)
            .distinct()
            .load::<Option<String>>(&mut conn)?;

        let mut tokens = HashSet::new();
        for acc in rows.into_iter().flatten() {
            tokens.insert(accession_root(&acc).to_string());
            tokens.insert(acc);
        }

        Ok(tokens)
    }

    pub fn stats_by_source(&self) -> Result<Vec<SourceStats>, Error> {
        let mut conn = self.pool.get()?;

        let rows = sql_query(
            "SELECT COALESCE(source, 'unknown') AS source,
                    COUNT(*)::BIGINT AS entries,
                    COALESCE(SUM(total_bp), 0)::BIGINT AS total_bp,
                    COUNT(DISTINCT species)::BIGINT AS species_count
             FROM entries
             GROUP BY COALESCE(source, 'unknown')
             ORDER BY source",
        )
        .load::<SourceStats>(&mut conn)?;

        Ok(rows)
    }

    /// Kingdom rollups are meaningful for the genome-bearing sources only.
    pub fn counts_by_kingdom(&self) -> Result<Vec<GroupStats>, Error> {
        let mut conn = self.pool.get()?;

        let rows = sql_query(
            "SELECT COALESCE(NULLIF(TRIM(kingdom), ''), 'Unknown') AS label,
                    COUNT(*)::BIGINT AS entries,
                    COALESCE(SUM(total_bp), 0)::BIGINT AS total_bp,
                    COUNT(DISTINCT species)::BIGINT AS species_count
             FROM entries
             WHERE source IN ('ncbi', 'ena')
             GROUP BY COALESCE(NULLIF(TRIM(kingdom), ''), 'Unknown')
             ORDER BY entries DESC",
        )
        .load::<GroupStats>(&mut conn)?;

        Ok(rows)
    }

    /// Origin rollups cover the metagenome source only.
    pub fn counts_by_origin(&self) -> Result<Vec<GroupStats>, Error> {
        let mut conn = self.pool.get()?;

        let rows = sql_query(
            "SELECT COALESCE(NULLIF(TRIM(origin), ''), 'Unknown') AS label,
                    COUNT(*)::BIGINT AS entries,
                    COALESCE(SUM(total_bp), 0)::BIGINT AS total_bp,
                    COUNT(DISTINCT species)::BIGINT AS species_count
             FROM entries
             WHERE source = 'mgnify'
             GROUP BY COALESCE(NULLIF(TRIM(origin), ''), 'Unknown')
             ORDER BY entries DESC",
        )
        .load::<GroupStats>(&mut conn)?;

        Ok(rows)
    }

    pub fn dedup_stats(&self) -> Result<DedupStats, Error> {
        let mut conn = self.pool.get()?;

        let stats = sql_query(
            "SELECT COUNT(*)::BIGINT AS total_entries,
                    COUNT(DISTINCT COALESCE(sequence_hash, accession))::BIGINT AS unique_entries,
                    (COUNT(*) - COUNT(DISTINCT COALESCE(sequence_hash, accession)))::BIGINT AS duplicate_entries
             FROM entries",
        )
        .get_result::<DedupStats>(&mut conn)?;

        Ok(stats)
    }

    pub fn filtering_stats(&self) -> Result<FilteringTotals, Error> {
        let mut conn = self.pool.get()?;

        let totals = sql_query(
            "SELECT COALESCE(SUM(total_contigs), 0)::BIGINT AS total_contigs,
                    COALESCE(SUM(contigs_kept), 0)::BIGINT AS contigs_kept,
                    COALESCE(SUM(contigs_removed), 0)::BIGINT AS contigs_removed
             FROM filtering_stats",
        )
        .get_result::<FilteringTotals>(&mut conn)?;

        Ok(totals)
    }
}
