use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use rayon::prelude::*;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::Database;
use crate::disk::DiskManager;
use crate::errors::Error;
use crate::extractors::ena::EnaAdapter;
use crate::extractors::mgnify::MgnifyAdapter;
use crate::extractors::ncbi::NcbiAdapter;
use crate::extractors::{LocalItem, Source, SourceAdapter};
use crate::models::{ConflictReason, NewEntry, NewFilteringStat};
use crate::predictor::GenePredictor;
use crate::sequence;
use crate::storage::ObjectStore;
use crate::utils::{accession_forms, clean_species};


/// High-duplication regions of a catalog can produce whole batches of
/// already-seen accessions; the source is only abandoned after this many
/// empty batches in a row.
const MAX_EMPTY_BATCHES: usize = 5;


pub struct Pipeline {
    config: Config,
    db: Database,
    store: ObjectStore,
    disk: DiskManager,
    predictor: GenePredictor,
    known_hashes: Mutex<HashSet<String>>,
    pool: rayon::ThreadPool,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Pipeline, Error> {
        fs::create_dir_all(&config.paths.base_data)?;
        fs::create_dir_all(&config.paths.temp)?;

        let db = Database::connect(&config)?;
        let store = ObjectStore::connect(&config)?;
        let known_hashes = db.existing_hashes()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.processing.workers)
            .build()?;

        info!(
            existing_hashes = known_hashes.len(),
            workers = config.processing.workers,
            "Pipeline initialized",
        );

        Ok(Pipeline {
            config,
            db,
            store,
            disk: DiskManager::new(),
            predictor: GenePredictor::new(),
            known_hashes: Mutex::new(known_hashes),
            pool,
        })
    }

    pub fn run(&mut self) -> Result<(), Error> {
        info!("Starting ETL pipeline");

        // accessions claimed by any adapter this run, before their catalog
        // rows have landed
        let mut seen = HashSet::new();

        for source in self.config.sources.order.clone() {
            if !self.config.sources.enabled(source) {
                info!(%source, "Source disabled, skipping");
                continue;
            }

            info!(%source, "Processing source");
            let mut adapter = self.build_adapter(source)?;
            self.process_source(source, adapter.as_mut(), &mut seen);
        }

        self.log_final_stats();
        info!("Pipeline complete");
        Ok(())
    }

    fn build_adapter(&self, source: Source) -> Result<Box<dyn SourceAdapter>, Error> {
        Ok(match source {
            Source::Ncbi => Box::new(NcbiAdapter::new(&self.config, &self.db)?),
            Source::Ena => Box::new(EnaAdapter::new(&self.config, &self.db)?),
            Source::Mgnify => Box::new(MgnifyAdapter::new(&self.config, &self.db)?),
        })
    }

    /// Batched extraction loop for one source. Batches are sequential;
    /// items within a batch run on the worker pool.
    fn process_source(&self, source: Source, adapter: &mut dyn SourceAdapter, seen: &mut HashSet<String>) {
        let batch_size = self.config.sources.batch_size(source);
        let limit = self.config.sources.limit(source);
        let min_free_gb = self.config.processing.min_free_gb;
        let is_metagenome = source.is_metagenome();

        let mut total_processed = 0usize;
        let mut batch_number = 0usize;
        let mut consecutive_empty = 0usize;

        while total_processed < limit {
            let purge_roots = [self.config.paths.temp.as_path(), self.config.paths.base_data.as_path()];
            if !self.disk.ensure_free_space(min_free_gb, &purge_roots) {
                error!(%source, min_free_gb, "Cannot ensure free space, aborting batch loop");
                return;
            }

            batch_number += 1;
            let current = batch_size.min(limit - total_processed);
            info!(%source, batch = batch_number, requested = current, "Extracting batch");

            let files = adapter.download_batch(current, seen);

            if files.is_empty() {
                if adapter.exhausted() {
                    info!(%source, "Source exhausted");
                    break;
                }

                consecutive_empty += 1;
                if consecutive_empty >= MAX_EMPTY_BATCHES {
                    info!(%source, batches = consecutive_empty, "Consecutive empty batches, stopping source");
                    break;
                }
                info!(
                    %source,
                    empty = consecutive_empty,
                    max = MAX_EMPTY_BATCHES,
                    "Empty batch, trying the next window",
                );
                continue;
            }
            consecutive_empty = 0;

            info!(%source, files = files.len(), "Batch extracted");

            let adapter_ref: &dyn SourceAdapter = adapter;
            let results: Vec<(bool, PathBuf)> = self.pool.install(|| {
                files
                    .par_iter()
                    .map(|item| {
                        let success = self.process_item(source, item, adapter_ref, is_metagenome);
                        (success, item.path.clone())
                    })
                    .collect()
            });

            let processed: Vec<PathBuf> = results
                .into_iter()
                .filter(|(success, _)| *success)
                .map(|(_, path)| path)
                .collect();
            total_processed += processed.len();

            info!(%source, processed = processed.len(), total = total_processed, "Batch processed");

            // payloads are destroyed right after upload; this catches any
            // remnant left beside them
            self.disk.cleanup_files(&processed);
        }

        info!(%source, total = total_processed, "Source complete");
    }

    /// One attempt per item. Failures before upload leave nothing behind in
    /// the object store; failures between the two uploads may orphan a
    /// genome object, which is acceptable.
    fn process_item(&self, source: Source, item: &LocalItem, adapter: &dyn SourceAdapter, is_metagenome: bool) -> bool {
        match self.etl_single_file(source, item, adapter, is_metagenome) {
            Ok(success) => success,
            Err(err) => {
                error!(%source, file = %item.path.display(), %err, "Item failed");
                false
            }
        }
    }

    fn etl_single_file(
        &self,
        source: Source,
        item: &LocalItem,
        adapter: &dyn SourceAdapter,
        is_metagenome: bool,
    ) -> Result<bool, Error> {
        let path = &item.path;

        let purge_roots = [self.config.paths.temp.as_path()];
        if !self.disk.ensure_free_space(self.config.processing.min_free_gb, &purge_roots) {
            error!(file = %path.display(), "Low disk during item, skipping");
            return Ok(false);
        }

        let Some(valid_path) = sequence::validate_and_fix(path) else {
            warn!(file = %path.display(), "Validation failed");
            return Ok(false);
        };

        let (acc_full, acc_root) = accession_forms(path);
        let meta = adapter
            .metadata(&acc_full)
            .or_else(|| adapter.metadata(&acc_root))
            .unwrap_or_default();
        let kingdom = if is_metagenome { None } else { meta.kingdom };
        let origin = if is_metagenome { meta.origin } else { None };

        // CDS exports carry gene headers, not organism headers
        let name_lower = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let species_parsed = if !name_lower.contains("cds_from_genomic") && !name_lower.contains("cds-") {
            sequence::parse_species(&valid_path)
        } else {
            None
        };
        let species = clean_species(species_parsed.as_deref()).or_else(|| clean_species(meta.species.as_deref()));

        let Some(hash) = sequence::sequence_hash(&valid_path)? else {
            warn!(file = %path.display(), "No usable sequence to hash");
            return Ok(false);
        };

        {
            let mut hashes = self.known_hashes.lock().expect("known hashes lock poisoned");
            if !hashes.insert(hash.clone()) {
                info!(accession = %acc_full, "Duplicate sequence (in-memory)");
                return Ok(false);
            }
        }

        let working_path = if is_metagenome {
            let min_length = self.config.filtering.metagenomes.min_contig_length;
            let (filtered, outcome) = sequence::filter_contigs(&valid_path, min_length)?;

            self.db.insert_filtering_stat(&NewFilteringStat {
                source: source.as_str().to_string(),
                accession: acc_full.clone(),
                total_contigs: outcome.total,
                contigs_kept: outcome.kept,
                contigs_removed: outcome.removed,
            })?;

            filtered
        } else {
            valid_path.clone()
        };

        let total_bp = sequence::total_bp(&working_path)? as i64;

        let work_dir = self.config.paths.temp.join(&acc_full);
        let prediction = if is_metagenome {
            self.predictor.predict_metagenome(&working_path, &work_dir)
        } else {
            self.predictor.predict_single(&working_path)
        };
        let protein_gz = match prediction {
            Ok(proteins) => proteins,
            Err(err) => {
                warn!(accession = %acc_full, %err, "Protein prediction failed");
                return Ok(false);
            }
        };

        let genome_gz = match sequence::ensure_gz(&working_path) {
            Ok(compressed) => compressed,
            Err(err) => {
                warn!(accession = %acc_full, %err, "Failed to compress genome payload");
                return Ok(false);
            }
        };

        let Some(genome_uri) = self.store.upload_genome(&genome_gz, source, &acc_full) else {
            error!(accession = %acc_full, "Genome upload failed");
            return Ok(false);
        };
        self.disk.cleanup_files(&[genome_gz]);

        let Some(protein_uri) = self.store.upload_proteins(&protein_gz, source, &acc_full) else {
            error!(accession = %acc_full, "Protein upload failed");
            return Ok(false);
        };
        self.disk.cleanup_files(&[protein_gz]);

        let entry = NewEntry {
            source: source.as_str().to_string(),
            accession: acc_full.clone(),
            s3_genome_path: genome_uri,
            s3_protein_path: protein_uri,
            sequence_hash: Some(hash),
            total_bp,
            species,
            kingdom,
            origin,
            status: "uploaded".to_string(),
        };

        let (inserted, reason) = self.db.insert_entry(&entry)?;
        if !inserted {
            let reason = reason.unwrap_or(ConflictReason::Unknown);
            info!(%source, accession = %acc_full, reason = reason.as_str(), "Duplicate entry (database race)");
            return Ok(false);
        }

        info!(
            accession = %acc_full,
            total_bp,
            species = entry.species.as_deref().unwrap_or(""),
            kingdom = entry.kingdom.as_deref().unwrap_or(""),
            origin = entry.origin.as_deref().unwrap_or(""),
            "Entry loaded",
        );

        if is_metagenome {
            self.disk.cleanup_directory(&work_dir);
        }

        Ok(true)
    }

    fn log_final_stats(&self) {
        info!("Final statistics");

        match self.db.stats_by_source() {
            Ok(rows) => {
                for row in rows {
                    info!(
                        source = %row.source,
                        entries = row.entries,
                        total_bp = row.total_bp,
                        species = row.species_count,
                        "Source totals",
                    );
                }
            }
            Err(err) => warn!(%err, "Failed to read source statistics"),
        }

        match self.db.counts_by_kingdom() {
            Ok(rows) => {
                for row in rows {
                    info!(kingdom = %row.label, entries = row.entries, total_bp = row.total_bp, "Kingdom totals");
                }
            }
            Err(err) => warn!(%err, "Failed to read kingdom statistics"),
        }

        match self.db.counts_by_origin() {
            Ok(rows) => {
                for row in rows {
                    info!(origin = %row.label, entries = row.entries, total_bp = row.total_bp, "Origin totals");
                }
            }
            Err(err) => warn!(%err, "Failed to read origin statistics"),
        }

        match self.db.dedup_stats() {
            Ok(stats) => info!(
                total = stats.total_entries,
                unique = stats.unique_entries,
                duplicates = stats.duplicate_entries,
                "Deduplication totals",
            ),
            Err(err) => warn!(%err, "Failed to read dedup statistics"),
        }

        match self.db.filtering_stats() {
            Ok(totals) => info!(
                total_contigs = totals.total_contigs,
                kept = totals.contigs_kept,
                removed = totals.contigs_removed,
                "Filtering totals",
            ),
            Err(err) => warn!(%err, "Failed to read filtering statistics"),
        }
    }
}
