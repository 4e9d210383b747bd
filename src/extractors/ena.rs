use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use ureq::Agent;

use super::errors::ExtractError;
use super::{LocalItem, Source, SourceAdapter, SourceMetadata};
use crate::config::Config;
use crate::database::Database;
use crate::errors::Error;
use crate::utils::{accession_root, new_spinner};


const TSV_API: &str = "https://www.ebi.ac.uk/ena/browser/api/tsv/textsearch";
const PORTAL_API: &str = "https://www.ebi.ac.uk/ena/portal/api/search";
const FASTA_API: &str = "https://www.ebi.ac.uk/ena/browser/api/fasta";
const VIEW_API: &str = "https://www.ebi.ac.uk/ena/data/view";

const CATALOG_QUERY: &str = "prokaryotic whole genome sequences";
const CATALOG_TIMEOUT: Duration = Duration::from_secs(120);
const PORTAL_FIELDS: &str = "accession,scientific_name,assembly_level,tax_division,base_count";

/// Enrichment is a nicety, so it is capped to keep startup bounded.
const ENRICH_LIMIT: usize = 1000;
const ENRICH_BATCH: usize = 50;
const ENRICH_PAUSE: Duration = Duration::from_millis(500);

const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Error pages and stub responses fit under this; real assemblies do not.
const DOWNLOAD_MIN_BYTES: u64 = 1000;

const ARCHAEAL_GENERA: &[&str] = &[
    "methanobacterium",
    "halobacterium",
    "thermococcus",
    "pyrococcus",
    "sulfolobus",
    "methanococcus",
];


#[derive(Debug, Clone, Deserialize)]
struct CatalogRow {
    accession: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnaMetadata {
    pub kingdom: String,
    pub species: Option<String>,
    pub description: String,
    pub assembly_level: String,
    pub scientific_name: String,
    #[serde(default)]
    pub tax_division: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PortalAssembly {
    accession: String,
    #[serde(default)]
    scientific_name: String,
    #[serde(default)]
    assembly_level: String,
    #[serde(default)]
    tax_division: String,
}


/// Assembly ingestion from the cached ENA text-search catalog.
///
/// Unlike the other adapters this one is stateful across batches: a cursor
/// walks the catalog rows and `catalog_exhausted` flips once it runs off the
/// end.
pub struct EnaAdapter {
    db: Database,
    agent: Agent,
    base_dir: PathBuf,
    max_retries: usize,
    kingdoms: Vec<String>,
    metadata_cache: PathBuf,
    catalog: Vec<CatalogRow>,
    metadata: HashMap<String, EnaMetadata>,
    cursor: usize,
    catalog_exhausted: bool,
    existing: HashSet<String>,
}

impl EnaAdapter {
    pub fn new(config: &Config, db: &Database) -> Result<EnaAdapter, Error> {
        let base_dir = config.paths.base_data.join("ena");
        fs::create_dir_all(&base_dir)?;

        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.processing.download_timeout)))
            .build()
            .into();

        let existing = db.existing_accessions(Source::Ena)?;
        info!(existing = existing.len(), "ENA adapter ready");

        let mut adapter = EnaAdapter {
            db: db.clone(),
            agent,
            metadata_cache: base_dir.join("ena_metadata.json"),
            base_dir,
            max_retries: config.processing.max_retries,
            kingdoms: config.sources.ena.kingdoms.clone(),
            catalog: Vec::new(),
            metadata: HashMap::new(),
            cursor: 0,
            catalog_exhausted: false,
            existing,
        };

        adapter.ensure_catalog();
        adapter.ensure_metadata();
        Ok(adapter)
    }

    /// Load the cached TSV catalog, downloading it once when missing. A
    /// failed download degrades to an empty catalog rather than killing the
    /// run; the batch loop then reports the source exhausted.
    fn ensure_catalog(&mut self) {
        let tsv_cache = self.base_dir.join("ena_catalog.tsv");

        if !tsv_cache.exists() {
            info!("Downloading ENA assembly catalog");
            if let Err(err) = self.download_catalog(&tsv_cache) {
                error!(%err, "Failed to download ENA catalog");
                return;
            }
        }

        match load_catalog(&tsv_cache) {
            Ok(rows) => {
                info!(assemblies = rows.len(), "ENA catalog loaded");
                self.catalog = rows;
            }
            Err(err) => {
                error!(%err, "Failed to parse ENA catalog");
            }
        }
    }

    fn download_catalog(&self, dest: &PathBuf) -> Result<(), ExtractError> {
        // the full catalog takes a while to assemble server side, so this
        // request gets its own generous budget
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(CATALOG_TIMEOUT))
            .build()
            .into();

        let spinner = new_spinner("Downloading ENA catalog");
        let mut response = agent
            .get(TSV_API)
            .query("domain", "genome_assembly")
            .query("query", CATALOG_QUERY)
            .call()?;

        if !response.status().is_success() {
            error!(status = response.status().as_u16(), "ENA catalog request failed");
            return Err(ExtractError::RequestFailed);
        }

        let mut reader = BufReader::new(response.body_mut().as_reader());
        let mut writer = BufWriter::new(File::create(dest)?);
        io::copy(&mut reader, &mut writer)?;
        io::Write::flush(&mut writer)?;
        spinner.finish();

        Ok(())
    }

    /// Metadata comes from the JSON cache when present, otherwise it is
    /// derived from the catalog descriptions and optionally enriched through
    /// the portal API before being cached for the next run.
    fn ensure_metadata(&mut self) {
        if self.metadata_cache.exists() {
            match load_metadata_cache(&self.metadata_cache) {
                Ok(metadata) => {
                    info!(accessions = metadata.len(), "ENA metadata cache loaded");
                    self.metadata = metadata;
                    return;
                }
                Err(err) => warn!(%err, "Failed to load ENA metadata cache, rebuilding"),
            }
        }

        for row in &self.catalog {
            let accession = row.accession.trim();
            if accession.is_empty() {
                continue;
            }

            let species = species_from_description(&row.description);
            let entry = EnaMetadata {
                kingdom: infer_kingdom_from_species(species.as_deref()),
                scientific_name: species.clone().unwrap_or_else(|| "Unknown".to_string()),
                species,
                description: row.description.clone(),
                assembly_level: "unknown".to_string(),
                tax_division: None,
            };

            self.metadata.insert(accession_root(accession).to_string(), entry.clone());
            self.metadata.insert(accession.to_string(), entry);
        }
        info!(accessions = self.metadata.len(), "ENA metadata derived from descriptions");

        if self.portal_available() {
            self.enrich_metadata();
        }

        if let Err(err) = save_metadata_cache(&self.metadata_cache, &self.metadata) {
            warn!(%err, "Failed to save ENA metadata cache");
        }
    }

    /// One cheap probe decides whether enrichment runs at all; restricted
    /// networks fail it once instead of stalling every batch.
    fn portal_available(&self) -> bool {
        let sample: Vec<&String> = self.metadata.keys().take(3).collect();
        if sample.is_empty() {
            return false;
        }

        let query = sample
            .iter()
            .map(|acc| format!("accession=\"{}\"", accession_root(acc)))
            .collect::<Vec<_>>()
            .join(" OR ");

        match self.portal_search(&query) {
            Ok(rows) if !rows.is_empty() => {
                info!("ENA portal API available, enriching metadata");
                true
            }
            Ok(_) => {
                info!("ENA portal API returned no data, using description metadata");
                false
            }
            Err(err) => {
                info!(%err, "ENA portal API unavailable, using description metadata");
                false
            }
        }
    }

    fn portal_search(&self, query: &str) -> Result<Vec<PortalAssembly>, ExtractError> {
        let mut response = self
            .agent
            .get(PORTAL_API)
            .query("result", "assembly")
            .query("query", query)
            .query("fields", PORTAL_FIELDS)
            .query("format", "json")
            .query("dataPortal", "ena")
            .call()?;

        if !response.status().is_success() {
            return Err(ExtractError::RequestFailed);
        }

        Ok(response.body_mut().read_json::<Vec<PortalAssembly>>()?)
    }

    fn enrich_metadata(&mut self) {
        let mut roots: Vec<String> = self
            .metadata
            .keys()
            .filter(|key| key.contains('.'))
            .map(|key| accession_root(key).to_string())
            .collect();
        roots.sort();
        roots.dedup();
        roots.truncate(ENRICH_LIMIT);

        let mut enriched = 0usize;
        for batch in roots.chunks(ENRICH_BATCH) {
            let query = batch
                .iter()
                .map(|acc| format!("accession=\"{acc}\""))
                .collect::<Vec<_>>()
                .join(" OR ");

            match self.portal_search(&query) {
                Ok(rows) => {
                    for row in rows {
                        enriched += self.apply_enrichment(&row);
                    }
                }
                Err(err) => {
                    debug!(%err, "ENA enrichment batch failed");
                    continue;
                }
            }

            std::thread::sleep(ENRICH_PAUSE);
        }

        info!(enriched, "ENA metadata enrichment complete");
    }

    fn apply_enrichment(&mut self, row: &PortalAssembly) -> usize {
        let root = accession_root(&row.accession).to_string();
        let keys: Vec<String> = self
            .metadata
            .keys()
            .filter(|key| accession_root(key) == root)
            .cloned()
            .collect();

        for key in &keys {
            if let Some(entry) = self.metadata.get_mut(key) {
                entry.assembly_level = row.assembly_level.clone();
                entry.tax_division = Some(row.tax_division.clone());
                entry.kingdom = infer_kingdom_from_tax_division(&row.tax_division);
                if !row.scientific_name.is_empty() {
                    entry.scientific_name = row.scientific_name.clone();
                }
            }
        }

        usize::from(!keys.is_empty())
    }

    fn kingdom_for(&self, accession: &str) -> String {
        self.metadata
            .get(accession)
            .map(|meta| meta.kingdom.clone())
            .unwrap_or_else(|| "bacteria".to_string())
    }

    /// Download an assembly's FASTA, trying each endpoint in order with
    /// backoff. A download only counts when the payload starts with the
    /// FASTA marker and is big enough to be real sequence.
    fn download_assembly(&self, accession: &str) -> Option<PathBuf> {
        let root = accession_root(accession);
        let endpoints = [
            format!("{FASTA_API}/{root}?download=true"),
            format!("{VIEW_API}/{root}&display=fasta&download=fasta"),
            format!("{VIEW_API}/{root}&display=fasta"),
        ];

        let dest = self.base_dir.join(format!("{accession}.fasta"));
        if usable_download(&dest) {
            debug!(accession, "Assembly already downloaded");
            return Some(dest);
        }

        for endpoint in &endpoints {
            for attempt in 0..self.max_retries {
                if attempt > 0 {
                    std::thread::sleep(RETRY_BACKOFF);
                }

                match self.try_download(endpoint, &dest) {
                    Ok(true) => {
                        info!(accession, "Assembly downloaded");
                        return Some(dest);
                    }
                    Ok(false) => continue,
                    Err(err) => {
                        debug!(accession, endpoint, %err, "Download attempt failed");
                        continue;
                    }
                }
            }

            if usable_download(&dest) {
                return Some(dest);
            }
        }

        error!(accession, "Failed to download assembly");
        None
    }

    fn try_download(&self, endpoint: &str, dest: &PathBuf) -> Result<bool, ExtractError> {
        let mut response = self
            .agent
            .get(endpoint)
            .header("Accept", "text/x-fasta,text/plain,*/*")
            .call()?;

        if !response.status().is_success() {
            return Ok(false);
        }

        let partial = dest.with_extension("part");
        let mut reader = BufReader::new(response.body_mut().as_reader());
        let mut writer = BufWriter::new(File::create(&partial)?);
        io::copy(&mut reader, &mut writer)?;
        io::Write::flush(&mut writer)?;
        drop(writer);

        if !usable_download(&partial) {
            fs::remove_file(&partial).ok();
            return Ok(false);
        }

        fs::rename(&partial, dest)?;
        Ok(true)
    }
}

impl SourceAdapter for EnaAdapter {
    fn source(&self) -> Source {
        Source::Ena
    }

    fn download_batch(&mut self, limit: usize, seen: &mut HashSet<String>) -> Vec<LocalItem> {
        if self.catalog.is_empty() {
            warn!("ENA catalog not available");
            self.catalog_exhausted = true;
            return Vec::new();
        }
        if self.catalog_exhausted {
            info!("ENA catalog exhausted");
            return Vec::new();
        }

        let mut candidates = Vec::new();
        let mut skipped_in_db = 0usize;
        let mut skipped_seen = 0usize;
        let mut skipped_kingdom = 0usize;

        while candidates.len() < limit && self.cursor < self.catalog.len() {
            let accession = self.catalog[self.cursor].accession.trim().to_string();
            self.cursor += 1;

            if accession.is_empty() {
                continue;
            }
            let root = accession_root(&accession).to_string();

            if !self.kingdoms.is_empty() && !self.kingdoms.contains(&self.kingdom_for(&accession)) {
                skipped_kingdom += 1;
                continue;
            }
            if self.existing.contains(&accession) || self.existing.contains(&root) {
                skipped_in_db += 1;
                continue;
            }
            if seen.contains(&accession) || seen.contains(&root) {
                skipped_seen += 1;
                continue;
            }

            // the in-memory cache can be stale under races, so candidates
            // still pay for one catalog probe before download
            let in_catalog = self.db.entry_exists(&accession).unwrap_or(false)
                || self.db.entry_exists(&root).unwrap_or(false);
            if in_catalog {
                skipped_in_db += 1;
                self.existing.insert(accession);
                self.existing.insert(root);
                continue;
            }

            candidates.push(accession);
        }

        if self.cursor >= self.catalog.len() {
            self.catalog_exhausted = true;
            info!("Reached the end of the ENA catalog");
        }

        info!(
            position = self.cursor,
            total = self.catalog.len(),
            candidates = candidates.len(),
            skipped_in_db,
            skipped_seen,
            skipped_kingdom,
            "ENA catalog scanned",
        );

        let mut downloaded = Vec::new();
        let mut failed = 0usize;
        for accession in &candidates {
            match self.download_assembly(accession) {
                Some(path) => {
                    seen.insert(accession_root(accession).to_string());
                    seen.insert(accession.clone());
                    downloaded.push(LocalItem { path });
                }
                None => failed += 1,
            }
        }

        info!(downloaded = downloaded.len(), requested = candidates.len(), "ENA batch complete");
        if failed > 0 {
            warn!(failed, "Some ENA assemblies failed to download");
        }
        downloaded
    }

    fn metadata(&self, accession: &str) -> Option<SourceMetadata> {
        self.metadata.get(accession).map(|meta| SourceMetadata {
            kingdom: Some(meta.kingdom.clone()),
            origin: None,
            species: meta.species.clone(),
        })
    }

    fn exhausted(&self) -> bool {
        self.catalog_exhausted
    }
}


fn load_catalog(path: &PathBuf) -> Result<Vec<CatalogRow>, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?;

    let mut rows = Vec::new();
    for row in reader.deserialize::<CatalogRow>() {
        match row {
            Ok(row) => rows.push(row),
            Err(err) => debug!(%err, "Skipping malformed catalog row"),
        }
    }
    Ok(rows)
}

fn load_metadata_cache(path: &PathBuf) -> Result<HashMap<String, EnaMetadata>, ExtractError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

fn save_metadata_cache(path: &PathBuf, metadata: &HashMap<String, EnaMetadata>) -> Result<(), ExtractError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), metadata)?;
    Ok(())
}

fn usable_download(path: &PathBuf) -> bool {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return false,
    };
    if size <= DOWNLOAD_MIN_BYTES {
        return false;
    }

    let mut first = [0u8; 1];
    match File::open(path).and_then(|mut file| file.read_exact(&mut first)) {
        Ok(()) => first[0] == b'>',
        Err(_) => false,
    }
}


static SPECIES_IN_DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)assembly for (.+?)(?:\s+strain|\s+isolate|\s+\d|$)").expect("Invalid species pattern")
});

/// Pull a species name out of a catalog description like
/// "JAANBD01 assembly for Bacillus subtilis strain X".
pub fn species_from_description(description: &str) -> Option<String> {
    let captured = SPECIES_IN_DESCRIPTION.captures(description)?.get(1)?;
    let mut tokens = captured.as_str().split_whitespace();

    let genus = tokens.next()?;
    match tokens.next() {
        Some(species) => Some(format!("{genus} {species}")),
        None => Some(genus.to_string()),
    }
}

/// The text-search catalog is prokaryotic, so anything not recognizably
/// viral or archaeal defaults to bacteria.
pub fn infer_kingdom_from_species(species: Option<&str>) -> String {
    let species = match species {
        Some(species) => species.to_lowercase(),
        None => return "bacteria".to_string(),
    };

    if ["virus", "phage", "viroid"].iter().any(|word| species.contains(word)) {
        return "viral".to_string();
    }
    if ARCHAEAL_GENERA.iter().any(|genus| species.contains(genus)) {
        return "archaea".to_string();
    }

    "bacteria".to_string()
}

pub fn infer_kingdom_from_tax_division(tax_division: &str) -> String {
    let division = tax_division.to_lowercase();

    if division.contains("arch") {
        "archaea".to_string()
    } else if division.contains("vir") {
        "viral".to_string()
    } else {
        "bacteria".to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn species_extraction_from_descriptions() {
        assert_eq!(
            species_from_description("JAANBD01 assembly for Bacillus subtilis strain 168"),
            Some("Bacillus subtilis".to_string()),
        );
        assert_eq!(
            species_from_description("assembly for Methanococcus maripaludis isolate X1"),
            Some("Methanococcus maripaludis".to_string()),
        );
        assert_eq!(
            species_from_description("Assembly For Escherichia coli"),
            Some("Escherichia coli".to_string()),
        );
        assert_eq!(species_from_description("whole genome shotgun sequencing project"), None);
    }

    #[test]
    fn kingdom_inference_from_species_patterns() {
        assert_eq!(infer_kingdom_from_species(Some("Escherichia virus T4")), "viral");
        assert_eq!(infer_kingdom_from_species(Some("Salmonella phage chi")), "viral");
        assert_eq!(infer_kingdom_from_species(Some("Sulfolobus acidocaldarius")), "archaea");
        assert_eq!(infer_kingdom_from_species(Some("Escherichia coli")), "bacteria");
        assert_eq!(infer_kingdom_from_species(None), "bacteria");
    }

    #[test]
    fn kingdom_inference_from_tax_division() {
        assert_eq!(infer_kingdom_from_tax_division("Archaea"), "archaea");
        assert_eq!(infer_kingdom_from_tax_division("Viruses"), "viral");
        assert_eq!(infer_kingdom_from_tax_division("Prokaryotes"), "bacteria");
        assert_eq!(infer_kingdom_from_tax_division(""), "bacteria");
    }
}
