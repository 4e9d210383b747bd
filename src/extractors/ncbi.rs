use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use rayon::prelude::*;
use regex::Regex;
use tracing::{error, info, warn};
use ureq::Agent;

use super::errors::ExtractError;
use super::{LocalItem, Source, SourceAdapter, SourceMetadata};
use crate::config::Config;
use crate::database::Database;
use crate::errors::Error;
use crate::utils::{accession_root, new_progress_bar_bytes};


const SUMMARY_URL_BASE: &str = "https://ftp.ncbi.nlm.nih.gov/genomes/refseq";

/// Anything smaller than this is a failed or truncated summary download.
const SUMMARY_MIN_BYTES: u64 = 1000;

const DOWNLOAD_THREADS: usize = 8;


struct Candidate {
    accession: String,
    ftp_path: String,
}

/// RefSeq assembly ingestion driven by the per-kingdom assembly summaries.
pub struct NcbiAdapter {
    agent: Agent,
    base_dir: PathBuf,
    kingdoms: Vec<String>,
    force_update_summaries: bool,
    require_full_genome: bool,
    metadata: HashMap<String, SourceMetadata>,
    existing: HashSet<String>,
    download_pool: rayon::ThreadPool,
}

impl NcbiAdapter {
    pub fn new(config: &Config, db: &Database) -> Result<NcbiAdapter, Error> {
        let base_dir = config.paths.base_data.join("ncbi");
        fs::create_dir_all(&base_dir)?;

        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.processing.download_timeout)))
            .build()
            .into();

        let existing = db.existing_accessions(Source::Ncbi)?;
        info!(existing = existing.len(), "NCBI adapter ready");

        Ok(NcbiAdapter {
            agent,
            base_dir,
            kingdoms: config.sources.ncbi.kingdoms.clone(),
            force_update_summaries: config.sources.ncbi.force_update_summaries,
            require_full_genome: config.sources.ncbi.require_full_genome,
            metadata: HashMap::new(),
            existing,
            download_pool: rayon::ThreadPoolBuilder::new().num_threads(DOWNLOAD_THREADS).build()?,
        })
    }

    fn mark_processed(&mut self, accession: &str) {
        self.existing.insert(accession_root(accession).to_string());
        self.existing.insert(accession.to_string());
    }

    /// Walk the kingdom's assembly summary and pick the next acceptable
    /// accessions that nothing has claimed yet.
    fn candidates(
        &mut self,
        kingdom: &str,
        limit: usize,
        seen: &HashSet<String>,
    ) -> Result<Vec<Candidate>, ExtractError> {
        let summary_path = self.ensure_summary(kingdom)?;

        let mut candidates = Vec::new();
        let mut skipped_in_cache = 0usize;
        let mut skipped_seen = 0usize;
        let mut skipped_level = 0usize;
        let mut skipped_partial = 0usize;

        let file = File::open(&summary_path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let row = match parse_summary_row(&line) {
                Some(row) => row,
                None => continue,
            };

            let root = accession_root(&row.accession);

            if self.existing.contains(&row.accession) || self.existing.contains(root) {
                skipped_in_cache += 1;
                continue;
            }
            if seen.contains(&row.accession) || seen.contains(root) {
                skipped_seen += 1;
                continue;
            }
            if !row.acceptable_level() {
                skipped_level += 1;
                continue;
            }
            if self.require_full_genome && row.genome_rep != "Full" {
                skipped_partial += 1;
                continue;
            }

            let meta = SourceMetadata {
                kingdom: Some(kingdom.to_string()),
                origin: None,
                species: species_from_organism(&row.organism_name),
            };
            self.metadata.insert(row.accession.clone(), meta.clone());
            self.metadata.insert(root.to_string(), meta);

            candidates.push(Candidate {
                accession: row.accession,
                ftp_path: row.ftp_path,
            });

            if candidates.len() >= limit {
                break;
            }
        }

        info!(
            kingdom,
            candidates = candidates.len(),
            skipped_in_cache,
            skipped_seen,
            skipped_level,
            skipped_partial,
            "NCBI assembly summary scanned",
        );

        Ok(candidates)
    }

    fn ensure_summary(&self, kingdom: &str) -> Result<PathBuf, ExtractError> {
        let url = format!("{SUMMARY_URL_BASE}/{kingdom}/assembly_summary.txt");
        let summary_path = self.base_dir.join(format!("assembly_summary_{kingdom}.txt"));

        let cached_size = fs::metadata(&summary_path).map(|meta| meta.len()).unwrap_or(0);
        if cached_size > SUMMARY_MIN_BYTES && !self.force_update_summaries {
            info!(kingdom, size = cached_size, "Using cached assembly summary");
            return Ok(summary_path);
        }

        info!(kingdom, url, "Downloading assembly summary");
        self.download_to_file(&url, &summary_path)?;

        let size = fs::metadata(&summary_path).map(|meta| meta.len()).unwrap_or(0);
        if size < SUMMARY_MIN_BYTES {
            error!(kingdom, size, "Assembly summary download looks truncated");
            return Err(ExtractError::RequestFailed);
        }

        Ok(summary_path)
    }

    fn download_to_file(&self, url: &str, dest: &PathBuf) -> Result<(), ExtractError> {
        let mut response = self.agent.get(url).call()?;

        if !response.status().is_success() {
            error!(url, status = response.status().as_u16(), "Request failed");
            return Err(ExtractError::RequestFailed);
        }

        let total = response
            .headers()
            .get("content-length")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let bar = new_progress_bar_bytes(total, "Downloading");

        let body = response.body_mut().as_reader();
        let mut reader = BufReader::new(body);
        let mut writer = BufWriter::new(File::create(dest)?);

        let mut read_buf = [0; 8092];
        loop {
            let result = reader.read(&mut read_buf[..]);

            // retry reading if interrupted as it is non-fatal
            if result.as_ref().is_err_and(|err| err.kind() == ErrorKind::Interrupted) {
                continue;
            }

            let bytes_read = result?;
            if bytes_read == 0 {
                break;
            }

            writer.write_all(&read_buf[..bytes_read])?;
            bar.inc(bytes_read as u64);
        }

        writer.flush()?;
        bar.finish();
        Ok(())
    }

    /// Resolve the genomic FASTA inside the assembly's directory listing and
    /// pull it into the workspace.
    fn download_genome(&self, candidate: &Candidate) -> Option<PathBuf> {
        let https_url = candidate.ftp_path.replace("ftp://", "https://");

        let listing = self
            .agent
            .get(format!("{https_url}/"))
            .call()
            .ok()?
            .body_mut()
            .read_to_string()
            .ok()?;

        let pattern = format!(r#"{}[^"]*genomic\.fna\.gz"#, regex::escape(&candidate.accession));
        let filename = Regex::new(&pattern).ok()?.find(&listing)?.as_str().to_string();

        let dest = self.base_dir.join(&filename);
        if dest.exists() {
            return Some(dest);
        }

        match self.download_to_file(&format!("{https_url}/{filename}"), &dest) {
            Ok(()) => Some(dest),
            Err(err) => {
                warn!(accession = %candidate.accession, %err, "Genome download failed");
                fs::remove_file(&dest).ok();
                None
            }
        }
    }
}

impl SourceAdapter for NcbiAdapter {
    fn source(&self) -> Source {
        Source::Ncbi
    }

    fn download_batch(&mut self, limit: usize, seen: &mut HashSet<String>) -> Vec<LocalItem> {
        let mut downloaded = Vec::new();

        for kingdom in self.kingdoms.clone() {
            if downloaded.len() >= limit {
                break;
            }

            let candidates = match self.candidates(&kingdom, limit - downloaded.len(), seen) {
                Ok(candidates) => candidates,
                Err(err) => {
                    error!(kingdom, %err, "Failed to list NCBI candidates");
                    continue;
                }
            };

            let adapter: &NcbiAdapter = self;
            let results: Vec<Option<(String, PathBuf)>> = adapter.download_pool.install(|| {
                candidates
                    .par_iter()
                    .map(|candidate| {
                        adapter
                            .download_genome(candidate)
                            .map(|path| (candidate.accession.clone(), path))
                    })
                    .collect()
            });

            for (accession, path) in results.into_iter().flatten() {
                seen.insert(accession_root(&accession).to_string());
                seen.insert(accession.clone());
                self.mark_processed(&accession);
                downloaded.push(LocalItem { path });
            }
        }

        info!(
            downloaded = downloaded.len(),
            cached_accessions = self.existing.len(),
            "NCBI batch complete",
        );
        downloaded
    }

    fn metadata(&self, accession: &str) -> Option<SourceMetadata> {
        self.metadata.get(accession).cloned()
    }
}


#[derive(Debug, PartialEq, Eq)]
struct SummaryRow {
    accession: String,
    organism_name: String,
    assembly_level: String,
    genome_rep: String,
    ftp_path: String,
}

impl SummaryRow {
    fn acceptable_level(&self) -> bool {
        matches!(self.assembly_level.as_str(), "Complete Genome" | "Chromosome") && self.ftp_path != "na"
    }
}

fn parse_summary_row(line: &str) -> Option<SummaryRow> {
    if line.starts_with('#') || line.trim().is_empty() {
        return None;
    }

    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 20 {
        return None;
    }

    Some(SummaryRow {
        accession: parts[0].to_string(),
        organism_name: parts[7].to_string(),
        assembly_level: parts[11].to_string(),
        genome_rep: parts[13].to_string(),
        ftp_path: parts[19].to_string(),
    })
}

fn species_from_organism(organism_name: &str) -> Option<String> {
    let mut tokens = organism_name.split_whitespace();
    let genus = tokens.next()?;
    match tokens.next() {
        Some(species) => Some(format!("{genus} {species}")),
        None => Some(genus.to_string()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn summary_line(accession: &str, level: &str, genome_rep: &str, ftp: &str) -> String {
        let mut parts = vec![""; 20];
        parts[0] = accession;
        parts[7] = "Escherichia coli K-12";
        parts[11] = level;
        parts[13] = genome_rep;
        parts[19] = ftp;
        parts.join("\t")
    }

    #[test]
    fn parses_a_summary_row() {
        let line = summary_line(
            "GCF_000005845.2",
            "Complete Genome",
            "Full",
            "ftp://ftp.ncbi.nlm.nih.gov/genomes/all/GCF/000/005/845/GCF_000005845.2_ASM584v2",
        );
        let row = parse_summary_row(&line).unwrap();

        assert_eq!(row.accession, "GCF_000005845.2");
        assert_eq!(row.organism_name, "Escherichia coli K-12");
        assert!(row.acceptable_level());
        assert_eq!(row.genome_rep, "Full");
    }

    #[test]
    fn skips_comments_and_short_lines() {
        assert!(parse_summary_row("# assembly_accession\tbioproject").is_none());
        assert!(parse_summary_row("").is_none());
        assert!(parse_summary_row("GCF_1\tonly\tthree\tcols").is_none());
    }

    #[test]
    fn rejects_scaffold_and_missing_ftp_rows() {
        let scaffold = parse_summary_row(&summary_line("GCF_1", "Scaffold", "Full", "ftp://x")).unwrap();
        assert!(!scaffold.acceptable_level());

        let no_ftp = parse_summary_row(&summary_line("GCF_1", "Chromosome", "Full", "na")).unwrap();
        assert!(!no_ftp.acceptable_level());
    }

    #[test]
    fn species_takes_first_two_tokens() {
        assert_eq!(
            species_from_organism("Escherichia coli K-12 MG1655"),
            Some("Escherichia coli".to_string()),
        );
        assert_eq!(species_from_organism("Wolbachia"), Some("Wolbachia".to_string()));
        assert_eq!(species_from_organism(""), None);
    }
}
