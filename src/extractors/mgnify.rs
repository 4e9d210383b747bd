use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use ureq::Agent;

use super::errors::ExtractError;
use super::{LocalItem, Source, SourceAdapter, SourceMetadata};
use crate::config::Config;
use crate::database::Database;
use crate::errors::Error;


const BASE: &str = "https://www.ebi.ac.uk/metagenomics/api/v1";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Accession suffixes the archive appends to processed-read exports.
const ACCESSION_SUFFIXES: &[&str] = &["_MERGED_FASTQ", "_FASTQ"];


#[derive(Debug, Default, Deserialize)]
struct ApiPage {
    #[serde(default)]
    data: Vec<ApiObject>,
}

#[derive(Debug, Deserialize)]
struct ApiDocument {
    data: Option<ApiObject>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    attributes: serde_json::Map<String, Value>,
    #[serde(default)]
    links: serde_json::Map<String, Value>,
}

impl ApiObject {
    fn attr_text(&self, key: &str) -> &str {
        self.attributes.get(key).and_then(Value::as_str).unwrap_or_default()
    }

    fn self_link(&self) -> Option<String> {
        self.links.get("self").and_then(Value::as_str).map(str::to_string)
    }
}


/// Processed-read ingestion from MGnify analyses, iterating the configured
/// environment tags. Only `*FASTQ.fasta[.gz]` exports are accepted; protein
/// and ORF artifacts are produced downstream by this pipeline instead.
pub struct MgnifyAdapter {
    db: Database,
    agent: Agent,
    base_dir: PathBuf,
    environments: Vec<String>,
    analyses_per_study: usize,
    delay: Duration,
    max_file_mb: u64,
    last_request: Option<Instant>,
    metadata: HashMap<String, String>,
    existing: HashSet<String>,
}

impl MgnifyAdapter {
    pub fn new(config: &Config, db: &Database) -> Result<MgnifyAdapter, Error> {
        let base_dir = config.paths.base_data.join("mgnify");
        fs::create_dir_all(&base_dir)?;

        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.processing.download_timeout)))
            .build()
            .into();

        let mut existing = db.existing_accessions(Source::Mgnify)?;

        // catalogued accessions are filenames; index their analysis ids too
        let cleaned: Vec<String> = existing.iter().map(|acc| clean_accession_token(acc)).collect();
        existing.extend(cleaned);
        info!(existing = existing.len(), "MGnify adapter ready");

        Ok(MgnifyAdapter {
            db: db.clone(),
            agent,
            base_dir,
            environments: config.sources.mgnify.environments.clone(),
            analyses_per_study: config.sources.mgnify.analyses_per_study,
            delay: Duration::from_secs_f64(config.sources.mgnify.delay_seconds),
            max_file_mb: config.sources.mgnify.max_file_mb,
            last_request: None,
            metadata: HashMap::new(),
            existing,
        })
    }

    /// All requests to the archive share one pacing budget.
    fn rate(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                std::thread::sleep(self.delay - elapsed);
            }
        }
        self.last_request = Some(Instant::now());
    }

    fn get_page(&mut self, url: &str, params: &[(&str, String)]) -> Option<ApiPage> {
        self.rate();

        let mut request = self.agent.get(url).header("Accept", "application/json");
        for (key, value) in params {
            request = request.query(*key, value);
        }

        match request.call() {
            Ok(mut response) if response.status().is_success() => {
                response.body_mut().read_json::<ApiPage>().ok()
            }
            Ok(response) => {
                debug!(url, status = response.status().as_u16(), "MGnify request rejected");
                None
            }
            Err(err) => {
                debug!(url, %err, "MGnify request failed");
                None
            }
        }
    }

    fn get_document(&mut self, url: &str) -> Option<ApiDocument> {
        self.rate();

        match self.agent.get(url).header("Accept", "application/json").call() {
            Ok(mut response) if response.status().is_success() => {
                response.body_mut().read_json::<ApiDocument>().ok()
            }
            _ => None,
        }
    }

    fn search_studies(&mut self, environment: &str, limit: usize) -> Vec<ApiObject> {
        let params = [
            ("search", environment.to_string()),
            ("page_size", limit.to_string()),
        ];
        let studies = self
            .get_page(&format!("{BASE}/studies"), &params)
            .map(|page| page.data)
            .unwrap_or_default();

        info!(environment, studies = studies.len(), "MGnify studies found");
        studies
    }

    fn list_analyses(&mut self, study_id: &str) -> Vec<ApiObject> {
        let params = [("page_size", self.analyses_per_study.to_string())];
        self.get_page(&format!("{BASE}/studies/{study_id}/analyses"), &params)
            .map(|page| page.data)
            .unwrap_or_default()
    }

    fn infer_origin_from_analysis(&mut self, analysis_id: &str) -> Option<String> {
        let document = self.get_document(&format!("{BASE}/analyses/{analysis_id}"))?;
        let analysis = document.data?;

        let text = [
            analysis.attr_text("environment"),
            analysis.attr_text("environment_biome"),
            analysis.attr_text("biome"),
            analysis.attr_text("sample_desc"),
            analysis.attr_text("sample_name"),
        ]
        .join(" ")
        .to_lowercase();

        normalize_origin(&text)
    }

    /// Select and download the single processed-reads export for an
    /// analysis. Returns the local path, or `None` when the analysis has no
    /// acceptable download.
    fn download_reads(&mut self, analysis_id: &str, origin: Option<&str>) -> Option<PathBuf> {
        let manifest = self.get_page(&format!("{BASE}/analyses/{analysis_id}/downloads"), &[])?;

        let chosen = manifest
            .data
            .iter()
            .find(|item| item.id.as_deref().map(wanted_download).unwrap_or(false))?;

        let url = chosen.self_link()?;
        let filename = normalize_filename(chosen.id.as_deref()?);

        let out_dir = self.base_dir.join(&filename);
        if let Err(err) = fs::create_dir_all(&out_dir) {
            warn!(analysis_id, %err, "Failed to create analysis directory");
            return None;
        }
        let dest = out_dir.join(&filename);

        let path = self.download_stream(&url, dest)?;

        // sidecar manifest describing where the payload came from
        let sidecar_path = out_dir.join(format!("{analysis_id}_download.json"));
        let sidecar = json!({
            "analysis_id": analysis_id,
            "download_id": chosen.id.clone(),
            "url": url,
            "origin": origin,
        });
        if let Err(err) = fs::write(&sidecar_path, serde_json::to_string_pretty(&sidecar).unwrap_or_default()) {
            warn!(analysis_id, %err, "Failed to write download manifest");
        }

        Some(path)
    }

    fn download_stream(&mut self, url: &str, dest: PathBuf) -> Option<PathBuf> {
        if fs::metadata(&dest).map(|meta| meta.len() > 0).unwrap_or(false) {
            info!(file = %dest.display(), "Already downloaded");
            return Some(dest);
        }

        // HEAD first so oversized exports never hit the disk
        if let Some(length) = self.head_content_length(url) {
            if length / (1024 * 1024) > self.max_file_mb {
                warn!(url, size_mb = length / (1024 * 1024), "Skipping oversized download");
                return None;
            }
        }

        match self.stream_to_part_file(url, &dest) {
            Ok(path) => {
                info!(file = %path.display(), "MGnify download complete");
                Some(path)
            }
            Err(err) => {
                warn!(url, %err, "MGnify download failed");
                None
            }
        }
    }

    fn head_content_length(&mut self, url: &str) -> Option<u64> {
        self.rate();
        let response = self.agent.head(url).call().ok()?;
        response
            .headers()
            .get("content-length")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
    }

    fn stream_to_part_file(&mut self, url: &str, dest: &PathBuf) -> Result<PathBuf, ExtractError> {
        self.rate();

        let mut response = self.agent.get(url).call()?;
        if !response.status().is_success() {
            warn!(url, status = response.status().as_u16(), "MGnify download rejected");
            return Err(ExtractError::RequestFailed);
        }

        let partial = dest.with_extension("part");
        let mut reader = BufReader::new(response.body_mut().as_reader());
        let mut writer = BufWriter::new(File::create(&partial)?);
        io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        drop(writer);

        // gzip payloads are not always named as such by the archive
        let mut final_dest = dest.clone();
        let mut magic = [0u8; 2];
        let is_gzip = File::open(&partial)
            .and_then(|mut file| file.read_exact(&mut magic))
            .map(|_| magic == GZIP_MAGIC)
            .unwrap_or(false);
        if is_gzip && !final_dest.extension().map(|ext| ext == "gz").unwrap_or(false) {
            let mut name = final_dest.into_os_string();
            name.push(".gz");
            final_dest = PathBuf::from(name);
        }

        fs::rename(&partial, &final_dest)?;
        Ok(final_dest)
    }

    fn remember_origin(&mut self, analysis_id: &str, path: &PathBuf, origin: Option<&str>) {
        let origin = match origin {
            Some(origin) => origin.to_string(),
            None => return,
        };

        self.metadata.insert(analysis_id.to_string(), origin.clone());
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            self.metadata.insert(clean_accession_token(stem), origin.clone());
            self.metadata.insert(stem.to_string(), origin);
        }
    }
}

impl SourceAdapter for MgnifyAdapter {
    fn source(&self) -> Source {
        Source::Mgnify
    }

    fn download_batch(&mut self, limit: usize, seen: &mut HashSet<String>) -> Vec<LocalItem> {
        let mut downloaded = Vec::new();
        let mut skipped = 0usize;

        for environment in self.environments.clone() {
            if downloaded.len() >= limit {
                break;
            }

            let studies = self.search_studies(&environment, limit.max(10));
            if studies.is_empty() {
                continue;
            }

            let environment_origin = normalize_environment_to_origin(&environment);

            for study in &studies {
                if downloaded.len() >= limit {
                    break;
                }
                let study_id = match &study.id {
                    Some(id) => id.clone(),
                    None => continue,
                };

                let study_origin = infer_origin_from_study(study);
                let primary_origin = environment_origin.clone().or(study_origin);

                let analyses = self.list_analyses(&study_id);
                for analysis in &analyses {
                    if downloaded.len() >= limit {
                        break;
                    }
                    let analysis_id = match &analysis.id {
                        Some(id) => id.clone(),
                        None => continue,
                    };

                    if self.existing.contains(&analysis_id) || seen.contains(&analysis_id) {
                        skipped += 1;
                        continue;
                    }
                    if self.db.entry_exists(&analysis_id).unwrap_or(false) {
                        skipped += 1;
                        self.existing.insert(analysis_id);
                        continue;
                    }

                    let analysis_origin = self.infer_origin_from_analysis(&analysis_id);
                    let origin = analysis_origin.or_else(|| primary_origin.clone());

                    if let Some(path) = self.download_reads(&analysis_id, origin.as_deref()) {
                        seen.insert(analysis_id.clone());
                        self.remember_origin(&analysis_id, &path, origin.as_deref());
                        info!(analysis_id, ?origin, "Metagenome downloaded");
                        downloaded.push(LocalItem { path });
                    }
                }
            }
        }

        info!(downloaded = downloaded.len(), skipped, "MGnify batch complete");
        downloaded
    }

    fn metadata(&self, accession: &str) -> Option<SourceMetadata> {
        let origin = self
            .metadata
            .get(accession)
            .or_else(|| {
                let stem = accession.trim_end_matches(".gz").trim_end_matches(".fasta");
                self.metadata.get(stem)
            })
            .or_else(|| self.metadata.get(&clean_accession_token(accession)))?;

        Some(SourceMetadata {
            kingdom: None,
            origin: Some(origin.clone()),
            species: None,
        })
    }
}


/// Accept only processed reads exported as FASTA from FASTQ, never the
/// archive's own protein (`.faa`) or ORF (`.ffn`) artifacts.
fn wanted_download(id: &str) -> bool {
    let id = id.to_lowercase();
    if id.contains(".faa") || id.contains(".ffn") {
        return false;
    }
    id.contains("fastq.fasta")
}

fn normalize_filename(id: &str) -> String {
    if id.ends_with(".fasta") || id.ends_with(".fasta.gz") {
        return id.to_string();
    }
    if id.ends_with(".gz") {
        return format!("{}.fasta.gz", id.trim_end_matches(".gz"));
    }
    format!("{id}.fasta")
}

/// Strip export suffixes and extensions down to the bare analysis or run id.
fn clean_accession_token(token: &str) -> String {
    let mut cleaned = token.trim_end_matches(".gz").trim_end_matches(".fasta").to_string();
    for suffix in ACCESSION_SUFFIXES {
        cleaned = cleaned.replace(suffix, "");
    }
    cleaned
}

fn infer_origin_from_study(study: &ApiObject) -> Option<String> {
    let text = [
        study.attr_text("biome"),
        study.attr_text("study-abstract"),
        study.attr_text("study-name"),
    ]
    .join(" ")
    .to_lowercase();

    normalize_origin(&text)
}

/// Map an environment search term onto a normalized origin label.
pub fn normalize_environment_to_origin(term: &str) -> Option<String> {
    let env = term.to_lowercase();

    let origin = if env.contains("soil") || env.contains("rhizosphere") {
        "soil"
    } else if env.contains("marine") || env.contains("ocean") || env.contains("sea") {
        "marine"
    } else if env.contains("freshwater") || env.contains("lake") || env.contains("river") {
        "freshwater"
    } else if env.contains("plant") || env.contains("leaf") || env.contains("root") {
        "plant"
    } else if env.contains("gut") || env.contains("fecal") || env.contains("intestin") {
        "gut"
    } else if env.contains("sediment") || env.contains("mud") {
        "sediment"
    } else if env.contains("wastewater") || env.contains("sewage") {
        "wastewater"
    } else if env.contains("biofilm") {
        "biofilm"
    } else if env.contains("hypersaline") || env.contains("salt") {
        "hypersaline"
    } else if env.contains("hot spring") || env.contains("thermal") {
        "hot spring"
    } else if env.contains("permafrost") || env.contains("ice") || env.contains("glacier") {
        "permafrost"
    } else if env.contains("desert") || env.contains("arid") {
        "desert"
    } else if env.contains("estuary") {
        "estuary"
    } else {
        return None;
    };

    Some(origin.to_string())
}

/// Looser fallback used on study and analysis free text.
pub fn normalize_origin(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }

    let origin = if ["soil", "rhizosphere"].iter().any(|k| text.contains(k)) {
        "soil"
    } else if ["marine", "ocean", "sea"].iter().any(|k| text.contains(k)) {
        "marine"
    } else if ["freshwater", "water", "lake", "river"].iter().any(|k| text.contains(k)) {
        "freshwater"
    } else if ["root", "leaf", "plant"].iter().any(|k| text.contains(k)) {
        "plant"
    } else if ["gut", "fecal", "feces", "stool", "intest"].iter().any(|k| text.contains(k)) {
        "gut"
    } else if ["sediment", "mud", "silt"].iter().any(|k| text.contains(k)) {
        "sediment"
    } else if ["skin", "oral", "mouth", "saliva"].iter().any(|k| text.contains(k)) {
        "host"
    } else if ["wastewater", "sewage"].iter().any(|k| text.contains(k)) {
        "wastewater"
    } else {
        return None;
    };

    Some(origin.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_selection_rejects_protein_artifacts() {
        assert!(wanted_download("ERR2985769_FASTQ.fasta"));
        assert!(wanted_download("ERR2985769_MERGED_FASTQ.fasta.gz"));
        assert!(!wanted_download("ERR2985769_FASTQ.faa"));
        assert!(!wanted_download("ERR2985769_FASTQ.ffn.gz"));
        assert!(!wanted_download("ERR2985769_contigs.fasta"));
    }

    #[test]
    fn filenames_are_normalized_to_fasta() {
        assert_eq!(normalize_filename("ERR1_FASTQ.fasta"), "ERR1_FASTQ.fasta");
        assert_eq!(normalize_filename("ERR1_FASTQ.fasta.gz"), "ERR1_FASTQ.fasta.gz");
        assert_eq!(normalize_filename("ERR1_FASTQ.gz"), "ERR1_FASTQ.fasta.gz");
        assert_eq!(normalize_filename("ERR1_FASTQ"), "ERR1_FASTQ.fasta");
    }

    #[test]
    fn accession_tokens_are_cleaned() {
        assert_eq!(clean_accession_token("ERR1_FASTQ.fasta.gz"), "ERR1");
        assert_eq!(clean_accession_token("ERR1_MERGED_FASTQ.fasta"), "ERR1");
        assert_eq!(clean_accession_token("MGYA00123456"), "MGYA00123456");
    }

    #[test]
    fn environment_terms_map_to_origins() {
        assert_eq!(normalize_environment_to_origin("soil"), Some("soil".to_string()));
        assert_eq!(normalize_environment_to_origin("deep ocean"), Some("marine".to_string()));
        assert_eq!(normalize_environment_to_origin("wastewater"), Some("wastewater".to_string()));
        assert_eq!(normalize_environment_to_origin("hot spring"), Some("hot spring".to_string()));
        assert_eq!(normalize_environment_to_origin("permafrost"), Some("permafrost".to_string()));
        assert_eq!(normalize_environment_to_origin("volcano"), None);
    }

    #[test]
    fn free_text_fallback_finds_origins() {
        assert_eq!(normalize_origin("human stool sample from donor"), Some("gut".to_string()));
        assert_eq!(normalize_origin("oral microbiome swab"), Some("host".to_string()));
        assert_eq!(normalize_origin(""), None);
        assert_eq!(normalize_origin("unclassified biome"), None);
    }
}
