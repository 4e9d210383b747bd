use std::path::Path;
use std::sync::LazyLock;

use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;

pub static SPINNER_TEMPLATE: &str = "[{elapsed_precise}] {spinner:2.cyan/blue} {msg}";
pub static BYTES_PROGRESS_TEMPLATE: &str =
    "[{elapsed_precise}] {bar:40.cyan/blue} {decimal_bytes:>7}/{decimal_total_bytes:7} @ {decimal_bytes_per_sec} {msg}";


pub fn new_spinner(message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(SPINNER_TEMPLATE).expect("Invalid spinner template");
    ProgressBar::new_spinner().with_message(message.to_string()).with_style(style)
}

pub fn new_progress_bar_bytes(total: u64, message: &str) -> ProgressBar {
    let style = ProgressStyle::with_template(BYTES_PROGRESS_TEMPLATE).expect("Invalid progress bar template");
    ProgressBar::new(total).with_message(message.to_string()).with_style(style)
}


static ASSEMBLY_ACCESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"GC[AF]_\d+(?:\.\d+)?").expect("Invalid accession pattern"));

/// Strip the version suffix from an accession. `GCF_000001.2` -> `GCF_000001`.
pub fn accession_root(accession: &str) -> &str {
    accession.split('.').next().unwrap_or(accession)
}

/// Derive the full and version-stripped accession forms from a downloaded
/// filename, eg `GCF_002271195.1_ASM227119v1_genomic.fna.gz`.
///
/// Filenames without an assembly accession (metagenome reads in particular)
/// fall back to the file stem, which is what gets catalogued for them.
pub fn accession_forms(path: &Path) -> (String, String) {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

    if let Some(found) = ASSEMBLY_ACCESSION.find(name) {
        let full = found.as_str().to_string();
        let root = accession_root(&full).to_string();
        return (full, root);
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let root = accession_root(stem).to_string();
    (stem.to_string(), root)
}

/// Reject species candidates that are clearly not a binomial name:
/// bracketed environmental annotations, single tokens, empty strings.
pub fn clean_species(candidate: Option<&str>) -> Option<String> {
    let candidate = candidate?.trim();
    if candidate.is_empty() || candidate.contains('[') || candidate.contains(']') {
        return None;
    }
    if candidate.split_whitespace().count() < 2 {
        return None;
    }
    Some(candidate.to_string())
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn accession_forms_from_ncbi_filename() {
        let path = PathBuf::from("/data/ncbi/GCF_002271195.1_ASM227119v1_genomic.fna.gz");
        let (full, root) = accession_forms(&path);
        assert_eq!(full, "GCF_002271195.1");
        assert_eq!(root, "GCF_002271195");
    }

    #[test]
    fn accession_forms_from_bare_accession() {
        let path = PathBuf::from("GCA_000005845.2.fasta");
        let (full, root) = accession_forms(&path);
        assert_eq!(full, "GCA_000005845.2");
        assert_eq!(root, "GCA_000005845");
    }

    #[test]
    fn accession_forms_fall_back_to_stem() {
        let path = PathBuf::from("/data/mgnify/ERR2985769_FASTQ.fasta.gz");
        let (full, root) = accession_forms(&path);
        assert_eq!(full, "ERR2985769_FASTQ.fasta");
        assert_eq!(root, "ERR2985769_FASTQ");
    }

    #[test]
    fn clean_species_rejects_brackets_and_single_tokens() {
        assert_eq!(clean_species(Some("Escherichia coli")), Some("Escherichia coli".to_string()));
        assert_eq!(clean_species(Some("  Bacillus subtilis ")), Some("Bacillus subtilis".to_string()));
        assert_eq!(clean_species(Some("[uncultured] bacterium")), None);
        assert_eq!(clean_species(Some("Escherichia")), None);
        assert_eq!(clean_species(Some("")), None);
        assert_eq!(clean_species(None), None);
    }
}
