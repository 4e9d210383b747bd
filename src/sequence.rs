use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::Error;


/// Validation floor for a usable nucleotide file. Anything smaller is a
/// truncated download or an error page.
const MIN_FILE_BYTES: u64 = 100;

/// How much of a gzip stream gets decoded when checking integrity.
const GZIP_PROBE_BYTES: usize = 1024;

const FASTA_LINE_WIDTH: usize = 70;

/// Header noise that terminates the species portion of a description.
const SPECIES_STOP_TOKENS: &[&str] = &["chromosome", "scaffold", "contig", "strain", "complete"];


#[derive(Debug, Clone)]
pub struct FastaRecord {
    pub id: String,
    pub description: String,
    pub sequence: String,
}

impl FastaRecord {
    pub fn len(&self) -> usize {
        self.sequence.len()
    }
}


/// Streaming FASTA reader over any buffered source.
pub struct FastaReader<R: BufRead> {
    reader: R,
    pending_header: Option<String>,
}

impl<R: BufRead> FastaReader<R> {
    pub fn new(reader: R) -> FastaReader<R> {
        FastaReader {
            reader,
            pending_header: None,
        }
    }

    fn read_header(&mut self) -> io::Result<Option<String>> {
        if let Some(header) = self.pending_header.take() {
            return Ok(Some(header));
        }

        // skip any leading junk before the first record marker
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim_end();
            if let Some(header) = trimmed.strip_prefix('>') {
                return Ok(Some(header.to_string()));
            }
        }
    }
}

impl<R: BufRead> Iterator for FastaReader<R> {
    type Item = io::Result<FastaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = match self.read_header() {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        };

        let mut sequence = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if let Some(next_header) = trimmed.strip_prefix('>') {
                        self.pending_header = Some(next_header.to_string());
                        break;
                    }
                    sequence.push_str(trimmed.trim());
                }
                Err(err) => return Some(Err(err)),
            }
        }

        let mut parts = header.splitn(2, char::is_whitespace);
        let id = parts.next().unwrap_or_default().to_string();
        let description = parts.next().unwrap_or_default().trim().to_string();

        Some(Ok(FastaRecord {
            id,
            description,
            sequence,
        }))
    }
}


pub fn is_gzip_path(path: &Path) -> bool {
    path.extension().map(|ext| ext == "gz").unwrap_or(false)
}

/// Open a FASTA file for streaming, transparently decoding gzip.
pub fn open_fasta(path: &Path) -> Result<FastaReader<Box<dyn BufRead>>, Error> {
    let file = File::open(path)?;
    let reader: Box<dyn BufRead> = if is_gzip_path(path) {
        Box::new(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(FastaReader::new(reader))
}

pub fn write_record<W: Write>(writer: &mut W, record: &FastaRecord) -> io::Result<()> {
    if record.description.is_empty() {
        writeln!(writer, ">{}", record.id)?;
    } else {
        writeln!(writer, ">{} {}", record.id, record.description)?;
    }
    for chunk in record.sequence.as_bytes().chunks(FASTA_LINE_WIDTH) {
        writer.write_all(chunk)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}


/// Check that a downloaded file is a usable FASTA payload, decompressing it
/// to a sibling file first when gzipped. Returns the path to the plain-text
/// file, or `None` when the payload is unusable.
pub fn validate_and_fix(path: &Path) -> Option<PathBuf> {
    let usable = if is_gzip_path(path) {
        match decompress_to_sibling(path) {
            Ok(decompressed) => decompressed,
            Err(err) => {
                warn!(file = %path.display(), %err, "Failed to decompress download");
                return None;
            }
        }
    } else {
        path.to_path_buf()
    };

    let size = fs::metadata(&usable).ok()?.len();
    if size < MIN_FILE_BYTES {
        return None;
    }

    let mut reader = open_fasta(&usable).ok()?;
    match reader.next() {
        Some(Ok(record)) if !record.sequence.is_empty() => Some(usable),
        _ => None,
    }
}

fn decompress_to_sibling(path: &Path) -> Result<PathBuf, Error> {
    let sibling = path.with_extension("");
    let input = File::open(path)?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let mut output = BufWriter::new(File::create(&sibling)?);
    io::copy(&mut decoder, &mut output)?;
    output.flush()?;
    Ok(sibling)
}


/// Parse "Genus species" out of the first record's description.
///
/// Descriptions with bracketed text are environmental or synthetic samples
/// and never carry a usable binomial, so they are rejected outright.
pub fn parse_species(path: &Path) -> Option<String> {
    let mut reader = open_fasta(path).ok()?;
    let record = reader.next()?.ok()?;
    species_from_description(&record.description)
}

pub fn species_from_description(description: &str) -> Option<String> {
    if description.contains('[') || description.contains(']') {
        return None;
    }

    // ascii lowercase keeps byte offsets aligned with the original
    let lowered = description.to_ascii_lowercase();
    let mut cut = description.len();
    if let Some(comma) = lowered.find(',') {
        cut = cut.min(comma);
    }
    for token in SPECIES_STOP_TOKENS {
        if let Some(found) = lowered.find(token) {
            cut = cut.min(found);
        }
    }

    let mut tokens = description[..cut].split_whitespace();
    let genus = tokens.next()?;
    let species = tokens.next()?;
    Some(format!("{genus} {species}"))
}


/// Canonical fingerprint of the nucleotide payload.
///
/// Each record is uppercased and stripped of ambiguous `N` bases before
/// hashing; the per-record digests are sorted and hashed again, making the
/// result invariant to contig order and to N-runs.
pub fn sequence_hash(path: &Path) -> Result<Option<String>, Error> {
    let mut digests = Vec::new();

    for record in open_fasta(path)? {
        let record = record.map_err(Error::Io)?;

        let cleaned: Vec<u8> = record
            .sequence
            .bytes()
            .map(|base| base.to_ascii_uppercase())
            .filter(|base| *base != b'N')
            .collect();

        if cleaned.is_empty() {
            continue;
        }

        let mut hasher = Sha256::new();
        hasher.update(&cleaned);
        digests.push(to_hex(&hasher.finalize()));
    }

    if digests.is_empty() {
        return Ok(None);
    }

    digests.sort();
    let mut hasher = Sha256::new();
    hasher.update(digests.join("|").as_bytes());
    Ok(Some(to_hex(&hasher.finalize())))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}


/// Sum of record lengths, taken before compression so the catalog reflects
/// the payload actually uploaded.
pub fn total_bp(path: &Path) -> Result<u64, Error> {
    let mut total = 0u64;
    for record in open_fasta(path)? {
        total += record.map_err(Error::Io)?.len() as u64;
    }
    Ok(total)
}


#[derive(Debug, Clone, Copy)]
pub struct FilterOutcome {
    pub total: i32,
    pub kept: i32,
    pub removed: i32,
}

/// Drop contigs at or below the configured length, writing survivors to a
/// `.filtered.fasta` sibling. When nothing survives the original file is
/// returned so downstream stages still get a usable input.
pub fn filter_contigs(path: &Path, min_length: usize) -> Result<(PathBuf, FilterOutcome), Error> {
    let filtered_path = path.with_extension("filtered.fasta");
    let mut writer = BufWriter::new(File::create(&filtered_path)?);

    let mut total = 0;
    let mut kept = 0;
    for record in open_fasta(path)? {
        let record = record.map_err(Error::Io)?;
        total += 1;
        if record.len() > min_length {
            kept += 1;
            write_record(&mut writer, &record)?;
        }
    }
    writer.flush()?;

    let outcome = FilterOutcome {
        total,
        kept,
        removed: total - kept,
    };

    if kept == 0 {
        fs::remove_file(&filtered_path)?;
        return Ok((path.to_path_buf(), outcome));
    }

    Ok((filtered_path, outcome))
}


/// Make sure a file exists as readable gzip, compressing it if needed and
/// deleting the uncompressed original on success.
pub fn ensure_gz(path: &Path) -> Result<PathBuf, Error> {
    if is_gzip_path(path) {
        validate_gz(path)?;
        return Ok(path.to_path_buf());
    }

    let gz_path = append_gz(path);

    // a cached compression from an earlier attempt is fine as long as it is
    // no older than its source
    if gz_path.exists() {
        let source_mtime = fs::metadata(path)?.modified()?;
        let gz_mtime = fs::metadata(&gz_path)?.modified()?;
        if gz_mtime >= source_mtime && validate_gz(&gz_path).is_ok() {
            fs::remove_file(path)?;
            return Ok(gz_path);
        }
    }

    let mut input = BufReader::new(File::open(path)?);
    let output = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()?;

    validate_gz(&gz_path)?;
    fs::remove_file(path)?;
    Ok(gz_path)
}

fn append_gz(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

fn validate_gz(path: &Path) -> Result<(), Error> {
    let file = File::open(path)?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    let mut probe = vec![0u8; GZIP_PROBE_BYTES];

    let mut read = 0;
    while read < probe.len() {
        match decoder.read(&mut probe[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(err) => {
                return Err(Error::InvalidSequence(format!(
                    "{} is not readable gzip: {err}",
                    path.display()
                )))
            }
        }
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::tempdir;

    use super::*;

    fn write_fasta(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn write_fasta_gz(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap();
        path
    }

    #[test]
    fn reads_multi_record_fasta() {
        let input = ">seq1 Escherichia coli chromosome\nACGT\nACGT\n>seq2\nTTTT\n";
        let records: Vec<FastaRecord> = FastaReader::new(Cursor::new(input)).map(|r| r.unwrap()).collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "seq1");
        assert_eq!(records[0].description, "Escherichia coli chromosome");
        assert_eq!(records[0].sequence, "ACGTACGT");
        assert_eq!(records[1].id, "seq2");
        assert_eq!(records[1].sequence, "TTTT");
    }

    #[test]
    fn validate_rejects_tiny_and_headerless_files() {
        let dir = tempdir().unwrap();

        let tiny = write_fasta(dir.path(), "tiny.fasta", ">s\nACGT\n");
        assert!(validate_and_fix(&tiny).is_none());

        let junk = write_fasta(dir.path(), "junk.fasta", &"not fasta at all\n".repeat(20));
        assert!(validate_and_fix(&junk).is_none());
    }

    #[test]
    fn validate_decompresses_gzip_to_sibling() {
        let dir = tempdir().unwrap();
        let content = format!(">seq1 test record\n{}\n", "ACGT".repeat(50));
        let gz = write_fasta_gz(dir.path(), "genome.fna.gz", &content);

        let usable = validate_and_fix(&gz).unwrap();
        assert_eq!(usable, dir.path().join("genome.fna"));
        assert!(usable.exists());
    }

    #[test]
    fn species_parsing_truncates_at_noise() {
        assert_eq!(
            species_from_description("Escherichia coli str. K-12 chromosome 1"),
            Some("Escherichia coli".to_string()),
        );
        assert_eq!(
            species_from_description("Bacillus subtilis, complete genome"),
            Some("Bacillus subtilis".to_string()),
        );
        assert_eq!(species_from_description("Salmonella strain X"), None);
        assert_eq!(species_from_description("[uncultured bacterium] clone A"), None);
        assert_eq!(species_from_description(""), None);
    }

    #[test]
    fn hash_is_invariant_to_record_order_and_n_bases() {
        let dir = tempdir().unwrap();

        let a = write_fasta(dir.path(), "a.fasta", ">s1\nACGTACGT\n>s2\nGGGGCCCC\n");
        let b = write_fasta(dir.path(), "b.fasta", ">s2\nGGGGCCCC\n>s1\nACGTACGT\n");
        let c = write_fasta(dir.path(), "c.fasta", ">s1\nacgtNNacgt\n>s2\nGGNGGCCCC\n");

        let ha = sequence_hash(&a).unwrap().unwrap();
        let hb = sequence_hash(&b).unwrap().unwrap();
        let hc = sequence_hash(&c).unwrap().unwrap();

        assert_eq!(ha, hb);
        assert_eq!(ha, hc);

        let different = write_fasta(dir.path(), "d.fasta", ">s1\nTTTTTTTT\n");
        assert_ne!(ha, sequence_hash(&different).unwrap().unwrap());
    }

    #[test]
    fn hash_is_none_without_usable_sequence() {
        let dir = tempdir().unwrap();
        let empty = write_fasta(dir.path(), "n.fasta", ">s1\nNNNNNN\n");
        assert_eq!(sequence_hash(&empty).unwrap(), None);
    }

    #[test]
    fn filter_keeps_long_contigs_and_counts() {
        let dir = tempdir().unwrap();
        let path = write_fasta(
            dir.path(),
            "meta.fasta",
            &format!(">long\n{}\n>short\nACGT\n>edge\n{}\n", "A".repeat(300), "C".repeat(200)),
        );

        let (filtered, outcome) = filter_contigs(&path, 200).unwrap();
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.kept, 1);
        assert_eq!(outcome.removed, 2);
        assert_ne!(filtered, path);

        let kept: Vec<FastaRecord> = open_fasta(&filtered).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "long");
    }

    #[test]
    fn filter_returns_original_when_nothing_survives() {
        let dir = tempdir().unwrap();
        let path = write_fasta(dir.path(), "meta.fasta", ">a\nACGT\n>b\nACGT\n");

        let (filtered, outcome) = filter_contigs(&path, 2000).unwrap();
        assert_eq!(filtered, path);
        assert_eq!(outcome.kept, 0);
        assert_eq!(outcome.removed, 2);
    }

    #[test]
    fn ensure_gz_compresses_and_removes_original() {
        let dir = tempdir().unwrap();
        let path = write_fasta(dir.path(), "genome.fna", &format!(">s\n{}\n", "ACGT".repeat(100)));

        let gz = ensure_gz(&path).unwrap();
        assert_eq!(gz, dir.path().join("genome.fna.gz"));
        assert!(gz.exists());
        assert!(!path.exists());

        // round-trip through the reader to prove the payload survived
        let records: Vec<FastaRecord> = open_fasta(&gz).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records[0].sequence.len(), 400);
    }

    #[test]
    fn ensure_gz_accepts_existing_gzip() {
        let dir = tempdir().unwrap();
        let gz = write_fasta_gz(dir.path(), "genome.fna.gz", ">s\nACGT\n");

        let out = ensure_gz(&gz).unwrap();
        assert_eq!(out, gz);
    }

    #[test]
    fn total_bp_sums_record_lengths() {
        let dir = tempdir().unwrap();
        let path = write_fasta(dir.path(), "bp.fasta", ">a\nACGTAC\nGT\n>b\nAC\n");
        assert_eq!(total_bp(&path).unwrap(), 10);
    }
}
