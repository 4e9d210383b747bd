use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{info, warn};
use wait_timeout::ChildExt;

use crate::errors::Error;
use crate::sequence::{self, FastaRecord};


const PREDICTOR_BIN: &str = "prodigal";
const SPLITTER_BIN: &str = "seqkit";

const PREDICT_TIMEOUT: Duration = Duration::from_secs(300);
const SPLIT_TIMEOUT: Duration = Duration::from_secs(300);
/// Per-split predictions run on smaller inputs but compete for cores, so
/// they get a longer leash than the single-genome path.
const SPLIT_PREDICT_TIMEOUT: Duration = Duration::from_secs(600);

const STDERR_CAPTURE_LIMIT: usize = 16 * 1024;

/// Pre-filter threshold for metagenome reads. Independent of the
/// configurable contig filter applied earlier in the pipeline.
const PREFILTER_MIN_CONTIG: usize = 200;
const PREFILTER_MIN_SEQS: usize = 10;
const PREFILTER_MIN_BASES: u64 = 50_000;

/// Inputs below either bound are predicted directly without splitting.
const DIRECT_MAX_SEQS: usize = 1_000;
const DIRECT_MAX_BASES: u64 = 500_000;

const SPLIT_TARGET_BASES: u64 = 100_000;
const MIN_SPLITS: u64 = 2;
const MAX_SPLITS: u64 = 8;
const SPLIT_MIN_SEQS: usize = 10;
const SPLIT_MIN_BASES: u64 = 10_000;

const SPLIT_WORKER_CAP: usize = 8;


#[derive(Debug, Clone, Copy, Default)]
pub struct GenePredictor;

impl GenePredictor {
    pub fn new() -> GenePredictor {
        GenePredictor
    }

    /// Predict proteins for a single genome and return the gzipped `.faa`.
    pub fn predict_single(&self, genome: &Path) -> Result<PathBuf, Error> {
        let proteins = genome.with_extension("faa");
        self.run_predictor(genome, &proteins, false, PREDICT_TIMEOUT)?;
        sequence::ensure_gz(&proteins)
    }

    /// Predict proteins for a metagenome with the split/parallel/merge
    /// pipeline. Every stage is fail-fast: any unusable split or failed
    /// child abandons the whole item, there are no partial successes.
    pub fn predict_metagenome(&self, reads: &Path, work_dir: &Path) -> Result<PathBuf, Error> {
        fs::create_dir_all(work_dir)?;

        let stem = protein_stem(reads);
        let prefiltered = work_dir.join(format!("{stem}.prefiltered.fasta"));
        let (kept_seqs, kept_bases) = prefilter_reads(reads, &prefiltered)?;

        if kept_seqs < PREFILTER_MIN_SEQS || kept_bases < PREFILTER_MIN_BASES {
            fs::remove_file(&prefiltered).ok();
            return Err(Error::Prediction(format!(
                "metagenome too small after pre-filter: {kept_seqs} sequences, {kept_bases} bases",
            )));
        }

        let merged = work_dir.join(format!("{stem}_proteins.faa"));

        if kept_seqs < DIRECT_MAX_SEQS || kept_bases < DIRECT_MAX_BASES {
            info!(seqs = kept_seqs, bases = kept_bases, "Small metagenome, predicting without splits");
            self.run_predictor(&prefiltered, &merged, true, PREDICT_TIMEOUT)?;
            fs::remove_file(&prefiltered)?;
            return sequence::ensure_gz(&merged);
        }

        let plan = SplitPlan::for_bases(kept_bases);
        let splits_dir = work_dir.join("splits");
        let splits = self.split_reads(&prefiltered, &splits_dir, &plan)?;

        for split in &splits {
            validate_split(split)?;
        }

        info!(splits = splits.len(), bases = kept_bases, "Predicting splits in parallel");
        let outputs = self.predict_splits(&splits)?;

        merge_proteins(&outputs, &merged)?;

        fs::remove_dir_all(&splits_dir)?;
        fs::remove_file(&prefiltered)?;

        sequence::ensure_gz(&merged)
    }

    fn predict_splits(&self, splits: &[PathBuf]) -> Result<Vec<PathBuf>, Error> {
        use rayon::prelude::*;

        let workers = SPLIT_WORKER_CAP.min(splits.len());
        let pool = rayon::ThreadPoolBuilder::new().num_threads(workers).build()?;

        // the predictor is not thread safe, so each split gets its own child
        // process. a failed split stops any split that has not started yet.
        pool.install(|| {
            splits
                .par_iter()
                .map(|split| {
                    let proteins = split.with_extension("faa");
                    self.run_predictor(split, &proteins, true, SPLIT_PREDICT_TIMEOUT)?;
                    Ok(proteins)
                })
                .collect::<Result<Vec<PathBuf>, Error>>()
        })
    }

    /// Split reads into roughly even chunks, preferring size-based splitting
    /// and falling back to parts-based splitting when that mode fails.
    fn split_reads(&self, input: &Path, splits_dir: &Path, plan: &SplitPlan) -> Result<Vec<PathBuf>, Error> {
        fs::create_dir_all(splits_dir)?;

        let by_size = run_command(
            Command::new(SPLITTER_BIN)
                .arg("split2")
                .arg("-s")
                .arg(format!("{}k", plan.per_split_kb))
                .arg("-O")
                .arg(splits_dir)
                .arg(input),
            SPLIT_TIMEOUT,
        );

        if let Err(err) = by_size {
            warn!(%err, "Size-based splitting unavailable, falling back to parts-based");
            run_command(
                Command::new(SPLITTER_BIN)
                    .arg("split")
                    .arg("-p")
                    .arg(plan.splits.to_string())
                    .arg("-O")
                    .arg(splits_dir)
                    .arg(input),
                SPLIT_TIMEOUT,
            )?;
        }

        let mut splits = Vec::new();
        for entry in fs::read_dir(splits_dir)? {
            let path = entry?.path();
            let is_fasta = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext, "fasta" | "fa" | "fna"))
                .unwrap_or(false);
            if is_fasta {
                splits.push(path);
            }
        }
        splits.sort();

        if splits.is_empty() {
            return Err(Error::Prediction("splitter produced no output files".to_string()));
        }

        Ok(splits)
    }

    fn run_predictor(&self, input: &Path, proteins: &Path, metagenome: bool, timeout: Duration) -> Result<(), Error> {
        let mut command = Command::new(PREDICTOR_BIN);
        command
            .arg("-i")
            .arg(input)
            .arg("-a")
            .arg(proteins)
            .arg("-o")
            .arg("/dev/null")
            .arg("-q");
        if metagenome {
            command.arg("-p").arg("meta");
        }

        run_command(&mut command, timeout)?;

        let produced = fs::metadata(proteins).map(|meta| meta.len()).unwrap_or(0);
        if produced == 0 {
            return Err(Error::Prediction(format!(
                "predictor produced no output for {}",
                input.display()
            )));
        }

        Ok(())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlan {
    pub splits: u64,
    pub per_split_kb: u64,
}

impl SplitPlan {
    /// Target ~100 kb per split, clamped to between 2 and 8 splits.
    pub fn for_bases(total_bases: u64) -> SplitPlan {
        let splits = (total_bases / SPLIT_TARGET_BASES).clamp(MIN_SPLITS, MAX_SPLITS);
        let per_split_kb = (total_bases / splits / 1000).max(1);
        SplitPlan { splits, per_split_kb }
    }
}


/// Drop reads shorter than the pre-filter floor, returning how much
/// sequence survived.
fn prefilter_reads(input: &Path, output: &Path) -> Result<(usize, u64), Error> {
    let mut writer = BufWriter::new(File::create(output)?);

    let mut kept_seqs = 0usize;
    let mut kept_bases = 0u64;
    for record in sequence::open_fasta(input)? {
        let record = record.map_err(Error::Io)?;
        if record.len() < PREFILTER_MIN_CONTIG {
            continue;
        }
        kept_seqs += 1;
        kept_bases += record.len() as u64;
        sequence::write_record(&mut writer, &record)?;
    }
    io::Write::flush(&mut writer)?;

    Ok((kept_seqs, kept_bases))
}

fn validate_split(split: &Path) -> Result<(), Error> {
    let mut seqs = 0usize;
    let mut bases = 0u64;
    for record in sequence::open_fasta(split)? {
        let record: FastaRecord = record.map_err(Error::Io)?;
        seqs += 1;
        bases += record.len() as u64;
    }

    if seqs < SPLIT_MIN_SEQS || bases < SPLIT_MIN_BASES {
        return Err(Error::Prediction(format!(
            "unbalanced split {}: {seqs} sequences, {bases} bases",
            split.display()
        )));
    }

    Ok(())
}

fn merge_proteins(outputs: &[PathBuf], merged: &Path) -> Result<(), Error> {
    let mut writer = BufWriter::new(File::create(merged)?);
    for output in outputs {
        let mut reader = BufReader::new(File::open(output)?);
        io::copy(&mut reader, &mut writer)?;
    }
    io::Write::flush(&mut writer)?;
    Ok(())
}

fn protein_stem(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("reads");
    stem.trim_end_matches(".filtered").to_string()
}

/// Run a child process to completion with a hard deadline, capturing a
/// bounded amount of stderr for diagnostics. Children that miss the
/// deadline are killed rather than left running past the item.
fn run_command(command: &mut Command, timeout: Duration) -> Result<(), Error> {
    let program = command.get_program().to_string_lossy().to_string();

    let mut child = command
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| Error::Prediction(format!("failed to spawn {program}: {err}")))?;

    let stderr = child.stderr.take();
    let drain = std::thread::spawn(move || {
        let mut kept = Vec::new();
        if let Some(mut stderr) = stderr {
            let mut chunk = [0u8; 8192];
            loop {
                match stderr.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let room = STDERR_CAPTURE_LIMIT.saturating_sub(kept.len());
                        kept.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
        }
        kept
    });

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            child.kill().ok();
            child.wait().ok();
            drain.join().ok();
            return Err(Error::Prediction(format!(
                "{program} timed out after {}s",
                timeout.as_secs()
            )));
        }
        Err(err) => {
            child.kill().ok();
            return Err(Error::Prediction(format!("failed waiting on {program}: {err}")));
        }
    };

    let captured = drain.join().unwrap_or_default();
    if !status.success() {
        let stderr_text = String::from_utf8_lossy(&captured);
        return Err(Error::Prediction(format!(
            "{program} exited with {status}: {}",
            stderr_text.trim()
        )));
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn split_plan_clamps_between_two_and_eight() {
        assert_eq!(SplitPlan::for_bases(50_000).splits, 2);
        assert_eq!(SplitPlan::for_bases(600_000).splits, 6);
        assert_eq!(SplitPlan::for_bases(10_000_000).splits, 8);

        let plan = SplitPlan::for_bases(800_000);
        assert_eq!(plan.splits, 8);
        assert_eq!(plan.per_split_kb, 100);
    }

    #[test]
    fn prefilter_drops_short_reads() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("reads.fasta");
        fs::write(
            &input,
            format!(
                ">keep1\n{}\n>drop\n{}\n>keep2\n{}\n",
                "A".repeat(250),
                "C".repeat(150),
                "G".repeat(200)
            ),
        )
        .unwrap();

        let output = dir.path().join("reads.prefiltered.fasta");
        let (seqs, bases) = prefilter_reads(&input, &output).unwrap();

        assert_eq!(seqs, 2);
        assert_eq!(bases, 450);
    }

    #[test]
    fn split_validation_rejects_starved_splits() {
        let dir = tempdir().unwrap();
        let split = dir.path().join("part_001.fasta");
        fs::write(&split, ">a\nACGT\n").unwrap();

        assert!(validate_split(&split).is_err());
    }

    #[test]
    fn merge_concatenates_outputs_in_order() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("part_001.faa");
        let second = dir.path().join("part_002.faa");
        fs::write(&first, ">p1\nMKV\n").unwrap();
        fs::write(&second, ">p2\nMLL\n").unwrap();

        let merged = dir.path().join("all_proteins.faa");
        merge_proteins(&[first, second], &merged).unwrap();

        let text = fs::read_to_string(&merged).unwrap();
        assert_eq!(text, ">p1\nMKV\n>p2\nMLL\n");
    }

    #[test]
    fn protein_stem_strips_filter_suffix() {
        assert_eq!(protein_stem(Path::new("/tmp/ERR12_FASTQ.filtered.fasta")), "ERR12_FASTQ");
        assert_eq!(protein_stem(Path::new("/tmp/genome.fna")), "genome");
    }
}
