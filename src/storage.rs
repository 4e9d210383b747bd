use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use futures::{stream, StreamExt, TryStreamExt};
use tokio::runtime::Runtime;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::Error;
use crate::extractors::Source;


/// Transport-level retry budget. Application failures are terminal per call.
const MAX_TRANSPORT_ATTEMPTS: u32 = 8;

const MULTIPART_THRESHOLD: u64 = 500 * 1024 * 1024;
const PART_SIZE: u64 = 64 * 1024 * 1024;
const PART_CONCURRENCY: usize = 4;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];


/// Synchronous facade over the S3 SDK. The rest of the pipeline blocks on
/// native I/O, so the async client runs on a small private runtime.
pub struct ObjectStore {
    client: Client,
    runtime: Runtime,
    bucket: String,
    final_prefix: String,
    proteins_prefix: String,
}

impl ObjectStore {
    pub fn connect(config: &Config) -> Result<ObjectStore, Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        let sdk_config = runtime.block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.aws.region.clone()))
                .retry_config(RetryConfig::standard().with_max_attempts(MAX_TRANSPORT_ATTEMPTS))
                .load(),
        );

        Ok(ObjectStore {
            client: Client::new(&sdk_config),
            runtime,
            bucket: config.aws.s3.bucket_name.clone(),
            final_prefix: config.aws.s3.final_prefix.clone(),
            proteins_prefix: config.aws.s3.proteins_prefix.clone(),
        })
    }

    /// Upload a genome payload, returning its URI or `None` on failure.
    pub fn upload_genome(&self, path: &Path, source: Source, accession: &str) -> Option<String> {
        let filename = file_name(path)?;
        let key = genome_key(&self.final_prefix, source, accession, &filename);
        self.upload_checked(path, &key)
    }

    /// Upload a protein payload, returning its URI or `None` on failure.
    pub fn upload_proteins(&self, path: &Path, source: Source, accession: &str) -> Option<String> {
        let filename = file_name(path)?;
        let key = protein_key(&self.proteins_prefix, source, accession, &filename);
        self.upload_checked(path, &key)
    }

    fn upload_checked(&self, path: &Path, key: &str) -> Option<String> {
        match self.upload(path, key) {
            Ok(uri) => Some(uri),
            Err(err) => {
                error!(key, file = %path.display(), %err, "Upload failed");
                None
            }
        }
    }

    fn upload(&self, path: &Path, key: &str) -> Result<String, Error> {
        let size = fs::metadata(path)?.len();
        if size == 0 {
            return Err(Error::Storage(format!("refusing to upload empty file {}", path.display())));
        }

        if size > MULTIPART_THRESHOLD {
            self.upload_multipart(path, key, size)?;
        } else {
            self.upload_single(path, key)?;
        }

        self.verify(key)?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }

    fn upload_single(&self, path: &Path, key: &str) -> Result<(), Error> {
        let body = self
            .runtime
            .block_on(ByteStream::from_path(path))
            .map_err(|err| Error::Storage(err.to_string()))?;

        let mut request = self.client.put_object().bucket(&self.bucket).key(key).body(body);
        if let Some(content_type) = content_type_for(key) {
            request = request.content_type(content_type);
        }

        self.runtime.block_on(request.send()).map_err(sdk_error)?;
        Ok(())
    }

    fn upload_multipart(&self, path: &Path, key: &str, size: u64) -> Result<(), Error> {
        let mut create = self.client.create_multipart_upload().bucket(&self.bucket).key(key);
        if let Some(content_type) = content_type_for(key) {
            create = create.content_type(content_type);
        }

        let created = self.runtime.block_on(create.send()).map_err(sdk_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::Storage("multipart upload created without an id".to_string()))?
            .to_string();

        info!(key, size, parts = part_count(size), "Starting multipart upload");

        match self.upload_parts(path, key, &upload_id, size) {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
                self.runtime
                    .block_on(
                        self.client
                            .complete_multipart_upload()
                            .bucket(&self.bucket)
                            .key(key)
                            .upload_id(&upload_id)
                            .multipart_upload(completed)
                            .send(),
                    )
                    .map_err(sdk_error)?;
                Ok(())
            }
            Err(err) => {
                // leave nothing half-assembled behind
                let abort = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send();
                if let Err(abort_err) = self.runtime.block_on(abort) {
                    warn!(key, err = %DisplayErrorContext(abort_err), "Failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    fn upload_parts(&self, path: &Path, key: &str, upload_id: &str, size: u64) -> Result<Vec<CompletedPart>, Error> {
        let mut specs = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;
        while offset < size {
            let length = PART_SIZE.min(size - offset) as usize;
            specs.push((part_number, offset, length));
            offset += length as u64;
            part_number += 1;
        }

        self.runtime.block_on(async {
            stream::iter(specs.into_iter().map(|(part_number, offset, length)| {
                let client = self.client.clone();
                let bucket = self.bucket.clone();
                let key = key.to_string();
                let upload_id = upload_id.to_string();
                let path = path.to_path_buf();

                async move {
                    let chunk = tokio::task::spawn_blocking(move || read_chunk(&path, offset, length))
                        .await
                        .map_err(|err| Error::Storage(format!("part read task failed: {err}")))??;

                    let uploaded = client
                        .upload_part()
                        .bucket(&bucket)
                        .key(&key)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(chunk))
                        .send()
                        .await
                        .map_err(sdk_error)?;

                    Ok::<CompletedPart, Error>(
                        CompletedPart::builder()
                            .part_number(part_number)
                            .set_e_tag(uploaded.e_tag().map(str::to_string))
                            .build(),
                    )
                }
            }))
            .buffered(PART_CONCURRENCY)
            .try_collect()
            .await
        })
    }

    /// Confirm the object landed and looks like what we sent. A gzip key
    /// whose payload lacks the gzip magic is logged but not failed, since
    /// the bytes themselves are already durable.
    fn verify(&self, key: &str) -> Result<(), Error> {
        let head = self
            .runtime
            .block_on(self.client.head_object().bucket(&self.bucket).key(key).send())
            .map_err(sdk_error)?;

        info!(
            key,
            size = head.content_length().unwrap_or_default(),
            etag = head.e_tag().unwrap_or_default(),
            "Upload verified",
        );

        if key.ends_with(".gz") {
            let object = self
                .runtime
                .block_on(
                    self.client
                        .get_object()
                        .bucket(&self.bucket)
                        .key(key)
                        .range("bytes=0-1")
                        .send(),
                )
                .map_err(sdk_error)?;

            let bytes = self
                .runtime
                .block_on(object.body.collect())
                .map_err(|err| Error::Storage(err.to_string()))?
                .into_bytes();

            if bytes.as_ref() != GZIP_MAGIC {
                warn!(key, "Uploaded object does not start with the gzip magic");
            }
        }

        Ok(())
    }
}


pub fn genome_key(final_prefix: &str, source: Source, accession: &str, filename: &str) -> String {
    format!("{}/{}/genomes/{}/{}", final_prefix.trim_end_matches('/'), source, accession, filename)
}

pub fn protein_key(proteins_prefix: &str, source: Source, accession: &str, filename: &str) -> String {
    format!("{}/{}/{}/{}", proteins_prefix.trim_end_matches('/'), source, accession, filename)
}

fn content_type_for(key: &str) -> Option<&'static str> {
    // opaque gzip objects, not transport-encoded responses, so no
    // content-encoding header gets set
    if key.ends_with(".gz") {
        Some("application/gzip")
    } else {
        None
    }
}

fn file_name(path: &Path) -> Option<String> {
    match path.file_name().and_then(|name| name.to_str()) {
        Some(name) => Some(name.to_string()),
        None => {
            error!(file = %path.display(), "Upload path has no usable filename");
            None
        }
    }
}

fn part_count(size: u64) -> u64 {
    size.div_ceil(PART_SIZE)
}

fn read_chunk(path: &PathBuf, offset: u64, length: usize) -> Result<Vec<u8>, Error> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buffer = vec![0u8; length];
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

fn sdk_error<E>(err: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::Storage(format!("{}", DisplayErrorContext(err)))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_layout_templates() {
        assert_eq!(
            genome_key("genomes/final/", Source::Ncbi, "GCF_000001.1", "GCF_000001.1_genomic.fna.gz"),
            "genomes/final/ncbi/genomes/GCF_000001.1/GCF_000001.1_genomic.fna.gz",
        );
        assert_eq!(
            protein_key("proteins", Source::Mgnify, "ERR12_FASTQ.fasta", "ERR12_FASTQ_proteins.faa.gz"),
            "proteins/mgnify/ERR12_FASTQ.fasta/ERR12_FASTQ_proteins.faa.gz",
        );
    }

    #[test]
    fn gzip_keys_get_the_gzip_content_type() {
        assert_eq!(content_type_for("a/b/genome.fna.gz"), Some("application/gzip"));
        assert_eq!(content_type_for("a/b/genome.fna"), None);
    }

    #[test]
    fn part_count_covers_the_whole_object() {
        assert_eq!(part_count(PART_SIZE), 1);
        assert_eq!(part_count(PART_SIZE + 1), 2);
        assert_eq!(part_count(MULTIPART_THRESHOLD), 8);
    }
}
