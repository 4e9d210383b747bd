use std::fs;
use std::path::{Path, PathBuf};

use sysinfo::Disks;
use tracing::{info, warn};


const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;


/// Free-space guard for the shared workspace filesystem.
///
/// Reclaimable artifacts are anything the pipeline can regenerate or has
/// abandoned: `splits` directories from metagenome prediction and `.part`
/// files from interrupted downloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskManager;

impl DiskManager {
    pub fn new() -> DiskManager {
        DiskManager
    }

    /// Check free space at the filesystem root, purging reclaimable
    /// artifacts under the given roots if the threshold is not met.
    /// Returns false when space cannot be recovered.
    pub fn ensure_free_space(&self, min_gb: u64, purge_roots: &[&Path]) -> bool {
        let free = free_space_gb();
        if free >= min_gb {
            return true;
        }

        warn!(free_gb = free, min_gb, "Low disk space, purging reclaimable artifacts");
        for root in purge_roots {
            purge_reclaimable(root);
        }

        let free = free_space_gb();
        if free < min_gb {
            warn!(free_gb = free, min_gb, "Purge did not recover enough space");
            return false;
        }

        info!(free_gb = free, "Free space recovered");
        true
    }

    /// Best-effort removal of files left behind after an item completes.
    pub fn cleanup_files(&self, paths: &[PathBuf]) {
        for path in paths {
            if path.exists() {
                if let Err(err) = fs::remove_file(path) {
                    warn!(file = %path.display(), %err, "Failed to remove file");
                }
            }
        }
    }

    pub fn cleanup_directory(&self, dir: &Path) {
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(dir) {
                warn!(dir = %dir.display(), %err, "Failed to remove directory");
            }
        }
    }
}


fn free_space_gb() -> u64 {
    let disks = Disks::new_with_refreshed_list();

    // the disk mounted closest to the filesystem root backs the workspace
    let mut best: Option<(usize, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        let depth = mount.components().count();
        match best {
            Some((best_depth, _)) if depth >= best_depth => {}
            _ => best = Some((depth, disk.available_space())),
        }
    }

    best.map(|(_, available)| available / BYTES_PER_GB).unwrap_or(u64::MAX)
}

fn purge_reclaimable(root: &Path) {
    if !root.exists() {
        return;
    }

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %root.display(), %err, "Failed to scan purge root");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();

        if path.is_dir() {
            if entry.file_name() == "splits" {
                info!(dir = %path.display(), "Purging splits directory");
                if let Err(err) = fs::remove_dir_all(&path) {
                    warn!(dir = %path.display(), %err, "Failed to purge splits directory");
                }
            } else {
                purge_reclaimable(&path);
            }
            continue;
        }

        let is_partial = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(".part"))
            .unwrap_or(false);

        if is_partial {
            info!(file = %path.display(), "Purging partial download");
            if let Err(err) = fs::remove_file(&path) {
                warn!(file = %path.display(), %err, "Failed to purge partial download");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn purge_removes_splits_dirs_and_part_files() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        let splits = root.join("work/GCF_1/splits");
        fs::create_dir_all(&splits).unwrap();
        fs::write(splits.join("part_001.fasta"), ">a\nACGT\n").unwrap();

        let partial = root.join("work/download.fasta.part");
        fs::write(&partial, "half a file").unwrap();

        let keeper = root.join("work/genome.fna");
        fs::write(&keeper, ">a\nACGT\n").unwrap();

        purge_reclaimable(root);

        assert!(!splits.exists());
        assert!(!partial.exists());
        assert!(keeper.exists());
    }

    #[test]
    fn purge_tolerates_missing_root() {
        purge_reclaimable(Path::new("/definitely/not/a/real/path"));
    }

    #[test]
    fn cleanup_helpers_are_best_effort() {
        let dir = tempdir().unwrap();
        let manager = DiskManager::new();

        let file = dir.path().join("leftover.fasta");
        fs::write(&file, "x").unwrap();
        manager.cleanup_files(&[file.clone(), dir.path().join("never-existed")]);
        assert!(!file.exists());

        let work = dir.path().join("work");
        fs::create_dir_all(work.join("nested")).unwrap();
        manager.cleanup_directory(&work);
        assert!(!work.exists());
    }
}
