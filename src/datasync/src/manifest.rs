use crate::error::SyncError;
use openssl::sha::Sha1;
use std::{fs::File, io::Read, path::Path};

pub const DIGEST_LEN: usize = 20;
pub type Digest = [u8; DIGEST_LEN];

/// Streaming SHA-1 of a file's full content.
pub fn sha1_file(path: &Path) -> Result<Digest, SyncError> {
    let mut file = File::open(path).map_err(|e| SyncError::io(path, e))?;
    let mut ctx = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| SyncError::io(path, e))?;
        if n == 0 {
            return Ok(ctx.finish());
        }
        ctx.update(&buf[..n]);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub digest: Digest,
}

/// Snapshot of a directory: (file name, content hash) for every regular file
/// directly inside it. Subdirectories and symlinks to non-files are not
/// listed; a symlink to a regular file is hashed through its target.
/// Entries are sorted by name so two manifests of equal content compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileManifest {
    entries: Vec<ManifestEntry>,
}

impl FileManifest {
    pub fn of_dir(dir: &Path) -> Result<FileManifest, SyncError> {
        let mut entries = Vec::new();
        let iter = std::fs::read_dir(dir).map_err(|e| SyncError::io(dir, e))?;
        for item in iter {
            let item = item.map_err(|e| SyncError::io(dir, e))?;
            let path = item.path();
            // metadata() follows symlinks, so a link to a file is included
            let meta = std::fs::metadata(&path).map_err(|e| SyncError::io(&path, e))?;
            if !meta.is_file() {
                continue;
            }
            let name = match item.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue, // non-UTF-8 names cannot be expressed upstream
            };
            let digest = sha1_file(&path)?;
            entries.push(ManifestEntry { name, digest });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(FileManifest { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<&Digest> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i].digest)
    }
}
