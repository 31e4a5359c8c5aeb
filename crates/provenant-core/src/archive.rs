//! Capsule archives: one gzip'd tar per sealing, manifest first, then payload and files.
//!
//! Bundles are written under `archives/.staging/` and promoted to their final
//! name in one step, so the final path only ever holds a complete archive.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tar::{Archive as TarArchive, Builder, Header};

use crate::cas::{ContentAddressableStore, MerkleTree};
use crate::error::{invalid_input, io_error, serde_error, ProvenanceError, Result};
use crate::hasher::{self, Digest};
use crate::utils;

pub const MANIFEST_NAME: &str = "manifest.json";
pub const PRIMARY_NAME: &str = "payload/primary";
pub const FILES_PREFIX: &str = "files/";
pub const ARCHIVE_EXT: &str = ".tar.gz";
const STAGING_DIR: &str = ".staging";
const PARTIAL_EXT: &str = ".partial";
const FORMAT_VERSION: u32 = 1;

/// A capsule as the archiver sees it: references into the CAS, not bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capsule {
    pub capsule_id: String,
    pub primary_payload_digest: Digest,
    /// Associated file name -> digest
    pub associated_files: BTreeMap<String, Digest>,
    pub metadata: Value,
}

impl Capsule {
    /// `(archive member name, digest)` for every referenced blob, primary first.
    pub fn members(&self) -> Vec<(String, Digest)> {
        let mut out = vec![(PRIMARY_NAME.to_string(), self.primary_payload_digest)];
        out.extend(
            self.associated_files
                .iter()
                .map(|(name, d)| (format!("{}{}", FILES_PREFIX, name), *d)),
        );
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub digest: Digest,
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub capsule_id: String,
    pub created_at: String,
    /// Sorted by name
    pub files: Vec<ManifestFile>,
    pub merkle_root: Digest,
    pub metadata: Value,
}

impl Manifest {
    pub fn leaves(&self) -> Vec<(String, Digest)> {
        self.files.iter().map(|f| (f.name.clone(), f.digest)).collect()
    }
}

/// A sealed, immutable bundle at its final path
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Archive {
    pub archive_path: PathBuf,
    pub manifest: Manifest,
}

/// A fully written bundle still sitting in the staging area.
/// Dropping it without `promote` leaves an orphan for `sweep_staging`.
#[derive(Debug)]
pub struct StagedArchive {
    temp_path: PathBuf,
    final_path: PathBuf,
    manifest: Manifest,
}

impl StagedArchive {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The single atomicity boundary: link the staged file into place, never overwriting.
    pub fn promote(self) -> Result<Archive> {
        match fs::hard_link(&self.temp_path, &self.final_path) {
            Ok(()) => {
                let _ = fs::remove_file(&self.temp_path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(ProvenanceError::WriteFailure {
                    operation: "archive_promote".to_string(),
                    path: Some(self.final_path.display().to_string()),
                    source: "final archive path already exists".to_string(),
                });
            }
            Err(_) => {
                // filesystems without hard links
                if self.final_path.exists() {
                    return Err(ProvenanceError::WriteFailure {
                        operation: "archive_promote".to_string(),
                        path: Some(self.final_path.display().to_string()),
                        source: "final archive path already exists".to_string(),
                    });
                }
                fs::rename(&self.temp_path, &self.final_path)
                    .map_err(|e| io_error("archive_promote", Some(&self.final_path), e))?;
            }
        }
        utils::log(&format!(
            "archive: sealed {} -> {}",
            self.manifest.capsule_id,
            self.final_path.display()
        ));
        Ok(Archive { archive_path: self.final_path, manifest: self.manifest })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheck {
    pub name: String,
    pub expected: Digest,
    /// None when the member is missing from the bundle
    pub actual: Option<Digest>,
    pub matches: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub archive_path: PathBuf,
    pub manifest: Manifest,
    pub files: Vec<FileCheck>,
    /// Members present in the bundle but absent from the manifest
    pub unexpected: Vec<String>,
    pub recomputed_root: Digest,
    pub merkle_root_matches: bool,
    pub digests_match: bool,
}

impl ArchiveReport {
    pub fn is_valid(&self) -> bool {
        self.merkle_root_matches && self.digests_match
    }
}

pub struct Archiver {
    dir: PathBuf,
    staging: PathBuf,
    cas: Arc<ContentAddressableStore>,
}

impl Archiver {
    pub fn new(dir: impl Into<PathBuf>, cas: Arc<ContentAddressableStore>) -> Result<Self> {
        let dir = dir.into();
        let staging = dir.join(STAGING_DIR);
        fs::create_dir_all(&staging).map_err(|e| io_error("archiver_open", Some(&staging), e))?;
        Ok(Self { dir, staging, cas })
    }

    /// stage + promote
    pub fn seal(&self, capsule: &Capsule) -> Result<Archive> {
        self.stage(capsule)?.promote()
    }

    /// Fetch every referenced blob, build the manifest and write the bundle to staging.
    pub fn stage(&self, capsule: &Capsule) -> Result<StagedArchive> {
        validate_capsule(capsule)?;

        let mut contents: Vec<(String, Digest, Vec<u8>)> = Vec::new();
        for (name, digest) in capsule.members() {
            let bytes = self.cas.get(&digest).map_err(|e| match e {
                ProvenanceError::NotFound { .. } => ProvenanceError::MissingBlob {
                    capsule_id: capsule.capsule_id.clone(),
                    digest: digest.to_hex(),
                },
                other => other,
            })?;
            contents.push((name, digest, bytes));
        }
        contents.sort_by(|a, b| a.0.cmp(&b.0));

        let tree = MerkleTree::build(contents.iter().map(|(n, d, _)| (n.clone(), *d)).collect())?;
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            capsule_id: capsule.capsule_id.clone(),
            created_at: utils::now_rfc3339(),
            files: contents
                .iter()
                .map(|(name, digest, bytes)| ManifestFile {
                    name: name.clone(),
                    digest: *digest,
                    size: bytes.len() as u64,
                })
                .collect(),
            merkle_root: tree.root(),
            metadata: capsule.metadata.clone(),
        };

        let file_name = format!(
            "{}-{}-{}{}",
            utils::sanitize_component(&capsule.capsule_id),
            utils::compact_stamp(),
            utils::random_hex(4),
            ARCHIVE_EXT
        );
        let final_path = self.dir.join(&file_name);
        let temp_path = self.staging.join(format!("{}{}", file_name, PARTIAL_EXT));

        if let Err(e) = write_bundle(&temp_path, &manifest, &contents) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        Ok(StagedArchive { temp_path, final_path, manifest })
    }

    /// Re-hash every member and recompute the Merkle root from the manifest.
    /// Unreadable bundles are errors; content mismatches are reported, not raised.
    pub fn inspect(&self, path: &Path) -> Result<ArchiveReport> {
        inspect_archive(path)
    }

    pub fn verify(&self, path: &Path) -> Result<bool> {
        Ok(self.inspect(path)?.is_valid())
    }

    /// Promoted archives, sorted by file name
    pub fn list_archives(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| io_error("archive_list", Some(&self.dir), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && path.to_string_lossy().ends_with(ARCHIVE_EXT) {
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Remove staged bundles left behind by interrupted seals. Returns how many were removed.
    pub fn sweep_staging(&self) -> Result<usize> {
        let mut removed = 0;
        let entries =
            fs::read_dir(&self.staging).map_err(|e| io_error("archive_sweep", Some(&self.staging), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.to_string_lossy().ends_with(PARTIAL_EXT) {
                fs::remove_file(&path).map_err(|e| io_error("archive_sweep", Some(&path), e))?;
                removed += 1;
            }
        }
        if removed > 0 {
            utils::log(&format!("archive: swept {} orphaned staging files", removed));
        }
        Ok(removed)
    }

    /// Remove a promoted archive that was never recorded anywhere.
    pub(crate) fn discard(&self, archive: &Archive) -> Result<()> {
        fs::remove_file(&archive.archive_path)
            .map_err(|e| io_error("archive_discard", Some(&archive.archive_path), e))?;
        utils::log(&format!("archive: rolled back {}", archive.archive_path.display()));
        Ok(())
    }
}

/// File names must be plain, non-empty, relative names.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(invalid_input("capsule_file_name", format!("unusable file name {:?}", name)));
    }
    Ok(())
}

fn validate_capsule(capsule: &Capsule) -> Result<()> {
    if capsule.capsule_id.trim().is_empty() {
        return Err(invalid_input("seal", "capsule_id must not be empty"));
    }
    for name in capsule.associated_files.keys() {
        validate_file_name(name)?;
    }
    Ok(())
}

fn tar_header(size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    header
}

fn write_bundle(temp_path: &Path, manifest: &Manifest, contents: &[(String, Digest, Vec<u8>)]) -> Result<()> {
    let io = |e: std::io::Error| io_error("archive_stage", Some(temp_path), e);
    let manifest_bytes = serde_json::to_vec_pretty(manifest).map_err(|e| serde_error("archive_manifest", e))?;

    let file = File::create(temp_path).map_err(io)?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    builder
        .append_data(&mut tar_header(manifest_bytes.len() as u64), MANIFEST_NAME, &manifest_bytes[..])
        .map_err(io)?;
    for (name, _, bytes) in contents {
        builder
            .append_data(&mut tar_header(bytes.len() as u64), name, &bytes[..])
            .map_err(io)?;
    }
    let encoder = builder.into_inner().map_err(io)?;
    let file = encoder.finish().map_err(io)?;
    file.sync_all().map_err(io)?;
    Ok(())
}

fn corrupt(path: &Path, reason: impl Into<String>) -> ProvenanceError {
    ProvenanceError::CorruptArchive {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn read_members(path: &Path) -> Result<HashMap<String, Vec<u8>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(crate::error::not_found("archive_open", path.display().to_string()));
        }
        Err(e) => return Err(io_error("archive_open", Some(path), e)),
    };
    let mut archive = TarArchive::new(GzDecoder::new(file));
    let mut members = HashMap::new();
    let entries = archive.entries().map_err(|e| corrupt(path, e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(path, e.to_string()))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(path, e.to_string()))?
            .to_string_lossy()
            .to_string();
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| corrupt(path, e.to_string()))?;
        members.insert(name, bytes);
    }
    Ok(members)
}

pub fn inspect_archive(path: &Path) -> Result<ArchiveReport> {
    let mut members = read_members(path)?;
    let manifest_bytes = members
        .remove(MANIFEST_NAME)
        .ok_or_else(|| corrupt(path, "missing manifest.json"))?;
    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| corrupt(path, format!("unreadable manifest: {}", e)))?;

    let files: Vec<FileCheck> = manifest
        .files
        .par_iter()
        .map(|f| {
            let actual = members.get(&f.name).map(|b| hasher::digest(b));
            FileCheck {
                name: f.name.clone(),
                expected: f.digest,
                actual,
                matches: actual == Some(f.digest),
            }
        })
        .collect();

    let mut unexpected: Vec<String> = members
        .keys()
        .filter(|name| !manifest.files.iter().any(|f| &f.name == *name))
        .cloned()
        .collect();
    unexpected.sort();

    let recomputed_root = match MerkleTree::build(manifest.leaves()) {
        Ok(tree) => tree.root(),
        Err(_) => return Err(corrupt(path, "manifest lists one name with two digests")),
    };
    let merkle_root_matches = recomputed_root == manifest.merkle_root;
    let digests_match = files.iter().all(|f| f.matches) && unexpected.is_empty();

    if !(merkle_root_matches && digests_match) {
        utils::log_error(&format!("archive: verification failed for {}", path.display()));
    }

    Ok(ArchiveReport {
        archive_path: path.to_path_buf(),
        manifest,
        files,
        unexpected,
        recomputed_root,
        merkle_root_matches,
        digests_match,
    })
}
