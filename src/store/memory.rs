//! in-memory store, optionally mirrored to a JSON snapshot on disk
//!
//! With a snapshot file every write is persisted before it returns (write to a
//! sibling temp file, then rename). Writers from every process sharing the
//! file serialize on an advisory lock next to it and re-read the snapshot
//! under that lock, so a compare-and-swap always sees the latest row. Reads
//! reload whenever the file's fingerprint changes.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::model::{Domain, Record, RecordType, Verification, VerificationStatus};
use crate::store::{RecordStore, Result, StoreError, TxtAnswer, VerificationStore};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    domains: Vec<Domain>,
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    verifications: Vec<Verification>,
}

/// Identifies one version of the snapshot file. Every persist renames a new
/// file into place, so the inode changes even when mtime and size do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

#[derive(Default)]
struct Inner {
    snapshot: Snapshot,
    loaded: Option<Fingerprint>,
}

#[derive(Default)]
pub struct MemoryStore {
    path: Option<PathBuf>,
    inner: RwLock<Inner>,
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.to_path_buf().into_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> u64 {
    0
}

fn fingerprint(path: &Path) -> Result<Option<Fingerprint>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(Fingerprint {
            modified: meta.modified().ok(),
            len: meta.len(),
            inode: inode(&meta),
        })),
        Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn load_snapshot(path: &Path) -> Result<Snapshot> {
    let data = fs::read(path)?;
    if data.is_empty() {
        return Ok(Snapshot::default());
    }

    Ok(serde_json::from_slice(&data)?)
}

/// Exclusive advisory lock on `<snapshot>.lock`, held for one write.
/// Released when dropped.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<FileLock> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(sibling(path, ".lock"))?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

impl MemoryStore {
    /// A store that lives only as long as the process
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    /// A store backed by a JSON snapshot, which is created on first write
    pub fn open<P: AsRef<Path>>(path: P) -> Result<MemoryStore> {
        let store = MemoryStore {
            path: Some(path.as_ref().to_path_buf()),
            inner: RwLock::new(Inner::default()),
        };
        store.refresh()?;

        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn refresh(&self) -> Result<()> {
        let path = match self.path {
            Some(ref path) => path,
            None => return Ok(()),
        };

        let current = fingerprint(path)?;
        if current.is_none() || self.inner.read().loaded == current {
            return Ok(());
        }

        let mut inner = self.inner.write();
        if inner.loaded == current {
            return Ok(());
        }

        inner.snapshot = load_snapshot(path)?;
        inner.loaded = current;

        log::debug!("Loaded store snapshot from {}", path.display());

        Ok(())
    }

    fn persist(path: &Path, snapshot: &Snapshot) -> Result<Option<Fingerprint>> {
        let tmp = sibling(path, ".tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        fs::rename(&tmp, path)?;

        fingerprint(path)
    }

    fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Snapshot) -> R,
    {
        self.refresh()?;
        Ok(f(&self.inner.read().snapshot))
    }

    /// Run `f` against a copy of the latest snapshot. The copy replaces the
    /// current state only once it is persisted; if `f` or the persist fails
    /// nothing changes.
    fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Snapshot) -> Result<R>,
    {
        let mut inner = self.inner.write();

        let path = match self.path {
            Some(ref path) => path,
            None => {
                let mut next = inner.snapshot.clone();
                let result = f(&mut next)?;
                inner.snapshot = next;
                return Ok(result);
            }
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let _lock = FileLock::acquire(path)?;

        // another process may have written since our last look
        let mut next = match fingerprint(path)? {
            Some(current) => {
                let loaded = load_snapshot(path)?;
                inner.snapshot = loaded.clone();
                inner.loaded = Some(current);
                loaded
            }
            None => inner.snapshot.clone(),
        };

        let result = f(&mut next)?;
        let persisted = MemoryStore::persist(path, &next)?;

        inner.snapshot = next;
        inner.loaded = persisted;

        Ok(result)
    }
}

impl RecordStore for MemoryStore {
    fn find_active_txt_records(&self, name: &str) -> Result<Vec<TxtAnswer>> {
        let name = normalize_name(name);

        self.read(|snapshot| {
            snapshot
                .records
                .iter()
                .filter(|rec| rec.active && rec.record_type == RecordType::TXT)
                .filter(|rec| rec.fqdn() == name)
                .map(|rec| TxtAnswer {
                    value: rec.value.clone(),
                    ttl: rec.ttl,
                })
                .collect()
        })
    }

    fn find_records_for_domain(&self, domain_id: Uuid) -> Result<Vec<Record>> {
        self.read(|snapshot| {
            snapshot
                .records
                .iter()
                .filter(|rec| rec.domain_id == domain_id)
                .cloned()
                .collect()
        })
    }

    fn insert_record(&self, record: Record) -> Result<Record> {
        self.write(move |snapshot| {
            let domain = snapshot
                .domains
                .iter()
                .find(|d| d.id == record.domain_id)
                .ok_or_else(|| StoreError::NotFound(format!("domain {}", record.domain_id)))?;

            let mut record = record;
            record.domain = domain.name.clone();

            snapshot.records.push(record.clone());
            Ok(record)
        })
    }

    fn set_record_active(&self, record_id: Uuid, active: bool) -> Result<Record> {
        self.write(|snapshot| {
            let record = snapshot
                .records
                .iter_mut()
                .find(|rec| rec.id == record_id)
                .ok_or_else(|| StoreError::NotFound(format!("record {}", record_id)))?;

            record.active = active;
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
    }

    fn find_domain_by_name(&self, name: &str) -> Result<Option<Domain>> {
        let name = normalize_name(name);
        self.read(|snapshot| snapshot.domains.iter().find(|d| d.name == name).cloned())
    }

    fn insert_domain(&self, domain: Domain) -> Result<Domain> {
        self.write(move |snapshot| {
            let mut domain = domain;
            domain.name = normalize_name(&domain.name);

            if let Some(existing) = snapshot.domains.iter().find(|d| d.name == domain.name) {
                return Ok(existing.clone());
            }

            snapshot.domains.push(domain.clone());
            Ok(domain)
        })
    }

    fn list_domains(&self) -> Result<Vec<Domain>> {
        self.read(|snapshot| snapshot.domains.clone())
    }

    fn set_domain_verified(&self, name: &str, verified: bool) -> Result<Domain> {
        let name = normalize_name(name);

        self.write(|snapshot| {
            let domain = snapshot
                .domains
                .iter_mut()
                .find(|d| d.name == name)
                .ok_or_else(|| StoreError::NotFound(format!("domain {}", name)))?;

            let now = Utc::now();
            domain.verified = verified;
            domain.verified_at = if verified { Some(now) } else { None };
            domain.updated_at = now;
            Ok(domain.clone())
        })
    }
}

impl VerificationStore for MemoryStore {
    fn get_verification(&self, id: Uuid) -> Result<Option<Verification>> {
        self.read(|snapshot| snapshot.verifications.iter().find(|v| v.id == id).cloned())
    }

    fn find_by_token(&self, token: &str) -> Result<Option<Verification>> {
        self.read(|snapshot| {
            snapshot
                .verifications
                .iter()
                .find(|v| v.token == token)
                .cloned()
        })
    }

    fn find_by_domain(&self, domain: &str) -> Result<Vec<Verification>> {
        let domain = normalize_name(domain);

        self.read(|snapshot| {
            let mut found: Vec<Verification> = snapshot
                .verifications
                .iter()
                .filter(|v| v.domain == domain)
                .cloned()
                .collect();
            found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            found
        })
    }

    fn insert_pending_verification(&self, candidate: Verification) -> Result<Verification> {
        self.write(move |snapshot| {
            let existing = snapshot.verifications.iter().find(|v| {
                v.status == VerificationStatus::Pending
                    && v.domain == candidate.domain
                    && v.service_id == candidate.service_id
            });

            if let Some(existing) = existing {
                return Ok(existing.clone());
            }

            snapshot.verifications.push(candidate.clone());
            Ok(candidate)
        })
    }

    fn insert_verification(&self, verification: Verification) -> Result<Verification> {
        self.write(move |snapshot| {
            if snapshot.verifications.iter().any(|v| v.id == verification.id) {
                return Err(StoreError::Conflict(format!(
                    "verification {}",
                    verification.id
                )));
            }

            snapshot.verifications.push(verification.clone());
            Ok(verification)
        })
    }

    fn compare_and_swap_verification(
        &self,
        expected: &Verification,
        new: &Verification,
    ) -> Result<bool> {
        self.write(|snapshot| {
            let stored = snapshot
                .verifications
                .iter_mut()
                .find(|v| v.id == expected.id)
                .ok_or_else(|| StoreError::NotFound(format!("verification {}", expected.id)))?;

            if stored.status != expected.status || stored.attempts != expected.attempts {
                return Ok(false);
            }

            *stored = new.clone();
            Ok(true)
        })
    }

    fn list_pending(&self) -> Result<Vec<Verification>> {
        self.read(|snapshot| {
            snapshot
                .verifications
                .iter()
                .filter(|v| v.status == VerificationStatus::Pending)
                .cloned()
                .collect()
        })
    }

    fn delete_for_domain(&self, domain: &str) -> Result<usize> {
        let domain = normalize_name(domain);

        self.write(|snapshot| {
            let before = snapshot.verifications.len();
            snapshot.verifications.retain(|v| v.domain != domain);
            Ok(before - snapshot.verifications.len())
        })
    }
}
