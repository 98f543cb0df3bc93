// TideFS Local Store — one file per object under a root directory
//
// Object ids map to fixed-width hex file names, so a directory scan at open
// time recovers the allocation high-water mark. Writes go through the page
// cache and are made durable by `sync`; positional reads past the end of a
// file come back zero-filled, matching the sparse record layout the quota
// ledger relies on.

use crate::{BackingStore, FsError, FsResult, ObjectId};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub struct FileStore {
    root: PathBuf,
    next_id: AtomicU64,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`. Existing object
    /// files are scanned to seed the id allocator past them.
    pub fn open(root: impl AsRef<Path>) -> FsResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(map_io)?;

        let mut max_id = 0u64;
        for entry in std::fs::read_dir(&root).map_err(map_io)? {
            let entry = entry.map_err(map_io)?;
            if let Some(id) = parse_object_name(&entry.file_name()) {
                max_id = max_id.max(id);
            }
        }
        log::info!(
            "opened local store at {} (next object id {})",
            root.display(),
            max_id + 1
        );
        Ok(Self {
            root,
            next_id: AtomicU64::new(max_id + 1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: ObjectId) -> PathBuf {
        self.root.join(format!("{:016x}.obj", id))
    }

    fn open_existing(&self, id: ObjectId) -> FsResult<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.object_path(id))
            .map_err(map_io)
    }
}

fn parse_object_name(name: &std::ffi::OsStr) -> Option<u64> {
    let name = name.to_str()?;
    let hex = name.strip_suffix(".obj")?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

fn map_io(e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound,
        _ => FsError::StorageError,
    }
}

impl BackingStore for FileStore {
    fn read_record(&self, id: ObjectId) -> FsResult<Vec<u8>> {
        std::fs::read(self.object_path(id)).map_err(map_io)
    }

    fn write_record(&self, id: ObjectId, bytes: &[u8]) -> FsResult<()> {
        // Truncate-and-rewrite of an object that must already exist.
        let file = self.open_existing(id)?;
        file.set_len(0).map_err(map_io)?;
        let mut file = file;
        file.write_all(bytes).map_err(map_io)
    }

    fn read_at(&self, id: ObjectId, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        let mut file = File::open(self.object_path(id)).map_err(map_io)?;
        file.seek(SeekFrom::Start(offset)).map_err(map_io)?;

        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match file.read(&mut out[filled..]) {
                Ok(0) => break, // remainder stays zero
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io(e)),
            }
        }
        Ok(out)
    }

    fn write_at(&self, id: ObjectId, offset: u64, bytes: &[u8]) -> FsResult<()> {
        let mut file = self.open_existing(id)?;
        file.seek(SeekFrom::Start(offset)).map_err(map_io)?;
        file.write_all(bytes).map_err(map_io)
    }

    fn allocate_object(&self, _kind_hint: u32, _parent_hint: Option<ObjectId>) -> FsResult<ObjectId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.object_path(id))
            .map_err(|e| {
                log::warn!("could not allocate object {}: {}", id, e);
                FsError::AllocationError
            })?;
        Ok(id)
    }

    fn free_object(&self, id: ObjectId) -> FsResult<()> {
        std::fs::remove_file(self.object_path(id)).map_err(map_io)
    }

    fn sync(&self) -> FsResult<()> {
        // No handles are kept open between calls, so each object file is
        // reopened and fsynced.
        for entry in std::fs::read_dir(&self.root).map_err(map_io)? {
            let entry = entry.map_err(map_io)?;
            if parse_object_name(&entry.file_name()).is_some() {
                let file = File::open(entry.path()).map_err(map_io)?;
                file.sync_all().map_err(map_io)?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
