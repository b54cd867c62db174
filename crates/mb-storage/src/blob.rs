use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use mb_core::{BlobStore, MbError, MbResult};

/// Disk-backed blob store: one file per image at `<root>/<id>.<ext>`.
/// The directory is created on first use.
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_root(&self) -> MbResult<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| MbError::Storage(format!("create storage dir: {e}")))
    }

    fn target(&self, id: Uuid, ext: &str) -> PathBuf {
        self.root.join(format!("{id}.{ext}"))
    }
}

impl BlobStore for DiskBlobStore {
    fn write(&self, id: Uuid, ext: &str, bytes: &[u8]) -> MbResult<PathBuf> {
        self.ensure_root()?;
        let dest = self.target(id, ext);
        fs::write(&dest, bytes).map_err(|e| MbError::Storage(format!("write blob: {e}")))?;
        Ok(dest)
    }

    fn move_in(&self, id: Uuid, ext: &str, src: &Path) -> MbResult<PathBuf> {
        self.ensure_root()?;
        let dest = self.target(id, ext);
        if fs::rename(src, &dest).is_err() {
            // Rename fails across filesystem boundaries; copy then unlink.
            fs::copy(src, &dest).map_err(|e| MbError::Storage(format!("copy blob: {e}")))?;
            fs::remove_file(src)
                .map_err(|e| MbError::Storage(format!("remove source after copy: {e}")))?;
        }
        Ok(dest)
    }

    fn read(&self, path: &Path) -> MbResult<Vec<u8>> {
        fs::read(path).map_err(|e| MbError::Storage(format!("read blob {}: {e}", path.display())))
    }

    fn delete(&self, path: &Path) -> MbResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MbError::Storage(format!("delete blob: {e}"))),
        }
    }
}
