/// File storage for both ends of a transfer.
///
/// The server reads ranges out of served files. The client sizes its output
/// up front and writes each chunk at its offset.
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

/// Byte-addressable file storage used by both ends of a transfer.
///
/// Names are the filenames that travel on the wire; implementations decide
/// where they live.
pub trait Storage: Send + Sync {
    /// True if `name` is a regular file that can be served.
    fn exists(&self, name: &str) -> bool;

    fn size(&self, name: &str) -> io::Result<u64>;

    /// Read exactly `len` bytes at `offset`.
    fn read(&self, name: &str, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Create (or truncate) `name` and size it to `size` bytes.
    fn create(&self, name: &str, size: u64) -> io::Result<()>;

    fn write(&self, name: &str, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Delete `name`. Deleting a missing file is not an error.
    fn remove(&self, name: &str) -> io::Result<()>;
}

/// Storage rooted at a directory on disk.
///
/// A wire name maps to `{dir}/{name}`. Names that would escape the directory
/// (absolute paths, `..`) are refused.
pub struct DirStorage {
    dir: PathBuf,
}

impl DirStorage {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("File storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Path for a wire name, or `InvalidInput` if it leaves the root.
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let rel = Path::new(name);
        let safe = !name.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing path outside storage: {name}"),
            ));
        }
        Ok(self.dir.join(rel))
    }
}

impl Storage for DirStorage {
    fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    fn size(&self, name: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.resolve(name)?)?.len())
    }

    fn read(&self, name: &str, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = fs::File::open(self.resolve(name)?)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn create(&self, name: &str, size: u64) -> io::Result<()> {
        let path = self.resolve(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::File::create(&path)?;
        file.set_len(size)?;
        Ok(())
    }

    fn write(&self, name: &str, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = fs::OpenOptions::new().write(true).open(self.resolve(name)?)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        match fs::remove_file(self.resolve(name)?) {
            Ok(()) => {
                info!("Deleted {}", name);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("{} already gone", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
