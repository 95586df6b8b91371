use memmap2::{Mmap, MmapMut};
use std::{
    fs::{File, Metadata, OpenOptions},
    io,
    path::{Path, PathBuf},
};

/// Directory backing named shared-memory regions.
///
/// On Linux `/dev/shm` is a tmpfs, so a file there is plain shared memory with
/// a name. Elsewhere we fall back to the system temp directory.
pub fn region_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Resolve a region name to the file that backs it.
///
/// Names containing a path separator are treated as explicit paths, which is
/// what the tests use to keep regions inside a scratch directory.
pub fn region_path(name: &str) -> PathBuf {
    if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
        PathBuf::from(name)
    } else {
        region_dir().join(name)
    }
}

/// Identity of the file behind a mapping.
///
/// A writer that crashed and was replaced by one that recreated the file gives
/// us a new inode; the old mapping then points at an orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn of(meta: &Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_meta: &Metadata) -> Option<Self> {
        None
    }
}

pub struct MmapFileMut {
    _file: File,
    mmap: MmapMut,
}

pub struct MmapFile {
    _file: File,
    mmap: Mmap,
    path: PathBuf,
    id: Option<FileId>,
}

impl MmapFileMut {
    /// Open `path` (creating it if absent) and map it read-write.
    ///
    /// The file is grown to `size_bytes` when it is shorter, never truncated.
    /// Returns the mapping and whether the file was freshly created.
    pub fn create_or_attach<P: AsRef<Path>>(path: P, size_bytes: u64) -> io::Result<(Self, bool)> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let current = file.metadata()?.len();
        let created = current == 0;
        if current < size_bytes {
            file.set_len(size_bytes)?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok((Self { _file: file, mmap }, created))
    }

    /// Map an existing region read/write as-is, without the create path's
    /// sizing. For tooling and tests that inspect or patch a live region.
    pub fn open_rw<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self { _file: file, mmap })
    }

    /// Return raw pointer to start of memory mapped file data
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    /// Size of the mapping, which may exceed what was asked for if the file
    /// was already larger.
    #[inline]
    pub fn mapped_len(&self) -> usize {
        self.mmap.len()
    }
}

impl MmapFile {
    /// Open an existing file and map it read-only
    pub fn open_ro<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let id = FileId::of(&file.metadata()?);

        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            _file: file,
            mmap,
            path,
            id,
        })
    }

    /// Return raw pointer to start of memory mapped file data
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Size of the mapping, which may exceed what was asked for if the file
    /// was already larger.
    #[inline]
    pub fn mapped_len(&self) -> usize {
        self.mmap.len()
    }

    /// True when the path no longer names the file we mapped (removed or
    /// recreated). Always false on platforms without inode identity.
    pub fn is_replaced(&self) -> bool {
        let Some(ours) = self.id else {
            return false;
        };
        match std::fs::metadata(&self.path) {
            Ok(meta) => FileId::of(&meta) != Some(ours),
            Err(_) => true,
        }
    }
}
