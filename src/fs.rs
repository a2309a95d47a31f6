//! Filesystem library boundary.
//!
//! Once a chip is identified, the UI reads and edits the filesystem images
//! stored in its flash partitions (SPIFFS, LittleFS, FAT) through external
//! libraries. The protocol client never calls them; [`Filesystem`] pins the
//! capability surface those libraries are expected to offer, and
//! [`MemoryFilesystem`] is a small in-memory mount honouring it, used to check
//! the contract.
//!
//! Paths are absolute and `/` separated. Trailing and repeated separators are
//! ignored, `.` and `..` components are rejected.

use std::collections::BTreeMap;
use std::convert::TryInto;

use thiserror::Error;

/// Magic at the start of a [`MemoryFilesystem`] image.
const IMAGE_MAGIC: &[u8; 8] = b"ESPMEMFS";

/// On-disk format version of [`MemoryFilesystem`] images, `major << 16 | minor`.
pub const DISK_VERSION: u32 = 0x0001_0000;

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    #[error("no space left: {needed} bytes needed, {free} free")]
    NoSpace { needed: u64, free: u64 },

    #[error("invalid filesystem image: {0}")]
    InvalidImage(String),
}

pub type FsResult<T> = std::result::Result<T, FsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Absolute path.
    pub path: String,
    /// Last path component.
    pub name: String,
    pub kind: EntryKind,
    /// File size in bytes, `0` for directories.
    pub size: u64,
}

/// Space accounting. `used_bytes + free_bytes <= capacity_bytes` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

/// Capabilities of a mounted filesystem image.
pub trait Filesystem {
    /// Direct children of the directory at `path`, sorted by path.
    fn list(&self, path: &str) -> FsResult<Vec<Entry>>;
    fn read_file(&self, path: &str) -> FsResult<Vec<u8>>;
    /// Create or replace the file at `path`. Its parent must exist.
    fn write_file(&mut self, path: &str, data: &[u8]) -> FsResult<()>;
    fn delete_file(&mut self, path: &str) -> FsResult<()>;
    fn mkdir(&mut self, path: &str) -> FsResult<()>;
    /// Move a file or a whole directory tree.
    fn rename(&mut self, from: &str, to: &str) -> FsResult<()>;
    /// Erase everything, leaving an empty root.
    fn format(&mut self) -> FsResult<()>;
    /// Serialize the mount to an image that can be mounted again.
    fn to_image(&self) -> FsResult<Vec<u8>>;
    fn get_usage(&self) -> Usage;
    fn get_disk_version(&self) -> u32;
}

/// An in-memory [`Filesystem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFilesystem {
    capacity: u64,
    nodes: BTreeMap<String, Node>,
}

impl MemoryFilesystem {
    /// An empty mount able to hold `capacity` bytes of file data.
    pub fn new(capacity: u64) -> Self {
        MemoryFilesystem {
            capacity,
            nodes: BTreeMap::new(),
        }
    }

    /// Mount an image produced by [`Filesystem::to_image`].
    pub fn from_image(image: &[u8]) -> FsResult<Self> {
        let mut reader = ImageReader { image, offset: 0 };
        if reader.take(IMAGE_MAGIC.len())? != IMAGE_MAGIC {
            return Err(FsError::InvalidImage("bad magic".into()));
        }
        let version = reader.u32()?;
        if version >> 16 != DISK_VERSION >> 16 {
            return Err(FsError::InvalidImage(format!(
                "unsupported disk version 0x{:08x}",
                version
            )));
        }

        let mut fs = MemoryFilesystem::new(reader.u64()?);
        let count = reader.u32()?;
        for _ in 0..count {
            let kind = reader.take(1)?[0];
            let len = reader.u32()? as usize;
            let path = String::from_utf8(reader.take(len)?.to_vec())
                .map_err(|_| FsError::InvalidImage("path is not UTF-8".into()))?;
            match kind {
                0 => fs.mkdir(&path)?,
                1 => {
                    let len = reader.u32()? as usize;
                    let data = reader.take(len)?.to_vec();
                    fs.write_file(&path, &data)?;
                }
                other => {
                    return Err(FsError::InvalidImage(format!(
                        "unknown entry kind {}",
                        other
                    )))
                }
            }
        }
        Ok(fs)
    }

    fn used(&self) -> u64 {
        self.nodes
            .values()
            .map(|node| match node {
                Node::File(data) => data.len() as u64,
                Node::Dir => 0,
            })
            .sum()
    }

    fn require_dir(&self, path: &str) -> FsResult<()> {
        if path == "/" {
            return Ok(());
        }
        match self.nodes.get(path) {
            Some(Node::Dir) => Ok(()),
            Some(Node::File(_)) => Err(FsError::NotADirectory(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }
}

impl Filesystem for MemoryFilesystem {
    fn list(&self, path: &str) -> FsResult<Vec<Entry>> {
        let path = normalize(path)?;
        self.require_dir(&path)?;

        Ok(self
            .nodes
            .iter()
            .filter(|(candidate, _)| parent_of(candidate) == path)
            .map(|(candidate, node)| Entry {
                path: candidate.clone(),
                name: name_of(candidate).to_string(),
                kind: node.kind(),
                size: node.size(),
            })
            .collect())
    }

    fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let path = normalize(path)?;
        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(data.clone()),
            Some(Node::Dir) => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    fn write_file(&mut self, path: &str, data: &[u8]) -> FsResult<()> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(FsError::IsADirectory(path));
        }
        self.require_dir(parent_of(&path))?;

        let replaced = match self.nodes.get(&path) {
            Some(Node::Dir) => return Err(FsError::IsADirectory(path)),
            Some(Node::File(old)) => old.len() as u64,
            None => 0,
        };
        let free = self.capacity - self.used() + replaced;
        if data.len() as u64 > free {
            return Err(FsError::NoSpace {
                needed: data.len() as u64,
                free,
            });
        }

        self.nodes.insert(path, Node::File(data.to_vec()));
        Ok(())
    }

    fn delete_file(&mut self, path: &str) -> FsResult<()> {
        let path = normalize(path)?;
        match self.nodes.get(&path) {
            Some(Node::File(_)) => {
                self.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Dir) => Err(FsError::IsADirectory(path)),
            None => Err(FsError::NotFound(path)),
        }
    }

    fn mkdir(&mut self, path: &str) -> FsResult<()> {
        let path = normalize(path)?;
        if path == "/" || self.nodes.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        self.require_dir(parent_of(&path))?;
        self.nodes.insert(path, Node::Dir);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> FsResult<()> {
        let from = normalize(from)?;
        let to = normalize(to)?;
        if from == "/" || to == "/" {
            return Err(FsError::InvalidPath("/".into()));
        }
        if !self.nodes.contains_key(&from) {
            return Err(FsError::NotFound(from));
        }
        if self.nodes.contains_key(&to) {
            return Err(FsError::AlreadyExists(to));
        }
        let prefix = format!("{}/", from);
        if to.starts_with(&prefix) {
            return Err(FsError::InvalidPath(to));
        }
        self.require_dir(parent_of(&to))?;

        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|path| **path == from || path.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = self.nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                self.nodes.insert(new, node);
            }
        }
        Ok(())
    }

    fn format(&mut self) -> FsResult<()> {
        self.nodes.clear();
        Ok(())
    }

    fn to_image(&self) -> FsResult<Vec<u8>> {
        let mut image = IMAGE_MAGIC.to_vec();
        image.extend_from_slice(&DISK_VERSION.to_le_bytes());
        image.extend_from_slice(&self.capacity.to_le_bytes());
        image.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());

        // Parents sort before their children, so the image replays in order.
        for (path, node) in &self.nodes {
            match node {
                Node::Dir => image.push(0),
                Node::File(_) => image.push(1),
            }
            image.extend_from_slice(&(path.len() as u32).to_le_bytes());
            image.extend_from_slice(path.as_bytes());
            if let Node::File(data) = node {
                image.extend_from_slice(&(data.len() as u32).to_le_bytes());
                image.extend_from_slice(data);
            }
        }
        Ok(image)
    }

    fn get_usage(&self) -> Usage {
        let used = self.used();
        Usage {
            capacity_bytes: self.capacity,
            used_bytes: used,
            free_bytes: self.capacity - used,
        }
    }

    fn get_disk_version(&self) -> u32 {
        DISK_VERSION
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
}

impl Node {
    fn kind(&self) -> EntryKind {
        match self {
            Node::File(_) => EntryKind::File,
            Node::Dir => EntryKind::Dir,
        }
    }

    fn size(&self) -> u64 {
        match self {
            Node::File(data) => data.len() as u64,
            Node::Dir => 0,
        }
    }
}

fn normalize(path: &str) -> FsResult<String> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidPath(path.to_string()));
    }
    let mut normalized = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if component == "." || component == ".." {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        normalized.push('/');
        normalized.push_str(component);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Parent of a normalized path other than the root.
fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

struct ImageReader<'a> {
    image: &'a [u8],
    offset: usize,
}

impl<'a> ImageReader<'a> {
    fn take(&mut self, len: usize) -> FsResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.image.len())
            .ok_or_else(|| FsError::InvalidImage("truncated image".into()))?;
        let bytes = &self.image[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn u32(&mut self) -> FsResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| {
            FsError::InvalidImage("truncated image".into())
        })?))
    }

    fn u64(&mut self) -> FsResult<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| {
            FsError::InvalidImage("truncated image".into())
        })?))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
fn sample() -> MemoryFilesystem {
    let mut fs = MemoryFilesystem::new(4096);
    fs.write_file("/info.txt", b"hello\n").unwrap();
    fs.mkdir("/nested").unwrap();
    fs.write_file("/nested/nested_info.txt", b"deep").unwrap();
    fs
}

#[test]
fn format_twice_leaves_an_empty_listing() {
    let mut fs = MemoryFilesystem::new(1024);
    fs.format().unwrap();
    assert_eq!(fs.list("/").unwrap(), vec![]);
    fs.format().unwrap();
    assert_eq!(fs.list("/").unwrap(), vec![]);
}

#[test]
fn format_erases_files() {
    let mut fs = sample();
    fs.format().unwrap();
    assert!(fs.list("/").unwrap().is_empty());
    assert_eq!(
        fs.read_file("/info.txt"),
        Err(FsError::NotFound("/info.txt".into()))
    );
    assert_eq!(fs.get_usage().used_bytes, 0);
}

#[test]
fn list_direct_children_only() {
    let fs = sample();
    let root = fs.list("/").unwrap();
    let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["info.txt", "nested"]);
    assert_eq!(root[1].kind, EntryKind::Dir);

    let nested = fs.list("/nested/").unwrap();
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].path, "/nested/nested_info.txt");
    assert_eq!(nested[0].size, 4);
}

#[test]
fn mutations_survive_an_image_remount() {
    let mut fs = sample();
    fs.mkdir("/newdir").unwrap();
    fs.write_file("/newdir/a.txt", b"abc").unwrap();
    fs.rename("/info.txt", "/info-renamed.txt").unwrap();
    fs.write_file("/todelete.bin", &[1, 2, 3]).unwrap();
    fs.delete_file("/todelete.bin").unwrap();

    let remounted = MemoryFilesystem::from_image(&fs.to_image().unwrap()).unwrap();
    assert_eq!(remounted.read_file("/newdir/a.txt").unwrap(), b"abc");
    assert_eq!(remounted.read_file("/info-renamed.txt").unwrap(), b"hello\n");
    assert!(remounted.read_file("/info.txt").is_err());
    assert!(remounted.read_file("/todelete.bin").is_err());
    assert_eq!(remounted, fs);
}

#[test]
fn rename_moves_directory_trees() {
    let mut fs = sample();
    fs.rename("/nested", "/moved").unwrap();
    assert_eq!(fs.read_file("/moved/nested_info.txt").unwrap(), b"deep");
    assert!(fs.list("/nested").is_err());
    assert!(matches!(
        fs.rename("/moved", "/moved/inner"),
        Err(FsError::InvalidPath(_))
    ));
}

#[test]
fn usage_invariant_and_space_limit() {
    let mut fs = MemoryFilesystem::new(10);
    fs.write_file("/a", &[0; 6]).unwrap();
    let usage = fs.get_usage();
    assert_eq!(usage.used_bytes, 6);
    assert!(usage.used_bytes + usage.free_bytes <= usage.capacity_bytes);

    assert_eq!(
        fs.write_file("/b", &[0; 5]),
        Err(FsError::NoSpace { needed: 5, free: 4 })
    );
    // Replacing a file reuses its space.
    fs.write_file("/a", &[0; 10]).unwrap();
}

#[test]
fn path_errors() {
    let mut fs = sample();
    assert!(matches!(fs.read_file("relative"), Err(FsError::InvalidPath(_))));
    assert!(matches!(fs.read_file("/../etc"), Err(FsError::InvalidPath(_))));
    assert!(matches!(fs.write_file("/missing/a", b""), Err(FsError::NotFound(_))));
    assert!(matches!(fs.write_file("/info.txt/a", b""), Err(FsError::NotADirectory(_))));
    assert!(matches!(fs.mkdir("/nested"), Err(FsError::AlreadyExists(_))));
    assert!(matches!(fs.delete_file("/nested"), Err(FsError::IsADirectory(_))));
}

#[test]
fn bad_images_are_rejected() {
    assert!(matches!(
        MemoryFilesystem::from_image(b"NOTANIMAGE"),
        Err(FsError::InvalidImage(_))
    ));
    let mut image = sample().to_image().unwrap();
    image.truncate(image.len() - 1);
    assert!(matches!(
        MemoryFilesystem::from_image(&image),
        Err(FsError::InvalidImage(_))
    ));
    assert_eq!(sample().get_disk_version(), DISK_VERSION);
}
