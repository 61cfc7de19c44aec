//! Extensible array store.
//!
//! A hierarchical container of chunked, growable three-dimensional datasets,
//! laid out as a directory tree so that independent processes can extend it
//! with nothing but atomic renames and positional writes:
//!
//! ```text
//! perf_dump.4.pda/                  container
//! ├── .perfdump.json                container marker
//! ├── solve/                        group (one per region)
//! │   ├── MINFLT/                   dataset
//! │   │   ├── .dataset.json         dtype, shape [4, 1, T], chunks [4, 1, 1]
//! │   │   ├── 0                     chunk for step 0: 4 cells, rank-major
//! │   │   └── 1                     chunk for step 1
//! │   └── Runtime/
//! └── init/
//! ```
//!
//! Dataset metadata is only ever replaced through a rename, so a reader sees
//! either the old or the new shape. Cells live at `rank * element_size` in
//! the chunk file of their step; cells nobody wrote read back as zero.
//!
//! Group and dataset names may be any string. On disk they are escaped with
//! [`encode_name`]: `%`, `/`, `\`, NUL and a leading `.` become `%XX`, and the
//! empty name becomes a lone `%`.

use std::fmt::{self, Display};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::writers::{read_at, write_all_at};

/// Marker file identifying a directory as a container.
pub const CONTAINER_META: &str = ".perfdump.json";

/// Metadata file of a dataset directory.
pub const DATASET_META: &str = ".dataset.json";

const FORMAT_NAME: &str = "perfdump-array";
const FORMAT_VERSION: u32 = 1;

/// Element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// Unsigned 64-bit integer.
    U64,
    /// 64-bit IEEE float.
    F64,
}

impl Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dtype::U64 => write!(f, "u64"),
            Dtype::F64 => write!(f, "f64"),
        }
    }
}

/// Byte order of stored elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the running machine.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
}

/// A value that can be stored in a dataset.
pub trait Element: Pod {
    /// The matching dataset element type.
    const DTYPE: Dtype;
}

impl Element for u64 {
    const DTYPE: Dtype = Dtype::U64;
}

impl Element for f64 {
    const DTYPE: Dtype = Dtype::F64;
}

/// Shape and layout of a dataset: `[peers, 1, steps]`, unlimited along the
/// last axis and chunked one step at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub dtype: Dtype,
    pub byte_order: ByteOrder,
    pub shape: [u64; 3],
    pub max_shape: [Option<u64>; 3],
    pub chunks: [u64; 3],
}

impl DatasetMeta {
    /// Metadata of a freshly created dataset: one step.
    pub fn new(dtype: Dtype, peers: u64) -> Self {
        Self {
            dtype,
            byte_order: ByteOrder::native(),
            shape: [peers, 1, 1],
            max_shape: [Some(peers), Some(1), None],
            chunks: [peers, 1, 1],
        }
    }

    /// Number of peers along the first axis.
    pub fn peers(&self) -> u64 {
        self.shape[0]
    }

    /// Number of steps along the last axis.
    pub fn steps(&self) -> u64 {
        self.shape[2]
    }

    /// The same dataset grown by one step.
    pub fn extended(&self) -> Self {
        let mut meta = self.clone();
        meta.shape[2] += 1;
        meta
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ContainerMeta {
    format: String,
    version: u32,
}

/// A container on disk.
#[derive(Debug, Clone)]
pub struct ArrayStore {
    root: PathBuf,
}

impl ArrayStore {
    /// Opens the container at `path`, creating it if needed.
    ///
    /// Safe to call from every peer at once: creation is idempotent.
    pub fn create_or_open(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        let marker = root.join(CONTAINER_META);
        if !marker.exists() {
            let meta = ContainerMeta {
                format: FORMAT_NAME.to_string(),
                version: FORMAT_VERSION,
            };
            write_atomic(&marker, &serde_json::to_vec(&meta)?)?;
        }
        Self::open(root)
    }

    /// Opens an existing container.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let root = path.into();
        let marker = root.join(CONTAINER_META);
        let bytes = fs::read(&marker).map_err(|e| Error::io(&marker, e))?;
        let meta: ContainerMeta = serde_json::from_slice(&bytes)?;
        if meta.format != FORMAT_NAME || meta.version != FORMAT_VERSION {
            return Err(Error::Format(format!(
                "{} is {} v{}, expected {} v{}",
                root.display(),
                meta.format,
                meta.version,
                FORMAT_NAME,
                FORMAT_VERSION
            )));
        }
        Ok(Self { root })
    }

    /// Path of the container.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Names of all groups, sorted.
    pub fn groups(&self) -> Result<Vec<String>> {
        list_entries(&self.root)
    }

    /// Opens an existing group.
    pub fn group(&self, name: &str) -> Result<Group> {
        let path = self.root.join(encode_name(name));
        if !path.is_dir() {
            return Err(Error::Format(format!("no group {:?} in {}", name, self.root.display())));
        }
        Ok(Group {
            path,
            name: name.to_string(),
        })
    }

    /// Opens a group, creating it if it does not exist yet.
    pub fn require_group(&self, name: &str) -> Result<Group> {
        let path = self.root.join(encode_name(name));
        fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
        Ok(Group {
            path,
            name: name.to_string(),
        })
    }
}

/// A group of datasets, one per metric.
#[derive(Debug, Clone)]
pub struct Group {
    path: PathBuf,
    name: String,
}

impl Group {
    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of all datasets, sorted.
    pub fn datasets(&self) -> Result<Vec<String>> {
        list_entries(&self.path)
    }

    /// Reads a dataset's metadata, `None` if the dataset does not exist.
    pub fn dataset_meta(&self, name: &str) -> Result<Option<DatasetMeta>> {
        let meta_path = self.path.join(encode_name(name)).join(DATASET_META);
        match fs::read(&meta_path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&meta_path, e)),
        }
    }

    /// Creates a dataset or replaces its metadata.
    pub fn put_dataset_meta(&self, name: &str, meta: &DatasetMeta) -> Result<()> {
        let dir = self.path.join(encode_name(name));
        fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        write_atomic(&dir.join(DATASET_META), &serde_json::to_vec(meta)?)
    }

    /// Opens an existing dataset.
    pub fn dataset(&self, name: &str) -> Result<Dataset> {
        let meta = self.dataset_meta(name)?.ok_or_else(|| {
            Error::Format(format!("no dataset {:?} in group {:?}", name, self.name))
        })?;
        Ok(Dataset {
            path: self.path.join(encode_name(name)),
            name: format!("{}/{}", self.name, name),
            metric: name.to_string(),
            meta,
        })
    }
}

/// A `[peers, 1, steps]` dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    path: PathBuf,
    name: String,
    metric: String,
    meta: DatasetMeta,
}

impl Dataset {
    /// `group/dataset` name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dataset name within its group.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// Metadata as of opening.
    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    /// Current extent.
    pub fn shape(&self) -> [u64; 3] {
        self.meta.shape
    }

    /// Writes the cell `(rank, 0, step)`.
    pub fn write_cell<T: Element>(&self, rank: u64, step: u64, value: T) -> Result<()> {
        self.check::<T>(rank, step)?;
        let chunk = self.chunk_path(step);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&chunk)
            .map_err(|e| Error::io(&chunk, e))?;
        write_all_at(&file, bytemuck::bytes_of(&value), rank * mem::size_of::<T>() as u64)
            .map_err(|e| Error::io(&chunk, e))?;
        file.sync_data().map_err(|e| Error::io(&chunk, e))
    }

    /// Reads the cell `(rank, 0, step)`; unwritten cells are zero.
    pub fn read_cell<T: Element>(&self, rank: u64, step: u64) -> Result<T> {
        self.check::<T>(rank, step)?;
        if self.meta.byte_order != ByteOrder::native() {
            return Err(Error::Format(format!(
                "{} was written with {:?} byte order",
                self.name, self.meta.byte_order
            )));
        }
        let chunk = self.chunk_path(step);
        let file = match File::open(&chunk) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::zeroed()),
            Err(e) => return Err(Error::io(&chunk, e)),
        };
        let mut buf = vec![0u8; mem::size_of::<T>()];
        read_at(&file, &mut buf, rank * mem::size_of::<T>() as u64)
            .map_err(|e| Error::io(&chunk, e))?;
        Ok(bytemuck::pod_read_unaligned(&buf))
    }

    /// Reads every step of one rank.
    pub fn read_rank<T: Element>(&self, rank: u64) -> Result<Vec<T>> {
        (0..self.meta.steps())
            .map(|step| self.read_cell(rank, step))
            .collect()
    }

    fn check<T: Element>(&self, rank: u64, step: u64) -> Result<()> {
        if self.meta.dtype != T::DTYPE {
            return Err(Error::DtypeMismatch {
                dataset: self.name.clone(),
                found: self.meta.dtype.to_string(),
                expected: T::DTYPE.to_string(),
            });
        }
        if rank >= self.meta.peers() || step >= self.meta.steps() {
            return Err(Error::Format(format!(
                "cell ({}, 0, {}) outside {} of shape {:?}",
                rank, step, self.name, self.meta.shape
            )));
        }
        Ok(())
    }

    fn chunk_path(&self, step: u64) -> PathBuf {
        self.path.join(step.to_string())
    }
}

/// Escapes `name` into a single directory entry.
///
/// # Examples
///
/// ```rust
/// use perfdump::store::{decode_name, encode_name};
///
/// assert_eq!(encode_name("solve"), "solve");
/// assert_eq!(encode_name(".warmup"), "%2Ewarmup");
/// assert_eq!(encode_name("a/b%"), "a%2Fb%25");
/// assert_eq!(decode_name("%2Ewarmup").as_deref(), Some(".warmup"));
/// ```
pub fn encode_name(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut out = String::with_capacity(name.len());
    for (i, c) in name.char_indices() {
        match c {
            '%' | '/' | '\\' | '\0' => out.push_str(&format!("%{:02X}", c as u32)),
            '.' if i == 0 => out.push_str("%2E"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`encode_name`]; `None` if `entry` is not a valid escape.
pub fn decode_name(entry: &str) -> Option<String> {
    if entry == "%" {
        return Some(String::new());
    }
    let bytes = entry.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = entry.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn list_entries(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let is_dir = entry.file_type().map_err(|e| Error::io(dir, e))?.is_dir();
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if !is_dir || file_name.starts_with('.') {
            continue;
        }
        let name = decode_name(&file_name).ok_or_else(|| {
            Error::Format(format!("bad entry name {:?} in {}", file_name, dir.display()))
        })?;
        names.push(name);
    }
    names.sort();
    Ok(names)
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Replaces `path` with `bytes` through a uniquely named sibling and a rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&tmp, bytes).map_err(|e| Error::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io(path, e))
}
