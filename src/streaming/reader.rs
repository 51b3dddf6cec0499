//! Byte-range access to resource files
//!
//! Loader workers only ever need "give me `len` bytes at `offset`". Each
//! worker opens its own reader per resource, so readers need not be shared.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::types::{NodeId, ResourceId};
use crate::streaming::catalog::Resource;

/// Random access reader over one resource
pub trait RangeReader: Send {
    /// Fill `buf` with the bytes starting at `offset`. Short reads are errors.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// Opens readers for resources (one per worker per resource)
pub trait ReaderFactory: Send + Sync {
    fn open(&self, resource: &Resource) -> io::Result<Box<dyn RangeReader>>;
}

/// Reader over a file on disk
pub struct FileRangeReader {
    file: File,
    path: PathBuf,
}

impl FileRangeReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RangeReader for FileRangeReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }
}

/// Opens each resource's `path` from disk
#[derive(Clone, Debug, Default)]
pub struct FileReaderFactory;

impl ReaderFactory for FileReaderFactory {
    fn open(&self, resource: &Resource) -> io::Result<Box<dyn RangeReader>> {
        Ok(Box::new(FileRangeReader::open(&resource.desc().path)?))
    }
}

/// Reader over bytes already in memory
#[derive(Clone, Debug)]
pub struct MemoryRangeReader {
    data: Arc<[u8]>,
}

impl MemoryRangeReader {
    pub fn new(data: Arc<[u8]>) -> Self {
        Self { data }
    }
}

impl RangeReader for MemoryRangeReader {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds address space"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("range {}+{} beyond {} bytes", start, buf.len(), self.data.len()),
                )
            })?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }
}

/// Serves resources from in-memory buffers, keyed by resource id
#[derive(Clone, Debug, Default)]
pub struct MemoryReaderFactory {
    buffers: HashMap<ResourceId, Arc<[u8]>>,
}

impl MemoryReaderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, resource: ResourceId, data: impl Into<Arc<[u8]>>) {
        self.buffers.insert(resource, data.into());
    }

    pub fn with(mut self, resource: ResourceId, data: impl Into<Arc<[u8]>>) -> Self {
        self.insert(resource, data);
        self
    }
}

impl ReaderFactory for MemoryReaderFactory {
    fn open(&self, resource: &Resource) -> io::Result<Box<dyn RangeReader>> {
        let data = self.buffers.get(&resource.id()).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no buffer for resource {}", resource.id()),
            )
        })?;
        Ok(Box::new(MemoryRangeReader::new(data)))
    }
}

/// Produce the payload of every node of `resource` with `fill` and lay them
/// out back to back, the same layout the loaders read.
pub fn build_nodes(resource: &Resource, mut fill: impl FnMut(NodeId, &mut [u8])) -> Vec<u8> {
    let node_size = resource.node_size();
    let mut data = vec![0u8; resource.node_count() as usize * node_size];
    for (node, chunk) in data.chunks_exact_mut(node_size).enumerate() {
        fill(node as NodeId, chunk);
    }
    data
}

/// Write a resource file to `path`, creating parent directories
pub fn write_nodes(
    path: &Path,
    resource: &Resource,
    fill: impl FnMut(NodeId, &mut [u8]),
) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&build_nodes(resource, fill))?;
    writer.flush()
}
