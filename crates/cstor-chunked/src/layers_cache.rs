//! Cross-layer content cache.
//!
//! A [`LayersCache`] tracks one [`CacheFile`] per layer of a [`LayerStore`] and
//! answers "is this digest already on disk somewhere?". It is an ordinary
//! object: construct it once per store handle, share it through an `Arc`, and
//! drop it (or call [`LayersCache::release`]) to unmap every cache file.
//!
//! Lookups take a read lock and may run concurrently from the dedup workers;
//! [`LayersCache::load`] takes the write lock.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use serde::Deserialize;

use crate::cache_file::{CacheBuffer, CacheFile, Location, build_cache};
use crate::config::OutputFormat;
use crate::digest::binary_digest;
use crate::error::{ChunkedError, Result};
use crate::toc::FileEntry;

/// Layer data key of the serialized cache.
pub const CACHE_KEY: &str = "chunked-manifest-cache";
/// Layer data key of the TOC manifest.
pub const MANIFEST_KEY: &str = "zstd-chunked-manifest";
/// Layer data key of the layer-data JSON (`{"format": ...}`).
pub const LAYER_DATA_KEY: &str = "zstd-chunked-layer-data";

/// A layer as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLayer {
    /// Layer ID.
    pub id: String,
    /// Whether the layer lives in a read-only store; nothing is written back for it.
    pub read_only: bool,
}

/// Named data stored with a layer.
#[derive(Debug)]
pub enum LayerData {
    /// Backed by a file, which allows memory mapping.
    File(File),
    /// Held in memory.
    Memory(Vec<u8>),
}

impl LayerData {
    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            LayerData::File(mut f) => {
                let mut buf = Vec::new();
                f.read_to_end(&mut buf)?;
                Ok(buf)
            }
            LayerData::Memory(v) => Ok(v),
        }
    }
}

/// Layer bookkeeping the cache needs from the storage layer.
pub trait LayerStore: Send + Sync {
    /// All layers currently present.
    fn layers(&self) -> Result<Vec<StoredLayer>>;

    /// Directory holding the extracted content of a layer.
    fn layer_root(&self, id: &str) -> Result<PathBuf>;

    /// Read named data stored with a layer; `Ok(None)` if absent.
    fn read_layer_data(&self, id: &str, key: &str) -> Result<Option<LayerData>>;

    /// Store named data with a layer, replacing any previous value.
    fn write_layer_data(&self, id: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Modification time of the directory holding the store's layers.
    ///
    /// When it is unchanged since the last [`LayersCache::load`], the load
    /// is skipped. `None` rescans the store every time.
    fn modification_time(&self) -> Result<Option<SystemTime>> {
        Ok(None)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ChunkedLayerData {
    #[serde(default)]
    format: OutputFormat,
}

/// Serialize the layer-data JSON stored next to a chunked layer.
pub fn layer_data_json(format: OutputFormat) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&serde_json::json!({ "format": format }))?)
}

#[derive(Debug)]
struct CachedLayer {
    id: String,
    root: PathBuf,
    cache: CacheFile,
    /// Generated by this process from heap memory; try mapping it next load.
    reload_with_mmap: bool,
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    /// Layer the content was found in.
    pub layer_id: String,
    /// Root directory of that layer.
    pub root: PathBuf,
    /// Location inside the layer.
    pub location: Location,
}

/// Digest index over every layer of a store.
pub struct LayersCache {
    store: Arc<dyn LayerStore>,
    layers: RwLock<Vec<CachedLayer>>,
    /// Store modification time seen by the last load.
    loaded_mtime: Mutex<Option<SystemTime>>,
}

impl std::fmt::Debug for LayersCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayersCache").finish_non_exhaustive()
    }
}

fn poisoned<T>(_: T) -> ChunkedError {
    ChunkedError::Internal("layers cache lock poisoned".to_string())
}

impl LayersCache {
    /// Create an empty cache for `store`; call [`load`](Self::load) to populate it.
    pub fn new(store: Arc<dyn LayerStore>) -> Self {
        Self {
            store,
            layers: RwLock::new(Vec::new()),
            loaded_mtime: Mutex::new(None),
        }
    }

    /// Create and load a cache.
    pub fn open(store: Arc<dyn LayerStore>) -> Result<Arc<Self>> {
        let cache = Self::new(store);
        cache.load()?;
        Ok(Arc::new(cache))
    }

    /// Number of layers currently contributing entries.
    pub fn len(&self) -> usize {
        self.layers.read().map(|l| l.len()).unwrap_or(0)
    }

    /// True if no layer contributes entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every tracked layer, unmapping their cache files.
    pub fn release(&self) -> Result<()> {
        let mut guard = self.layers.write().map_err(poisoned)?;
        guard.clear();
        *self.loaded_mtime.lock().map_err(poisoned)? = None;
        Ok(())
    }

    /// Re-synchronize the tracked layers with the store.
    ///
    /// Layers no longer in the store are released. New layers get their
    /// cache file loaded, or rebuilt from their TOC when it is missing, of a
    /// different version or broken. Nothing happens when the store reports
    /// the same modification time as on the previous load.
    pub fn load(&self) -> Result<()> {
        let mut guard = self.layers.write().map_err(poisoned)?;
        let mtime = self.store.modification_time()?;
        let mut loaded_mtime = self.loaded_mtime.lock().map_err(poisoned)?;
        if mtime.is_some() && *loaded_mtime == mtime && !guard.iter().any(|l| l.reload_with_mmap) {
            return Ok(());
        }
        let mut loaded: HashMap<String, CachedLayer> =
            guard.drain(..).map(|l| (l.id.clone(), l)).collect();
        let mut layers = Vec::new();

        for stored in self.store.layers()? {
            if let Some(l) = loaded.remove(&stored.id)
                && !l.reload_with_mmap
            {
                layers.push(l);
                continue;
            }
            match self.load_layer_cache(&stored.id) {
                Ok(Some(l)) => {
                    layers.push(l);
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::info!("Error loading cache file for layer {:?}: {e}", stored.id),
            }
            match self.rebuild(&stored) {
                Ok(Some(l)) => layers.push(l),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Error creating cache file for layer {:?}: {e}", stored.id)
                }
            }
        }
        // Whatever is left in `loaded` is stale or superseded; dropping unmaps it.
        *guard = layers;
        *loaded_mtime = mtime;
        Ok(())
    }

    fn load_layer_cache(&self, id: &str) -> Result<Option<CachedLayer>> {
        let buffer = match self.store.read_layer_data(id, CACHE_KEY)? {
            None => return Ok(None),
            Some(LayerData::File(f)) => match CacheBuffer::map(&f) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Error mapping cache file for layer {id:?}: {e}");
                    CacheBuffer::Owned(LayerData::File(f).into_bytes()?)
                }
            },
            Some(LayerData::Memory(v)) => CacheBuffer::Owned(v),
        };
        let Some(cache) = CacheFile::parse(buffer)? else {
            return Ok(None);
        };
        Ok(Some(CachedLayer {
            id: id.to_string(),
            root: self.store.layer_root(id)?,
            cache,
            reload_with_mmap: false,
        }))
    }

    /// Rebuild the cache of a layer from its stored TOC.
    ///
    /// The result is written back for later reuse, except for read-only
    /// layers which are indexed in memory only. Layers without a TOC yield
    /// `Ok(None)`.
    fn rebuild(&self, layer: &StoredLayer) -> Result<Option<CachedLayer>> {
        let id = layer.id.as_str();
        let format = match self.store.read_layer_data(id, LAYER_DATA_KEY)? {
            Some(d) => serde_json::from_slice::<ChunkedLayerData>(&d.into_bytes()?)?.format,
            None => OutputFormat::Dir,
        };
        let Some(manifest) = self.store.read_layer_data(id, MANIFEST_KEY)? else {
            return Ok(None);
        };
        let bytes = build_cache(&manifest.into_bytes()?, format)?;
        if !layer.read_only {
            self.store.write_layer_data(id, CACHE_KEY, &bytes)?;
            tracing::debug!(
                "Written lookaside cache for layer {id:?} with length {}",
                bytes.len()
            );
        }
        let cache = CacheFile::parse(CacheBuffer::Owned(bytes))?
            .ok_or_else(|| ChunkedError::Internal("generated cache has wrong version".into()))?;
        Ok(Some(CachedLayer {
            id: id.to_string(),
            root: self.store.layer_root(id)?,
            cache,
            reload_with_mmap: !layer.read_only,
        }))
    }

    /// Find a digest in any tracked layer.
    ///
    /// A layer whose cache turns out to be corrupt is skipped with a warning.
    pub fn lookup(&self, digest: &str) -> Result<Option<CacheHit>> {
        if digest.is_empty() {
            return Ok(None);
        }
        let key = binary_digest(digest)?;
        let layers = self.layers.read().map_err(poisoned)?;
        for layer in layers.iter() {
            match layer.cache.lookup(&key) {
                Ok(Some(location)) => {
                    return Ok(Some(CacheHit {
                        layer_id: layer.id.clone(),
                        root: layer.root.clone(),
                        location,
                    }));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Ignoring cache of layer {:?}: {e}", layer.id),
            }
        }
        Ok(None)
    }

    /// Find a whole file with the content of `entry`.
    ///
    /// With `use_hard_links` the lookup is by hard-link fingerprint, so the
    /// result also matches the ownership, mode and xattrs of `entry`.
    pub fn find_file_in_other_layers(
        &self,
        entry: &FileEntry,
        use_hard_links: bool,
    ) -> Result<Option<CacheHit>> {
        let key = if use_hard_links {
            entry.hard_link_fingerprint()
        } else {
            match &entry.digest {
                Some(d) => d.clone(),
                None => return Ok(None),
            }
        };
        Ok(self
            .lookup(&key)?
            .filter(|hit| hit.location.offset == 0 && hit.location.length == entry.size))
    }

    /// Find the content of a chunk anywhere in the tracked layers.
    pub fn find_chunk_in_other_layers(&self, chunk: &FileEntry) -> Result<Option<CacheHit>> {
        match &chunk.chunk_digest {
            Some(d) => self.lookup(d),
            None => Ok(None),
        }
    }
}
