//! Translation of layer ownership into host IDs.

use crate::config::{ApplyOptions, IdMapping};
use crate::error::{ChunkedError, Result};

impl IdMapping {
    /// Create a new mapping range.
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    fn to_host(&self, id: u32) -> Option<u32> {
        let delta = id.checked_sub(self.container_id)?;
        (delta < self.size).then(|| self.host_id.checked_add(delta)).flatten()
    }
}

/// Parse mappings in the `/proc/<pid>/uid_map` format: one
/// `container host size` triple per line. Empty ranges are dropped.
pub fn parse_id_map(content: &str) -> Result<Vec<IdMapping>> {
    let mut maps = Vec::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        let parsed: Option<Vec<u32>> = fields.iter().map(|f| f.parse().ok()).collect();
        let [container_id, host_id, size] = parsed.as_deref().unwrap_or_default() else {
            return Err(ChunkedError::Internal(format!("invalid ID map line {line:?}")));
        };
        if *size > 0 {
            maps.push(IdMapping::new(*container_id, *host_id, *size));
        }
    }
    Ok(maps)
}

fn to_host(maps: &[IdMapping], kind: &'static str, id: u32) -> Result<u32> {
    if maps.is_empty() {
        return Ok(id);
    }
    maps.iter()
        .find_map(|m| m.to_host(id))
        .ok_or(ChunkedError::UnmappedId { kind, id })
}

impl ApplyOptions {
    /// Host owner for a file recorded as `uid:gid` in the layer.
    ///
    /// A forced owner wins over the mappings.
    pub fn host_owner(&self, uid: u32, gid: u32) -> Result<(u32, u32)> {
        if let Some(owner) = self.chown {
            return Ok(owner);
        }
        Ok((
            to_host(&self.uid_maps, "uid", uid)?,
            to_host(&self.gid_maps, "gid", gid)?,
        ))
    }
}
