//! On-disk state: `library.json` (scan results), `history.json` (recently
//! played assets), and `library.bin` (the metadata cache whose content hash
//! decides whether the GUI re-extracts anything).

use crate::library::DirStats;
use daqplay_engine::asset::AudioAsset;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;

pub const HISTORY_CAP: usize = 50;
const CACHE_VERSION: u32 = 1;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LibraryData {
    #[serde(rename = "audioFiles")]
    pub audio_files: Vec<String>,
    #[serde(rename = "libraryStats")]
    pub library_stats: Vec<DirStats>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LibraryState {
    pub library: LibraryData,
    #[serde(rename = "scanRecursiveLevel")]
    pub scan_recursive_level: usize,
    #[serde(rename = "lastLibbinHash", skip_serializing_if = "Option::is_none")]
    pub last_libbin_hash: Option<String>,
}

impl LibraryState {
    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::other(format!("malformed '{}': {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::other(format!("serialize library state: {}", e)))?;
        std::fs::write(path, bytes)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct History {
    pub history: Vec<AudioAsset>,
}

impl History {
    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| io::Error::other(format!("malformed '{}': {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::other(format!("serialize history: {}", e)))?;
        std::fs::write(path, bytes)
    }

    /// Most recent entry last, deduplicated by path, capped.
    pub fn push(&mut self, asset: AudioAsset) {
        self.history.retain(|a| a.path != asset.path);
        self.history.push(asset);
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_CAP;
            self.history.drain(..excess);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    assets: Vec<AudioAsset>,
}

/// Write the metadata cache and return its content hash.
pub fn save_cache(path: &Path, assets: &[AudioAsset]) -> io::Result<String> {
    let file = CacheFile {
        version: CACHE_VERSION,
        assets: assets.to_vec(),
    };
    let bytes = serde_json::to_vec(&file)
        .map_err(|e| io::Error::other(format!("serialize metadata cache: {}", e)))?;
    std::fs::write(path, &bytes)?;
    Ok(content_hash(&bytes))
}

pub fn load_cache(path: &Path) -> io::Result<(Vec<AudioAsset>, String)> {
    let bytes = std::fs::read(path)?;
    let file: CacheFile = serde_json::from_slice(&bytes)
        .map_err(|e| io::Error::other(format!("malformed '{}': {}", path.display(), e)))?;
    if file.version != CACHE_VERSION {
        return Err(io::Error::other(format!(
            "metadata cache version {} unsupported",
            file.version
        )));
    }
    Ok((file.assets, content_hash(&bytes)))
}

pub fn cache_hash(path: &Path) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(content_hash(&bytes))
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
