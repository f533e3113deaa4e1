//! Filesystem cache for quick-reply audio.
//!
//! Wake-word replies are the hottest TTS inputs; caching them keyed by
//! `(tts_provider, voice, sha256(text))` makes the second synthesis a file
//! lookup instead of a vendor round trip.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

/// Cache of synthesized quick-reply audio files.
pub struct QuickReplyCache {
    provider: String,
    voice: String,
    dir: PathBuf,
}

impl QuickReplyCache {
    /// Create a cache scoped to one TTS provider + voice combination.
    pub fn new(provider: &str, voice: &str) -> Self {
        Self::with_dir(provider, voice, PathBuf::from("cache").join("quick_reply"))
    }

    /// Create a cache rooted at an explicit directory (tests).
    pub fn with_dir(provider: &str, voice: &str, dir: PathBuf) -> Self {
        Self {
            provider: provider.to_string(),
            voice: voice.to_string(),
            dir,
        }
    }

    fn key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{}_{}_{}", self.provider, self.voice, &hex[..16])
    }

    fn path_for(&self, text: &str) -> PathBuf {
        self.dir.join(format!("{}.audio", self.key(text)))
    }

    /// Look up a cached audio file for `text`. Returns the path when the
    /// file exists and is non-empty.
    pub fn find_cached_audio(&self, text: &str) -> Option<PathBuf> {
        let path = self.path_for(text);
        match fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => Some(path),
            _ => None,
        }
    }

    /// Copy a freshly synthesized file into the cache.
    pub fn save_cached_audio(&self, text: &str, source: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let dest = self.path_for(text);
        fs::copy(source, &dest)?;
        debug!("Cached quick-reply audio: {}", dest.display());
        Ok(dest)
    }

    /// True when `path` points into this cache — cached files survive the
    /// egress cleanup.
    pub fn is_cached_file(&self, path: &str) -> bool {
        Path::new(path).starts_with(&self.dir)
    }
}
