//! Transient displayable URLs for stored blobs.
//!
//! A [`BlobUrl`] is a scoped handle: it registers a `blob:` URL when created and
//! revokes it when dropped, so consumers cannot leak URLs by forgetting to release
//! them.

use crate::storage::BlobStore;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

const URL_SCHEME: &str = "blob:storyboard/";

/// Live URL → payload mapping.
#[derive(Debug, Clone, Default)]
pub struct BlobUrlRegistry {
    live: Arc<DashMap<String, Arc<Vec<u8>>>>,
}

impl BlobUrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the blob and returns a URL for it. Missing blobs and lookup failures
    /// resolve to `None`; failures are logged.
    pub async fn resolve(&self, blobs: &BlobStore, id: Option<&str>) -> Option<BlobUrl> {
        let id = id?;
        match blobs.get(id).await {
            Ok(Some(data)) => Some(self.register(id, data)),
            Ok(None) => {
                log::debug!("Blob {} not found, nothing to display", id);
                None
            }
            Err(e) => {
                log::error!("Error fetching blob {} from store: {}", id, e);
                None
            }
        }
    }

    fn register(&self, blob_id: &str, data: Vec<u8>) -> BlobUrl {
        let url = format!("{}{}", URL_SCHEME, Uuid::new_v4());
        let data = Arc::new(data);
        self.live.insert(url.clone(), data.clone());
        log::debug!("Created {} for blob {}", url, blob_id);
        BlobUrl {
            url,
            blob_id: blob_id.to_string(),
            data,
            live: self.live.clone(),
        }
    }

    /// Payload behind a live URL, if it has not been revoked.
    pub fn lookup(&self, url: &str) -> Option<Arc<Vec<u8>>> {
        self.live.get(url).map(|entry| entry.value().clone())
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

/// A resolved blob URL; revoked on drop.
#[derive(Debug)]
pub struct BlobUrl {
    url: String,
    blob_id: String,
    data: Arc<Vec<u8>>,
    live: Arc<DashMap<String, Arc<Vec<u8>>>>,
}

impl BlobUrl {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn blob_id(&self) -> &str {
        &self.blob_id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn mime_type(&self) -> &'static str {
        sniff_mime(&self.data)
    }
}

impl Drop for BlobUrl {
    fn drop(&mut self) {
        self.live.remove(&self.url);
        log::debug!("Revoked {}", self.url);
    }
}

/// Best-effort content type from magic bytes. Blobs are stored without metadata.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    match data {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E', ..] => "audio/wav",
        [b'I', b'D', b'3', ..] | [0xFF, 0xFB, ..] | [0xFF, 0xF3, ..] => "audio/mpeg",
        [b'O', b'g', b'g', b'S', ..] => "audio/ogg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(sniff_mime(&[0x89, b'P', b'N', b'G', 0x0D]), "image/png");
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_mime(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff_mime(b"ID3\x04"), "audio/mpeg");
        assert_eq!(sniff_mime(b"hello"), "application/octet-stream");
    }

    #[test]
    fn dropping_the_handle_revokes_the_url() {
        let registry = BlobUrlRegistry::new();
        let handle = registry.register("blob-1", vec![1, 2, 3]);
        let url = handle.url().to_string();

        assert!(url.starts_with(URL_SCHEME));
        assert_eq!(registry.lookup(&url).as_deref(), Some(&vec![1, 2, 3]));
        assert_eq!(registry.live_count(), 1);

        drop(handle);
        assert!(registry.lookup(&url).is_none());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn replacing_a_handle_releases_the_previous_one() {
        let registry = BlobUrlRegistry::new();
        let mut shown = registry.register("a", vec![1]);
        assert_eq!(shown.blob_id(), "a");
        assert_eq!(registry.live_count(), 1);

        // Identifier changed: the old URL goes away as the new one takes its place
        shown = registry.register("b", vec![2]);
        assert_eq!(registry.live_count(), 1);
        assert_eq!(shown.blob_id(), "b");
    }
}
