//! URL-keyed metadata cache — listings and resolved canonical paths.
//!
//! Pure lookup/invalidate store: never performs network I/O. Entries never
//! expire by time; every mutating operation (mkdir, remove, rename, chmod,
//! put) explicitly invalidates the affected entry's parent.

use crate::entry::DirectoryListing;
use crate::remote_url::RemoteUrl;
use std::collections::HashMap;

/// Process-wide (one per engine) listing / path cache. Keys are normalized
/// URLs: credentials stripped, listing keys stripped of trailing slash.
#[derive(Debug, Default)]
pub struct ListingCache {
    listings: HashMap<String, DirectoryListing>,
    paths: HashMap<String, String>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Listings ─────────────────────────────────────────────────

    pub fn insert_listing(&mut self, url: &RemoteUrl, path: &str, listing: DirectoryListing) {
        self.listings.insert(url.cache_key(path), listing);
    }

    /// Read-through lookup; returns only valid listings.
    pub fn find_listing(&self, url: &RemoteUrl, path: &str) -> Option<&DirectoryListing> {
        self.listings
            .get(&url.cache_key(path))
            .filter(|l| l.valid)
    }

    /// Patch one cached entry's size after an upload, avoiding a re-fetch.
    pub fn update_entry_size(&mut self, url: &RemoteUrl, dir: &str, filename: &str, size: u64) {
        if let Some(listing) = self.listings.get_mut(&url.cache_key(dir)) {
            listing.update_entry_size(filename, size);
        }
    }

    // ── Resolved paths ───────────────────────────────────────────

    /// Record a canonicalized path (e.g. the PWD reply after a CWD walk).
    /// Supersedes any previous resolution for the same key.
    pub fn insert_path(&mut self, url: &RemoteUrl, requested: &str, resolved: impl Into<String>) {
        self.paths.insert(url.cache_key(requested), resolved.into());
    }

    pub fn find_path(&self, url: &RemoteUrl, requested: &str) -> Option<&str> {
        self.paths.get(&url.cache_key(requested)).map(String::as_str)
    }

    // ── Invalidation ─────────────────────────────────────────────

    /// Drop both the listing and the resolved path for one URL.
    pub fn invalidate(&mut self, url: &RemoteUrl, path: &str) {
        let key = url.cache_key(path);
        self.listings.remove(&key);
        self.paths.remove(&key);
    }

    /// Invalidate the parent directory of `path` — the entry every
    /// mutating operation dirties.
    pub fn invalidate_parent(&mut self, url: &RemoteUrl, path: &str) {
        let parent = RemoteUrl::parent_of(path).to_string();
        self.invalidate(url, &parent);
    }

    /// Drop everything cached for one server (used on disconnect-with-error).
    pub fn invalidate_server(&mut self, url: &RemoteUrl) {
        let prefix = url.cache_key("/");
        let prefix = prefix.trim_end_matches('/').to_string();
        self.listings.retain(|k, _| !k.starts_with(&prefix));
        self.paths.retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty() && self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DirectoryEntry, EntryKind};

    fn url() -> RemoteUrl {
        RemoteUrl::parse("ftp://user:pw@example.com/").unwrap()
    }

    fn listing_with(name: &str, size: u64) -> DirectoryListing {
        let mut l = DirectoryListing::new("ftp://example.com:21/pub");
        l.add_entry(DirectoryEntry {
            filename: name.into(),
            size,
            kind: EntryKind::File,
            ..Default::default()
        });
        l
    }

    #[test]
    fn invalidate_always_clears() {
        let mut cache = ListingCache::new();
        let u = url();
        // Regardless of prior state: empty, present, re-inserted.
        cache.invalidate(&u, "/pub");
        assert!(cache.find_listing(&u, "/pub").is_none());

        cache.insert_listing(&u, "/pub", listing_with("a", 1));
        assert!(cache.find_listing(&u, "/pub").is_some());
        cache.invalidate(&u, "/pub");
        assert!(cache.find_listing(&u, "/pub").is_none());

        cache.insert_listing(&u, "/pub", listing_with("a", 1));
        cache.invalidate(&u, "/pub");
        cache.invalidate(&u, "/pub");
        assert!(cache.find_listing(&u, "/pub").is_none());
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let mut cache = ListingCache::new();
        let u = url();
        cache.insert_listing(&u, "/pub/", listing_with("a", 1));
        assert!(cache.find_listing(&u, "/pub").is_some());
        cache.invalidate(&u, "/pub");
        assert!(cache.find_listing(&u, "/pub/").is_none());
    }

    #[test]
    fn credentials_do_not_partition_the_cache() {
        let mut cache = ListingCache::new();
        let a = RemoteUrl::parse("ftp://alice:x@example.com/").unwrap();
        let b = RemoteUrl::parse("ftp://bob:y@example.com/").unwrap();
        cache.insert_listing(&a, "/pub", listing_with("a", 1));
        assert!(cache.find_listing(&b, "/pub").is_some());
    }

    #[test]
    fn parent_invalidation() {
        let mut cache = ListingCache::new();
        let u = url();
        cache.insert_listing(&u, "/pub", listing_with("f", 1));
        cache.invalidate_parent(&u, "/pub/f");
        assert!(cache.find_listing(&u, "/pub").is_none());
    }

    #[test]
    fn size_patch() {
        let mut cache = ListingCache::new();
        let u = url();
        cache.insert_listing(&u, "/pub", listing_with("up.bin", 0));
        cache.update_entry_size(&u, "/pub", "up.bin", 777);
        assert_eq!(
            cache.find_listing(&u, "/pub").unwrap().find("up.bin").unwrap().size,
            777
        );
    }

    #[test]
    fn resolved_paths_superseded() {
        let mut cache = ListingCache::new();
        let u = url();
        cache.insert_path(&u, "~/sub", "/home/user/sub");
        assert_eq!(cache.find_path(&u, "~/sub"), Some("/home/user/sub"));
        cache.insert_path(&u, "~/sub", "/srv/sub");
        assert_eq!(cache.find_path(&u, "~/sub"), Some("/srv/sub"));
    }
}
