//! Virtual file store backing the guest's filesystem view.
//!
//! An in-memory path-to-bytes map is authoritative. A durable backing
//! store may be attached; writes to it are fire-and-forget and its
//! failures never block the read path. A read that follows a write always
//! observes the write through the in-memory map.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Read-only entries present in every store from construction.
const SEED_FILES: &[(&str, &str)] = &[
    ("/proc/version", "Linux 4.5 blink-1.0 x86_64 GNU/Linux\n"),
    ("/proc/cpuinfo", "model name : Blink x86-64 Virtual CPU\n"),
    ("/etc/hostname", "helixcore\n"),
    ("/etc/os-release", "NAME=\"HelixCore OS\"\nVERSION=\"0.1\"\n"),
];

/// Path-keyed byte-blob store with synthesized directory listings.
pub struct FileStore {
    files: BTreeMap<String, Vec<u8>>,
    /// Snapshot target for durable persistence, if attached.
    backing: Option<PathBuf>,
}

impl FileStore {
    /// Create a store holding only the seeded `/proc` and `/etc` entries.
    pub fn new() -> Self {
        let mut files = BTreeMap::new();
        for (path, content) in SEED_FILES {
            files.insert(path.to_string(), content.as_bytes().to_vec());
        }
        Self { files, backing: None }
    }

    /// Attach a JSON snapshot file and load any previously persisted
    /// entries from it. Entries in the snapshot never shadow the seeds.
    pub fn with_backing(path: PathBuf) -> Self {
        let mut store = Self::new();
        if let Ok(text) = std::fs::read_to_string(&path) {
            if let Ok(map) = serde_json::from_str::<BTreeMap<String, String>>(&text) {
                for (k, v) in map {
                    store.files.entry(k).or_insert_with(|| v.into_bytes());
                }
            }
        }
        store.backing = Some(path);
        store
    }

    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    pub fn size(&self, path: &str) -> Option<u64> {
        self.files.get(path).map(|v| v.len() as u64)
    }

    pub fn write(&mut self, path: &str, bytes: Vec<u8>) {
        self.files.insert(path.to_string(), bytes);
        self.persist();
    }

    pub fn delete(&mut self, path: &str) {
        self.files.remove(path);
        self.persist();
    }

    /// List the immediate children of `dir`. For every stored path with
    /// `dir/` as prefix, yields the first component after the prefix and
    /// whether further `/` separators follow (a synthesized subdirectory).
    pub fn list(&self, dir: &str) -> Vec<(String, bool)> {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{}/", dir)
        };
        let mut out: Vec<(String, bool)> = Vec::new();
        for path in self.files.keys() {
            let Some(rest) = path.strip_prefix(&prefix) else { continue };
            if rest.is_empty() {
                continue;
            }
            let (name, is_dir) = match rest.find('/') {
                Some(pos) => (&rest[..pos], true),
                None => (rest, false),
            };
            if !out.iter().any(|(n, _)| n == name) {
                out.push((name.to_string(), is_dir));
            }
        }
        out
    }

    /// Snapshot the map to the backing file. Errors are swallowed: the
    /// in-memory map stays authoritative and callers never wait on this.
    fn persist(&self) {
        let Some(backing) = &self.backing else { return };
        let map: BTreeMap<&str, String> = self
            .files
            .iter()
            .map(|(k, v)| (k.as_str(), String::from_utf8_lossy(v).into_owned()))
            .collect();
        if let Ok(json) = serde_json::to_string_pretty(&map) {
            let _ = std::fs::write(backing, json);
        }
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_are_present() {
        let store = FileStore::new();
        let version = store.read("/proc/version").unwrap();
        assert_eq!(version, b"Linux 4.5 blink-1.0 x86_64 GNU/Linux\n");
        assert_eq!(store.size("/etc/hostname"), Some(10));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut store = FileStore::new();
        store.write("/tmp/a.txt", b"hello".to_vec());
        assert_eq!(store.read("/tmp/a.txt"), Some(&b"hello"[..]));
        store.delete("/tmp/a.txt");
        assert_eq!(store.read("/tmp/a.txt"), None);
    }

    #[test]
    fn list_synthesizes_directories() {
        let mut store = FileStore::new();
        store.write("/src/main.c", Vec::new());
        store.write("/src/lib/util.c", Vec::new());
        let mut entries = store.list("/src");
        entries.sort();
        assert_eq!(
            entries,
            vec![("lib".to_string(), true), ("main.c".to_string(), false)]
        );
        let etc = store.list("/etc");
        assert!(etc.contains(&("hostname".to_string(), false)));
    }
}
