// SPDX-FileCopyrightText: Copyright © 2024 Cytrus Tools Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::BTreeMap;

use crate::environment;
use crate::manifest::{Archive, FileEntry, Manifest};
use crate::platform::Platform;

/// Reconciliation plan between a local and a remote manifest,
/// keyed by fragment like the manifests themselves
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff(pub BTreeMap<String, FragmentDiff>);

impl Diff {
    pub fn fragment(&self, name: &str) -> Option<&FragmentDiff> {
        self.0.get(name)
    }

    pub fn fragments(&self) -> impl Iterator<Item = (&String, &FragmentDiff)> {
        self.0.iter()
    }

    /// True when no fragment wants any download
    pub fn is_download_empty(&self) -> bool {
        self.0.values().all(|fragment| {
            fragment.files.values().all(|entry| !entry.download)
        })
    }

    /// Paths written by downloads anywhere in the plan (pack members
    /// included), used to keep deletions from racing a sibling
    /// fragment's download
    pub fn downloading_paths(&self) -> impl Iterator<Item = &str> {
        self.0.values().flat_map(|fragment| {
            fragment
                .files
                .iter()
                .filter(|(_, entry)| entry.download)
                .flat_map(|(path, entry)| {
                    let mut paths = vec![path.as_str()];
                    if let Some(members) = &entry.pack_files {
                        paths.extend(members.keys().map(String::as_str));
                    }
                    paths
                })
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentDiff {
    pub files: BTreeMap<String, Entry>,
    /// Inverted index over entries marked for download: content hash
    /// to the targets sharing it
    pub hashes: BTreeMap<String, Vec<Target>>,
}

impl FragmentDiff {
    /// Bytes this fragment still wants from the repository
    pub fn download_size(&self) -> u64 {
        self.files
            .values()
            .filter(|entry| entry.download)
            .map(|entry| entry.size)
            .sum()
    }
}

/// One planned operation on one path (or one pack)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub hash: Option<String>,
    pub size: u64,
    pub executable: bool,
    /// Fetch this content from the repository
    pub download: bool,
    /// Hash matched but the executable bit differs; chmod only
    pub update_permissions: bool,
    /// This entry stands for a whole pack to extract
    pub is_pack: bool,
    pub pack_files: Option<BTreeMap<String, FileEntry>>,
    /// Set when the path is a manifested archive, enabling
    /// in-place patching
    pub archive: Option<Archive>,
}

impl Entry {
    pub fn is_deletion(&self) -> bool {
        self.size == 0 && self.hash.is_none() && !self.download
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: String,
    pub size: u64,
    pub executable: bool,
}

/// Compute the action set for `selection` given both manifests.
/// Pure over its inputs; re-running with an altered selection yields
/// a correct new plan.
pub fn compute(
    selection: &[String],
    local: &Manifest,
    remote: &Manifest,
    platform: Platform,
) -> Diff {
    let mut diff = Diff::default();

    // Scratch copy of the local side; anything still here after the
    // first pass is a tombstone candidate
    let mut scratch: BTreeMap<String, BTreeMap<String, FileEntry>> = local
        .fragments()
        .map(|(name, fragment)| (name.clone(), fragment.files.clone()))
        .collect();

    for (name, fragment) in remote.fragments() {
        let selected = selection.iter().any(|wanted| wanted == name);
        let locally_present = local.fragment(name).is_some();

        if !selected && !locally_present {
            continue;
        }

        let bucket = diff.0.entry(name.clone()).or_default();

        if !selected {
            // No longer wanted: leave every local file in scratch so
            // the deletion pass reclaims the fragment
            continue;
        }

        let local_files = local.fragment(name).map(|fragment| &fragment.files);

        for (path, remote_entry) in &fragment.files {
            let local_entry = local_files.and_then(|files| files.get(path));

            if remote_entry.is_tombstone() {
                if local_entry.is_some() {
                    bucket.files.insert(path.clone(), Entry::default());
                    if let Some(files) = scratch.get_mut(name) {
                        files.remove(path);
                    }
                }
                continue;
            }

            let hash_changed = local_entry.map(|entry| &entry.hash) != Some(&remote_entry.hash);
            let exec_changed = platform.tracks_permissions()
                && local_entry.is_some_and(|entry| entry.executable != remote_entry.executable);

            if let Some(files) = scratch.get_mut(name) {
                files.remove(path);
            }

            if !hash_changed && !exec_changed {
                continue;
            }

            let entry = Entry {
                hash: remote_entry.hash.clone(),
                size: remote_entry.size,
                executable: remote_entry.executable,
                download: hash_changed,
                update_permissions: exec_changed,
                archive: fragment.archives.get(path).cloned(),
                ..Default::default()
            };

            if entry.download {
                if let Some(hash) = &entry.hash {
                    bucket.hashes.entry(hash.clone()).or_default().push(Target {
                        path: path.clone(),
                        size: remote_entry.size,
                        executable: remote_entry.executable,
                    });
                }
            }

            bucket.files.insert(path.clone(), entry);
        }
    }

    coalesce_packs(&mut diff, remote);

    // Deletion pass: whatever the first pass did not claim is gone
    // from the remote side and gets tombstoned
    for (name, files) in scratch {
        let survivors = files
            .into_keys()
            .filter(|path| {
                !diff
                    .fragment(&name)
                    .is_some_and(|bucket| bucket.files.contains_key(path))
            })
            .collect::<Vec<_>>();

        if survivors.is_empty() {
            continue;
        }

        let bucket = diff.0.entry(name).or_default();
        for path in survivors {
            bucket.files.insert(path, Entry::default());
        }
    }

    diff
}

/// Replace individual downloads with whole-pack fetches where more
/// than `PACK_RATIO` of a pack's members are wanted anyway
fn coalesce_packs(diff: &mut Diff, remote: &Manifest) {
    for (name, fragment) in remote.fragments() {
        if fragment.packs.is_empty() {
            continue;
        }

        let Some(bucket) = diff.0.get_mut(name) else {
            continue;
        };

        for (pack_hash, pack) in &fragment.packs {
            let wanted = pack
                .hashes
                .iter()
                .filter(|hash| bucket.hashes.contains_key(*hash))
                .cloned()
                .collect::<Vec<_>>();

            if pack.hashes.is_empty()
                || (wanted.len() as f64 / pack.hashes.len() as f64) <= environment::PACK_RATIO
            {
                continue;
            }

            let mut pack_files = BTreeMap::new();

            for hash in &wanted {
                for target in bucket.hashes.get(hash).into_iter().flatten() {
                    pack_files.insert(
                        target.path.clone(),
                        FileEntry {
                            hash: Some(hash.clone()),
                            size: target.size,
                            executable: target.executable,
                        },
                    );
                    if let Some(entry) = bucket.files.get_mut(&target.path) {
                        entry.download = false;
                    }
                }
            }

            bucket.files.insert(
                pack_hash.clone(),
                Entry {
                    hash: Some(pack_hash.clone()),
                    size: pack.size,
                    download: true,
                    is_pack: true,
                    pack_files: Some(pack_files),
                    ..Default::default()
                },
            );
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn manifest(value: serde_json::Value) -> Manifest {
        Manifest::from_value(value).expect("valid manifest")
    }

    fn selection(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[test]
    fn identical_manifests_diff_empty() {
        let remote = manifest(json!({
            "main": { "files": {
                "a.bin": { "hash": "aa", "size": 4, "executable": false },
                "b.bin": { "hash": "bb", "size": 2, "executable": true }
            }}
        }));

        let diff = compute(&selection(&["main"]), &remote, &remote, Platform::Linux);
        assert!(diff.is_download_empty());
        assert!(diff.fragment("main").map_or(true, |b| b.files.is_empty()));
    }

    #[test]
    fn fresh_install_downloads_everything() {
        let remote = manifest(json!({
            "main": { "files": { "a.bin": { "hash": "aa", "size": 4, "executable": false } } }
        }));

        let diff = compute(
            &selection(&["main"]),
            &Manifest::default(),
            &remote,
            Platform::Linux,
        );

        let entry = &diff.fragment("main").unwrap().files["a.bin"];
        assert!(entry.download);
        assert!(!entry.update_permissions);
        assert_eq!(entry.size, 4);
    }

    #[test]
    fn removed_remote_file_is_tombstoned() {
        let local = manifest(json!({
            "main": { "files": {
                "a.bin": { "hash": "aa", "size": 4, "executable": false },
                "b.bin": { "hash": "bb", "size": 2, "executable": false }
            }}
        }));
        let remote = manifest(json!({
            "main": { "files": { "a.bin": { "hash": "aa", "size": 4, "executable": false } } }
        }));

        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Linux);

        let bucket = diff.fragment("main").unwrap();
        assert!(bucket.files["b.bin"].is_deletion());
        assert!(!bucket.files.contains_key("a.bin"));
    }

    #[test]
    fn permission_only_change_skips_download() {
        let local = manifest(json!({
            "main": { "files": { "tool": { "hash": "aa", "size": 4, "executable": false } } }
        }));
        let remote = manifest(json!({
            "main": { "files": { "tool": { "hash": "aa", "size": 4, "executable": true } } }
        }));

        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Linux);
        let entry = &diff.fragment("main").unwrap().files["tool"];
        assert!(!entry.download);
        assert!(entry.update_permissions);

        // Windows ignores the executable bit entirely
        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Windows);
        assert!(diff.is_download_empty());
    }

    #[test]
    fn deselected_fragment_is_reclaimed() {
        let local = manifest(json!({
            "fr": { "files": { "fr.pak": { "hash": "ff", "size": 9, "executable": false } } }
        }));
        let remote = manifest(json!({
            "fr": { "files": { "fr.pak": { "hash": "ff", "size": 9, "executable": false } } },
            "en": { "files": { "en.pak": { "hash": "ee", "size": 9, "executable": false } } }
        }));

        let diff = compute(&selection(&["en"]), &local, &remote, Platform::Linux);

        assert!(diff.fragment("fr").unwrap().files["fr.pak"].is_deletion());
        assert!(diff.fragment("en").unwrap().files["en.pak"].download);
    }

    fn pack_fixture(members: usize, wanted: usize) -> (Manifest, Manifest) {
        let hashes: Vec<String> = (0..members).map(|i| format!("{i:02x}")).collect();

        let mut files = serde_json::Map::new();
        for (i, hash) in hashes.iter().enumerate().take(wanted) {
            files.insert(
                format!("file{i}.bin"),
                json!({ "hash": hash, "size": 1, "executable": false }),
            );
        }

        let remote = manifest(json!({
            "main": {
                "files": files,
                "packs": { "pack0": { "size": 100, "hashes": hashes } }
            }
        }));

        (Manifest::default(), remote)
    }

    #[test]
    fn pack_coalesces_above_ratio() {
        let (local, remote) = pack_fixture(10, 6);
        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Linux);

        let bucket = diff.fragment("main").unwrap();
        let pack = &bucket.files["pack0"];
        assert!(pack.is_pack && pack.download);
        assert_eq!(pack.pack_files.as_ref().unwrap().len(), 6);

        // Members are no longer fetched individually
        let individual = bucket
            .files
            .values()
            .filter(|entry| entry.download && !entry.is_pack)
            .count();
        assert_eq!(individual, 0);
    }

    #[test]
    fn pack_stays_apart_at_ratio() {
        let (local, remote) = pack_fixture(10, 5);
        let diff = compute(&selection(&["main"]), &local, &remote, Platform::Linux);

        let bucket = diff.fragment("main").unwrap();
        assert!(!bucket.files.contains_key("pack0"));
        let individual = bucket.files.values().filter(|entry| entry.download).count();
        assert_eq!(individual, 5);
    }

    #[test]
    fn archive_entry_carries_inner_manifest() {
        let remote = manifest(json!({
            "main": {
                "files": { "maps/m.d2p": { "hash": "dd", "size": 64, "executable": false } },
                "archives": {
                    "maps/m.d2p": { "files": { "a.ele": { "hash": "11", "size": 32 } } }
                }
            }
        }));

        let diff = compute(
            &selection(&["main"]),
            &Manifest::default(),
            &remote,
            Platform::Linux,
        );

        let entry = &diff.fragment("main").unwrap().files["maps/m.d2p"];
        assert!(entry.download);
        assert!(entry.archive.is_some());
    }

    #[test]
    fn rerun_with_new_selection_is_pure() {
        let local = Manifest::default();
        let remote = manifest(json!({
            "en": { "files": { "en.pak": { "hash": "ee", "size": 1, "executable": false } } },
            "fr": { "files": { "fr.pak": { "hash": "ff", "size": 1, "executable": false } } }
        }));

        let first = compute(&selection(&["fr"]), &local, &remote, Platform::Linux);
        let second = compute(&selection(&["en"]), &local, &remote, Platform::Linux);
        let again = compute(&selection(&["fr"]), &local, &remote, Platform::Linux);

        assert_eq!(first, again);
        assert!(second.fragment("en").unwrap().files["en.pak"].download);
        assert!(second.fragment("fr").is_none());
    }
}
