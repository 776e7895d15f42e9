//! Reshape a remote folder listing into POSIX-compatible entries.
//!
//! The platform permits multiple sibling data objects with identical
//! names, and object names may also collide with subfolder names. Neither
//! survives a POSIX namespace. Each group of same-named objects becomes a
//! *faux subdirectory* carrying the colliding name, whose members get
//! deterministic disambiguated names. Objects clashing with a real
//! subfolder are renamed in place; the folder keeps its name.
//!
//! The renaming comes at the cost of showing users names the platform
//! does not have, so it is applied only where POSIX leaves no choice, and
//! it must produce identical names on every mount of the same folder.

use std::collections::{BTreeMap, BTreeSet};

use dxfuse_platform::{DataObjectDescriptor, FolderContents};

/// A folder listing after fix-up.
#[derive(Debug, Default)]
pub struct PosixDir {
    /// Objects that live directly in the folder.
    pub data_objects: Vec<DataObjectDescriptor>,
    /// Real remote subfolders, by name.
    pub subdirs: Vec<String>,
    /// Synthesized directories: (name, members). Members carry their
    /// disambiguated names. These have no remote folder backing them.
    pub faux_subdirs: Vec<(String, Vec<DataObjectDescriptor>)>,
}

/// The unique tail of a remote id: `file-A` yields `A`. Ids are unique,
/// so the tail disambiguates within any group of one id type.
fn id_tail(id: &str) -> &str {
    match id.find('-') {
        Some(idx) => &id[idx + 1..],
        None => id,
    }
}

/// Rename a group member by appending the unique tail of its id.
fn disambiguate(name: &str, id: &str) -> String {
    format!("{}_{}", name, id_tail(id))
}

/// Apply the fix-up to one remote folder listing.
pub fn fix_folder(contents: FolderContents) -> PosixDir {
    let subdir_names: BTreeSet<String> = contents.subdirs.iter().cloned().collect();

    // Group objects by name. The same object hard-linked into this folder
    // twice would appear as a duplicated (id, name) pair; collapse those
    // first.
    let mut groups: BTreeMap<String, Vec<DataObjectDescriptor>> = BTreeMap::new();
    let mut seen: BTreeSet<(String, String)> = BTreeSet::new();
    for obj in contents.data_objects {
        if !seen.insert((obj.id.clone(), obj.name.clone())) {
            continue;
        }
        groups.entry(obj.name.clone()).or_default().push(obj);
    }

    let mut result = PosixDir {
        subdirs: contents.subdirs,
        ..PosixDir::default()
    };

    for (name, mut members) in groups {
        // Stable order, so the renaming is identical across mounts.
        members.sort_by(|a, b| a.id.cmp(&b.id));

        if subdir_names.contains(&name) {
            // A folder owns the name; the objects move aside.
            for mut obj in members {
                obj.name = disambiguate(&name, &obj.id);
                result.data_objects.push(obj);
            }
        } else if members.len() == 1 {
            result.data_objects.extend(members);
        } else {
            let renamed: Vec<DataObjectDescriptor> = members
                .into_iter()
                .map(|mut obj| {
                    obj.name = disambiguate(&name, &obj.id);
                    obj
                })
                .collect();
            result.faux_subdirs.push((name, renamed));
        }
    }

    result
}
