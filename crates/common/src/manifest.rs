//! The mount manifest: which remote folders and files appear where.
//!
//! A manifest binds local mount-relative base directories to remote
//! `(project, folder)` pairs, and may pre-declare individual files. The
//! scaffolding directories implied by nesting of base directories are
//! synthesized at bootstrap.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::ancestors;

/// A single pre-declared remote file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Project (or container) holding the file.
    pub proj_id: String,
    /// Remote file id (`file-…`).
    pub file_id: String,
    /// Local directory the file appears under.
    pub parent: String,
    /// Local file name.
    pub fname: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub ctime: i64,
    #[serde(default)]
    pub mtime: i64,
}

/// A remote folder mounted at a local base directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDirectory {
    pub proj_id: String,
    /// Folder inside the project, absolute ("/" is the project root).
    pub folder: String,
    /// Local mount-relative base directory.
    pub dirname: String,
    #[serde(default)]
    pub ctime: i64,
    #[serde(default)]
    pub mtime: i64,
}

/// The initial filesystem structure for one mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    #[serde(default)]
    pub directories: Vec<ManifestDirectory>,
}

impl Manifest {
    /// Parse a manifest from its JSON representation.
    pub fn parse(payload: &str) -> Result<Manifest> {
        let manifest: Manifest =
            serde_json::from_str(payload).map_err(|e| Error::IO(format!("bad manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check structural requirements: absolute paths, no duplicate base
    /// directories, folders rooted at '/'.
    pub fn validate(&self) -> Result<()> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for d in &self.directories {
            if !d.dirname.starts_with('/') || d.dirname == "/" {
                return Err(Error::IO(format!(
                    "manifest dirname must be an absolute non-root path: {}",
                    d.dirname
                )));
            }
            if !d.folder.starts_with('/') {
                return Err(Error::IO(format!(
                    "manifest folder must be absolute: {}",
                    d.folder
                )));
            }
            if !seen.insert(d.dirname.as_str()) {
                return Err(Error::IO(format!("duplicate manifest dirname {}", d.dirname)));
            }
        }
        for f in &self.files {
            if !f.parent.starts_with('/') {
                return Err(Error::IO(format!(
                    "manifest file parent must be absolute: {}",
                    f.parent
                )));
            }
        }
        Ok(())
    }

    /// The synthetic scaffolding directories implied by nesting: every
    /// proper ancestor of a declared base directory or file parent that is
    /// not itself declared. Sorted shallow-first so they can be created in
    /// order.
    pub fn dir_skeleton(&self) -> Vec<String> {
        let declared: BTreeSet<&str> =
            self.directories.iter().map(|d| d.dirname.as_str()).collect();

        let mut skeleton: BTreeSet<String> = BTreeSet::new();
        for d in &self.directories {
            for anc in ancestors(&d.dirname) {
                if !declared.contains(anc.as_str()) {
                    skeleton.insert(anc);
                }
            }
        }
        for f in &self.files {
            if f.parent != "/" && !declared.contains(f.parent.as_str()) {
                for anc in ancestors(&f.parent) {
                    if !declared.contains(anc.as_str()) {
                        skeleton.insert(anc);
                    }
                }
                skeleton.insert(f.parent.clone());
            }
        }

        let mut result: Vec<String> = skeleton.into_iter().collect();
        result.sort_by_key(|p| (p.matches('/').count(), p.clone()));
        result
    }

    /// Map each local base directory to its backing project, used for the
    /// longest-prefix project lookup on file creation.
    pub fn base_dirs(&self) -> Vec<(String, String)> {
        self.directories
            .iter()
            .map(|d| (d.dirname.clone(), d.proj_id.clone()))
            .collect()
    }
}
