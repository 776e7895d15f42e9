//! The SQLite-backed metadata index.
//!
//! One database file per mount holds three tables:
//!
//! - `data_objects`: one row per remote object, keyed by inode, indexed
//!   by remote id so hard links can be detected.
//! - `namespace`: the tree, one row per `(parent, name)` binding.
//! - `directories`: per-directory project backing and population state.
//!
//! All statements are parameterized. All mutations run inside a
//! transaction on a mutex-guarded connection; remote describes happen
//! with the connection lock released and only the commit takes it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use dxfuse_common::{join_path, split_path, Error, Result, INODE_ROOT, MAX_DIR_SIZE};
use dxfuse_platform::{DataObjectDescriptor, FolderContents};

use crate::node::{Dir, File, Node, ObjKind};
use crate::posix::{self, PosixDir};

const NS_DIR_TYPE: i64 = 1;
const NS_DATA_OBJ_TYPE: i64 = 2;

/// Source of remote folder listings. The platform client satisfies this;
/// tests substitute in-memory fakes.
#[async_trait]
pub trait FolderSource: Send + Sync {
    async fn describe_folder(&self, project_id: &str, folder: &str) -> Result<FolderContents>;
}

/// Outcome of looking for a directory in the index.
#[derive(Debug, Clone)]
pub enum DirStatus {
    Missing,
    Unpopulated(Dir),
    Populated(Dir),
}

/// Seconds since the Unix epoch, clamped at zero.
fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn db_err(err: rusqlite::Error) -> Error {
    Error::IO(format!("metadata store: {}", err))
}

/// The persistent metadata index for one mount.
pub struct MetadataDb {
    /// Guarded connection; held only for the duration of a query or
    /// transaction, never across a remote call.
    conn: Mutex<Connection>,
    /// Monotonic inode allocator. Inodes never recur within a mount.
    inode_counter: AtomicI64,
    /// Serializes directory populations so concurrent accessors of the
    /// same directory trigger exactly one describe round trip.
    populate_lock: tokio::sync::Mutex<()>,
}

impl MetadataDb {
    /// Create a fresh metadata store at `db_path`. The caller removes any
    /// stale file from a previous mount first; the namespace is rebuilt
    /// from scratch every time.
    pub fn open(db_path: &Path) -> Result<MetadataDb> {
        let conn: Connection = Connection::open(db_path).map_err(db_err)?;

        // WAL keeps readers unblocked while a population commits.
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;

        conn.execute_batch(
            "CREATE TABLE data_objects (
                inode bigint,
                kind int NOT NULL,
                id text NOT NULL,
                proj_id text NOT NULL,
                size bigint NOT NULL,
                ctime bigint NOT NULL,
                mtime bigint NOT NULL,
                nlink int NOT NULL,
                inline_data text NOT NULL,
                PRIMARY KEY (inode)
            );
            CREATE INDEX id_index ON data_objects (id);

            CREATE TABLE namespace (
                parent text NOT NULL,
                name text NOT NULL,
                obj_type int NOT NULL,
                inode bigint NOT NULL,
                PRIMARY KEY (parent, name)
            );
            CREATE INDEX parent_index ON namespace (parent);
            CREATE INDEX inode_rev_index ON namespace (inode);

            CREATE TABLE directories (
                inode bigint,
                proj_id text NOT NULL,
                proj_folder text NOT NULL,
                populated int NOT NULL,
                ctime bigint NOT NULL,
                mtime bigint NOT NULL,
                PRIMARY KEY (inode)
            );",
        )
        .map_err(db_err)?;

        // The root belongs to no single project, which is what lets one
        // mount expose several projects side by side.
        let now: i64 = now_seconds();
        conn.execute(
            "INSERT INTO directories VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![INODE_ROOT, "", "", 0, now, now],
        )
        .map_err(db_err)?;
        conn.execute(
            "INSERT INTO namespace VALUES (?1, ?2, ?3, ?4)",
            params!["", "/", NS_DIR_TYPE, INODE_ROOT],
        )
        .map_err(db_err)?;

        Ok(MetadataDb {
            conn: Mutex::new(conn),
            inode_counter: AtomicI64::new(INODE_ROOT),
            populate_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    /// Allocate an inode number. Stable for the lifetime of the mount.
    fn alloc_inode(&self) -> i64 {
        self.inode_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    /// Build the initial tree from the manifest: synthetic scaffolding
    /// directories (populated by construction), pre-declared files, and
    /// one unpopulated directory per mounted remote folder. One
    /// transaction; the root is populated when it commits.
    pub fn bootstrap(&self, manifest: &dxfuse_common::Manifest) -> Result<()> {
        let mut conn = self.lock_conn();
        let txn: Transaction<'_> = conn.transaction().map_err(db_err)?;

        let now: i64 = now_seconds();
        for dir_path in manifest.dir_skeleton() {
            self.create_empty_dir_tx(&txn, "", "", now, now, &dir_path, true)?;
        }

        for f in &manifest.files {
            self.create_data_object_tx(
                &txn,
                ObjKind::Regular,
                &f.proj_id,
                &f.file_id,
                f.size,
                f.ctime,
                f.mtime,
                &f.parent,
                &f.fname,
                "",
            )?;
        }

        for d in &manifest.directories {
            // Local directory d.dirname stands for folder d.folder on
            // project d.proj_id; children are discovered on first access.
            self.create_empty_dir_tx(
                &txn,
                &d.proj_id,
                &d.folder,
                d.ctime,
                d.mtime,
                &d.dirname,
                false,
            )?;
        }

        txn.execute(
            "UPDATE directories SET populated = 1 WHERE inode = ?1",
            params![INODE_ROOT],
        )
        .map_err(db_err)?;
        txn.commit().map_err(db_err)
    }

    // ========================================================================
    // Row creation
    // ========================================================================

    /// Insert one data object under `(parent, name)`. If the remote id is
    /// already known the existing inode is hard-linked: only the
    /// namespace entry is added and nlink goes up by one.
    fn create_data_object_tx(
        &self,
        txn: &Transaction<'_>,
        kind: ObjKind,
        proj_id: &str,
        obj_id: &str,
        size: i64,
        ctime: i64,
        mtime: i64,
        parent: &str,
        name: &str,
        inline_data: &str,
    ) -> Result<i64> {
        let taken: Option<i64> = txn
            .query_row(
                "SELECT inode FROM namespace WHERE parent = ?1 AND name = ?2",
                params![parent, name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if taken.is_some() {
            return Err(Error::Exists);
        }

        let mut stmt = txn
            .prepare("SELECT inode, nlink FROM data_objects WHERE id = ?1")
            .map_err(db_err)?;
        let existing: Vec<(i64, i64)> = stmt
            .query_map(params![obj_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err)?
            .collect::<std::result::Result<_, _>>()
            .map_err(db_err)?;

        let inode: i64 = match existing.len() {
            0 => {
                let inode: i64 = self.alloc_inode();
                txn.execute(
                    "INSERT INTO data_objects VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        inode,
                        kind.to_db(),
                        obj_id,
                        proj_id,
                        size,
                        ctime,
                        mtime,
                        1,
                        inline_data
                    ],
                )
                .map_err(db_err)?;
                inode
            }
            1 => {
                let (inode, nlink) = existing[0];
                txn.execute(
                    "UPDATE data_objects SET nlink = ?1 WHERE inode = ?2",
                    params![nlink + 1, inode],
                )
                .map_err(db_err)?;
                inode
            }
            n => {
                return Err(Error::Corrupt(format!(
                    "{} data-object rows share id {}",
                    n, obj_id
                )))
            }
        };

        txn.execute(
            "INSERT INTO namespace VALUES (?1, ?2, ?3, ?4)",
            params![parent, name, NS_DATA_OBJ_TYPE, inode],
        )
        .map_err(db_err)?;
        Ok(inode)
    }

    /// Insert an empty directory at `dir_path`.
    fn create_empty_dir_tx(
        &self,
        txn: &Transaction<'_>,
        proj_id: &str,
        proj_folder: &str,
        ctime: i64,
        mtime: i64,
        dir_path: &str,
        populated: bool,
    ) -> Result<i64> {
        if !dir_path.starts_with('/') {
            return Err(Error::Corrupt(format!(
                "directory path must be absolute: {}",
                dir_path
            )));
        }
        let (parent, basename) = split_path(dir_path);

        let taken: Option<i64> = txn
            .query_row(
                "SELECT inode FROM namespace WHERE parent = ?1 AND name = ?2",
                params![parent, basename],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if taken.is_some() {
            return Err(Error::Exists);
        }

        let inode: i64 = self.alloc_inode();
        txn.execute(
            "INSERT INTO namespace VALUES (?1, ?2, ?3, ?4)",
            params![parent, basename, NS_DIR_TYPE, inode],
        )
        .map_err(db_err)?;
        txn.execute(
            "INSERT INTO directories VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![inode, proj_id, proj_folder, populated as i64, ctime, mtime],
        )
        .map_err(db_err)?;
        Ok(inode)
    }

    /// Create a data object in its own transaction; used for newly
    /// created files, with the staging path as inline data.
    #[allow(clippy::too_many_arguments)]
    pub fn create_data_object(
        &self,
        kind: ObjKind,
        proj_id: &str,
        obj_id: &str,
        size: i64,
        ctime: i64,
        mtime: i64,
        parent: &str,
        name: &str,
        inline_data: &str,
    ) -> Result<i64> {
        let mut conn = self.lock_conn();
        let txn: Transaction<'_> = conn.transaction().map_err(db_err)?;
        let inode: i64 = self.create_data_object_tx(
            &txn, kind, proj_id, obj_id, size, ctime, mtime, parent, name, inline_data,
        )?;
        txn.commit().map_err(db_err)?;
        Ok(inode)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Point lookup of a directory by path, without populating anything.
    pub fn directory_lookup(&self, dir_path: &str) -> Result<DirStatus> {
        let conn = self.lock_conn();
        let (parent, basename) = split_path(dir_path);

        let inode: Option<i64> = conn
            .query_row(
                "SELECT inode FROM namespace
                 WHERE parent = ?1 AND name = ?2 AND obj_type = ?3",
                params![parent, basename, NS_DIR_TYPE],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let inode: i64 = match inode {
            Some(i) => i,
            None => return Ok(DirStatus::Missing),
        };

        let row: Option<(i64, String, String, i64, i64)> = conn
            .query_row(
                "SELECT populated, proj_id, proj_folder, ctime, mtime
                 FROM directories WHERE inode = ?1",
                params![inode],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                },
            )
            .optional()
            .map_err(db_err)?;
        let (populated, proj_id, proj_folder, ctime, mtime) = row.ok_or_else(|| {
            Error::Corrupt(format!(
                "directory {} is in the namespace but has no directory row",
                dir_path
            ))
        })?;

        let dir = Dir {
            parent: parent.to_string(),
            dname: basename.to_string(),
            full_path: dir_path.to_string(),
            inode,
            ctime,
            mtime,
            proj_id,
            proj_folder,
            populated: populated != 0,
        };
        if dir.populated {
            Ok(DirStatus::Populated(dir))
        } else {
            Ok(DirStatus::Unpopulated(dir))
        }
    }

    /// Check that `dir_path` exists, populating its parent on the way if
    /// needed. The kernel resolves paths component by component, so the
    /// parent is always present in the index by the time a child is
    /// touched; anything else is a bug.
    pub async fn directory_exists(
        &self,
        dir_path: &str,
        source: &dyn FolderSource,
    ) -> Result<DirStatus> {
        if dir_path == "/" {
            // The root has no parent to check.
            return self.directory_lookup(dir_path);
        }

        let (parent, _) = split_path(dir_path);
        match self.directory_lookup(parent)? {
            DirStatus::Missing => {
                return Err(Error::Corrupt(format!(
                    "accessing directory {} before its parent {}",
                    dir_path, parent
                )))
            }
            DirStatus::Unpopulated(parent_dir) => {
                tracing::debug!("parent directory {} not yet populated", parent);
                self.populate_directory(&parent_dir, source).await?;
            }
            DirStatus::Populated(_) => {}
        }

        self.directory_lookup(dir_path)
    }

    /// Resolve one name inside a populated directory.
    fn fast_lookup(&self, parent_path: &str, name: &str) -> Result<Node> {
        let entry: Option<(i64, i64)> = {
            let conn = self.lock_conn();
            conn.query_row(
                "SELECT obj_type, inode FROM namespace
                 WHERE parent = ?1 AND name = ?2",
                params![parent_path, name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?
        };

        let (obj_type, inode) = entry.ok_or(Error::NotFound)?;
        match obj_type {
            NS_DIR_TYPE => self.dir_by_inode(parent_path, name, inode).map(Node::Directory),
            NS_DATA_OBJ_TYPE => self
                .data_object_by_inode(name, inode)
                .map(Node::DataObject),
            other => Err(Error::Corrupt(format!(
                "namespace entry {}/{} has invalid type {}",
                parent_path, name, other
            ))),
        }
    }

    fn dir_by_inode(&self, parent_path: &str, name: &str, inode: i64) -> Result<Dir> {
        let conn = self.lock_conn();
        let row: Option<(String, String, i64, i64, i64)> = conn
            .query_row(
                "SELECT proj_id, proj_folder, populated, ctime, mtime
                 FROM directories WHERE inode = ?1",
                params![inode],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                },
            )
            .optional()
            .map_err(db_err)?;
        let (proj_id, proj_folder, populated, ctime, mtime) = row.ok_or_else(|| {
            Error::Corrupt(format!(
                "directory inode {} ({}/{}) has no directory row",
                inode, parent_path, name
            ))
        })?;

        let full_path: String = if name == "/" {
            "/".to_string()
        } else {
            join_path(parent_path, name)
        };
        Ok(Dir {
            parent: parent_path.to_string(),
            dname: name.to_string(),
            full_path,
            inode,
            ctime,
            mtime,
            proj_id,
            proj_folder,
            populated: populated != 0,
        })
    }

    fn data_object_by_inode(&self, name: &str, inode: i64) -> Result<File> {
        let conn = self.lock_conn();
        let row: Option<(i64, String, String, i64, i64, i64, i64, String)> = conn
            .query_row(
                "SELECT kind, id, proj_id, size, ctime, mtime, nlink, inline_data
                 FROM data_objects WHERE inode = ?1",
                params![inode],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        let (kind, id, proj_id, size, ctime, mtime, nlink, inline_data) =
            row.ok_or_else(|| {
                Error::Corrupt(format!(
                    "data object inode {} ({}) has no backing row",
                    inode, name
                ))
            })?;

        Ok(File {
            kind: ObjKind::from_db(kind)?,
            id,
            proj_id,
            name: name.to_string(),
            size,
            inode,
            ctime,
            mtime,
            nlink,
            inline_data,
        })
    }

    /// Look for `name` inside `parent_path`, populating the directory
    /// chain on demand.
    pub async fn lookup(
        &self,
        parent_path: &str,
        name: &str,
        source: &dyn FolderSource,
    ) -> Result<Node> {
        match self.directory_exists(parent_path, source).await? {
            DirStatus::Missing => Err(Error::NotFound),
            DirStatus::Unpopulated(dir) => {
                self.populate_directory(&dir, source).await?;
                self.fast_lookup(parent_path, name)
            }
            DirStatus::Populated(_) => self.fast_lookup(parent_path, name),
        }
    }

    /// The root directory. Always populated after bootstrap.
    pub fn root(&self) -> Result<Dir> {
        match self.directory_lookup("/")? {
            DirStatus::Populated(dir) => Ok(dir),
            DirStatus::Unpopulated(_) => {
                Err(Error::Corrupt("root directory is not populated".to_string()))
            }
            DirStatus::Missing => Err(Error::Corrupt("root directory is missing".to_string())),
        }
    }

    /// Resolve an inode to a node. Hard-linked objects resolve through
    /// their first namespace binding; the attributes are identical either
    /// way.
    pub fn node_by_inode(&self, inode: i64) -> Result<Node> {
        let entry: Option<(String, String, i64)> = {
            let conn = self.lock_conn();
            conn.query_row(
                "SELECT parent, name, obj_type FROM namespace
                 WHERE inode = ?1 ORDER BY parent, name LIMIT 1",
                params![inode],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_err)?
        };
        let (parent, name, obj_type) = entry.ok_or(Error::NotFound)?;

        match obj_type {
            NS_DIR_TYPE => self.dir_by_inode(&parent, &name, inode).map(Node::Directory),
            NS_DATA_OBJ_TYPE => self.data_object_by_inode(&name, inode).map(Node::DataObject),
            other => Err(Error::Corrupt(format!(
                "namespace entry for inode {} has invalid type {}",
                inode, other
            ))),
        }
    }

    /// The full path of a directory inode. Directories bind into the
    /// namespace exactly once, so this is a single query.
    pub fn dir_path(&self, inode: i64) -> Result<String> {
        let conn = self.lock_conn();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT parent, name FROM namespace
                 WHERE inode = ?1 AND obj_type = ?2",
                params![inode, NS_DIR_TYPE],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let (parent, name) = row.ok_or(Error::NotFound)?;
        if name == "/" {
            Ok("/".to_string())
        } else {
            Ok(join_path(&parent, &name))
        }
    }

    // ========================================================================
    // Population
    // ========================================================================

    /// Read the contents of a populated directory straight from the
    /// index.
    pub fn directory_read_all(
        &self,
        dir_path: &str,
    ) -> Result<(HashMap<String, File>, HashMap<String, Dir>)> {
        let conn = self.lock_conn();

        let mut subdirs: HashMap<String, Dir> = HashMap::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT directories.inode, directories.proj_id,
                            directories.proj_folder, directories.populated,
                            namespace.name, directories.ctime, directories.mtime
                     FROM directories JOIN namespace
                     ON directories.inode = namespace.inode
                     WHERE namespace.parent = ?1 AND namespace.obj_type = ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![dir_path, NS_DIR_TYPE], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                })
                .map_err(db_err)?;
            for row in rows {
                let (inode, proj_id, proj_folder, populated, dname, ctime, mtime) =
                    row.map_err(db_err)?;
                subdirs.insert(
                    dname.clone(),
                    Dir {
                        parent: dir_path.to_string(),
                        full_path: join_path(dir_path, &dname),
                        dname,
                        inode,
                        ctime,
                        mtime,
                        proj_id,
                        proj_folder,
                        populated: populated != 0,
                    },
                );
            }
        }

        let mut files: HashMap<String, File> = HashMap::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT data_objects.kind, data_objects.id, data_objects.proj_id,
                            data_objects.inode, data_objects.size, data_objects.ctime,
                            data_objects.mtime, data_objects.nlink,
                            data_objects.inline_data, namespace.name
                     FROM data_objects JOIN namespace
                     ON data_objects.inode = namespace.inode
                     WHERE namespace.parent = ?1 AND namespace.obj_type = ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![dir_path, NS_DATA_OBJ_TYPE], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                })
                .map_err(db_err)?;
            for row in rows {
                let (kind, id, proj_id, inode, size, ctime, mtime, nlink, inline_data, name) =
                    row.map_err(db_err)?;
                files.insert(
                    name.clone(),
                    File {
                        kind: ObjKind::from_db(kind)?,
                        id,
                        proj_id,
                        name,
                        size,
                        inode,
                        ctime,
                        mtime,
                        nlink,
                        inline_data,
                    },
                );
            }
        }

        Ok((files, subdirs))
    }

    /// Discover a directory's children from the remote platform and
    /// commit them in one transaction.
    ///
    /// Populations are serialized: the first caller performs the describe
    /// round trip, and anyone racing it finds the populated flag set and
    /// returns early.
    pub async fn populate_directory(&self, dir: &Dir, source: &dyn FolderSource) -> Result<()> {
        let _guard = self.populate_lock.lock().await;

        // Re-check after winning the lock; a concurrent caller may have
        // populated this directory already.
        let dir: Dir = match self.directory_lookup(&dir.full_path)? {
            DirStatus::Populated(_) => return Ok(()),
            DirStatus::Unpopulated(d) => d,
            DirStatus::Missing => {
                return Err(Error::Corrupt(format!(
                    "populating directory {} that is not in the index",
                    dir.full_path
                )))
            }
        };

        // Synthetic directories have no remote backing; they are born
        // populated, so finding one here just flips the flag.
        if dir.proj_id.is_empty() {
            let conn = self.lock_conn();
            conn.execute(
                "UPDATE directories SET populated = 1 WHERE inode = ?1",
                params![dir.inode],
            )
            .map_err(db_err)?;
            return Ok(());
        }

        tracing::debug!("describe folder {}:{}", dir.proj_id, dir.proj_folder);
        let contents: FolderContents = source
            .describe_folder(&dir.proj_id, &dir.proj_folder)
            .await?;

        let total: usize = contents.data_objects.len() + contents.subdirs.len();
        if total > MAX_DIR_SIZE {
            return Err(Error::NotSupported(format!(
                "folder {}:{} holds {} entries, above the {} limit",
                dir.proj_id, dir.proj_folder, total, MAX_DIR_SIZE
            )));
        }

        // The platform records no per-folder times. Approximate: creation
        // is the earliest child create, modification the latest child
        // modification. Tools comparing timestamps depend on this.
        let mut ctime: i64 = dir.ctime;
        let mut mtime: i64 = dir.mtime;
        for o in &contents.data_objects {
            ctime = ctime.min(o.ctime);
            mtime = mtime.max(o.mtime);
        }

        let fixed: PosixDir = posix::fix_folder(contents);

        let mut conn = self.lock_conn();
        let txn: Transaction<'_> = conn.transaction().map_err(db_err)?;

        self.insert_children_tx(&txn, &dir, ctime, mtime, &fixed.data_objects, &fixed.subdirs)?;

        // Faux subdirectories add no remote depth: they are fully
        // populated at birth and have no matching project folder.
        for (faux_name, members) in &fixed.faux_subdirs {
            let faux_path: String = join_path(&dir.full_path, faux_name);
            self.create_empty_dir_tx(&txn, &dir.proj_id, "", ctime, mtime, &faux_path, true)?;
            for m in members {
                let kind: ObjKind = ObjKind::of_data_object(&m.id, m.symlink_path.as_deref());
                let inline: &str = m.symlink_path.as_deref().unwrap_or("");
                self.create_data_object_tx(
                    &txn, kind, &m.proj_id, &m.id, m.size, m.ctime, m.mtime, &faux_path,
                    &m.name, inline,
                )?;
            }
        }

        txn.execute(
            "UPDATE directories SET populated = 1, ctime = ?1, mtime = ?2 WHERE inode = ?3",
            params![ctime, mtime, dir.inode],
        )
        .map_err(db_err)?;
        txn.commit().map_err(db_err)
    }

    /// Insert the direct children of a directory: one row per data
    /// object, one empty unpopulated directory per remote subfolder.
    fn insert_children_tx(
        &self,
        txn: &Transaction<'_>,
        dir: &Dir,
        ctime: i64,
        mtime: i64,
        data_objects: &[DataObjectDescriptor],
        subdirs: &[String],
    ) -> Result<()> {
        for o in data_objects {
            let kind: ObjKind = ObjKind::of_data_object(&o.id, o.symlink_path.as_deref());
            let inline: &str = o.symlink_path.as_deref().unwrap_or("");
            self.create_data_object_tx(
                txn,
                kind,
                &o.proj_id,
                &o.id,
                o.size,
                o.ctime,
                o.mtime,
                &dir.full_path,
                &o.name,
                inline,
            )?;
        }

        for sub_name in subdirs {
            let sub_folder: String = join_path(&dir.proj_folder, sub_name);
            let sub_path: String = join_path(&dir.full_path, sub_name);
            self.create_empty_dir_tx(
                txn,
                &dir.proj_id,
                &sub_folder,
                ctime,
                mtime,
                &sub_path,
                false,
            )?;
        }
        Ok(())
    }

    /// List a directory, populating it first if needed.
    pub async fn readdir(
        &self,
        dir_path: &str,
        source: &dyn FolderSource,
    ) -> Result<(HashMap<String, File>, HashMap<String, Dir>)> {
        match self.directory_exists(dir_path, source).await? {
            DirStatus::Missing => Err(Error::NotFound),
            DirStatus::Unpopulated(dir) => {
                self.populate_directory(&dir, source).await?;
                self.directory_read_all(dir_path)
            }
            DirStatus::Populated(_) => self.directory_read_all(dir_path),
        }
    }

    // ========================================================================
    // Updates
    // ========================================================================

    /// Record the final size and modification time of a file.
    pub fn update_file(&self, inode: i64, size: i64, mtime: i64) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE data_objects SET size = ?1, mtime = ?2 WHERE inode = ?3",
            params![size, mtime, inode],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// A newly created file reached its closed state remotely: record the
    /// final size/mtime and drop the staging path, after which opens read
    /// through the remote path like any other file.
    pub fn finalize_new_file(&self, inode: i64, size: i64, mtime: i64) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "UPDATE data_objects SET size = ?1, mtime = ?2, inline_data = '' WHERE inode = ?3",
            params![size, mtime, inode],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // ========================================================================
    // Consistency checks (used by tests and the fatal-error path)
    // ========================================================================

    /// Verify the cross-table invariants. Returns `Corrupt` naming the
    /// first violation found.
    pub fn check_consistency(&self) -> Result<()> {
        let conn = self.lock_conn();

        let orphan_dirs: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM namespace
                 WHERE obj_type = ?1 AND inode NOT IN (SELECT inode FROM directories)",
                params![NS_DIR_TYPE],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if orphan_dirs > 0 {
            return Err(Error::Corrupt(format!(
                "{} namespace directories lack directory rows",
                orphan_dirs
            )));
        }

        let orphan_objs: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM namespace
                 WHERE obj_type = ?1 AND inode NOT IN (SELECT inode FROM data_objects)",
                params![NS_DATA_OBJ_TYPE],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if orphan_objs > 0 {
            return Err(Error::Corrupt(format!(
                "{} namespace objects lack data-object rows",
                orphan_objs
            )));
        }

        let bad_nlink: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM data_objects
                 WHERE nlink != (SELECT COUNT(*) FROM namespace
                                 WHERE namespace.inode = data_objects.inode)",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if bad_nlink > 0 {
            return Err(Error::Corrupt(format!(
                "{} data objects have an nlink that disagrees with the namespace",
                bad_nlink
            )));
        }

        Ok(())
    }
}
