// src/db/mod.rs

//! Local installed-package database
//!
//! Plain CRUD over a single SQLite table. The transaction engine registers
//! and unregisters packages here; everything richer (queries, history,
//! repository metadata) lives outside this crate's scope.

use crate::error::Result;
use crate::packages::PackageRef;
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::{Path, PathBuf};

/// Database location relative to the target root.
pub const DB_RELATIVE_PATH: &str = "var/lib/quern/quern.db";

/// One row of the installed-package view.
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    pub name: String,
    pub epoch: u32,
    pub version: String,
    pub release: String,
    pub arch: String,
    pub install_size: i64,
    pub installed_at: i64,
}

/// Handle to the installed-package database of one target root.
pub struct PackageDb {
    conn: Connection,
    path: Option<PathBuf>,
}

impl PackageDb {
    /// Open (creating if needed) the database under the given target root.
    pub fn open(root: &Path) -> Result<Self> {
        let db_path = root.join(DB_RELATIVE_PATH);
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn,
            path: Some(db_path),
        })
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS packages (
                name TEXT NOT NULL,
                epoch INTEGER NOT NULL DEFAULT 0,
                version TEXT NOT NULL,
                release TEXT NOT NULL,
                arch TEXT NOT NULL,
                install_size INTEGER NOT NULL DEFAULT 0,
                installed_at INTEGER NOT NULL DEFAULT (strftime('%s','now')),
                PRIMARY KEY (name, arch)
            )",
            [],
        )?;
        Ok(())
    }

    /// Register a package, replacing any previous incarnation of the same
    /// (name, arch).
    pub fn add_package(&self, pkg: &PackageRef, install_size: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO packages
                 (name, epoch, version, release, arch, install_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                pkg.name,
                pkg.epoch,
                pkg.version,
                pkg.release,
                pkg.arch,
                install_size
            ],
        )?;
        Ok(())
    }

    /// Unregister a package. A no-op when the row is already gone, so
    /// erase and cleanup may race over the same terminal state.
    pub fn remove_package(&self, pkg: &PackageRef) -> Result<()> {
        self.conn.execute(
            "DELETE FROM packages WHERE name = ?1 AND arch = ?2",
            params![pkg.name, pkg.arch],
        )?;
        Ok(())
    }

    /// Look up one installed package by name.
    pub fn lookup(&self, name: &str) -> Result<Option<InstalledPackage>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, epoch, version, release, arch, install_size, installed_at
                 FROM packages WHERE name = ?1",
                params![name],
                Self::row_to_package,
            )
            .optional()?;
        Ok(row)
    }

    /// All installed packages, ordered by name.
    pub fn installed(&self) -> Result<Vec<InstalledPackage>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, epoch, version, release, arch, install_size, installed_at
             FROM packages ORDER BY name",
        )?;
        let rows = stmt.query_map([], Self::row_to_package)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Reopen the backing file, discarding any stale view. Used after an
    /// environment-cache import replaces the database underneath us.
    pub fn refresh(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            self.conn = Connection::open(path)?;
            Self::init_schema(&self.conn)?;
        }
        Ok(())
    }

    fn row_to_package(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstalledPackage> {
        Ok(InstalledPackage {
            name: row.get(0)?,
            epoch: row.get(1)?,
            version: row.get(2)?,
            release: row.get(3)?,
            arch: row.get(4)?,
            install_size: row.get(5)?,
            installed_at: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str, version: &str) -> PackageRef {
        PackageRef::resolved(name, 0, version, "1", "x86_64")
    }

    #[test]
    fn test_add_lookup_remove() {
        let db = PackageDb::in_memory().unwrap();
        db.add_package(&pkg("zlib", "1.3.1"), 1024).unwrap();

        let found = db.lookup("zlib").unwrap().unwrap();
        assert_eq!(found.version, "1.3.1");
        assert_eq!(found.install_size, 1024);

        db.remove_package(&pkg("zlib", "1.3.1")).unwrap();
        assert!(db.lookup("zlib").unwrap().is_none());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let db = PackageDb::in_memory().unwrap();
        // Erase and cleanup both end here; a second removal must not fail
        db.remove_package(&pkg("ghost", "1.0")).unwrap();
        db.remove_package(&pkg("ghost", "1.0")).unwrap();
    }

    #[test]
    fn test_replace_same_name() {
        let db = PackageDb::in_memory().unwrap();
        db.add_package(&pkg("bash", "5.1"), 100).unwrap();
        db.add_package(&pkg("bash", "5.2"), 200).unwrap();

        let found = db.lookup("bash").unwrap().unwrap();
        assert_eq!(found.version, "5.2");
        assert_eq!(db.installed().unwrap().len(), 1);
    }

    #[test]
    fn test_open_creates_parents() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = PackageDb::open(dir.path()).unwrap();
        db.add_package(&pkg("coreutils", "9.4"), 4096).unwrap();
        assert!(dir.path().join(DB_RELATIVE_PATH).exists());
    }

    #[test]
    fn test_refresh_rereads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let db = PackageDb::open(dir.path()).unwrap();
            db.add_package(&pkg("sed", "4.9"), 10).unwrap();
        }
        let mut db = PackageDb::open(dir.path()).unwrap();
        db.refresh().unwrap();
        assert!(db.lookup("sed").unwrap().is_some());
    }
}
