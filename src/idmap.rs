//! Persistent stable-identifier store
//!
//! Maps paths to inode numbers that survive remounts. Allocation bumps a
//! sealed high-water mark in the same transaction as the insert, so a number
//! is never handed out twice, even across crashes.

use crate::error::{StrataError, StrataResult};
use crate::sqlite::SqliteSettings;
use crate::workspace::RegionLock;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const DB_FILE: &str = "idmap.db";
pub const LOCK_FILE: &str = "idmap.lock";

const MARK_KEY: &str = "high_water_mark";

/// Store directory name for a filesystem
pub fn store_dir_name(fs_name: &str) -> String {
    format!("idmap.{}", fs_name)
}

#[derive(Debug, Clone)]
pub struct IdMapOptions {
    pub dir: PathBuf,
    /// Numbers below the floor are reserved for the consumer
    pub reserved_floor: u64,
    pub had_prior_crash: bool,
    /// Store lives on shared storage; every mutation takes `idmap.lock`
    pub high_availability: bool,
    pub sqlite: SqliteSettings,
}

fn seal(value: u64) -> String {
    let digest = Sha256::digest(format!("hwm:{}", value).as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn to_sql(value: u64) -> StrataResult<i64> {
    i64::try_from(value).map_err(|_| StrataError::Internal(format!("inode {} out of range", value)))
}

fn from_sql(value: i64) -> StrataResult<u64> {
    u64::try_from(value).map_err(|_| StrataError::IdentityStoreCorrupt(format!("negative inode {}", value)))
}

fn corrupt(reason: impl std::fmt::Display) -> StrataError {
    StrataError::IdentityStoreCorrupt(reason.to_string())
}

#[derive(Debug)]
pub struct IdMap {
    conn: Mutex<Connection>,
    dir: PathBuf,
    floor: u64,
    lock_path: Option<PathBuf>,
}

impl IdMap {
    /// Open or create the store; blocking
    pub fn open(options: IdMapOptions) -> StrataResult<Self> {
        std::fs::create_dir_all(&options.dir).map_err(|e| {
            StrataError::IdMapUnavailable(format!(
                "cannot create {}: {}",
                options.dir.display(),
                e
            ))
        })?;
        let lock_path = options
            .high_availability
            .then(|| options.dir.join(LOCK_FILE));
        let _region = match &lock_path {
            Some(path) => Some(RegionLock::lock_blocking(path)?),
            None => None,
        };

        let db_path = options.dir.join(DB_FILE);
        debug!("Opening stable identifier store {}", db_path.display());
        let conn = Connection::open(&db_path)?;
        options.sqlite.apply(&conn)?;

        let mut derived_from_rows = None;
        if options.had_prior_crash {
            match integrity_check(&conn) {
                Ok(()) => debug!("Identifier store passed integrity check"),
                Err(reason) if options.high_availability => {
                    let next = max_inode(&conn)
                        .map_err(|e| corrupt(format!("{}; recovery failed: {}", reason, e)))?;
                    warn!(
                        "Identifier store failed integrity check ({}), continuing from {}",
                        reason, next
                    );
                    derived_from_rows = Some(next);
                }
                Err(reason) => return Err(corrupt(reason)),
            }
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS inodes (
                inode INTEGER PRIMARY KEY,
                path TEXT UNIQUE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL,
                seal TEXT NOT NULL
            );",
        )?;

        let map = Self {
            conn: Mutex::new(conn),
            dir: options.dir,
            floor: options.reserved_floor,
            lock_path,
        };

        {
            let mut conn = map.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut mark = next_free(&tx, map.floor)?;
            if let Some(rows) = derived_from_rows {
                mark = mark.max(rows);
            }
            write_mark(&tx, mark)?;
            tx.commit()?;
            info!(
                "Stable identifier store at {} continues from {}",
                map.dir.display(),
                mark
            );
        }
        Ok(map)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_high_availability(&self) -> bool {
        self.lock_path.is_some()
    }

    /// Inode of `path`, allocating a fresh one on first sight
    pub fn get_or_allocate(&self, path: &str) -> StrataResult<u64> {
        let _region = self.region()?;
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(inode) = lookup_inode(&tx, path)? {
            return Ok(inode);
        }

        let inode = next_free(&tx, self.floor)?;
        tx.execute(
            "INSERT INTO inodes (inode, path) VALUES (?1, ?2)",
            params![to_sql(inode)?, path],
        )?;
        write_mark(&tx, inode + 1)?;
        tx.commit()?;
        Ok(inode)
    }

    pub fn path_of(&self, inode: u64) -> StrataResult<Option<String>> {
        let conn = self.connection()?;
        let path = conn
            .query_row(
                "SELECT path FROM inodes WHERE inode = ?1",
                [to_sql(inode)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    pub fn inode_of(&self, path: &str) -> StrataResult<Option<u64>> {
        let conn = self.connection()?;
        lookup_inode(&conn, path)
    }

    /// Next number that will be allocated
    pub fn high_water_mark(&self) -> StrataResult<u64> {
        let conn = self.connection()?;
        Ok(read_mark(&conn)?.map(|(value, _)| value).unwrap_or(self.floor))
    }

    pub fn len(&self) -> StrataResult<u64> {
        let conn = self.connection()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM inodes", [], |row| row.get(0))?;
        from_sql(n)
    }

    pub fn is_empty(&self) -> StrataResult<bool> {
        Ok(self.len()? == 0)
    }

    fn connection(&self) -> StrataResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StrataError::Internal("identifier store mutex poisoned".to_string()))
    }

    fn region(&self) -> StrataResult<Option<RegionLock>> {
        match &self.lock_path {
            Some(path) => Ok(Some(RegionLock::lock_blocking(path)?)),
            None => Ok(None),
        }
    }
}

fn integrity_check(conn: &Connection) -> Result<(), String> {
    let result: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if result == "ok" {
        Ok(())
    } else {
        Err(result)
    }
}

/// One past the largest inode in use
fn max_inode(conn: &Connection) -> StrataResult<u64> {
    let max: Option<i64> = conn.query_row("SELECT MAX(inode) FROM inodes", [], |row| row.get(0))?;
    match max {
        Some(max) => Ok(from_sql(max)? + 1),
        None => Ok(0),
    }
}

fn lookup_inode(conn: &Connection, path: &str) -> StrataResult<Option<u64>> {
    let inode: Option<i64> = conn
        .query_row("SELECT inode FROM inodes WHERE path = ?1", [path], |row| row.get(0))
        .optional()?;
    inode.map(from_sql).transpose()
}

/// Persisted mark and whether its seal matches
fn read_mark(conn: &Connection) -> StrataResult<Option<(u64, bool)>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT value, seal FROM meta WHERE key = ?1",
            [MARK_KEY],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((value, stored)) => {
            let value = from_sql(value)?;
            Ok(Some((value, seal(value) == stored)))
        }
        None => Ok(None),
    }
}

fn write_mark(tx: &Transaction<'_>, value: u64) -> StrataResult<()> {
    tx.execute(
        "INSERT INTO meta (key, value, seal) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, seal = excluded.seal",
        params![MARK_KEY, to_sql(value)?, seal(value)],
    )?;
    Ok(())
}

/// Never below the floor, the sealed mark or any number in use
fn next_free(conn: &Connection, floor: u64) -> StrataResult<u64> {
    let in_use = max_inode(conn)?;
    let sealed = match read_mark(conn)? {
        Some((value, true)) => value,
        Some((value, false)) => {
            warn!(
                "High-water mark {} has a broken seal, deriving from stored inodes",
                value
            );
            0
        }
        None => 0,
    };
    Ok(floor.max(sealed).max(in_use))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(dir: &Path, floor: u64) -> IdMapOptions {
        IdMapOptions {
            dir: dir.join(store_dir_name("repo")),
            reserved_floor: floor,
            had_prior_crash: false,
            high_availability: false,
            sqlite: SqliteSettings::default(),
        }
    }

    #[test]
    fn seal_is_short_and_stable() {
        assert_eq!(seal(42).len(), 16);
        assert_eq!(seal(42), seal(42));
        assert_ne!(seal(42), seal(43));
    }

    #[test]
    fn allocation_starts_at_floor() {
        let temp = TempDir::new().unwrap();
        let map = IdMap::open(options(temp.path(), 256)).unwrap();
        assert!(map.is_empty().unwrap());

        assert_eq!(map.get_or_allocate("/a").unwrap(), 256);
        assert_eq!(map.get_or_allocate("/b").unwrap(), 257);
        assert_eq!(map.get_or_allocate("/a").unwrap(), 256);
        assert_eq!(map.high_water_mark().unwrap(), 258);
        assert_eq!(map.path_of(257).unwrap().as_deref(), Some("/b"));
        assert_eq!(map.inode_of("/c").unwrap(), None);
        assert_eq!(map.len().unwrap(), 2);
    }

    #[test]
    fn mapping_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let first = {
            let map = IdMap::open(options(temp.path(), 100)).unwrap();
            map.get_or_allocate("/etc/passwd").unwrap()
        };

        let map = IdMap::open(options(temp.path(), 100)).unwrap();
        assert_eq!(map.inode_of("/etc/passwd").unwrap(), Some(first));
        assert_eq!(map.get_or_allocate("/new").unwrap(), first + 1);
    }

    #[test]
    fn broken_seal_after_crash_derives_from_rows() {
        let temp = TempDir::new().unwrap();
        let opts = options(temp.path(), 10);
        {
            let map = IdMap::open(opts.clone()).unwrap();
            for path in ["/x", "/y", "/z"] {
                map.get_or_allocate(path).unwrap();
            }
        }
        let conn = Connection::open(opts.dir.join(DB_FILE)).unwrap();
        conn.execute(
            "UPDATE meta SET value = 1, seal = 'forged' WHERE key = ?1",
            [MARK_KEY],
        )
        .unwrap();
        drop(conn);

        let map = IdMap::open(IdMapOptions {
            had_prior_crash: true,
            ..opts
        })
        .unwrap();
        assert_eq!(map.high_water_mark().unwrap(), 13);
        assert_eq!(map.get_or_allocate("/w").unwrap(), 13);
    }

    #[test]
    fn sealed_mark_above_rows_is_kept() {
        let temp = TempDir::new().unwrap();
        let opts = options(temp.path(), 0);
        {
            let map = IdMap::open(opts.clone()).unwrap();
            map.get_or_allocate("/only").unwrap();
        }
        let conn = Connection::open(opts.dir.join(DB_FILE)).unwrap();
        conn.execute("DELETE FROM inodes", []).unwrap();
        drop(conn);

        // The number handed to /only is never reused.
        let map = IdMap::open(opts).unwrap();
        assert_eq!(map.get_or_allocate("/other").unwrap(), 1);
    }

    #[test]
    fn corrupt_store_after_crash() {
        let temp = TempDir::new().unwrap();
        let opts = options(temp.path(), 0);
        std::fs::create_dir_all(&opts.dir).unwrap();
        std::fs::write(opts.dir.join(DB_FILE), vec![0x5a; 4096]).unwrap();

        let err = IdMap::open(IdMapOptions {
            had_prior_crash: true,
            ..opts.clone()
        })
        .unwrap_err();
        assert!(matches!(err, StrataError::IdentityStoreCorrupt(_)));

        let err = IdMap::open(IdMapOptions {
            had_prior_crash: true,
            high_availability: true,
            ..opts
        })
        .unwrap_err();
        assert!(matches!(err, StrataError::IdentityStoreCorrupt(_)));
    }

    #[test]
    fn high_availability_uses_lock_file() {
        let temp = TempDir::new().unwrap();
        let opts = IdMapOptions {
            high_availability: true,
            ..options(temp.path(), 0)
        };
        let map = IdMap::open(opts.clone()).unwrap();
        assert!(map.is_high_availability());
        assert_eq!(map.get_or_allocate("/shared").unwrap(), 0);
        assert!(opts.dir.join(LOCK_FILE).exists());
    }
}
