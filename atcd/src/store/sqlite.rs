use std::path::{Path, PathBuf};

use atc_shaping::{GroupId, Shaping, Target};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use super::{Cleanup, Group, Member, Result, Store, StoreError, StoreOptions};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    secret TEXT NOT NULL,
    profile BLOB,
    timeout INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS members (
    address TEXT PRIMARY KEY NOT NULL,
    group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS members_group_id ON members(group_id);
";

const SELECT_GROUP: &str = "SELECT id, secret, profile, timeout FROM groups";

/// Reader connections kept open between reads.
const MAX_IDLE_READERS: usize = 8;

/// Where the database lives. Every connection of a store opens the same location.
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    /// A named shared-cache database, alive while the writer connection is open.
    Memory(String),
}

impl Location {
    fn memory() -> Self {
        Self::Memory(format!("file:atcd-{:016x}?mode=memory&cache=shared", rand::random::<u64>()))
    }

    fn connect(&self) -> rusqlite::Result<Connection> {
        match self {
            Self::File(path) => Connection::open(path),
            Self::Memory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
        }
    }
}

/// A [`Store`] backed by SQLite.
///
/// Reads run concurrently, each on a pooled reader connection. Writes go through the single
/// writer connection and exclude every read and every other write, so id assignment and the
/// insert that follows it happen in one write section.
#[derive(Debug)]
pub struct SqliteStore {
    location: Location,
    /// Shared by reads, exclusive for writes.
    gate: RwLock<()>,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    options: StoreOptions,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::with_location(Location::File(path.as_ref().to_path_buf()), options)
    }

    /// A private database that lives as long as the store.
    pub fn in_memory(options: StoreOptions) -> Result<Self> {
        Self::with_location(Location::memory(), options)
    }

    fn with_location(location: Location, options: StoreOptions) -> Result<Self> {
        let writer = location.connect()?;
        writer.execute_batch(SCHEMA)?;

        Ok(Self {
            location,
            gate: RwLock::new(()),
            writer: Mutex::new(writer),
            readers: Mutex::new(Vec::new()),
            options,
        })
    }

    fn open_reader(&self) -> Result<Connection> {
        let conn = self.location.connect()?;
        conn.execute_batch("PRAGMA query_only = ON;")?;
        Ok(conn)
    }

    /// Runs `f` on a reader connection, concurrently with other reads.
    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let _shared = self.gate.read();

        let idle = self.readers.lock().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => self.open_reader()?,
        };

        let res = f(&conn);

        let mut readers = self.readers.lock();
        if readers.len() < MAX_IDLE_READERS {
            readers.push(conn);
        }

        res
    }

    /// Runs `f` on the writer connection, excluding all reads and other writes.
    fn write<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let _exclusive = self.gate.write();
        f(&mut self.writer.lock())
    }
}

/// The raw columns of a group row, decoded outside of the row callback.
struct GroupRow {
    id: GroupId,
    secret: String,
    profile: Option<Vec<u8>>,
    timeout: i64,
}

impl GroupRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            secret: row.get(1)?,
            profile: row.get(2)?,
            timeout: row.get(3)?,
        })
    }

    fn decode(self) -> Result<Group> {
        let shaping: Option<Shaping> =
            self.profile.as_deref().map(serde_json::from_slice).transpose()?;
        let timeout = DateTime::<Utc>::from_timestamp(self.timeout, 0).ok_or_else(|| {
            StoreError::Corrupt(format!("group {} has invalid timeout {}", self.id, self.timeout))
        })?;

        Ok(Group { id: self.id, secret: self.secret, shaping, timeout })
    }
}

fn parse_address(address: &str) -> Result<Target> {
    address.parse().map_err(|e| StoreError::Corrupt(format!("member {address:?}: {e}")))
}

fn query_group(conn: &Connection, id: GroupId) -> Result<Option<Group>> {
    conn.query_row(&format!("{SELECT_GROUP} WHERE id = ?1"), params![id], GroupRow::from_row)
        .optional()?
        .map(GroupRow::decode)
        .transpose()
}

fn upsert_group_in(conn: &Connection, group: &Group, options: &StoreOptions) -> Result<Group> {
    let profile = group.shaping.as_ref().map(serde_json::to_vec).transpose()?;
    let timeout = options.expiry().timestamp();

    let id = if group.is_persisted() {
        conn.execute(
            "INSERT INTO groups (id, secret, profile, timeout) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET profile = excluded.profile, timeout = excluded.timeout",
            params![group.id, group.secret, profile, timeout],
        )?;
        group.id
    } else {
        conn.execute(
            "INSERT INTO groups (secret, profile, timeout) VALUES (?1, ?2, ?3)",
            params![group.secret, profile, timeout],
        )?;
        conn.last_insert_rowid()
    };

    query_group(conn, id)?
        .ok_or_else(|| StoreError::Corrupt(format!("group {id} vanished after upsert")))
}

/// Replacing gives a moved member a fresh rowid, which keeps `members_of` in joining order.
fn upsert_member_in(conn: &Connection, member: &Member) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO members (address, group_id) VALUES (?1, ?2)",
        params![member.target.to_string(), member.group],
    )?;
    Ok(())
}

impl Store for SqliteStore {
    fn group(&self, id: GroupId) -> Result<Option<Group>> {
        self.read(|conn| query_group(conn, id))
    }

    fn groups(&self) -> Result<Vec<Group>> {
        let rows = self.read(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_GROUP} ORDER BY id"))?;
            let rows = stmt.query_map([], GroupRow::from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;
        rows.into_iter().map(GroupRow::decode).collect()
    }

    fn upsert_group(&self, group: &Group) -> Result<Group> {
        self.write(|conn| upsert_group_in(conn, group, &self.options))
    }

    fn insert_group_with_member(&self, group: &Group, target: &Target) -> Result<Group> {
        self.write(|conn| {
            let tx = conn.transaction()?;
            let group = upsert_group_in(&tx, group, &self.options)?;
            upsert_member_in(&tx, &Member::new(*target, group.id))?;
            tx.commit()?;
            Ok(group)
        })
    }

    fn delete_group(&self, id: GroupId) -> Result<()> {
        self.write(|conn| {
            conn.execute("DELETE FROM groups WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    fn member(&self, target: &Target) -> Result<Option<Member>> {
        let group: Option<GroupId> = self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT group_id FROM members WHERE address = ?1",
                    params![target.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        Ok(group.map(|group| Member::new(*target, group)))
    }

    fn upsert_member(&self, member: &Member) -> Result<()> {
        self.write(|conn| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM groups WHERE id = ?1)",
                params![member.group],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::UnknownGroup(member.group));
            }

            upsert_member_in(conn, member)
        })
    }

    fn delete_member(&self, target: &Target) -> Result<()> {
        self.write(|conn| {
            conn.execute("DELETE FROM members WHERE address = ?1", params![target.to_string()])?;
            Ok(())
        })
    }

    fn members_of(&self, id: GroupId) -> Result<Vec<Target>> {
        let addresses = self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT address FROM members WHERE group_id = ?1 ORDER BY rowid")?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;

        addresses.iter().map(|address| parse_address(address)).collect()
    }

    fn members(&self) -> Result<Vec<Member>> {
        let rows = self.read(|conn| {
            let mut stmt = conn.prepare("SELECT address, group_id FROM members ORDER BY rowid")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, GroupId>(1)?)))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;

        rows.iter()
            .map(|(address, group)| Ok(Member::new(parse_address(address)?, *group)))
            .collect()
    }

    fn cleanup(&self) -> Result<Cleanup> {
        self.write(|conn| {
            let empty = conn.execute(
                "DELETE FROM groups WHERE id NOT IN (SELECT DISTINCT group_id FROM members)",
                [],
            )?;
            let expired = conn
                .execute("DELETE FROM groups WHERE timeout < ?1", params![Utc::now().timestamp()])?;

            Ok(Cleanup { empty, expired })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use chrono::TimeDelta;

    use super::*;
    use crate::store::conformance;

    fn store() -> SqliteStore {
        SqliteStore::in_memory(StoreOptions::default()).unwrap()
    }

    #[test]
    fn ids_are_increasing_and_never_reused() {
        conformance::ids_are_increasing_and_never_reused(&store());
    }

    #[test]
    fn upsert_keeps_secret_and_refreshes_timeout() {
        conformance::upsert_keeps_secret_and_refreshes_timeout(&store());
    }

    #[test]
    fn membership_is_exclusive() {
        conformance::membership_is_exclusive(&store());
    }

    #[test]
    fn cleanup_removes_empty_groups() {
        conformance::cleanup_removes_empty_groups(&store());
    }

    #[test]
    fn cleanup_removes_expired_groups() {
        let options = StoreOptions::default().with_group_timeout(TimeDelta::seconds(-10));
        conformance::cleanup_removes_expired_groups(&SqliteStore::in_memory(options).unwrap());
    }

    #[test]
    fn deleting_a_group_cascades() {
        conformance::deleting_a_group_cascades(&store());
    }

    #[test]
    fn profile_is_stored_as_json() {
        let store = store();
        let mut group = store.upsert_group(&Group::new("s")).unwrap();
        group.shaping = Some(Shaping::default());
        store.upsert_group(&group).unwrap();

        let profile: Vec<u8> = store
            .read(|conn| {
                let sql = "SELECT profile FROM groups WHERE id = ?1";
                Ok(conn.query_row(sql, params![group.id], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(String::from_utf8(profile).unwrap(), r#"{"up":null,"down":null}"#);
    }

    #[test]
    fn reads_overlap() {
        let store = store();
        let id = store.upsert_group(&Group::new("s")).unwrap().id;
        let both_reading = Barrier::new(2);

        thread::scope(|scope| {
            let readers: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        store.read(|conn| {
                            // Returns only once the other reader holds its connection too.
                            both_reading.wait();
                            query_group(conn, id)
                        })
                    })
                })
                .collect();

            for reader in readers {
                assert_eq!(reader.join().unwrap().unwrap().map(|group| group.id), Some(id));
            }
        });

        assert_eq!(store.readers.lock().len(), 2);
    }

    #[test]
    fn readers_see_committed_writes() {
        let store = store();
        let target = "1.2.3.4".parse().unwrap();

        assert_eq!(store.member(&target).unwrap(), None);
        let group = store.insert_group_with_member(&Group::new("s"), &target).unwrap();
        assert_eq!(store.member(&target).unwrap(), Some(Member::new(target, group.id)));

        store.delete_group(group.id).unwrap();
        assert_eq!(store.member(&target).unwrap(), None);
    }

    #[test]
    fn reader_connections_cannot_write() {
        let store = store();
        let err = store
            .read(|conn| {
                conn.execute("INSERT INTO groups (secret, timeout) VALUES ('s', 0)", [])?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(store.groups().unwrap().is_empty());
    }

    #[test]
    fn reopening_keeps_data() {
        let path = std::env::temp_dir().join(format!("atcd-store-{}.db", rand::random::<u64>()));

        let id = {
            let store = SqliteStore::open(&path, StoreOptions::default()).unwrap();
            let target = "1.2.3.4".parse().unwrap();
            store.insert_group_with_member(&Group::new("s"), &target).unwrap().id
        };

        let store = SqliteStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.group(id).unwrap().map(|group| group.secret), Some("s".to_owned()));
        assert_eq!(store.members_of(id).unwrap().len(), 1);

        let _ = std::fs::remove_file(path);
    }
}
