//! Relational record of file-version history (§3.4, §4.6).

pub mod lifecycle;

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;

/// Where a row's content lives, replacing the source's nullable `sha` /
/// `base_sha` columns with an explicit tagged variant (per the design notes
/// on moving from dynamic typing to tagged variants).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileState {
    Copy { sha: String, key_pair: Vec<u8> },
    Diff { sha: String, key_pair: Vec<u8>, base_sha: String, base_key_pair: Vec<u8> },
    Deleted,
}

impl FileState {
    pub fn sha(&self) -> Option<&str> {
        match self {
            FileState::Copy { sha, .. } | FileState::Diff { sha, .. } => Some(sha),
            FileState::Deleted => None,
        }
    }

    pub fn key_pair(&self) -> Option<&[u8]> {
        match self {
            FileState::Copy { key_pair, .. } | FileState::Diff { key_pair, .. } => Some(key_pair),
            FileState::Deleted => None,
        }
    }

    pub fn base_sha(&self) -> Option<&str> {
        match self {
            FileState::Diff { base_sha, .. } => Some(base_sha),
            _ => None,
        }
    }

    pub fn base_key_pair(&self) -> Option<&[u8]> {
        match self {
            FileState::Diff { base_key_pair, .. } => Some(base_key_pair),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub id: i64,
    pub abs_file_name: String,
    pub state: FileState,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub commit_timestamp: i64,
}

impl ManifestEntry {
    pub fn new_unsaved(
        abs_file_name: impl Into<String>,
        state: FileState,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> Self {
        ManifestEntry {
            id: 0,
            abs_file_name: abs_file_name.into(),
            state,
            uid,
            gid,
            mode,
            commit_timestamp: 0,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let sha: Option<String> = row.get("sha")?;
        let key_pair: Option<Vec<u8>> = row.get("key_pair")?;
        let base_sha: Option<String> = row.get("base_sha")?;
        let base_key_pair: Option<Vec<u8>> = row.get("base_key_pair")?;

        let state = match (sha, base_sha) {
            (None, _) => FileState::Deleted,
            (Some(sha), Some(base_sha)) => FileState::Diff {
                sha,
                key_pair: key_pair.unwrap_or_default(),
                base_sha,
                base_key_pair: base_key_pair.unwrap_or_default(),
            },
            (Some(sha), None) => FileState::Copy { sha, key_pair: key_pair.unwrap_or_default() },
        };

        Ok(ManifestEntry {
            id: row.get("id")?,
            abs_file_name: row.get("abs_file_name")?,
            state,
            uid: row.get::<_, i64>("uid")? as u32,
            gid: row.get::<_, i64>("gid")? as u32,
            mode: row.get::<_, i64>("mode")? as u32,
            commit_timestamp: row.get("commit_timestamp")?,
        })
    }
}

const SELECT_COLUMNS: &str = "
    manifest.id as id, manifest.abs_file_name as abs_file_name, manifest.sha as sha,
    manifest.uid as uid, manifest.gid as gid, manifest.mode as mode,
    manifest.key_pair as key_pair, manifest.commit_timestamp as commit_timestamp,
    base_shas.base_sha as base_sha, base_shas.base_key_pair as base_key_pair
";

pub struct Manifest {
    conn: Connection,
    pub changed: bool,
}

impl Manifest {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut manifest = Manifest { conn, changed: false };
        manifest.ensure_tables()?;
        Ok(manifest)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut manifest = Manifest { conn, changed: false };
        manifest.ensure_tables()?;
        Ok(manifest)
    }

    fn ensure_tables(&mut self) -> Result<()> {
        let existing: HashSet<String> = self
            .conn
            .prepare("select name from sqlite_master where type='table' and name not like 'sqlite_%'")?
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        if existing.contains("manifest") && existing.contains("base_shas") {
            return Ok(());
        }
        tracing::info!("this looks like a new manifest; initializing tables");
        self.conn.execute_batch(
            "
            create table if not exists manifest (
                id integer primary key autoincrement,
                abs_file_name text not null,
                sha text,
                uid integer,
                gid integer,
                mode integer,
                key_pair blob,
                commit_timestamp integer not null
            );
            create table if not exists base_shas (
                sha text not null unique,
                base_sha text not null,
                base_key_pair blob unique,
                foreign key(sha) references manifest(sha)
            );
            create index if not exists manifest_path_ts_idx on manifest(abs_file_name, commit_timestamp);
            create index if not exists manifest_sha_idx on manifest(sha);
            create unique index if not exists manifest_no_dup_idx
                on manifest(abs_file_name, sha, uid, gid, mode, commit_timestamp);
            ",
        )?;
        Ok(())
    }

    /// Most recent row for `abs_file_name` at or before `ts` (default now).
    pub fn get_entry(&self, abs_file_name: &str, ts: Option<i64>) -> Result<Option<ManifestEntry>> {
        let ts = match ts {
            Some(ts) => ts,
            None => self.current_ts()?,
        };
        let sql = format!(
            "select {SELECT_COLUMNS} from manifest left join base_shas on manifest.sha = base_shas.sha
             where abs_file_name = ?1 and commit_timestamp <= ?2
             order by commit_timestamp desc limit 1"
        );
        let entry = self
            .conn
            .query_row(&sql, params![abs_file_name, ts], ManifestEntry::from_row)
            .optional()?;
        Ok(entry)
    }

    pub fn get_entries_by_sha(&self, sha_prefix: &str) -> Result<Vec<ManifestEntry>> {
        let sql = format!(
            "select {SELECT_COLUMNS} from manifest left join base_shas on manifest.sha = base_shas.sha
             where manifest.sha like ?1 order by commit_timestamp asc"
        );
        let pattern = format!("{sha_prefix}%");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern], ManifestEntry::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// Paged history query grouped by path, newest-first within each group,
    /// groups ordered by path ascending. Empty limits yield empty results.
    pub fn search(
        &self,
        like: Option<&str>,
        before: Option<i64>,
        after: Option<i64>,
        file_limit: Option<u32>,
        history_limit: Option<u32>,
    ) -> Result<Vec<(String, Vec<ManifestEntry>)>> {
        if file_limit == Some(0) || history_limit == Some(0) {
            return Ok(Vec::new());
        }
        let before = before.unwrap_or(i64::MAX);
        let after = after.unwrap_or(0);
        let like_pattern = format!("%{}%", like.unwrap_or(""));

        let sql = format!(
            "select {SELECT_COLUMNS} from manifest left join base_shas on manifest.sha = base_shas.sha
             where abs_file_name like ?1 and commit_timestamp between ?2 and ?3
             order by abs_file_name asc, commit_timestamp desc"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![like_pattern, after, before], ManifestEntry::from_row)?;

        let mut grouped: Vec<(String, Vec<ManifestEntry>)> = Vec::new();
        for row in rows {
            let entry = row?;
            match grouped.last_mut() {
                Some((path, entries)) if *path == entry.abs_file_name => {
                    if history_limit.map_or(true, |limit| (entries.len() as u32) < limit) {
                        entries.push(entry);
                    }
                }
                _ => {
                    if let Some(limit) = file_limit {
                        if grouped.len() as u32 >= limit {
                            break;
                        }
                    }
                    let path = entry.abs_file_name.clone();
                    grouped.push((path, vec![entry]));
                }
            }
        }
        Ok(grouped)
    }

    /// Append a new row with `commit_timestamp = now` (or later, if needed to
    /// stay strictly after the last row written — see `next_commit_timestamp`).
    /// Upserts the `base_shas` adjunct row when the entry is a diff,
    /// otherwise removes any stale adjunct row for this SHA.
    pub fn insert_or_update(&mut self, entry: &ManifestEntry) -> Result<()> {
        let ts = self.next_commit_timestamp()?;
        let sha = entry.state.sha();
        let key_pair = entry.state.key_pair();
        self.conn.execute(
            "insert into manifest (abs_file_name, sha, uid, gid, mode, key_pair, commit_timestamp)
             values (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![entry.abs_file_name, sha, entry.uid, entry.gid, entry.mode, key_pair, ts],
        )?;

        if let (Some(sha), Some(base_sha), Some(base_key_pair)) =
            (sha, entry.state.base_sha(), entry.state.base_key_pair())
        {
            self.conn.execute(
                "insert or replace into base_shas (sha, base_sha, base_key_pair) values (?1, ?2, ?3)",
                params![sha, base_sha, base_key_pair],
            )?;
        } else if let Some(sha) = sha {
            self.conn.execute("delete from base_shas where sha = ?1", params![sha])?;
        }

        self.changed = true;
        Ok(())
    }

    /// Append a tombstone row. No-op (with a log) if the path isn't tracked.
    pub fn delete(&mut self, abs_file_name: &str) -> Result<()> {
        if self.get_entry(abs_file_name, None)?.is_none() {
            tracing::warn!(abs_file_name, "trying to delete untracked file; nothing written");
            return Ok(());
        }
        let ts = self.next_commit_timestamp()?;
        self.conn.execute(
            "insert into manifest (abs_file_name, sha, uid, gid, mode, key_pair, commit_timestamp)
             values (?1, null, null, null, null, null, ?2)",
            params![abs_file_name, ts],
        )?;
        self.changed = true;
        Ok(())
    }

    fn max_commit_timestamp(&self) -> Result<Option<i64>> {
        Ok(self.conn.query_row("select max(commit_timestamp) from manifest", [], |r| r.get(0))?)
    }

    /// `now`, bumped past the most recent row's timestamp if needed. Two
    /// rows for the same path, second-resolution clock, and a command that
    /// runs faster than a second (delete immediately followed by a
    /// recreate, as in S3) would otherwise collide on the per-row unique
    /// index; this keeps `commit_timestamp` strictly increasing across the
    /// whole manifest so that can't happen.
    fn next_commit_timestamp(&self) -> Result<i64> {
        let now = now_secs();
        Ok(match self.max_commit_timestamp()? {
            Some(last) if last >= now => last + 1,
            _ => now,
        })
    }

    /// "Now", as far as history queries with no explicit `ts` are
    /// concerned. Writes can run ahead of the wall clock (see
    /// `next_commit_timestamp`), so a bare `now_secs()` default could be
    /// older than a row just inserted in the same second and make it
    /// invisible to `get_entry(_, None)`/`files(None)` immediately after.
    /// Clamping to the manifest's own latest timestamp keeps "no ts given"
    /// meaning "as of the most recent write", matching `next_commit_timestamp`.
    fn current_ts(&self) -> Result<i64> {
        let now = now_secs();
        Ok(match self.max_commit_timestamp()? {
            Some(last) if last > now => last,
            _ => now,
        })
    }

    /// Paths whose most-recent row at or before `ts` has a non-null SHA.
    pub fn files(&self, ts: Option<i64>) -> Result<HashSet<String>> {
        let ts = match ts {
            Some(ts) => ts,
            None => self.current_ts()?,
        };
        let sql = "
            select abs_file_name, sha from manifest m
            where commit_timestamp = (
                select max(commit_timestamp) from manifest
                where abs_file_name = m.abs_file_name and commit_timestamp <= ?1
            )
            and commit_timestamp <= ?1
        ";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![ts], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut out = HashSet::new();
        for row in rows {
            let (path, sha) = row?;
            if sha.is_some() {
                out.insert(path);
            }
        }
        Ok(out)
    }

    /// Rows that would violate the no-exact-duplicate unique index; used by
    /// verify after the index is temporarily dropped. A later row with the
    /// same (path, sha, uid, gid, mode) as an earlier one is expected — a
    /// delete followed by an identical recreate does exactly that — so only
    /// rows that also share `commit_timestamp` count as duplicates here.
    pub fn find_duplicate_entries(&self) -> Result<Vec<ManifestEntry>> {
        let sql = format!(
            "select {SELECT_COLUMNS} from manifest left join base_shas on manifest.sha = base_shas.sha
             where (abs_file_name, sha, uid, gid, mode, commit_timestamp) in (
                 select abs_file_name, sha, uid, gid, mode, commit_timestamp from manifest
                 group by abs_file_name, sha, uid, gid, mode, commit_timestamp having count(*) > 1
             )
             order by abs_file_name, commit_timestamp"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], ManifestEntry::from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// SHAs that appear in the manifest with two or more distinct key pairs
    /// — a corruption signature, since every row sharing a SHA must share a
    /// key pair.
    pub fn find_shas_with_multiple_key_pairs(&self) -> Result<Vec<(String, Vec<Vec<u8>>)>> {
        let mut stmt = self.conn.prepare(
            "select sha, key_pair from manifest where sha is not null group by sha, key_pair",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut by_sha: std::collections::HashMap<String, Vec<Vec<u8>>> = std::collections::HashMap::new();
        for row in rows {
            let (sha, key_pair) = row?;
            by_sha.entry(sha).or_default().push(key_pair);
        }
        Ok(by_sha.into_iter().filter(|(_, kps)| kps.len() > 1).collect())
    }

    pub fn delete_entry(&mut self, entry: &ManifestEntry) -> Result<()> {
        self.conn.execute("delete from manifest where id = ?1", params![entry.id])?;
        self.changed = true;
        Ok(())
    }

    /// Drop, then later restore, the no-duplicate unique index so `verify`
    /// can surface violations that the constraint would otherwise prevent
    /// from ever being written (they can still arise from a corrupted file).
    pub fn drop_no_duplicate_index(&self) -> Result<()> {
        self.conn.execute("drop index if exists manifest_no_dup_idx", [])?;
        Ok(())
    }

    pub fn restore_no_duplicate_index(&self) -> Result<()> {
        self.conn.execute(
            "create unique index if not exists manifest_no_dup_idx
             on manifest(abs_file_name, sha, uid, gid, mode, commit_timestamp)",
            [],
        )?;
        Ok(())
    }
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy_entry(path: &str, sha: &str) -> ManifestEntry {
        ManifestEntry::new_unsaved(path, FileState::Copy { sha: sha.into(), key_pair: vec![1, 2, 3] }, 1000, 1000, 0o644)
    }

    #[test]
    fn insert_and_get_entry_round_trips() {
        let mut m = Manifest::open_in_memory().unwrap();
        m.insert_or_update(&copy_entry("/data/foo", "aaa")).unwrap();
        let got = m.get_entry("/data/foo", None).unwrap().unwrap();
        assert_eq!(got.state.sha(), Some("aaa"));
        assert!(m.changed);
    }

    #[test]
    fn history_is_monotone_and_get_entry_returns_newest() {
        let mut m = Manifest::open_in_memory().unwrap();
        m.insert_or_update(&copy_entry("/data/foo", "aaa")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        m.insert_or_update(&copy_entry("/data/foo", "bbb")).unwrap();
        let got = m.get_entry("/data/foo", None).unwrap().unwrap();
        assert_eq!(got.state.sha(), Some("bbb"));
    }

    #[test]
    fn tombstone_then_recreate_yields_three_rows_and_files_contains_path() {
        let mut m = Manifest::open_in_memory().unwrap();
        m.insert_or_update(&copy_entry("/data/foo", "aaa")).unwrap();
        m.delete("/data/foo").unwrap();
        m.insert_or_update(&copy_entry("/data/foo", "aaa")).unwrap();

        let sql_count: i64 = m
            .conn
            .query_row("select count(*) from manifest where abs_file_name = ?1", params!["/data/foo"], |r| r.get(0))
            .unwrap();
        assert_eq!(sql_count, 3);
        assert!(m.files(None).unwrap().contains("/data/foo"));
    }

    #[test]
    fn delete_on_untracked_path_is_a_noop() {
        let mut m = Manifest::open_in_memory().unwrap();
        m.delete("/data/never-seen").unwrap();
        assert!(!m.changed);
    }

    #[test]
    fn diff_entry_round_trips_base_sha_and_key_pair() {
        let mut m = Manifest::open_in_memory().unwrap();
        let entry = ManifestEntry::new_unsaved(
            "/data/foo",
            FileState::Diff {
                sha: "new".into(),
                key_pair: vec![9; 4],
                base_sha: "aaa".into(),
                base_key_pair: vec![8; 4],
            },
            1000,
            1000,
            0o644,
        );
        m.insert_or_update(&entry).unwrap();
        let got = m.get_entry("/data/foo", None).unwrap().unwrap();
        assert_eq!(got.state.base_sha(), Some("aaa"));
        assert_eq!(got.state.base_key_pair(), Some(&[8u8; 4][..]));
    }

    #[test]
    fn find_shas_with_multiple_key_pairs_detects_corruption() {
        let mut m = Manifest::open_in_memory().unwrap();
        m.insert_or_update(&ManifestEntry::new_unsaved(
            "/data/a",
            FileState::Copy { sha: "same".into(), key_pair: vec![1, 1, 1] },
            0, 0, 0,
        )).unwrap();
        m.insert_or_update(&ManifestEntry::new_unsaved(
            "/data/b",
            FileState::Copy { sha: "same".into(), key_pair: vec![2, 2, 2] },
            0, 0, 0,
        )).unwrap();
        let offenders = m.find_shas_with_multiple_key_pairs().unwrap();
        assert_eq!(offenders.len(), 1);
        assert_eq!(offenders[0].0, "same");
    }
}
