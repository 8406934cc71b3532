use super::models::{BackupRoot, FileRecord, FileRecordUpdate, NewFileRecord, UploadStatus};
use super::schema::backup_path::{self, dsl as backup_path_dsl};
use super::schema::file_info::{self, dsl as file_info_dsl};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use diesel::OptionalExtension;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::fs;
use std::path::PathBuf;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/index");

/// SQLite-backed file index that relies on Diesel for schema management.
/// Writes are single-row keyed by `abs_path`; `create_time` is stamped when
/// a row first appears and `update_time` on every write.
pub struct IndexDb {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl IndexDb {
    /// Create or open the index database at `path`. The schema is migrated
    /// to the latest version on startup.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create index db parent dir {}", parent.display()))?;
        }

        let database_url = path
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid index database path"))?;

        run_migrations(&database_url)?;

        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("Failed to build index database connection pool")?;

        Ok(Self { pool })
    }

    fn connection(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool
            .get()
            .context("Failed to get connection from index pool")
    }

    /// Insert or update a file record keyed by `abs_path`.
    pub fn upsert_file(&self, record: &NewFileRecord) -> Result<()> {
        let mut conn = self.connection()?;
        let now = Utc::now().timestamp();
        let row = NewFileRow::from_record(record, now);
        let changeset = FileChangeset {
            server_path: Some(record.server_path.clone()),
            size: Some(record.size),
            md5: Some(record.md5.clone()),
            upload_status: Some(record.upload_status.code()),
            update_time: now,
        };

        diesel::insert_into(file_info::table)
            .values(&row)
            .on_conflict(file_info::abs_path)
            .do_update()
            .set(changeset)
            .execute(&mut conn)
            .context("Failed to upsert file record")?;
        Ok(())
    }

    /// Partially update the row for `abs_path`. Returns whether a row matched.
    pub fn update_file(&self, update: FileRecordUpdate, abs_path: &str) -> Result<bool> {
        if update.is_empty() {
            return Ok(false);
        }
        let mut conn = self.connection()?;
        let changeset = FileChangeset {
            server_path: update.server_path,
            size: update.size,
            md5: update.md5,
            upload_status: update.upload_status.map(UploadStatus::code),
            update_time: Utc::now().timestamp(),
        };
        let affected =
            diesel::update(file_info_dsl::file_info.filter(file_info_dsl::abs_path.eq(abs_path)))
                .set(changeset)
                .execute(&mut conn)
                .context("Failed to update file record")?;
        Ok(affected > 0)
    }

    pub fn set_status(&self, abs_path: &str, status: UploadStatus) -> Result<bool> {
        self.update_file(FileRecordUpdate::status(status), abs_path)
    }

    pub fn file_by_abs_path(&self, abs_path: &str) -> Result<Option<FileRecord>> {
        let mut conn = self.connection()?;
        let row = file_info_dsl::file_info
            .filter(file_info_dsl::abs_path.eq(abs_path))
            .first::<FileRow>(&mut conn)
            .optional()
            .context("Failed to query file record by path")?;
        row.map(FileRecord::try_from).transpose()
    }

    pub fn files_by_status(&self, status: UploadStatus) -> Result<Vec<FileRecord>> {
        let mut conn = self.connection()?;
        let rows = file_info_dsl::file_info
            .filter(file_info_dsl::upload_status.eq(status.code()))
            .order(file_info_dsl::abs_path.asc())
            .load::<FileRow>(&mut conn)
            .context("Failed to query file records by status")?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Delete every file record whose path equals `prefix` or lives under it.
    pub fn delete_by_prefix(&self, prefix: &str) -> Result<usize> {
        let mut conn = self.connection()?;
        let like = format!("{}{}%", prefix, std::path::MAIN_SEPARATOR);
        let affected = diesel::delete(
            file_info_dsl::file_info.filter(
                file_info_dsl::abs_path
                    .eq(prefix)
                    .or(file_info_dsl::abs_path.like(like)),
            ),
        )
        .execute(&mut conn)
        .context("Failed to delete file records by prefix")?;
        Ok(affected)
    }

    pub fn count_files(&self) -> Result<i64> {
        let mut conn = self.connection()?;
        file_info_dsl::file_info
            .count()
            .get_result(&mut conn)
            .context("Failed to count file records")
    }

    /// Register a backup root. Returns `false` when it already exists.
    pub fn add_root(&self, abs_path: &str, is_dir: bool) -> Result<bool> {
        let mut conn = self.connection()?;
        let now = Utc::now().timestamp();
        let row = NewBackupRow {
            abs_path: abs_path.to_string(),
            is_dir,
            create_time: now,
            update_time: now,
        };
        let inserted = diesel::insert_into(backup_path::table)
            .values(&row)
            .on_conflict(backup_path::abs_path)
            .do_nothing()
            .execute(&mut conn)
            .context("Failed to insert backup root")?;
        Ok(inserted > 0)
    }

    pub fn all_roots(&self) -> Result<Vec<BackupRoot>> {
        let mut conn = self.connection()?;
        let rows = backup_path_dsl::backup_path
            .order(backup_path_dsl::id.asc())
            .load::<BackupRow>(&mut conn)
            .context("Failed to load backup roots")?;
        Ok(rows.into_iter().map(BackupRoot::from).collect())
    }

    /// Remove a backup root and cascade to the file records under it.
    pub fn remove_root(&self, abs_path: &str) -> Result<usize> {
        let mut conn = self.connection()?;
        diesel::delete(backup_path_dsl::backup_path.filter(backup_path_dsl::abs_path.eq(abs_path)))
            .execute(&mut conn)
            .context("Failed to delete backup root")?;
        drop(conn);
        self.delete_by_prefix(abs_path)
    }
}

fn run_migrations(database_url: &str) -> Result<()> {
    let mut conn = SqliteConnection::establish(database_url)
        .with_context(|| format!("Failed to open index database at {}", database_url))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("Failed to run index database migrations: {err}"))?;
    Ok(())
}

#[derive(Queryable)]
struct FileRow {
    id: i64,
    abs_path: String,
    server_path: String,
    size: i64,
    md5: String,
    upload_status: i32,
    create_time: i64,
    update_time: i64,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = anyhow::Error;

    fn try_from(row: FileRow) -> Result<Self> {
        let upload_status = UploadStatus::from_code(row.upload_status)
            .ok_or_else(|| anyhow!("Unknown upload status value {}", row.upload_status))?;
        Ok(FileRecord {
            id: row.id,
            abs_path: row.abs_path,
            server_path: row.server_path,
            size: row.size,
            md5: row.md5,
            upload_status,
            create_time: row.create_time,
            update_time: row.update_time,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = file_info)]
struct NewFileRow {
    abs_path: String,
    server_path: String,
    size: i64,
    md5: String,
    upload_status: i32,
    create_time: i64,
    update_time: i64,
}

impl NewFileRow {
    fn from_record(record: &NewFileRecord, now: i64) -> Self {
        Self {
            abs_path: record.abs_path.clone(),
            server_path: record.server_path.clone(),
            size: record.size,
            md5: record.md5.clone(),
            upload_status: record.upload_status.code(),
            create_time: now,
            update_time: now,
        }
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = file_info)]
struct FileChangeset {
    server_path: Option<String>,
    size: Option<i64>,
    md5: Option<String>,
    upload_status: Option<i32>,
    update_time: i64,
}

#[derive(Queryable)]
struct BackupRow {
    id: i64,
    abs_path: String,
    is_dir: bool,
    create_time: i64,
    update_time: i64,
}

impl From<BackupRow> for BackupRoot {
    fn from(row: BackupRow) -> Self {
        Self {
            id: row.id,
            abs_path: row.abs_path,
            is_dir: row.is_dir,
            create_time: row.create_time,
            update_time: row.update_time,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = backup_path)]
struct NewBackupRow {
    abs_path: String,
    is_dir: bool,
    create_time: i64,
    update_time: i64,
}
