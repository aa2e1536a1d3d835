//! SQL operations over the `mfs` path tree.
//!
//! Every multi-step operation runs inside one transaction on the current
//! primary; dropping the transaction without commit is the rollback path.

use sqlx::{PgPool, Postgres, Transaction};

use crate::driver::DRIVER_NAME;
use crate::error::DriverError;
use crate::paths;

/// What a path currently is in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathKind {
    Missing,
    File,
    Directory,
}

pub(crate) async fn ensure_schema(pool: &PgPool) -> Result<(), DriverError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mds (
            key TEXT PRIMARY KEY,
            mdsfileinfo TEXT NOT NULL,
            deleted BOOLEAN NOT NULL DEFAULT FALSE
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mfs (
            path TEXT PRIMARY KEY,
            parent TEXT NOT NULL,
            dir BOOLEAN NOT NULL,
            size BIGINT NOT NULL,
            modtime TIMESTAMPTZ NOT NULL,
            key TEXT,
            owner TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS parent_idx ON mfs (parent)")
        .execute(pool)
        .await?;

    Ok(())
}

pub(crate) async fn check_file_type(
    tx: &mut Transaction<'_, Postgres>,
    path: &str,
) -> Result<PathKind, DriverError> {
    let row: Option<(bool,)> = sqlx::query_as("SELECT dir FROM mfs WHERE path=$1")
        .bind(path)
        .fetch_optional(&mut **tx)
        .await?;

    Ok(match row {
        None => PathKind::Missing,
        Some((false,)) => PathKind::File,
        Some((true,)) => PathKind::Directory,
    })
}

pub(crate) async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    path: &str,
    parent: &str,
    dir: bool,
    size: i64,
    key: Option<&str>,
    owner: Option<&str>,
) -> Result<(), DriverError> {
    sqlx::query(
        "INSERT INTO mfs (path, parent, dir, size, modtime, key, owner) VALUES ($1, $2, $3, $4, now(), $5, $6)",
    )
    .bind(path)
    .bind(parent)
    .bind(dir)
    .bind(size)
    .bind(key)
    .bind(owner)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Walk from the parent of `path` toward the root, materializing missing
/// directory rows. Stops at the first ancestor that already exists as a
/// directory; an ancestor that exists as a file fails the whole operation.
///
/// Concurrent writers below a shared parent race on these inserts, so the
/// directory insert tolerates an existing row.
pub(crate) async fn create_ancestors(
    tx: &mut Transaction<'_, Postgres>,
    path: &str,
    owner: Option<&str>,
) -> Result<(), DriverError> {
    let parent = paths::parent(path);

    let mut dir = paths::parent(&parent);
    let mut filename = paths::basename(&parent).to_string();
    while filename != "/" && filename != "." {
        let fullpath = paths::join(&dir, &filename);

        match check_file_type(tx, &fullpath).await? {
            PathKind::File => {
                return Err(DriverError::RewriteFileByDirectory(path.to_string()));
            }
            PathKind::Directory => break,
            PathKind::Missing => {
                sqlx::query(
                    "INSERT INTO mfs (path, parent, dir, size, modtime, key, owner) VALUES ($1, $2, true, 0, now(), NULL, $3) ON CONFLICT (path) DO NOTHING",
                )
                .bind(&fullpath)
                .bind(&dir)
                .bind(owner)
                .execute(&mut **tx)
                .await?;
            }
        }

        filename = paths::basename(&dir).to_string();
        dir = paths::parent(&dir);
    }

    Ok(())
}

/// Record a finished upload at `path`: replace any existing file row, insert
/// the new one and materialize its ancestors, all in one transaction.
pub(crate) async fn commit_file(
    pool: &PgPool,
    path: &str,
    size: i64,
    key: &str,
    owner: Option<&str>,
) -> Result<(), DriverError> {
    let mut tx = pool.begin().await?;

    match check_file_type(&mut tx, path).await? {
        PathKind::Directory => {
            return Err(DriverError::RewriteDirectoryByFile(path.to_string()));
        }
        PathKind::File => {
            sqlx::query("DELETE FROM mfs WHERE path=$1")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        PathKind::Missing => {}
    }

    insert_entry(&mut tx, path, &paths::parent(path), false, size, Some(key), owner).await?;
    create_ancestors(&mut tx, path, owner).await?;

    tx.commit().await?;
    Ok(())
}

/// Record the new total size of an appended file. The update must hit
/// exactly one row.
pub(crate) async fn update_size(pool: &PgPool, path: &str, size: i64) -> Result<(), DriverError> {
    let result = sqlx::query("UPDATE mfs SET size = $1 WHERE (path = $2)")
        .bind(size)
        .bind(path)
        .execute(pool)
        .await?;

    if result.rows_affected() != 1 {
        return Err(anyhow::anyhow!(
            "append size update affected {} rows for {}",
            result.rows_affected(),
            path
        )
        .into());
    }

    Ok(())
}

/// Resolve the blob key stored for a file path. Directories resolve to
/// not-found, same as missing rows.
pub(crate) async fn get_key(pool: &PgPool, path: &str) -> Result<String, DriverError> {
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT key FROM mfs WHERE path=$1")
        .bind(path)
        .fetch_optional(pool)
        .await?;

    match row {
        Some((Some(key),)) => Ok(key),
        // NOTE: no key also means that the path is a directory.
        Some((None,)) | None => Err(DriverError::path_not_found(path, DRIVER_NAME)),
    }
}

/// Fetch `(size, key)` for a path, or `None` when no row exists.
pub(crate) async fn lookup_size_and_key(
    pool: &PgPool,
    path: &str,
) -> Result<Option<(i64, Option<String>)>, DriverError> {
    let row: Option<(i64, Option<String>)> = sqlx::query_as("SELECT size, key FROM mfs WHERE path=$1")
        .bind(path)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// Move a file to a new path. Directories cannot be moved.
pub(crate) async fn move_file(
    pool: &PgPool,
    source_path: &str,
    dest_path: &str,
    owner: Option<&str>,
) -> Result<(), DriverError> {
    let mut tx = pool.begin().await?;

    // The source must exist and be a file.
    match check_file_type(&mut tx, source_path).await? {
        PathKind::Missing => return Err(DriverError::path_not_found(source_path, DRIVER_NAME)),
        PathKind::Directory => return Err(DriverError::DirectoryMove(source_path.to_string())),
        PathKind::File => {}
    }

    match check_file_type(&mut tx, dest_path).await? {
        PathKind::Missing => {
            let (size, key): (i64, Option<String>) =
                sqlx::query_as("DELETE FROM mfs WHERE path = $1 RETURNING size, key")
                    .bind(source_path)
                    .fetch_one(&mut *tx)
                    .await?;

            insert_entry(
                &mut tx,
                dest_path,
                &paths::parent(dest_path),
                false,
                size,
                key.as_deref(),
                owner,
            )
            .await?;
            create_ancestors(&mut tx, dest_path, owner).await?;
        }
        PathKind::File => {
            // Delete the source record and carry its payload over to the
            // already existing destination.
            sqlx::query(
                "WITH t AS (DELETE FROM mfs WHERE path = $1 RETURNING size, key)
                 UPDATE mfs SET (size, modtime, key) = (t.size, now(), t.key)
                 FROM t WHERE mfs.path = $2",
            )
            .bind(source_path)
            .bind(dest_path)
            .execute(&mut *tx)
            .await?;
        }
        PathKind::Directory => {
            return Err(DriverError::DirectoryMove(dest_path.to_string()));
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Delete `path` and, for directories, its whole subtree. Returns the blob
/// keys of every removed file so the caller can clean the KV store.
pub(crate) async fn delete_tree(pool: &PgPool, path: &str) -> Result<Vec<String>, DriverError> {
    let mut tx = pool.begin().await?;

    let mut deleted = Vec::new();
    let mut is_dir = true;

    if path != "/" {
        let row: Option<(Option<String>, bool)> =
            sqlx::query_as("DELETE FROM mfs WHERE mfs.path = $1 RETURNING mfs.key, mfs.dir")
                .bind(path)
                .fetch_optional(&mut *tx)
                .await?;

        match row {
            Some((key, dir)) => {
                if let Some(key) = key {
                    deleted.push(key);
                }
                is_dir = dir;
            }
            None => return Err(DriverError::path_not_found(path, DRIVER_NAME)),
        }
    }

    // Scan for children only if a directory is being deleted.
    if is_dir {
        let rows: Vec<(Option<String>,)> = sqlx::query_as(
            "WITH RECURSIVE t(path) AS (
                    SELECT path FROM mfs WHERE parent = $1
                UNION ALL
                    SELECT mfs.path FROM t, mfs WHERE mfs.parent = t.path
            )
            DELETE FROM mfs USING t WHERE mfs.path = t.path RETURNING mfs.key",
        )
        .bind(path)
        .fetch_all(&mut *tx)
        .await?;

        deleted.extend(rows.into_iter().filter_map(|(key,)| key));
    }

    tx.commit().await?;
    Ok(deleted)
}

/// Stat columns for a single path.
pub(crate) async fn stat(
    pool: &PgPool,
    path: &str,
) -> Result<Option<(bool, i64, chrono::DateTime<chrono::Utc>)>, DriverError> {
    let row = sqlx::query_as("SELECT dir, size, modtime FROM mfs WHERE path=$1")
        .bind(path)
        .fetch_optional(pool)
        .await?;

    Ok(row)
}

/// Direct children of `path`.
pub(crate) async fn list(pool: &PgPool, path: &str) -> Result<Vec<String>, DriverError> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT path FROM mfs WHERE parent=$1")
        .bind(path)
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|(path,)| path).collect())
}

/// Existence check that does not care about the entry type.
pub(crate) async fn exists(pool: &PgPool, path: &str) -> Result<bool, DriverError> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM mfs WHERE path=$1")
        .bind(path)
        .fetch_optional(pool)
        .await?;

    Ok(row.is_some())
}
