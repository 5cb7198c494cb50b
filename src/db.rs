use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use std::path::PathBuf;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

pub async fn make_pool(database_path: &str) -> anyhow::Result<SqlitePool> {
    let db_path = PathBuf::from(database_path);

    // ensure parent directory exists; WAL uses -wal/-shm files
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let opts = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePool::connect_with(opts).await?;
    MIGRATOR.run(&pool).await?;
    merge_duplicate_categories(&pool).await?;
    Ok(pool)
}

/// Collapse legacy duplicate categories onto the lowest id per
/// `(normalized_name, path)`, repointing products first.
pub async fn merge_duplicate_categories(pool: &SqlitePool) -> anyhow::Result<u64> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE products
           SET category_id = (
               SELECT MIN(c2.id)
                 FROM categories c2
                 JOIN categories c1 ON c1.id = products.category_id
                WHERE c2.normalized_name = c1.normalized_name
                  AND c2.path = c1.path
           )
         WHERE category_id IS NOT NULL
        "#,
    )
    .execute(&mut *tx)
    .await?;

    let deleted = sqlx::query(
        r#"
        DELETE FROM categories
         WHERE id NOT IN (
               SELECT MIN(id)
                 FROM categories
                GROUP BY normalized_name, path
         )
        "#,
    )
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    if deleted > 0 {
        tracing::info!("merged {deleted} duplicate categories");
    }
    Ok(deleted)
}
