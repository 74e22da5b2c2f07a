//! Tests for the database module

use tempfile::TempDir;

use super::migration::{Migration, MigrationManager};
use super::*;

async fn setup_test_db(name: &str) -> (SqlitePool, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = DatabaseConfig::with_path(temp_dir.path().join(name));
    let pool = create_database_pool(&config).await.unwrap();
    (pool, temp_dir)
}

async fn table_names(pool: &SqlitePool) -> Vec<String> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(pool)
            .await
            .unwrap();
    rows.into_iter().map(|r| r.0).collect()
}

#[tokio::test]
async fn test_create_database_pool_in_missing_directory() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("dir").join("dlp.db");

    let pool = create_database_pool(&DatabaseConfig::with_path(db_path.clone()))
        .await
        .unwrap();

    let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
    assert_eq!(result.0, 1);
    assert!(db_path.exists());
    pool.close().await;
}

#[tokio::test]
async fn test_wal_mode_enabled() {
    let (pool, _temp_dir) = setup_test_db("wal.db").await;
    let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(result.0.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_tag_store_schema() {
    let (pool, _temp_dir) = setup_test_db("tags.db").await;
    let result = MigrationManager::for_tag_store(pool.clone()).migrate().await.unwrap();
    assert_eq!(result.applied, 1);
    assert_eq!(result.current_version, 1);

    let tables = table_names(&pool).await;
    assert!(tables.contains(&"files".to_string()));
    assert!(!tables.contains(&"events".to_string()));
}

#[tokio::test]
async fn test_event_log_schema() {
    let (pool, _temp_dir) = setup_test_db("events.db").await;
    MigrationManager::for_event_log(pool.clone()).migrate().await.unwrap();

    let tables = table_names(&pool).await;
    assert!(tables.contains(&"events".to_string()));
    assert!(!tables.contains(&"files".to_string()));
}

#[tokio::test]
async fn test_skip_already_applied_migration() {
    let (pool, _temp_dir) = setup_test_db("skip.db").await;
    let manager = MigrationManager::for_tag_store(pool);

    assert_eq!(manager.migrate().await.unwrap().applied, 1);
    let second = manager.migrate().await.unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(second.skipped, 1);
}

#[tokio::test]
async fn test_leading_comment_does_not_hide_statement() {
    let (pool, _temp_dir) = setup_test_db("comment.db").await;
    let mut manager = MigrationManager::new(pool.clone());
    manager.add_migration(Migration::new(
        1,
        "commented",
        "-- header comment\nCREATE TABLE commented (id INTEGER);",
    ));
    manager.migrate().await.unwrap();

    assert!(table_names(&pool).await.contains(&"commented".to_string()));
}

#[tokio::test]
async fn test_migration_atomicity_on_failure() {
    let (pool, _temp_dir) = setup_test_db("atomic.db").await;
    let mut manager = MigrationManager::new(pool.clone());
    manager.add_migration(Migration::new(
        1,
        "failing_migration",
        "CREATE TABLE valid_table (id INTEGER); INVALID SQL STATEMENT;",
    ));

    assert!(manager.migrate().await.is_err());
    assert!(!table_names(&pool).await.contains(&"valid_table".to_string()));
    assert_eq!(manager.current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn test_checksum_verification() {
    let (pool, _temp_dir) = setup_test_db("checksum.db").await;

    let mut first = MigrationManager::new(pool.clone());
    first.add_migration(Migration::new(1, "test", "CREATE TABLE t1 (id INTEGER)"));
    first.migrate().await.unwrap();

    let mut second = MigrationManager::new(pool);
    second.add_migration(Migration::new(1, "test", "CREATE TABLE t2 (id INTEGER)"));

    match second.migrate().await {
        Err(DlpError::Storage(StorageError::MigrationFailed { reason })) => {
            assert!(reason.contains("checksum mismatch"));
        }
        other => panic!("Expected checksum mismatch error, got {:?}", other.map(|r| r.applied)),
    }
}
