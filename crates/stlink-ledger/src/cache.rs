//! SQLite cache for block timestamps and historical prices
//!
//! Block timestamps and past daily prices never change, so entries are pure
//! memos with no invalidation. Every write is committed on its own, so the
//! cache survives both clean and abnormal exits. A damaged cache is never
//! fatal: the run falls back to a cold cache.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cache database wrapper
pub struct Cache {
    pool: SqlitePool,
    /// None for the in-memory fallback
    path: Option<PathBuf>,
}

/// Entry counts for `cache stats`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub block_timestamps: i64,
    pub prices: i64,
    pub location: String,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} block timestamps, {} prices ({})",
            self.block_timestamps, self.prices, self.location
        )
    }
}

/// Path of the staging file written before an atomic rename
pub fn staging_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl Cache {
    /// Open the cache at `path`, recovering from interrupted writes and corruption
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!(dir = %parent.display(), error = %e, "Cannot create cache directory, using cold cache");
            return Self::open_in_memory().await;
        }

        promote_staging(path).await;

        match Self::open_file(path).await {
            Ok(cache) => return Ok(cache),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cache file unusable, starting cold");
            }
        }

        let aside = with_suffix(path, ".corrupt");
        match std::fs::rename(path, &aside) {
            Ok(()) => {
                info!(moved_to = %aside.display(), "Moved damaged cache aside");
                match Self::open_file(path).await {
                    Ok(cache) => return Ok(cache),
                    Err(e) => warn!(error = %e, "Cannot recreate cache file"),
                }
            }
            Err(e) => warn!(error = %e, "Cannot move damaged cache aside"),
        }

        warn!("Using in-memory cache for this run");
        Self::open_in_memory().await
    }

    /// Cache that lives only for this process
    pub async fn open_in_memory() -> Result<Self> {
        // A single connection: every new connection to :memory: is a fresh database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory cache")?;

        let cache = Self { pool, path: None };
        cache.init_schema().await?;
        Ok(cache)
    }

    async fn open_file(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open cache database")?;

        if let Err(e) = check_integrity(&pool).await {
            pool.close().await;
            return Err(e);
        }

        let cache = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        cache.init_schema().await?;

        debug!(path = %path.display(), "Opened cache");
        Ok(cache)
    }

    /// Initialize database schema
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "
            -- Block number -> unix timestamp
            CREATE TABLE IF NOT EXISTS block_timestamps (
                block INTEGER PRIMARY KEY,
                timestamp INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "
            -- Historical LINK prices (YYYY-MM-DD -> USD)
            CREATE TABLE IF NOT EXISTS prices (
                date TEXT PRIMARY KEY,
                usd_price REAL NOT NULL,
                fetched_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "
            -- Cache metadata
            CREATE TABLE IF NOT EXISTS metadata (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Block Timestamps
    // =========================================================================

    /// Get a cached block timestamp
    pub async fn get_block_timestamp(&self, block: u64) -> Result<Option<u64>> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT timestamp FROM block_timestamps WHERE block = ?")
                .bind(block as i64)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(ts,)| ts as u64))
    }

    /// Store a block timestamp
    pub async fn put_block_timestamp(&self, block: u64, timestamp: u64) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO block_timestamps (block, timestamp) VALUES (?, ?)")
            .bind(block as i64)
            .bind(timestamp as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Prices
    // =========================================================================

    /// Get a cached USD price for a YYYY-MM-DD date
    pub async fn get_price(&self, date: &str) -> Result<Option<f64>> {
        let row: Option<(f64,)> = sqlx::query_as("SELECT usd_price FROM prices WHERE date = ?")
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(p,)| p))
    }

    /// Store a USD price
    pub async fn put_price(&self, date: &str, usd_price: f64) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO prices (date, usd_price) VALUES (?, ?)")
            .bind(date)
            .bind(usd_price)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    /// Get metadata value
    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(v,)| v))
    }

    /// Set metadata value
    pub async fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Entry counts
    pub async fn stats(&self) -> Result<CacheStats> {
        let block_timestamps: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM block_timestamps")
            .fetch_one(&self.pool)
            .await?;
        let prices: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM prices")
            .fetch_one(&self.pool)
            .await?;

        Ok(CacheStats {
            block_timestamps: block_timestamps.0,
            prices: prices.0,
            location: self
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "in-memory".to_string()),
        })
    }

    /// Rewrite the database compactly: vacuum into a staging file, then rename
    /// it over the live file. An interrupted run leaves the staging file,
    /// which the next `open` promotes.
    pub async fn compact(self) -> Result<Self> {
        let Some(path) = self.path.clone() else {
            return Ok(self);
        };
        let staging = staging_path(&path);
        if staging.exists() {
            std::fs::remove_file(&staging)
                .with_context(|| format!("Failed to remove stale {}", staging.display()))?;
        }

        sqlx::query("VACUUM INTO ?")
            .bind(staging.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await
            .context("Failed to write compacted cache")?;
        self.pool.close().await;

        std::fs::rename(&staging, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        Self::open_file(&path).await
    }

    /// Close the pool, flushing everything to disk
    pub async fn close(self) {
        self.pool.close().await;
    }
}

async fn check_integrity(pool: &SqlitePool) -> Result<()> {
    let (result,): (String,) = sqlx::query_as("PRAGMA integrity_check")
        .fetch_one(pool)
        .await
        .context("Integrity check failed to run")?;
    if result != "ok" {
        anyhow::bail!("Integrity check reported: {}", result);
    }
    Ok(())
}

/// Promote a staging file left by an interrupted write, or discard it if damaged
async fn promote_staging(path: &Path) {
    let staging = staging_path(path);
    if !staging.exists() {
        return;
    }

    let intact = match SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&staging)
                .journal_mode(SqliteJournalMode::Delete)
                .read_only(true),
        )
        .await
    {
        Ok(pool) => {
            let ok = check_integrity(&pool).await.is_ok();
            pool.close().await;
            ok
        }
        Err(_) => false,
    };

    if intact {
        match std::fs::rename(&staging, path) {
            Ok(()) => info!(path = %path.display(), "Promoted cache left by an interrupted write"),
            Err(e) => warn!(error = %e, "Cannot promote staged cache file"),
        }
    } else {
        warn!(path = %staging.display(), "Discarding damaged staged cache file");
        if let Err(e) = std::fs::remove_file(&staging) {
            warn!(error = %e, "Cannot remove staged cache file");
        }
    }
}
