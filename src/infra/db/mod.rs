//! 数据库模块
//!
//! 本模块提供了 SQLite 数据库操作接口，使用 sqlx 实现。
//!
//! # 功能
//! 1. 链路状态表（每条有向链路每侧一行）
//! 2. 链路序号表（出站链路的持久化计数器）
//!
//! 窗口表按链路动态创建，见 `core::dedup::window`。
//!
//! # 使用示例
//! ```rust,ignore
//! let db = Database::new("data/clawrouter.db").await?;
//! let mut tx = db.begin().await?;
//! ```

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use super::error::{Error, Result};

/// 数据库连接池
pub type Pool = SqlitePool;

/// 数据库事务
pub type Tx = Transaction<'static, Sqlite>;

/// 等待写锁的超时时间
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// 数据库结构
#[derive(Clone, Debug)]
pub struct Database {
    /// 连接池
    pool: Pool,
}

impl Database {
    /// 创建数据库（简化版）
    ///
    /// # 参数说明
    /// * `path` - 数据库文件路径
    pub async fn new(path: &str) -> Result<Self> {
        Self::new_with_pool(path, 5).await
    }

    /// 创建数据库（完整版）
    ///
    /// # 参数说明
    /// * `path` - 数据库文件路径
    /// * `max_connections` - 最大连接数
    pub async fn new_with_pool(path: &str, max_connections: u32) -> Result<Self> {
        let db_path = PathBuf::from(path);
        debug!(path = %db_path.display(), "创建数据库连接");

        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "数据库连接成功");

        Ok(Self { pool })
    }

    /// 运行数据库迁移
    async fn run_migrations(pool: &Pool) -> Result<()> {
        debug!("运行数据库迁移");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS link_state (
                side TEXT NOT NULL,
                source_key TEXT NOT NULL,
                destination_key TEXT NOT NULL,
                epoch INTEGER NOT NULL DEFAULT 0,
                announced INTEGER NOT NULL DEFAULT 0,
                head_lo INTEGER NOT NULL DEFAULT 0,
                head_hi INTEGER NOT NULL DEFAULT 0,
                head_table TEXT NOT NULL DEFAULT '',
                tail_lo INTEGER NOT NULL DEFAULT 0,
                tail_hi INTEGER NOT NULL DEFAULT 0,
                tail_table TEXT NOT NULL DEFAULT '',
                updated_at INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (side, source_key, destination_key)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS link_sequence (
                source_key TEXT NOT NULL,
                destination_key TEXT NOT NULL,
                next_value INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (source_key, destination_key)
            )
            "#,
        )
        .execute(pool)
        .await?;

        info!("数据库迁移完成");
        Ok(())
    }

    /// 获取连接池
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// 开启事务
    pub async fn begin(&self) -> Result<Tx> {
        self.pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("开启事务失败: {}", e)))
    }

    /// 列出所有链路状态
    pub async fn list_link_states(&self) -> Result<Vec<LinkStateRecord>> {
        let records = sqlx::query_as::<_, LinkStateRecord>(
            "SELECT * FROM link_state ORDER BY side, source_key, destination_key",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 链路状态记录
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LinkStateRecord {
    /// 所属侧（outbox / inbox）
    pub side: String,
    /// 源键
    pub source_key: String,
    /// 目标键
    pub destination_key: String,
    /// 当前 epoch
    pub epoch: i64,
    /// 是否已通知对端
    pub announced: bool,
    pub head_lo: i64,
    pub head_hi: i64,
    pub head_table: String,
    pub tail_lo: i64,
    pub tail_hi: i64,
    pub tail_table: String,
    /// 更新时间
    pub updated_at: i64,
}
