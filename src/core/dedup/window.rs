//! 窗口表
//!
//! 每条链路两张物理表交替使用。每张表以 `seq` 为主键，
//! 并通过触发器约束只接受当前分配给它的区间 `[lo, hi)`。
//! 调用方在写入前先做显式区间检查，触发器只用来兜住并发竞争。

use sqlx::SqliteConnection;

use super::link_state::TableName;
use crate::infra::error::Result;

/// 宽度约束触发器抛出的错误消息
pub const WINDOW_VIOLATION: &str = "window_violation";

/// 窗口表中的一行
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WindowRow {
    pub seq: i64,
    pub message_id: String,
    /// JSON 编码的消息头部
    pub headers: String,
    pub body: Vec<u8>,
    pub dispatched: bool,
}

/// 行的分发状态摘要
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct WindowEntry {
    pub seq: i64,
    pub dispatched: bool,
}

/// 插入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// 主键冲突：该序号已存在
    DuplicateSequence,
    /// 宽度约束冲突：序号不在表当前的区间内
    OutsideWindow,
}

fn trigger_name(table: &TableName) -> String {
    format!("{}_window", table.as_str())
}

/// 创建窗口表
pub async fn create_table(conn: &mut SqliteConnection, table: &TableName) -> Result<()> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            seq INTEGER PRIMARY KEY,
            message_id TEXT NOT NULL,
            headers TEXT NOT NULL,
            body BLOB NOT NULL,
            dispatched INTEGER NOT NULL DEFAULT 0
        )
        "#,
        table
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// 设置表的宽度约束（替换已有约束）
pub async fn set_bounds(
    conn: &mut SqliteConnection,
    table: &TableName,
    lo: i64,
    hi: i64,
) -> Result<()> {
    drop_bounds(conn, table).await?;
    let sql = format!(
        "CREATE TRIGGER {trigger} BEFORE INSERT ON {table} FOR EACH ROW
         WHEN NEW.seq < {lo} OR NEW.seq >= {hi}
         BEGIN SELECT RAISE(ABORT, '{violation}'); END",
        trigger = trigger_name(table),
        table = table,
        lo = lo,
        hi = hi,
        violation = WINDOW_VIOLATION,
    );
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// 删除表的宽度约束
pub async fn drop_bounds(conn: &mut SqliteConnection, table: &TableName) -> Result<()> {
    let sql = format!("DROP TRIGGER IF EXISTS {}", trigger_name(table));
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// 清空表
pub async fn truncate(conn: &mut SqliteConnection, table: &TableName) -> Result<()> {
    let sql = format!("DELETE FROM {}", table);
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

/// 插入一行
///
/// 主键冲突和宽度约束冲突作为结果返回，其他数据库错误照常传播
pub async fn insert(
    conn: &mut SqliteConnection,
    table: &TableName,
    seq: i64,
    message_id: &str,
    headers: &str,
    body: &[u8],
    dispatched: bool,
) -> Result<InsertOutcome> {
    let sql = format!(
        "INSERT INTO {} (seq, message_id, headers, body, dispatched) VALUES (?, ?, ?, ?, ?)",
        table
    );
    let result = sqlx::query(&sql)
        .bind(seq)
        .bind(message_id)
        .bind(headers)
        .bind(body)
        .bind(dispatched)
        .execute(&mut *conn)
        .await;

    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(e) => classify_insert_error(e),
    }
}

fn classify_insert_error(err: sqlx::Error) -> Result<InsertOutcome> {
    if let sqlx::Error::Database(db_err) = &err {
        let message = db_err.message();
        if message.contains(WINDOW_VIOLATION) {
            return Ok(InsertOutcome::OutsideWindow);
        }
        if db_err.is_unique_violation() || message.contains("UNIQUE constraint failed") {
            return Ok(InsertOutcome::DuplicateSequence);
        }
    }
    Err(err.into())
}

/// 读取一行
pub async fn fetch(
    conn: &mut SqliteConnection,
    table: &TableName,
    seq: i64,
) -> Result<Option<WindowRow>> {
    let sql = format!(
        "SELECT seq, message_id, headers, body, dispatched FROM {} WHERE seq = ?",
        table
    );
    let row = sqlx::query_as::<_, WindowRow>(&sql)
        .bind(seq)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

/// 列出区间内已存在的行
pub async fn entries_in_range(
    conn: &mut SqliteConnection,
    table: &TableName,
    lo: i64,
    hi: i64,
) -> Result<Vec<WindowEntry>> {
    let sql = format!(
        "SELECT seq, dispatched FROM {} WHERE seq >= ? AND seq < ? ORDER BY seq",
        table
    );
    let entries = sqlx::query_as::<_, WindowEntry>(&sql)
        .bind(lo)
        .bind(hi)
        .fetch_all(&mut *conn)
        .await?;
    Ok(entries)
}

/// 统计区间内已存在的行数
pub async fn count_in_range(
    conn: &mut SqliteConnection,
    table: &TableName,
    lo: i64,
    hi: i64,
) -> Result<i64> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE seq >= ? AND seq < ?", table);
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(lo)
        .bind(hi)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// 表中最大的序号，空表返回 `None`
pub async fn max_seq(conn: &mut SqliteConnection, table: &TableName) -> Result<Option<i64>> {
    let sql = format!("SELECT MAX(seq) FROM {}", table);
    let max: Option<i64> = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
    Ok(max)
}

/// 标记已分发
pub async fn mark_dispatched(
    conn: &mut SqliteConnection,
    table: &TableName,
    seq: i64,
) -> Result<()> {
    let sql = format!("UPDATE {} SET dispatched = 1 WHERE seq = ?", table);
    sqlx::query(&sql).bind(seq).execute(&mut *conn).await?;
    Ok(())
}

/// 计算区间内缺失的序号（空洞）
///
/// `present` 必须按 `seq` 升序排列
pub fn missing_sequences(lo: i64, hi: i64, present: &[WindowEntry]) -> Vec<i64> {
    let mut missing = Vec::new();
    let mut iter = present.iter().map(|e| e.seq).peekable();
    for seq in lo..hi {
        while iter.peek().is_some_and(|p| *p < seq) {
            iter.next();
        }
        if iter.peek() != Some(&seq) {
            missing.push(seq);
        }
    }
    missing
}
