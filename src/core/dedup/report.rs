//! 链路状态报告
//!
//! `status` 命令和 `RouterService::link_report` 使用，直接读取存储，
//! 不依赖内存中的持久器。

use serde::Serialize;

use super::store::record_to_state;
use super::window;
use crate::infra::db::Database;
use crate::infra::error::Result;

/// 一条链路的状态摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    pub side: String,
    pub source: String,
    pub destination: String,
    pub epoch: i64,
    pub announced: bool,
    pub head: (i64, i64),
    pub tail: (i64, i64),
    /// tail 窗口中缺失的序号数
    pub tail_holes: i64,
}

/// 汇总数据库中所有链路
pub async fn link_report(db: &Database) -> Result<Vec<LinkReport>> {
    let records = db.list_link_states().await?;
    let mut conn = db.pool().acquire().await?;
    let mut reports = Vec::with_capacity(records.len());

    for record in &records {
        let state = record_to_state(record)?;
        let tail_holes = if state.is_initialized() {
            let tail = &state.tail;
            tail.width() - window::count_in_range(&mut conn, &tail.table, tail.lo, tail.hi).await?
        } else {
            0
        };

        reports.push(LinkReport {
            side: record.side.clone(),
            source: record.source_key.clone(),
            destination: record.destination_key.clone(),
            epoch: state.epoch,
            announced: state.announced,
            head: (state.head.lo, state.head.hi),
            tail: (state.tail.lo, state.tail.hi),
            tail_holes,
        });
    }

    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dedup::inbox::InboxPersister;
    use crate::core::dedup::link_state::LinkKey;

    #[tokio::test]
    async fn test_report_counts_tail_holes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("report.db").to_str().unwrap())
            .await
            .unwrap();

        let pending = InboxPersister::new(LinkKey::new("c", "b"));
        pending.setup(&db).await.unwrap();

        let inbox = InboxPersister::new(LinkKey::new("a", "b"));
        inbox.setup(&db).await.unwrap();
        inbox.initialize(&db, 4, 8, 0, 4).await.unwrap();
        let mut tx = db.begin().await.unwrap();
        inbox.deduplicate(&mut tx, "m1", 1).await.unwrap();
        tx.commit().await.unwrap();

        let reports = link_report(&db).await.unwrap();
        assert_eq!(reports.len(), 2);

        let active = reports.iter().find(|r| r.source == "a").unwrap();
        assert_eq!(active.side, "inbox");
        assert_eq!(active.epoch, 1);
        assert_eq!(active.head, (4, 8));
        assert_eq!(active.tail_holes, 3);

        let idle = reports.iter().find(|r| r.source == "c").unwrap();
        assert_eq!(idle.epoch, 0);
        assert_eq!(idle.tail_holes, 0);
    }
}
