//! 链路去重模块
//!
//! 在一对有序的（源，目标）路由器之间实现恰好一次转发。传输层只保证至少一次投递，
//! 发送侧给每条消息分配链路内单调递增的序号，接收侧在转发事务内记录已见过的序号。
//! 已见序号保存在两张交替使用的窗口表中（head / tail），按 epoch 轮换，
//! 因此记录不会无限增长。
//!
//! # 模块结构
//! - `link_state` - 链路状态模型（纯值）
//! - `store` / `sequence` / `window` - 链路状态行、序号计数器、窗口表的持久化
//! - `control` - Initialize / Advance / Plug 控制消息编解码
//! - `outbox` / `inbox` - 发送侧与接收侧持久器
//! - `dispatcher` / `cleaner` - 分发循环与 epoch 推进循环
//! - `collections` - 按链路组织的持久器集合
//! - `hooks` - 与路由管道衔接的出站捕获和入站去重
//! - `report` - 链路状态报告

pub mod cleaner;
pub mod collections;
pub mod control;
pub mod dispatcher;
pub mod hooks;
pub mod inbox;
pub mod link_state;
pub mod outbox;
pub mod report;
pub mod sequence;
pub mod store;
pub mod window;

pub use collections::{InboxCollection, OutboxCollection, OutboxLink};
pub use hooks::{ForwardContext, InboundDeduplication, ReceiveOutcome};
pub use inbox::{DedupOutcome, InboxAdvance, InboxPersister};
pub use link_state::{LinkKey, LinkSide, LinkState, LinkTables, SessionWindow, TableName};
pub use outbox::{AdvanceOutcome, CapturedOperation, OutboxPersister, StoreOutcome};
pub use report::LinkReport;
