//! 链路状态模型
//!
//! 一条有向链路（源键 → 目标键）的序号窗口状态。`LinkState` 是不可变值，
//! 所有状态迁移都返回新值，持久化和缓存由持久器负责。

use std::fmt;

use crate::infra::error::{Error, Result};

/// 链路所属侧
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkSide {
    /// 发送侧
    Outbox,
    /// 接收侧
    Inbox,
}

impl LinkSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkSide::Outbox => "outbox",
            LinkSide::Inbox => "inbox",
        }
    }
}

impl fmt::Display for LinkSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 有向链路键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    /// 源键（发送方路由器名称，即 sequence-key）
    pub source: String,
    /// 目标键
    pub destination: String,
}

impl LinkKey {
    pub fn new(source: &str, destination: &str) -> Self {
        Self {
            source: source.to_string(),
            destination: destination.to_string(),
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.destination)
    }
}

/// 窗口表名
///
/// 只允许 ASCII 字母、数字和下划线，且不能以数字开头，
/// 因此可以安全地拼接进 DDL 语句。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    /// 校验并创建表名
    ///
    /// # 错误
    /// 名称为空或包含非法字符时返回协议错误
    pub fn new(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && !raw.starts_with(|c: char| c.is_ascii_digit())
            && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(Error::Protocol(format!("非法窗口表名: '{}'", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 一条链路的两张物理窗口表
///
/// 在链路初始化时构建一次，之后随 `LinkState` 传递，不再按字符串拼接查找。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTables {
    pub first: TableName,
    pub second: TableName,
}

impl LinkTables {
    /// 根据链路侧和链路键生成表名
    ///
    /// 键中的非法字符替换为下划线，并追加原始键的哈希，避免不同键清洗后撞名。
    pub fn for_link(side: LinkSide, key: &LinkKey) -> Self {
        let base = format!(
            "{}_{}_{}_{:08x}",
            side.as_str(),
            sanitize(&key.source),
            sanitize(&key.destination),
            fnv1a(&format!("{}\u{0}{}", key.source, key.destination)),
        );
        Self {
            first: TableName(format!("{}_a", base)),
            second: TableName(format!("{}_b", base)),
        }
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(32)
        .collect()
}

fn fnv1a(input: &str) -> u32 {
    input.bytes().fold(0x811c_9dc5u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

/// 序号窗口（半开区间 `[lo, hi)`）及其物理表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionWindow {
    pub lo: i64,
    pub hi: i64,
    pub table: TableName,
}

impl SessionWindow {
    pub fn new(lo: i64, hi: i64, table: TableName) -> Self {
        Self { lo, hi, table }
    }

    pub fn contains(&self, seq: i64) -> bool {
        seq >= self.lo && seq < self.hi
    }

    pub fn width(&self) -> i64 {
        self.hi - self.lo
    }
}

/// 链路状态
///
/// * `epoch` 为 0 表示未初始化，1 为第一个有效 epoch
/// * `head` 当前活动窗口，`tail` 上一个窗口（排空后复用为下一个 head）
/// * 初始化后满足 `tail.hi == head.lo` 且两窗口宽度相等
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    pub epoch: i64,
    pub announced: bool,
    pub head: SessionWindow,
    pub tail: SessionWindow,
}

impl LinkState {
    /// 未初始化状态
    pub fn uninitialized() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.epoch > 0
    }

    /// 初始化：epoch 1，tail 为 `[0, size)`，head 为 `[size, 2·size)`
    pub fn initialize(head_table: &TableName, tail_table: &TableName, epoch_size: i64) -> Self {
        Self {
            epoch: 1,
            announced: false,
            head: SessionWindow::new(epoch_size, 2 * epoch_size, head_table.clone()),
            tail: SessionWindow::new(0, epoch_size, tail_table.clone()),
        }
    }

    /// 按接收侧收到的边界初始化
    pub fn initialize_with_bounds(
        tables: &LinkTables,
        head_lo: i64,
        head_hi: i64,
        tail_lo: i64,
        tail_hi: i64,
    ) -> Self {
        Self {
            epoch: 1,
            announced: false,
            head: SessionWindow::new(head_lo, head_hi, tables.first.clone()),
            tail: SessionWindow::new(tail_lo, tail_hi, tables.second.clone()),
        }
    }

    /// 推进到下一个 epoch
    ///
    /// 旧 tail 的表成为新 head，区间从旧 head 的上界延伸 `epoch_size`；
    /// 旧 head 整体成为新 tail。新 epoch 尚未通知对端。
    pub fn advance(&self, epoch_size: i64) -> Self {
        Self {
            epoch: self.epoch + 1,
            announced: false,
            head: SessionWindow::new(
                self.head.hi,
                self.head.hi + epoch_size,
                self.tail.table.clone(),
            ),
            tail: self.head.clone(),
        }
    }

    /// 标记已通知对端
    pub fn announce(&self) -> Self {
        Self {
            announced: true,
            ..self.clone()
        }
    }

    /// 缓存是否落后于给定序号（序号已超出缓存的 head 上界）
    pub fn is_stale(&self, seq: i64) -> bool {
        seq >= self.head.hi
    }

    /// 序号是否属于已退役的窗口
    pub fn is_retired(&self, seq: i64) -> bool {
        self.is_initialized() && seq < self.tail.lo
    }

    /// 窗口是否已超过 3/4 满，需要唤醒清理循环
    pub fn should_advance(&self, seq: i64) -> bool {
        if !self.is_initialized() {
            return false;
        }
        let size = self.head.width();
        seq >= self.head.lo + size / 2 + size / 4
    }

    /// 覆盖该序号的窗口
    pub fn window_for(&self, seq: i64) -> Option<&SessionWindow> {
        if !self.is_initialized() {
            return None;
        }
        if self.head.contains(seq) {
            Some(&self.head)
        } else if self.tail.contains(seq) {
            Some(&self.tail)
        } else {
            None
        }
    }

    /// 是否比另一个状态新
    ///
    /// epoch 更大为新；同一 epoch 下只有"已通知"能覆盖"未通知"
    pub fn supersedes(&self, other: &LinkState) -> bool {
        self.epoch > other.epoch
            || (self.epoch == other.epoch && self.announced && !other.announced)
    }
}
