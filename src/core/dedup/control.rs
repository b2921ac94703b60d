//! 控制协议
//!
//! 链路上的控制消息（Initialize、Advance、Plug）和普通消息走同一条链路，
//! 仅靠头部区分。所有整数字段都是十进制文本，缺失或无法解析的必填字段
//! 属于不可重试的协议错误。

use super::link_state::LinkState;
use crate::core::message::types::RouterMessage;
use crate::infra::error::{Error, Result};

pub const SEQUENCE_NUMBER: &str = "sequence-number";
pub const SEQUENCE_KEY: &str = "sequence-key";
pub const PLUG: &str = "plug";

pub const INITIALIZE: &str = "initialize";
pub const HEAD_LO: &str = "head-lo";
pub const HEAD_HI: &str = "head-hi";
pub const TAIL_LO: &str = "tail-lo";
pub const TAIL_HI: &str = "tail-hi";

pub const ADVANCE: &str = "advance";
pub const ADVANCE_EPOCH: &str = "advance-epoch";
pub const ADVANCE_HEAD_LO: &str = "advance-head-lo";
pub const ADVANCE_HEAD_HI: &str = "advance-head-hi";

/// 控制消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// 链路初始化，携带初始 head/tail 边界
    Initialize {
        head_lo: i64,
        head_hi: i64,
        tail_lo: i64,
        tail_hi: i64,
    },
    /// epoch 推进，携带新 head 边界
    Advance { epoch: i64, head_lo: i64, head_hi: i64 },
}

/// 去重接口上收到的消息分类
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    /// 没有 sequence-key，不参与去重
    Unsequenced,
    /// 控制消息
    Control { source: String, control: ControlMessage },
    /// 填补空洞的占位消息，不转发
    Plug { source: String, seq: i64 },
    /// 打过序号的业务消息
    Stamped { source: String, seq: i64 },
}

/// 对消息分类
///
/// # 错误
/// 链路消息缺少必填头部或数值无法解析时返回协议错误
pub fn classify(message: &RouterMessage) -> Result<LinkMessage> {
    let source = match message.header(SEQUENCE_KEY) {
        Some(source) => source.to_string(),
        None => return Ok(LinkMessage::Unsequenced),
    };

    if message.has_header(INITIALIZE) {
        let control = ControlMessage::Initialize {
            head_lo: required_i64(message, HEAD_LO)?,
            head_hi: required_i64(message, HEAD_HI)?,
            tail_lo: required_i64(message, TAIL_LO)?,
            tail_hi: required_i64(message, TAIL_HI)?,
        };
        return Ok(LinkMessage::Control { source, control });
    }

    if message.has_header(ADVANCE) {
        let control = ControlMessage::Advance {
            epoch: required_i64(message, ADVANCE_EPOCH)?,
            head_lo: required_i64(message, ADVANCE_HEAD_LO)?,
            head_hi: required_i64(message, ADVANCE_HEAD_HI)?,
        };
        return Ok(LinkMessage::Control { source, control });
    }

    let seq = required_i64(message, SEQUENCE_NUMBER)?;
    if message.has_header(PLUG) {
        Ok(LinkMessage::Plug { source, seq })
    } else {
        Ok(LinkMessage::Stamped { source, seq })
    }
}

fn required_i64(message: &RouterMessage, header: &str) -> Result<i64> {
    let raw = message.header(header).ok_or_else(|| {
        Error::Protocol(format!("消息 {} 缺少必填头部 '{}'", message.id, header))
    })?;
    raw.trim().parse::<i64>().map_err(|_| {
        Error::Protocol(format!(
            "消息 {} 的头部 '{}' 不是整数: '{}'",
            message.id, header, raw
        ))
    })
}

/// 给出站消息打上序号
pub fn stamp(message: &mut RouterMessage, seq: i64, source_key: &str) {
    message
        .headers
        .insert(SEQUENCE_NUMBER.to_string(), seq.to_string());
    message
        .headers
        .insert(SEQUENCE_KEY.to_string(), source_key.to_string());
}

/// 是否为链路协议自身的消息（Plug、Initialize 或 Advance）
///
/// 这类消息只在链路内有意义，不能进入路由管道
pub fn is_link_control(message: &RouterMessage) -> bool {
    [PLUG, INITIALIZE, ADVANCE]
        .iter()
        .any(|header| message.has_header(header))
}

/// 去掉上一跳的链路头部
pub fn strip(message: &mut RouterMessage) {
    for header in [SEQUENCE_NUMBER, SEQUENCE_KEY, PLUG] {
        message.headers.remove(header);
    }
}

/// 构建 Initialize 控制消息
pub fn initialize_message(source_key: &str, state: &LinkState) -> RouterMessage {
    RouterMessage::new(Vec::new())
        .with_header(SEQUENCE_KEY, source_key)
        .with_header(INITIALIZE, "true")
        .with_header(HEAD_LO, state.head.lo)
        .with_header(HEAD_HI, state.head.hi)
        .with_header(TAIL_LO, state.tail.lo)
        .with_header(TAIL_HI, state.tail.hi)
}

/// 构建 Advance 控制消息
pub fn advance_message(source_key: &str, state: &LinkState) -> RouterMessage {
    RouterMessage::new(Vec::new())
        .with_header(SEQUENCE_KEY, source_key)
        .with_header(ADVANCE, "true")
        .with_header(ADVANCE_EPOCH, state.epoch)
        .with_header(ADVANCE_HEAD_LO, state.head.lo)
        .with_header(ADVANCE_HEAD_HI, state.head.hi)
}

/// 当前 epoch 的通知消息：epoch 1 为 Initialize，之后为 Advance
pub fn announce_message(source_key: &str, state: &LinkState) -> RouterMessage {
    if state.epoch <= 1 {
        initialize_message(source_key, state)
    } else {
        advance_message(source_key, state)
    }
}

/// 构建 Plug 占位消息
pub fn plug_message(source_key: &str, seq: i64) -> RouterMessage {
    RouterMessage::new(Vec::new())
        .with_header(SEQUENCE_NUMBER, seq)
        .with_header(SEQUENCE_KEY, source_key)
        .with_header(PLUG, "true")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dedup::link_state::TableName;

    fn state() -> LinkState {
        let head = TableName::new("Head").unwrap();
        let tail = TableName::new("Tail").unwrap();
        LinkState::initialize(&head, &tail, 10)
    }

    #[test]
    fn test_announce_initialize_then_advance() {
        let initial = state();
        let message = announce_message("router-a", &initial);
        assert_eq!(
            classify(&message).unwrap(),
            LinkMessage::Control {
                source: "router-a".to_string(),
                control: ControlMessage::Initialize {
                    head_lo: 10,
                    head_hi: 20,
                    tail_lo: 0,
                    tail_hi: 10,
                },
            }
        );

        let advanced = initial.advance(10);
        let message = announce_message("router-a", &advanced);
        assert_eq!(
            classify(&message).unwrap(),
            LinkMessage::Control {
                source: "router-a".to_string(),
                control: ControlMessage::Advance {
                    epoch: 2,
                    head_lo: 20,
                    head_hi: 30,
                },
            }
        );
    }

    #[test]
    fn test_stamped_and_plug_messages() {
        let mut message = RouterMessage::with_id("m1", b"hi".to_vec());
        assert_eq!(classify(&message).unwrap(), LinkMessage::Unsequenced);

        stamp(&mut message, 7, "router-a");
        assert_eq!(
            classify(&message).unwrap(),
            LinkMessage::Stamped { source: "router-a".to_string(), seq: 7 }
        );

        let plug = plug_message("router-a", 3);
        assert_eq!(
            classify(&plug).unwrap(),
            LinkMessage::Plug { source: "router-a".to_string(), seq: 3 }
        );

        assert!(!is_link_control(&message));
        assert!(is_link_control(&plug));
        assert!(is_link_control(&announce_message("router-a", &state())));
        assert!(is_link_control(&announce_message("router-a", &state().advance(10))));

        strip(&mut message);
        assert_eq!(classify(&message).unwrap(), LinkMessage::Unsequenced);
        assert_eq!(message.body, b"hi".to_vec());
    }

    #[test]
    fn test_malformed_headers_are_protocol_errors() {
        let missing_seq = RouterMessage::with_id("m1", Vec::new()).with_header(SEQUENCE_KEY, "a");
        assert!(matches!(classify(&missing_seq), Err(Error::Protocol(_))));

        let bad_seq = RouterMessage::with_id("m2", Vec::new())
            .with_header(SEQUENCE_KEY, "a")
            .with_header(SEQUENCE_NUMBER, "seven");
        assert!(matches!(classify(&bad_seq), Err(Error::Protocol(_))));

        let partial_init = RouterMessage::with_id("m3", Vec::new())
            .with_header(SEQUENCE_KEY, "a")
            .with_header(INITIALIZE, "true")
            .with_header(HEAD_LO, "10");
        assert!(matches!(classify(&partial_init), Err(Error::Protocol(_))));
    }
}
