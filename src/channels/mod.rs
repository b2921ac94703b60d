//! 渠道适配器模块
//!
//! 本模块定义了传输层与路由器之间的统一接口，并实现了进程内的内存传输。

pub mod traits;
pub mod memory;

pub use memory::{DeadLetter, MemoryEndpoint, MemoryHub, MemoryHubConfig};
pub use traits::{DeliveryAction, InboundHandler, MessageSender};
