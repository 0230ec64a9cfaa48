//! 事件模块
//!
//! - `types.rs`: 推送给订阅者的事件类型
//! - `throttle.rs`: 推送节流，控制快照的发布频率
//! - `notifier.rs`: 一对多的快照推送（基于 watch 通道）

mod notifier;
mod throttle;
mod types;

pub use notifier::*;
pub use throttle::*;
pub use types::*;
