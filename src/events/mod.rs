//! 事件模块
//!
//! - `types.rs`: 事件类型（单任务事件、全局事件）
//! - `bus.rs`: 按任务 ID 和全局两种范围订阅的事件总线

mod bus;
mod types;

pub use bus::*;
pub use types::*;
