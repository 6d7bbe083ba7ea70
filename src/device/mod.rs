//! 设备门面
//!
//! [`Hand`] / [`Finger`] / [`Joint`] 三级视图把对象表映射到协议处理器：
//! 门面只负责计算 `(index, sub_index, 存储号)` 并转发，所有状态都在
//! [`crate::protocol::Handler`] 内。泛型数据操作以对象标记类型为参数，
//! 作用域（整手 / 单指 / 单关节）决定扇出范围。

use std::time::Duration;

mod controller;
mod error;
mod finger;
mod hand;
mod joint;

pub use controller::{FilteredController, TargetInbox};
pub use error::HandError;
pub use finger::Finger;
pub use hand::{Hand, HandBuilder, HandController};
pub use joint::Joint;

/// 数据操作的默认超时
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
