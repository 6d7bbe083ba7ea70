//! # dexhand-sdk
//!
//! 五指灵巧手（5 指 × 4 关节）主机侧 SDK。
//!
//! 设备通过 USB Bulk 链路承载一个自定义帧协议，其上叠加两个子协议：
//!
//! - **SDO**（服务数据对象）：请求/响应通道，用于配置与单次读写，
//!   带写后回读校验与超时重试；
//! - **PDO**（过程数据对象）：500 Hz 循环通道，用于实时位置流。
//!
//! # 架构层次
//!
//! - [`usb`]: USB 传输（设备选择、缓冲池、收发线程）
//! - [`protocol`]: 协议核心（帧构造/解析、存储表、SDO 引擎、PDO 实时引擎）
//! - [`data`]: 对象描述表（手部级 / 关节级地址与策略）
//! - [`device`]: [`Hand`] / [`Finger`] / [`Joint`] 门面与实时控制
//!
//! # 快速上手
//!
//! ```rust,no_run
//! use dexhand_sdk::{data, Hand};
//!
//! # fn main() -> Result<(), dexhand_sdk::HandError> {
//! let hand = Hand::builder().build()?;
//!
//! // 使能全部关节，读取拇指近端关节位置
//! hand.write_joints::<data::joint::Enabled>(true)?;
//! let position = hand.finger_thumb().joint(0)?.read::<data::joint::ActualPosition>()?;
//! println!("thumb J1: {position:.4} rad");
//! # Ok(())
//! # }
//! ```

pub mod data;
pub mod device;
pub mod filter;
pub mod protocol;
pub mod sync;
pub mod usb;

// Re-export 核心类型，简化用户导入
pub use device::{Finger, Hand, HandBuilder, HandController, HandError, Joint, DEFAULT_TIMEOUT};
pub use filter::LowPass;
pub use protocol::{
    Buffer8, Handler, JointMatrix, ProtocolError, RealtimeController, StorageInfo, FINGER_COUNT,
    JOINT_COUNT,
};
pub use sync::{Completer, Latch, WaitError};
pub use usb::{Transport, TxBuffer, UsbError, UsbTransport};
