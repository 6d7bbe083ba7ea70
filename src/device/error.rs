//! 设备层错误

use thiserror::Error;

use crate::data::FirmwareVersionData;
use crate::protocol::ProtocolError;
use crate::sync::WaitError;
use crate::usb::UsbError;

/// 设备层统一错误类型
#[derive(Error, Debug)]
pub enum HandError {
    /// USB 传输层错误
    #[error("USB error: {0}")]
    Usb(#[from] UsbError),

    /// 协议层错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 批量操作超时
    #[error("Operation timed out: {0}")]
    Timeout(#[from] WaitError),

    /// 固件版本过低
    #[error(
        "The firmware version ({found}) is outdated. \
         Please contact after-sales service for an upgrade."
    )]
    FirmwareOutdated { found: FirmwareVersionData },

    /// 初始化阶段的关节配置未能完成
    #[error("Hand initialization timed out: joint configuration incomplete")]
    InitTimeout,

    /// 手指/关节编号越界
    #[error("Index out of bounds: {what} must be less than {limit}, got {got}")]
    IndexOutOfRange {
        what: &'static str,
        limit: usize,
        got: usize,
    },

    /// 上行未开启时请求实际位置
    #[error("Upstream is disabled")]
    UpstreamDisabled,

    /// 对象未注册（内部一致性故障）
    #[error("Object not registered: index=0x{index:04X}, sub-index=0x{sub_index:02X}")]
    ObjectNotRegistered { index: u16, sub_index: u8 },
}
