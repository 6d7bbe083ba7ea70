//! 协议层
//!
//! 灵巧手 USB 帧协议的完整实现：
//!
//! - [`frame`]: 出站帧构造（头部、16 字节对齐填充、CRC 槽位）
//! - [`sdo`] / [`pdo`]: 两个子协议的载荷编解码
//! - [`storage`]: 存储单元（值缓存、版本号、操作状态机、数值翻译）
//! - [`handler`]: 协议处理器：SDO 轮询线程、PDO 实时线程、接收分发
//! - [`raw_sdo`]: 面向调试的带外 SDO 槽位池
//! - [`latency`]: PDO 链路延迟测试器

use thiserror::Error;

pub(crate) mod frame;
pub mod handler;
pub(crate) mod latency;
pub(crate) mod pdo;
pub(crate) mod raw_sdo;
pub(crate) mod sdo;
pub mod storage;
pub(crate) mod tick;

pub use handler::{Handler, RealtimeController};
pub use storage::{policy, Buffer8, DataWidth, StorageInfo};

/// 手指数量
pub const FINGER_COUNT: usize = 5;
/// 每根手指的关节数量
pub const JOINT_COUNT: usize = 4;

/// `[手指][关节]` 位置矩阵（弧度）
pub type JointMatrix = [[f64; JOINT_COUNT]; FINGER_COUNT];

/// SDO 帧类型
pub(crate) const FRAME_TYPE_SDO: u8 = 0x21;
/// PDO 帧类型
pub(crate) const FRAME_TYPE_PDO: u8 = 0x11;

/// 协议层错误
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// 入站载荷长度不足
    #[error("{what} truncated: requires {requires} bytes, but {remaining} remain")]
    Truncated {
        what: &'static str,
        requires: usize,
        remaining: usize,
    },

    /// 未知的 SDO 命令说明符
    #[error("Invalid SDO command specifier: 0x{0:02X}")]
    InvalidSdoControl(u8),

    /// 未知的帧类型
    #[error("Invalid header type: 0x{0:02X}")]
    InvalidFrameType(u8),

    /// 未知的 PDO read_id
    #[error("PDO frame invalid: read_id == 0x{0:02X}")]
    InvalidPdoReadId(u8),

    /// 入站响应找不到对应的存储单元
    #[error("SDO object not found: index=0x{index:04X}, sub-index=0x{sub_index:02X}")]
    UnknownObject { index: u16, sub_index: u8 },

    /// 受检操作下发时该存储单元已有未完成操作
    #[error("Illegal checked operation: storage {0} is being operated")]
    OperationInFlight(usize),

    /// 线程安全违规
    #[error(
        "Thread safety violation: operations must be called from the construction thread \
         by default. Call disable_thread_safe_check() and serialize calls with a mutex \
         to operate from multiple threads"
    )]
    WrongThread,

    /// 存储注册已关闭（start_transmit_receive 之后）
    #[error("Storage registration is closed after start_transmit_receive")]
    RegistrationClosed,

    /// 重复启动
    #[error("Transmit/receive already started")]
    AlreadyStarted,

    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(#[from] crate::usb::UsbError),

    /// IO 错误（线程创建失败等）
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 启动时发送缓冲池无可用缓冲
    #[error("No transmit buffer available")]
    NoTransmitBuffer,

    /// 带外 SDO 槽位全部占用
    #[error("No available raw SDO slot. Too many concurrent operations")]
    RawSdoBusy,

    /// 带外 SDO 操作超时
    #[error("Raw SDO {operation} timed out: index=0x{index:04X}, sub_index={sub_index}")]
    RawSdoTimeout {
        operation: &'static str,
        index: u16,
        sub_index: u8,
    },

    /// 带外 SDO 写数据长度非法
    #[error("Raw SDO write data size must be 1, 2, 4, or 8 bytes, got {0}")]
    InvalidRawSdoSize(usize),

    /// 已有实时控制器在运行
    #[error("A realtime controller is already attached")]
    ControllerAttached,

    /// 未挂载实时控制器
    #[error("No realtime controller attached")]
    NoController,

    /// 延迟测试正在进行
    #[error("Latency testing is underway")]
    LatencyTestRunning,

    /// 延迟测试未启动
    #[error("Latency testing is not started")]
    LatencyTestNotStarted,

    /// PDO 实时线程异常退出
    #[error("Realtime thread terminated abnormally")]
    RealtimeThreadPanicked,
}

/// 入站字节游标：只前进、越界即报错，解析路径不分配
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn offset(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated {
                what,
                requires: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn peek_u8(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    pub(crate) fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    pub(crate) fn u16_be(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32_le(&mut self, what: &'static str) -> Result<u32, ProtocolError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn i32_le(&mut self, what: &'static str) -> Result<i32, ProtocolError> {
        Ok(self.u32_le(what)? as i32)
    }

    pub(crate) fn f32_le(&mut self, what: &'static str) -> Result<f32, ProtocolError> {
        Ok(f32::from_bits(self.u32_le(what)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_reads_and_tracks_offset() {
        let data = [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD];
        let mut cursor = Cursor::new(&data);

        assert_eq!(cursor.u8("a").unwrap(), 0x01);
        assert_eq!(cursor.u16_be("b").unwrap(), 0x2345);
        assert_eq!(cursor.u32_le("c").unwrap(), 0xCDAB_8967);
        assert_eq!(cursor.offset(), 7);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_cursor_truncation_is_an_error() {
        let data = [0x01, 0x02];
        let mut cursor = Cursor::new(&data);

        let err = cursor.u32_le("value").unwrap_err();
        match err {
            ProtocolError::Truncated {
                requires, remaining, ..
            } => {
                assert_eq!(requires, 4);
                assert_eq!(remaining, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        // 失败的读取不前进
        assert_eq!(cursor.offset(), 0);
    }
}
