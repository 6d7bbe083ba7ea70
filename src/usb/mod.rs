//! USB 传输层
//!
//! 封装灵巧手的 USB Bulk 链路：设备选择、端点收发、发送缓冲池。
//! 协议层只依赖 [`Transport`] 抽象，测试中可以用脚本化的 Mock 实现替换。

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

mod device;

pub use device::UsbTransport;

/// 单次 Bulk 传输的最大长度（字节）
pub const MAX_TRANSFER_LENGTH: usize = 2048;

/// 发送缓冲池容量
pub(crate) const TRANSMIT_BUFFER_COUNT: usize = 64;

/// USB 传输层错误
#[derive(Error, Debug)]
pub enum UsbError {
    /// libusb 错误（来自 rusb）
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// IO 错误（事件线程创建失败等）
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 设备选择失败（未找到或找到多个）
    #[error("USB device selection failed: {0}")]
    Selection(String),

    /// 接收回调重复安装
    #[error("Receive callback can only be installed once")]
    CallbackInstalled,
}

/// 接收回调：每个完成的 IN 传输在传输层事件线程上调用一次
pub type RxCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

/// 传输层抽象
///
/// 实现方约定：
/// - `transmit` 提交后缓冲自动归还缓冲池（[`TxBuffer`] 的 RAII 语义）；
/// - 设备断开属于不可恢复故障，记录日志后终止进程；
/// - `receive` 只允许安装一次回调。
pub trait Transport: Send + Sync {
    /// 从缓冲池借出一块可写缓冲；池耗尽时返回 `None`，调用方视为背压
    fn request_transmit_buffer(&self) -> Option<TxBuffer>;

    /// 将缓冲的前 `used` 字节提交到 OUT 端点
    fn transmit(&self, buffer: TxBuffer, used: usize);

    /// 安装接收回调（仅一次）
    fn receive(&self, callback: RxCallback) -> Result<(), UsbError>;
}

/// 固定大小的发送缓冲池
///
/// 有界 channel 充当无锁空闲队列：借出即 `try_recv`，归还由
/// [`TxBuffer`] 的 `Drop` 完成。
pub struct BufferPool {
    free_tx: Sender<Box<[u8]>>,
    free_rx: Receiver<Box<[u8]>>,
}

impl BufferPool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::bounded(count);
        for _ in 0..count {
            // 池在构造时灌满，容量恰好等于 count，不会失败
            let _ = free_tx.try_send(vec![0u8; buffer_size].into_boxed_slice());
        }
        Self { free_tx, free_rx }
    }

    pub fn request(&self) -> Option<TxBuffer> {
        self.free_rx.try_recv().ok().map(|data| TxBuffer {
            data: Some(data),
            pool: self.free_tx.clone(),
        })
    }
}

/// 池化发送缓冲
///
/// Drop 时自动归还所属缓冲池，无论是否经过 `transmit`。
pub struct TxBuffer {
    data: Option<Box<[u8]>>,
    pool: Sender<Box<[u8]>>,
}

impl TxBuffer {
    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for TxBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            match self.pool.try_send(data) {
                Ok(()) => {}
                // 池已销毁或已满（后者按构造不变式不可能发生）
                Err(TrySendError::Disconnected(_)) | Err(TrySendError::Full(_)) => {}
            }
        }
    }
}

/// 便捷别名：跨线程共享的传输层句柄
pub type SharedTransport = Arc<dyn Transport>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_drains_and_refills() {
        let pool = BufferPool::new(2, 64);

        let a = pool.request().unwrap();
        let b = pool.request().unwrap();
        assert_eq!(a.capacity(), 64);
        assert_eq!(b.capacity(), 64);

        // 池耗尽
        assert!(pool.request().is_none());

        // 归还后可再次借出
        drop(a);
        assert!(pool.request().is_some());
    }

    #[test]
    fn test_tx_buffer_returns_on_drop_after_write() {
        let pool = BufferPool::new(1, 16);
        let mut buf = pool.request().unwrap();
        buf.as_mut_slice()[0] = 0xAA;
        drop(buf);

        let again = pool.request().unwrap();
        // 缓冲复用，内容不保证清零
        assert_eq!(again.capacity(), 16);
    }
}
