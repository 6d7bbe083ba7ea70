//! 出站帧构造
//!
//! 每帧布局：8 字节头部 + 拼接载荷 + 2 字节 CRC 槽位，整体补零到
//! 16 字节的整数倍。CRC 槽位随填充一并清零（固件不校验该字段）。
//! 头部的 description 字段（大端）携带 10 位接收窗口与 6 位
//! `16 字节单位帧长 − 1`。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::usb::{SharedTransport, TxBuffer};

use super::ProtocolError;

pub(crate) const HEADER_LEN: usize = 8;
pub(crate) const CRC_LEN: usize = 2;

const FRAME_MAGIC: u16 = 0x55AA;
const SOURCE_HOST: u8 = 0x00;
const DESTINATION_DEVICE: u8 = 0xA0;
/// 接收窗口提示：256 个 16 字节单位
const MAX_RECEIVE_WINDOW: u16 = 0x100;

/// 出站帧构造器
///
/// 始终持有一块开放中的缓冲；`allocate` 返回载荷写入区间，空间不足时
/// 先 `finalize` 当前帧再续。SDO 与 PDO 各自持有独立实例，且只在
/// 所属线程上使用。
pub(crate) struct FrameBuilder {
    transport: SharedTransport,
    frame_type: u8,
    buffer: TxBuffer,
    used: usize,
    dropped_frames: Arc<AtomicU64>,
}

impl FrameBuilder {
    pub(crate) fn new(
        transport: SharedTransport,
        frame_type: u8,
        dropped_frames: Arc<AtomicU64>,
    ) -> Result<Self, ProtocolError> {
        let buffer = transport
            .request_transmit_buffer()
            .ok_or(ProtocolError::NoTransmitBuffer)?;
        let mut builder = Self {
            transport,
            frame_type,
            buffer,
            used: 0,
            dropped_frames,
        };
        builder.reset_frame();
        Ok(builder)
    }

    /// 申请 `size` 字节的载荷区间
    ///
    /// 剩余空间（含 CRC 槽位）不足时先提交当前帧。单个载荷必须放得进
    /// 一个空帧，协议中所有载荷都远小于缓冲容量。
    pub(crate) fn allocate(&mut self, size: usize) -> &mut [u8] {
        if self.used + size + CRC_LEN > self.buffer.capacity() {
            self.finalize();
        }
        debug_assert!(self.used + size + CRC_LEN <= self.buffer.capacity());

        let start = self.used;
        self.used += size;
        &mut self.buffer.as_mut_slice()[start..start + size]
    }

    /// 提交当前帧并开启新帧
    ///
    /// 缓冲池耗尽时丢弃积累的载荷并递增丢帧计数，当前缓冲复用为新帧。
    pub(crate) fn finalize(&mut self) {
        if self.used == HEADER_LEN {
            return;
        }

        match self.transport.request_transmit_buffer() {
            None => {
                self.reset_frame();
                let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
                trace!("TX frame dropped: transmit pool drained (total {})", dropped);
            }
            Some(new_buffer) => {
                let full = std::mem::replace(&mut self.buffer, new_buffer);
                let used = self.used;
                self.reset_frame();
                self.transmit_frame(full, used);
            }
        }
    }

    fn reset_frame(&mut self) {
        let buf = self.buffer.as_mut_slice();
        debug_assert!(buf.len() % 16 == 0);
        debug_assert!(buf.len() > HEADER_LEN + CRC_LEN);

        buf[0..2].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        buf[2] = SOURCE_HOST;
        buf[3] = DESTINATION_DEVICE;
        buf[4..6].fill(0); // description 在 finalize 时回填
        buf[6] = self.frame_type;
        buf[7] = 0x00; // prefix
        self.used = HEADER_LEN;
    }

    fn transmit_frame(&self, mut buffer: TxBuffer, used: usize) {
        let units = (used + CRC_LEN - 1) / 16 + 1;
        let padded_length = units * 16;

        {
            let buf = buffer.as_mut_slice();
            buf[used..padded_length].fill(0);

            let description = ((units as u16 - 1) << 10) | MAX_RECEIVE_WINDOW;
            buf[4..6].copy_from_slice(&description.to_be_bytes());
        }

        trace!(
            "TX [{} bytes] {:02X?}",
            padded_length,
            &buffer.as_slice()[..padded_length]
        );

        self.transport.transmit(buffer, padded_length);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::usb::{BufferPool, RxCallback, Transport, TxBuffer, UsbError};

    use super::*;

    struct RecordingTransport {
        pool: BufferPool,
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingTransport {
        fn new(buffer_count: usize) -> Self {
            Self {
                pool: BufferPool::new(buffer_count, 256),
                frames: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for RecordingTransport {
        fn request_transmit_buffer(&self) -> Option<TxBuffer> {
            self.pool.request()
        }

        fn transmit(&self, buffer: TxBuffer, used: usize) {
            self.frames.lock().push(buffer.as_slice()[..used].to_vec());
        }

        fn receive(&self, _callback: RxCallback) -> Result<(), UsbError> {
            Ok(())
        }
    }

    #[test]
    fn test_frame_header_layout_and_padding() {
        let transport = Arc::new(RecordingTransport::new(4));
        let dropped = Arc::new(AtomicU64::new(0));
        let mut builder =
            FrameBuilder::new(transport.clone(), 0x21, dropped).unwrap();

        builder.allocate(4).copy_from_slice(&[0x30, 0x52, 0x0A, 0x01]);
        builder.finalize();

        let frames = transport.frames.lock();
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];

        // 8 字节头 + 4 字节载荷 + 2 字节 CRC = 14 → 补到 16
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[0..2], &[0xAA, 0x55]);
        assert_eq!(frame[2], 0x00);
        assert_eq!(frame[3], 0xA0);
        // description: frame_length=0（1 个单位 − 1），窗口 0x100
        assert_eq!(u16::from_be_bytes([frame[4], frame[5]]), 0x0100);
        assert_eq!(frame[6], 0x21);
        assert_eq!(frame[7], 0x00);
        assert_eq!(&frame[8..12], &[0x30, 0x52, 0x0A, 0x01]);
        // CRC 槽位与填充清零
        assert_eq!(&frame[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_description_encodes_frame_length_units() {
        let transport = Arc::new(RecordingTransport::new(4));
        let dropped = Arc::new(AtomicU64::new(0));
        let mut builder =
            FrameBuilder::new(transport.clone(), 0x11, dropped).unwrap();

        // 8 + 30 + 2 = 40 → 3 个 16 字节单位
        let payload = builder.allocate(30);
        payload.fill(0x5A);
        builder.finalize();

        let frames = transport.frames.lock();
        let frame = &frames[0];
        assert_eq!(frame.len(), 48);
        let description = u16::from_be_bytes([frame[4], frame[5]]);
        assert_eq!(description >> 10, 2);
        assert_eq!(description & 0x3FF, 0x100);
    }

    #[test]
    fn test_finalize_without_payload_is_noop() {
        let transport = Arc::new(RecordingTransport::new(4));
        let dropped = Arc::new(AtomicU64::new(0));
        let mut builder = FrameBuilder::new(transport.clone(), 0x21, dropped).unwrap();

        builder.finalize();
        builder.finalize();
        assert!(transport.frames.lock().is_empty());
    }

    #[test]
    fn test_allocate_rolls_over_to_new_frame_when_full() {
        let transport = Arc::new(RecordingTransport::new(4));
        let dropped = Arc::new(AtomicU64::new(0));
        let mut builder = FrameBuilder::new(transport.clone(), 0x21, dropped).unwrap();

        // 缓冲 256 字节：填满后下一次 allocate 触发滚动
        for _ in 0..30 {
            builder.allocate(8).fill(0x11);
        }
        builder.allocate(8).fill(0x22);
        builder.finalize();

        let frames = transport.frames.lock();
        assert_eq!(frames.len(), 2);
        assert!(frames[0].len() <= 256);
    }

    #[test]
    fn test_pool_drained_drops_frame_and_counts() {
        // 池里只有一块缓冲：builder 自己占用后 finalize 必然拿不到新缓冲
        let transport = Arc::new(RecordingTransport::new(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let mut builder =
            FrameBuilder::new(transport.clone(), 0x21, dropped.clone()).unwrap();

        builder.allocate(4).fill(0xAB);
        builder.finalize();

        assert!(transport.frames.lock().is_empty());
        assert_eq!(dropped.load(Ordering::Relaxed), 1);

        // 丢帧后缓冲被复用，可以继续积累新载荷
        builder.allocate(4).fill(0xCD);
        builder.finalize();
        assert_eq!(dropped.load(Ordering::Relaxed), 2);
    }
}
