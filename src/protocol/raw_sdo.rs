//! 带外 SDO 槽位池
//!
//! 面向调试与固件探查：对未注册进存储表的任意 `(index, sub_index)`
//! 发起读写。槽位固定 4 个，调用方以 CAS 认领、在槽位条件变量上
//! 阻塞等待；请求帧统一由 SDO 线程发出（帧构造器只属于该线程），
//! 解析线程负责完成匹配的槽位。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

pub(crate) const RAW_SDO_SLOT_COUNT: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RawSdoMode {
    None,
    Read,
    Write,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RawSdoPhase {
    Idle,
    /// 已填写，等待 SDO 线程发出请求
    Pending,
    Reading,
    Writing,
    Success,
    Failed,
}

pub(crate) struct RawSdoRequest {
    pub index: u16,
    pub sub_index: u8,
    pub mode: RawSdoMode,
    pub phase: RawSdoPhase,
    /// 读结果（宽度由响应决定）
    pub read_result: Vec<u8>,
    /// 暂存的写数据，SDO 线程发送时取用
    pub write_data: [u8; 8],
    pub write_len: usize,
    /// `None` 表示永不超时
    pub deadline: Option<Instant>,
}

impl Default for RawSdoRequest {
    fn default() -> Self {
        Self {
            index: 0,
            sub_index: 0,
            mode: RawSdoMode::None,
            phase: RawSdoPhase::Idle,
            read_result: Vec::new(),
            write_data: [0; 8],
            write_len: 0,
            deadline: None,
        }
    }
}

pub(crate) struct RawSdoSlot {
    pub in_use: AtomicBool,
    pub request: Mutex<RawSdoRequest>,
    pub condvar: Condvar,
}

impl Default for RawSdoSlot {
    fn default() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            request: Mutex::new(RawSdoRequest::default()),
            condvar: Condvar::new(),
        }
    }
}

impl RawSdoSlot {
    /// 尝试认领空闲槽位
    pub(crate) fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// 释放槽位（等待方取走结果后调用）
    pub(crate) fn release(&self) {
        let mut request = self.request.lock();
        request.phase = RawSdoPhase::Idle;
        request.mode = RawSdoMode::None;
        drop(request);
        self.in_use.store(false, Ordering::Release);
    }

    /// 阻塞等待终态，返回是否成功
    pub(crate) fn wait_for_completion(&self) -> bool {
        let mut request = self.request.lock();
        while request.phase != RawSdoPhase::Success && request.phase != RawSdoPhase::Failed {
            self.condvar.wait(&mut request);
        }
        request.phase == RawSdoPhase::Success
    }
}

/// 把调用方超时换算为绝对截止时刻，超大超时饱和为"永不超时"
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_claim_and_release() {
        let slot = RawSdoSlot::default();
        assert!(slot.try_claim());
        assert!(!slot.try_claim());

        slot.release();
        assert!(slot.try_claim());
        assert_eq!(slot.request.lock().phase, RawSdoPhase::Idle);
    }

    #[test]
    fn test_wait_returns_on_success() {
        let slot = std::sync::Arc::new(RawSdoSlot::default());
        assert!(slot.try_claim());
        slot.request.lock().phase = RawSdoPhase::Pending;

        let completer = {
            let slot = std::sync::Arc::clone(&slot);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(5));
                let mut request = slot.request.lock();
                request.read_result = vec![0xAA];
                request.phase = RawSdoPhase::Success;
                slot.condvar.notify_one();
            })
        };

        assert!(slot.wait_for_completion());
        assert_eq!(slot.request.lock().read_result, vec![0xAA]);
        completer.join().unwrap();
    }

    #[test]
    fn test_deadline_saturates_for_huge_timeouts() {
        assert!(deadline_after(Duration::from_millis(10)).is_some());
        // Duration::MAX 无法落在 Instant 的值域内，饱和为永不超时
        assert!(deadline_after(Duration::MAX).is_none());
    }
}
