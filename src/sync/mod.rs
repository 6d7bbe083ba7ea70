//! 同步原语
//!
//! [`Latch`] 是批量异步操作的计数闩：调用方先 `count_up` N 次，
//! 随后下发 N 个异步操作，每个操作完成时 `count_down(success)`，
//! 唯一的等待者在 `wait` 上阻塞到全部回报完毕。失败数被聚合，
//! 任意一个失败都会让 `wait` 返回错误。
//!
//! [`Completer`] 是完成回调的统一抽象：同步调用方用 Latch 后端，
//! 语言绑定层可以用 future 后端接入同一接口。

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// 批量操作聚合失败
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{failed} of {total} batched operations timed out")]
pub struct WaitError {
    pub failed: usize,
    pub total: usize,
}

/// 操作完成回调
///
/// 在 SDO 线程上调用，实现不得阻塞。
pub trait Completer: Send + Sync {
    fn complete(&self, success: bool);
}

/// 任意 `Fn(bool)` 闭包都可以充当完成回调
impl<F: Fn(bool) + Send + Sync> Completer for F {
    fn complete(&self, success: bool) {
        self(success)
    }
}

#[derive(Default)]
struct LatchState {
    waiting: usize,
    total: usize,
    failed: usize,
}

/// 计数闩
pub struct Latch {
    state: Mutex<LatchState>,
    condvar: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            condvar: Condvar::new(),
        }
    }

    /// 登记一个待完成的操作，必须在对应的异步操作下发之前调用
    pub fn count_up(&self) {
        let mut state = self.state.lock();
        state.waiting += 1;
        state.total += 1;
    }

    /// 回报一个操作的结果
    pub fn count_down(&self, success: bool) {
        let mut state = self.state.lock();
        if !success {
            state.failed += 1;
        }
        state.waiting = state.waiting.saturating_sub(1);
        if state.waiting == 0 {
            self.condvar.notify_all();
        }
    }

    /// 阻塞到所有已登记的操作回报完毕
    ///
    /// 返回后闩复位，可以复用。任意操作失败时返回 [`WaitError`]。
    pub fn wait(&self) -> Result<(), WaitError> {
        let mut state = self.state.lock();
        while state.waiting > 0 {
            self.condvar.wait(&mut state);
        }

        let failed = state.failed;
        let total = state.total;
        state.failed = 0;
        state.total = 0;

        if failed > 0 {
            Err(WaitError { failed, total })
        } else {
            Ok(())
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Completer for Latch {
    fn complete(&self, success: bool) {
        self.count_down(success);
    }
}
