//! 周期执行器
//!
//! PDO 实时线程与延迟测试共用的定时循环：按绝对节拍调度，
//! spin_sleep 提供微秒级睡眠精度，落后时重新对齐而不补帧。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use spin_sleep::SpinSleeper;

/// 单次节拍的时间上下文
pub(crate) struct TickContext {
    /// 循环启动时刻
    pub begin_time: Instant,
    /// 本次节拍的计划执行时刻
    pub scheduled_update_time: Instant,
}

impl TickContext {
    /// 计划执行时刻相对循环启动的微秒数，随下行帧上报用于观测调度抖动
    pub(crate) fn scheduled_elapsed_us(&self) -> u32 {
        self.scheduled_update_time
            .duration_since(self.begin_time)
            .as_micros() as u32
    }
}

/// 以 `rate` Hz 循环执行 `tick`，直到停止标志置位或 `tick` 返回 `false`
pub(crate) fn spin(rate: f64, stop: &AtomicBool, mut tick: impl FnMut(&TickContext) -> bool) {
    let period = Duration::from_secs_f64(1.0 / rate);
    let sleeper = SpinSleeper::default();

    let begin_time = Instant::now();
    let mut scheduled = begin_time;

    while !stop.load(Ordering::Relaxed) {
        let keep_going = tick(&TickContext {
            begin_time,
            scheduled_update_time: scheduled,
        });
        if !keep_going {
            break;
        }

        scheduled += period;
        let now = Instant::now();
        if scheduled > now {
            sleeper.sleep(scheduled - now);
        } else {
            // 执行超期，从当前时刻重新对齐
            scheduled = now;
        }
    }
}
