//! PDO 链路延迟测试器
//!
//! 占用 PDO 线程以 500 Hz 发送 `read_id = 0xD0` 的探针帧，固件在
//! 应答中回填各级时间戳。按探针序号匹配应答后累计主机侧往返时间
//! 与设备内部转发耗时，周期性输出统计摘要。与实时控制器互斥。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::frame::FrameBuilder;
use super::pdo::{self, LatencyTestResult};
use super::tick;

const PROBE_RATE: f64 = 500.0;
/// 每累计这么多样本输出一次统计摘要
const REPORT_INTERVAL: u64 = 500;
/// 超过该时长未应答的探针从在途表中剔除
const PROBE_EXPIRY: Duration = Duration::from_millis(500);

#[derive(Default)]
struct LatencyStats {
    samples: u64,
    round_trip_min_us: u64,
    round_trip_max_us: u64,
    round_trip_sum_us: u64,
    device_forward_sum_us: u64,
    spinal_turnaround_sum_us: u64,
}

pub(crate) struct LatencyTester {
    next_id: AtomicU32,
    in_flight: Mutex<HashMap<u32, Instant>>,
    stats: Mutex<LatencyStats>,
}

impl LatencyTester {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            in_flight: Mutex::new(HashMap::new()),
            stats: Mutex::new(LatencyStats::default()),
        }
    }

    /// 在 PDO 线程上循环发送探针帧
    pub(crate) fn spin(&self, builder: &mut FrameBuilder, stop: &AtomicBool) {
        tick::spin(PROBE_RATE, stop, |_| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            {
                let mut in_flight = self.in_flight.lock();
                in_flight.insert(id, now);
                in_flight.retain(|_, sent| now.duration_since(*sent) < PROBE_EXPIRY);
            }

            let buf = builder.allocate(pdo::LATENCY_REQUEST_LEN);
            pdo::encode_latency_probe(buf, id);
            builder.finalize();
            true
        });
    }

    /// 接收线程回传一条测试结果
    pub(crate) fn read_result(&self, result: &LatencyTestResult) {
        let id = result.joints[0].id;
        let sent = match self.in_flight.lock().remove(&id) {
            Some(sent) => sent,
            None => {
                debug!("Latency probe {} reply has no matching in-flight record", id);
                return;
            }
        };
        let round_trip_us = sent.elapsed().as_micros() as u64;

        // 设备内部各级耗时：脊柱 USB 往返与关节链路转发（设备时钟，微秒）
        let spinal_turnaround_us = u64::from(result.t_usb_rx_tx);
        let mut forward_sum = 0u64;
        let mut forward_count = 0u64;
        for joint in &result.joints {
            let forward = joint.t4_spinal_rx.wrapping_sub(joint.t0_spinal_rx);
            forward_sum += u64::from(forward);
            forward_count += 1;
        }
        let device_forward_us = if forward_count > 0 {
            forward_sum / forward_count
        } else {
            0
        };

        let mut stats = self.stats.lock();
        stats.samples += 1;
        if stats.samples == 1 || round_trip_us < stats.round_trip_min_us {
            stats.round_trip_min_us = round_trip_us;
        }
        if round_trip_us > stats.round_trip_max_us {
            stats.round_trip_max_us = round_trip_us;
        }
        stats.round_trip_sum_us += round_trip_us;
        stats.device_forward_sum_us += device_forward_us;
        stats.spinal_turnaround_sum_us += spinal_turnaround_us;

        if stats.samples % REPORT_INTERVAL == 0 {
            info!(
                "Latency over {} probes: host RTT min/avg/max = {}/{}/{} us, \
                 joint chain avg = {} us, spinal turnaround avg = {} us",
                stats.samples,
                stats.round_trip_min_us,
                stats.round_trip_sum_us / stats.samples,
                stats.round_trip_max_us,
                stats.device_forward_sum_us / stats.samples,
                stats.spinal_turnaround_sum_us / stats.samples,
            );
        }
    }
}
