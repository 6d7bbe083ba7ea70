//! 协议处理器
//!
//! 拥有 USB 端点之上的全部协议状态：
//!
//! - 存储表与 `(index, sub_index)` 路由表（启动前注册，启动后只读）
//! - SDO 轮询线程（~199 Hz）：驱动逐对象状态机、写后确认重试、
//!   超时判定与完成回调分发
//! - PDO 实时线程（500 Hz，按需启动）：实时控制器或延迟测试器
//! - 接收分发：传输层事件线程上解析入站帧，更新存储单元与
//!   无锁位置/错误码快照
//!
//! 线程契约见各方法文档：默认只有构造线程可以发起调用方操作。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use spin_sleep::SpinSleeper;
use tracing::{debug, error, trace, warn};

use crate::sync::Completer;
use crate::usb::SharedTransport;

use super::frame::{FrameBuilder, HEADER_LEN};
use super::latency::LatencyTester;
use super::pdo;
use super::raw_sdo::{
    deadline_after, RawSdoMode, RawSdoPhase, RawSdoSlot, RAW_SDO_SLOT_COUNT,
};
use super::sdo::{self, SdoResponse};
use super::storage::{
    extract_raw_position, policy, to_raw_position, Buffer8, Completion, DataWidth, OpMode, OpState,
    Operation, StorageInfo, StorageUnit,
};
use super::tick;
use super::{
    Cursor, JointMatrix, ProtocolError, FINGER_COUNT, FRAME_TYPE_PDO, FRAME_TYPE_SDO, JOINT_COUNT,
};

/// SDO 轮询频率（Hz）
const SDO_UPDATE_RATE: f64 = 199.0;
/// PDO 实时频率（Hz）
const PDO_UPDATE_RATE: f64 = 500.0;
/// 主机心跳周期对应的 SDO 节拍数（约 0.5 s）
const HEARTBEAT_TICK_DIVIDER: u32 = 100;
/// 心跳写操作的超时
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(500);

/// 实时控制器
///
/// 由 PDO 线程独占驱动：`setup` 在循环启动前调用一次，`step` 每个
/// 节拍调用一次并返回 20 个目标位置（弧度）。上行开启时 `actual`
/// 携带最新的实际位置快照。
pub trait RealtimeController: Send {
    fn setup(&mut self, sampling_frequency: f64);
    fn step(&mut self, actual: Option<&JointMatrix>) -> JointMatrix;
}

/// 进程启动起算的单调微秒数
///
/// 锚点首次访问时固定，不受系统时钟调整影响，可安全放入 AtomicU64。
pub(crate) fn monotonic_micros() -> u64 {
    static APP_START: OnceLock<Instant> = OnceLock::new();
    APP_START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Severity {
    Critical,
    Error,
    Warn,
}

struct ErrorDefinition {
    bit: u8,
    description: &'static str,
    remedy: &'static str,
    severity: Severity,
}

const DEFAULT_REMEDY: &str = "Possible hardware damage, please contact customer service.";

const ERROR_DEFINITIONS: &[ErrorDefinition] = &[
    ErrorDefinition { bit: 0, description: "ADC failure", remedy: DEFAULT_REMEDY, severity: Severity::Critical },
    ErrorDefinition { bit: 1, description: "Driver communication fault", remedy: DEFAULT_REMEDY, severity: Severity::Error },
    ErrorDefinition { bit: 2, description: "Driver fault reported", remedy: DEFAULT_REMEDY, severity: Severity::Error },
    ErrorDefinition { bit: 3, description: "Encoder1 communication fault", remedy: DEFAULT_REMEDY, severity: Severity::Critical },
    ErrorDefinition { bit: 4, description: "Encoder1 noise detected", remedy: DEFAULT_REMEDY, severity: Severity::Error },
    ErrorDefinition { bit: 5, description: "Bus overvoltage", remedy: DEFAULT_REMEDY, severity: Severity::Error },
    ErrorDefinition { bit: 6, description: "Bus undervoltage", remedy: DEFAULT_REMEDY, severity: Severity::Error },
    ErrorDefinition { bit: 7, description: "Transmission slip detected", remedy: DEFAULT_REMEDY, severity: Severity::Critical },
    ErrorDefinition { bit: 8, description: "Phase overcurrent", remedy: DEFAULT_REMEDY, severity: Severity::Error },
    ErrorDefinition { bit: 13, description: "Overtemperature", remedy: "Try improve cooling and reduce load.", severity: Severity::Error },
    ErrorDefinition { bit: 14, description: "Board info invalid", remedy: DEFAULT_REMEDY, severity: Severity::Critical },
    ErrorDefinition { bit: 16, description: "Encoder2 communication error", remedy: DEFAULT_REMEDY, severity: Severity::Warn },
    ErrorDefinition { bit: 17, description: "Encoder2 noise detected", remedy: DEFAULT_REMEDY, severity: Severity::Warn },
    ErrorDefinition { bit: 18, description: "Flash erase error", remedy: DEFAULT_REMEDY, severity: Severity::Warn },
    ErrorDefinition { bit: 19, description: "Flash verify error", remedy: DEFAULT_REMEDY, severity: Severity::Warn },
    ErrorDefinition { bit: 20, description: "Flash write error", remedy: DEFAULT_REMEDY, severity: Severity::Warn },
    ErrorDefinition { bit: 21, description: "User config verification failed", remedy: DEFAULT_REMEDY, severity: Severity::Warn },
    ErrorDefinition { bit: 22, description: "Flash write count limit reached", remedy: DEFAULT_REMEDY, severity: Severity::Warn },
];

fn index_map_key(index: u16, sub_index: u8) -> u32 {
    (u32::from(index) << 8) | u32::from(sub_index)
}

/// 各线程共享的协议状态
struct Shared {
    storage: Box<[StorageUnit]>,
    index_map: HashMap<u32, usize>,
    raw_sdo: [RawSdoSlot; RAW_SDO_SLOT_COUNT],

    pdo_positions: [[AtomicU64; JOINT_COUNT]; FINGER_COUNT],
    pdo_error_codes: [[AtomicU32; JOINT_COUNT]; FINGER_COUNT],
    pdo_result_version: AtomicU64,

    heartbeat_slot: Option<usize>,
    heartbeat_enabled: AtomicBool,

    latency: Mutex<Option<Arc<LatencyTester>>>,
}

impl Shared {
    fn new(storage_unit_count: usize) -> Self {
        let storage: Vec<StorageUnit> = (0..storage_unit_count)
            .map(|_| StorageUnit::default())
            .collect();
        Self {
            storage: storage.into_boxed_slice(),
            index_map: HashMap::new(),
            raw_sdo: Default::default(),
            pdo_positions: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
            pdo_error_codes: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU32::new(0))),
            pdo_result_version: AtomicU64::new(0),
            heartbeat_slot: None,
            heartbeat_enabled: AtomicBool::new(false),
            latency: Mutex::new(None),
        }
    }

    fn find_storage(&self, index: u16, sub_index: u8) -> Result<&StorageUnit, ProtocolError> {
        self.index_map
            .get(&index_map_key(index, sub_index))
            .map(|&id| &self.storage[id])
            .ok_or(ProtocolError::UnknownObject { index, sub_index })
    }

    // ==================== 接收分发 ====================

    fn handle_rx(&self, bytes: &[u8]) {
        trace!("RX [{} bytes] {:02X?}", bytes.len(), bytes);

        let mut cursor = Cursor::new(bytes);
        if let Err(e) = self.parse_frame(&mut cursor) {
            error!("RX frame parsing failed at offset {}", cursor.offset());
            error!("{}", e);
            error!("RX frame dump [{} bytes] {:02X?}", bytes.len(), bytes);
        }
    }

    fn parse_frame(&self, cursor: &mut Cursor<'_>) -> Result<(), ProtocolError> {
        let header = cursor.take(HEADER_LEN, "frame header")?;
        match header[6] {
            FRAME_TYPE_SDO => self.parse_sdo_frame(cursor),
            FRAME_TYPE_PDO => self.parse_pdo_frame(cursor),
            other => Err(ProtocolError::InvalidFrameType(other)),
        }
    }

    fn parse_sdo_frame(&self, cursor: &mut Cursor<'_>) -> Result<(), ProtocolError> {
        loop {
            if cursor.remaining() == 0 {
                return Ok(());
            }
            match sdo::parse_response(cursor)? {
                SdoResponse::Padding => return Ok(()),
                SdoResponse::ReadSuccess {
                    index,
                    sub_index,
                    width,
                    value,
                } => self.handle_read_success(index, sub_index, width, value)?,
                SdoResponse::WriteSuccess { index, sub_index } => {
                    self.handle_write_success(index, sub_index)?
                }
                // 失败响应消费后丢弃，由逐操作超时兜底
                SdoResponse::ReadError {
                    index,
                    sub_index,
                    error_code,
                } => debug!(
                    "SDO read failed: 0x{:04X}.{} (error 0x{:08X})",
                    index, sub_index, error_code
                ),
                SdoResponse::WriteError {
                    index,
                    sub_index,
                    error_code,
                } => debug!(
                    "SDO write failed: 0x{:04X}.{} (error 0x{:08X})",
                    index, sub_index, error_code
                ),
            }
        }
    }

    fn handle_read_success(
        &self,
        index: u16,
        sub_index: u8,
        width: DataWidth,
        value: u64,
    ) -> Result<(), ProtocolError> {
        if self.complete_raw_read(index, sub_index, width, value) {
            return Ok(());
        }

        let unit = self.find_storage(index, sub_index)?;
        let mut op = Operation::unpack(unit.operation.load(Ordering::Acquire));

        debug!(
            "SDO read success: 0x{:04X}.{} ({:?}/{:?})",
            index, sub_index, op.mode, op.state
        );

        if op.mode == OpMode::None {
            // 迟到的响应
            return Ok(());
        }

        if op.state == OpState::Reading {
            unit.publish_value(value);
            op.state = OpState::Success;
            unit.operation.store(op.pack(), Ordering::Release);
        } else if op.state == OpState::WritingConfirming {
            let mask = width.mask();
            let cached = unit.value.load(Ordering::Relaxed);
            op.state = if value & mask == cached & mask {
                OpState::Success
            } else {
                // 回读与期望不符：回到 WRITING 重试
                OpState::Writing
            };
            unit.operation.store(op.pack(), Ordering::Relaxed);
        }
        Ok(())
    }

    fn handle_write_success(&self, index: u16, sub_index: u8) -> Result<(), ProtocolError> {
        if self.complete_raw_write(index, sub_index) {
            return Ok(());
        }

        let unit = self.find_storage(index, sub_index)?;
        let mut op = Operation::unpack(unit.operation.load(Ordering::Acquire));
        if op.mode == OpMode::None {
            return Ok(());
        }

        if op.state == OpState::Writing {
            op.state = OpState::Success;
            unit.operation.store(op.pack(), Ordering::Relaxed);
        }
        Ok(())
    }

    fn complete_raw_read(&self, index: u16, sub_index: u8, width: DataWidth, value: u64) -> bool {
        for slot in &self.raw_sdo {
            if !slot.in_use.load(Ordering::Acquire) {
                continue;
            }
            let mut request = slot.request.lock();
            if request.index == index
                && request.sub_index == sub_index
                && request.phase == RawSdoPhase::Reading
                && request.mode == RawSdoMode::Read
            {
                request.read_result = value.to_le_bytes()[..width.bytes()].to_vec();
                request.phase = RawSdoPhase::Success;
                slot.condvar.notify_one();
                return true;
            }
        }
        false
    }

    fn complete_raw_write(&self, index: u16, sub_index: u8) -> bool {
        for slot in &self.raw_sdo {
            if !slot.in_use.load(Ordering::Acquire) {
                continue;
            }
            let mut request = slot.request.lock();
            if request.index == index
                && request.sub_index == sub_index
                && request.phase == RawSdoPhase::Writing
                && request.mode == RawSdoMode::Write
            {
                request.phase = RawSdoPhase::Success;
                slot.condvar.notify_one();
                return true;
            }
        }
        false
    }

    fn parse_pdo_frame(&self, cursor: &mut Cursor<'_>) -> Result<(), ProtocolError> {
        let header = pdo::parse_header(cursor)?;
        match header.read_id {
            pdo::TPDO_POSITIONS => {
                debug!("TPDO 0x01 received");
                let positions = pdo::parse_positions(cursor)?;
                self.update_pdo_positions(&positions);
                self.bump_pdo_version();
            }
            pdo::TPDO_POS_IQ_ERR => {
                debug!("TPDO 0x02 received");
                let joints = pdo::parse_pos_iq_err(cursor)?;
                for (finger_id, finger) in joints.iter().enumerate() {
                    for (joint_id, joint) in finger.iter().enumerate() {
                        self.store_pdo_position(finger_id, joint_id, joint.position);
                        self.update_error_code(finger_id, joint_id, joint.error_code);
                    }
                }
                self.bump_pdo_version();
            }
            pdo::TPDO_LATENCY => {
                let result = pdo::parse_latency_result(cursor)?;
                // try_lock：测试器拆卸不阻塞接收线程
                if let Some(guard) = self.latency.try_lock() {
                    if let Some(tester) = guard.as_ref() {
                        tester.read_result(&result);
                    }
                }
            }
            other => return Err(ProtocolError::InvalidPdoReadId(other)),
        }
        Ok(())
    }

    fn update_pdo_positions(&self, positions: &[[i32; JOINT_COUNT]; FINGER_COUNT]) {
        for (finger_id, finger) in positions.iter().enumerate() {
            for (joint_id, &raw) in finger.iter().enumerate() {
                self.store_pdo_position(finger_id, joint_id, raw);
            }
        }
    }

    fn store_pdo_position(&self, finger_id: usize, joint_id: usize, raw: i32) {
        let mut value = extract_raw_position(raw);
        if joint_id == 0 && finger_id != 0 {
            value = -value;
        }
        self.pdo_positions[finger_id][joint_id].store(value.to_bits(), Ordering::Relaxed);
    }

    fn bump_pdo_version(&self) {
        self.pdo_result_version.store(
            self.pdo_result_version.load(Ordering::Relaxed) + 1,
            Ordering::Release,
        );
    }

    fn update_error_code(&self, finger_id: usize, joint_id: usize, current: u32) {
        let previous =
            self.pdo_error_codes[finger_id][joint_id].swap(current, Ordering::Relaxed);
        if current == previous {
            return;
        }

        let mut newly_set = current & !previous;
        if newly_set == 0 {
            return;
        }

        for def in ERROR_DEFINITIONS {
            let mask = 1u32 << def.bit;
            if newly_set & mask == 0 {
                continue;
            }
            log_error_event(finger_id, joint_id, def);
            newly_set &= !mask;
        }

        if newly_set != 0 {
            error!(
                "Joint motor F{}J{} reports unknown exception(s): 0x{:X}",
                finger_id + 1,
                joint_id + 1,
                newly_set
            );
        }
    }

    fn snapshot_positions(&self) -> JointMatrix {
        let mut positions = [[0.0; JOINT_COUNT]; FINGER_COUNT];
        for (finger_id, finger) in positions.iter_mut().enumerate() {
            for (joint_id, position) in finger.iter_mut().enumerate() {
                *position =
                    f64::from_bits(self.pdo_positions[finger_id][joint_id].load(Ordering::Relaxed));
            }
        }
        positions
    }

    // ==================== SDO 引擎 ====================

    fn sdo_thread_main(&self, builder: &mut FrameBuilder, stop: &AtomicBool) {
        let period = Duration::from_secs_f64(1.0 / SDO_UPDATE_RATE);
        let sleeper = SpinSleeper::default();
        let mut heartbeat_ticks = 0u32;

        while !stop.load(Ordering::Relaxed) {
            heartbeat_ticks += 1;
            if heartbeat_ticks >= HEARTBEAT_TICK_DIVIDER {
                heartbeat_ticks = 0;
                self.heartbeat_tick();
            }

            let now_us = monotonic_micros();
            for unit in self.storage.iter() {
                Self::process_storage_unit(unit, now_us, builder);
            }
            self.process_raw_slots(builder);

            builder.finalize();
            sleeper.sleep(period);
        }
    }

    fn process_storage_unit(unit: &StorageUnit, now_us: u64, builder: &mut FrameBuilder) {
        let mut op = Operation::unpack(unit.operation.load(Ordering::Acquire));
        if op.mode == OpMode::None {
            return;
        }

        // 被屏蔽的对象立即成功，不产生传输
        if unit.info.has(policy::MASKED) {
            op.state = OpState::Success;
        }

        if op.state == OpState::Success {
            let completion = unit.completion.swap(None);
            op.mode = OpMode::None;
            unit.operation.store(op.pack(), Ordering::Release);
            if let Some(completion) = completion {
                completion.completer.complete(true);
            }
            return;
        }

        if op.state == OpState::Waiting {
            // 本节拍首次见到新操作：换算绝对截止时刻后立即进入发送分支
            let timeout_us = unit.timeout_us.load(Ordering::Relaxed);
            unit.deadline_us
                .store(now_us.saturating_add(timeout_us), Ordering::Relaxed);
            op.state = if op.mode == OpMode::Read {
                OpState::Reading
            } else {
                OpState::Writing
            };
            unit.operation.store(op.pack(), Ordering::Relaxed);
        } else if now_us >= unit.deadline_us.load(Ordering::Relaxed) {
            let completion = unit.completion.swap(None);
            op.mode = OpMode::None;
            unit.operation.store(op.pack(), Ordering::Release);
            if let Some(completion) = completion {
                completion.completer.complete(false);
            }
            return;
        }

        match op.state {
            OpState::Reading | OpState::WritingConfirming => {
                debug!(
                    "SDO read request: 0x{:04X}.{} ({:?}/{:?})",
                    unit.info.index, unit.info.sub_index, op.mode, op.state
                );
                let buf = builder.allocate(sdo::READ_REQUEST_LEN);
                sdo::encode_read(buf, unit.info.index, unit.info.sub_index);
            }
            OpState::Writing => {
                // 先进入确认态，下一节拍发出回读
                op.state = OpState::WritingConfirming;
                unit.operation.store(op.pack(), Ordering::Relaxed);

                let width = unit.info.width;
                let raw = unit.value.load(Ordering::Relaxed);
                let buf = builder.allocate(sdo::write_request_len(width));
                sdo::encode_write(buf, unit.info.index, unit.info.sub_index, raw, width);
            }
            _ => {}
        }
    }

    fn process_raw_slots(&self, builder: &mut FrameBuilder) {
        let now = Instant::now();
        for slot in &self.raw_sdo {
            if !slot.in_use.load(Ordering::Acquire) {
                continue;
            }
            let mut request = slot.request.lock();

            if matches!(
                request.phase,
                RawSdoPhase::Pending | RawSdoPhase::Reading | RawSdoPhase::Writing
            ) {
                if let Some(deadline) = request.deadline {
                    if now >= deadline {
                        request.phase = RawSdoPhase::Failed;
                        slot.condvar.notify_one();
                        continue;
                    }
                }
            }

            // 请求只在 PENDING 态发出一次
            if request.phase == RawSdoPhase::Pending {
                match request.mode {
                    RawSdoMode::Read => {
                        let buf = builder.allocate(sdo::READ_REQUEST_LEN);
                        sdo::encode_read(buf, request.index, request.sub_index);
                        request.phase = RawSdoPhase::Reading;
                    }
                    RawSdoMode::Write => {
                        let width = DataWidth::from_size(request.write_len);
                        let raw = u64::from_le_bytes(request.write_data);
                        let buf = builder.allocate(sdo::write_request_len(width));
                        sdo::encode_write(buf, request.index, request.sub_index, raw, width);
                        request.phase = RawSdoPhase::Writing;
                    }
                    RawSdoMode::None => {}
                }
            }
        }
    }

    fn heartbeat_tick(&self) {
        if !self.heartbeat_enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some(slot) = self.heartbeat_slot else {
            return;
        };
        let unit = &self.storage[slot];
        if Operation::unpack(unit.operation.load(Ordering::Relaxed)).mode != OpMode::None {
            return;
        }

        // 计数器自增后下发一次非受检写，防止设备侧看门狗超时
        let next = unit.value.load(Ordering::Relaxed).wrapping_add(1);
        unit.value.store(next, Ordering::Relaxed);
        unit.timeout_us
            .store(HEARTBEAT_TIMEOUT.as_micros() as u64, Ordering::Relaxed);
        unit.completion.store(None);
        unit.operation.store(
            Operation {
                mode: OpMode::Write,
                state: OpState::Waiting,
            }
            .pack(),
            Ordering::Release,
        );
    }

    // ==================== PDO 引擎 ====================

    fn pdo_read_request(&self, builder: &mut FrameBuilder) {
        let buf = builder.allocate(pdo::READ_REQUEST_LEN);
        pdo::encode_read(buf);
        builder.finalize();
    }

    fn pdo_write(
        &self,
        builder: &mut FrameBuilder,
        read_id: u8,
        targets: &JointMatrix,
        timestamp_us: u32,
    ) {
        let mut raw = [[0i32; JOINT_COUNT]; FINGER_COUNT];
        for (finger_id, finger) in targets.iter().enumerate() {
            for (joint_id, &target) in finger.iter().enumerate() {
                let mut value = to_raw_position(target);
                if joint_id == 0 && finger_id != 0 {
                    value = value.wrapping_neg();
                }
                raw[finger_id][joint_id] = value;
            }
        }

        let buf = builder.allocate(pdo::WRITE_REQUEST_LEN);
        pdo::encode_write(buf, read_id, &raw, timestamp_us);
        builder.finalize();
    }

    fn pdo_thread_main(
        &self,
        builder: &mut FrameBuilder,
        stop: &AtomicBool,
        controller: &mut dyn RealtimeController,
        upstream_enabled: bool,
    ) {
        controller.setup(PDO_UPDATE_RATE);

        if upstream_enabled {
            // 第一阶段：持续发送空读帧，直到收到一帧新鲜的上行数据
            let old_version = self.pdo_result_version.load(Ordering::Relaxed);
            tick::spin(PDO_UPDATE_RATE, stop, |_| {
                self.pdo_read_request(builder);
                self.pdo_result_version.load(Ordering::Acquire) == old_version
            });

            tick::spin(PDO_UPDATE_RATE, stop, |ctx| {
                let actual = self.snapshot_positions();
                let targets = controller.step(Some(&actual));
                self.pdo_write(
                    builder,
                    pdo::TPDO_POSITIONS,
                    &targets,
                    ctx.scheduled_elapsed_us(),
                );
                true
            });
        } else {
            tick::spin(PDO_UPDATE_RATE, stop, |ctx| {
                let targets = controller.step(None);
                self.pdo_write(builder, 0x00, &targets, ctx.scheduled_elapsed_us());
                true
            });
        }
    }
}

fn log_error_event(finger_id: usize, joint_id: usize, def: &ErrorDefinition) {
    match def.severity {
        Severity::Critical | Severity::Error => {
            error!(
                "Joint motor F{}J{} reports an exception: {}.",
                finger_id + 1,
                joint_id + 1,
                def.description
            );
            error!("Hint: {}", def.remedy);
        }
        Severity::Warn => {
            warn!(
                "Joint motor F{}J{} reports an exception: {}.",
                finger_id + 1,
                joint_id + 1,
                def.description
            );
            warn!("Hint: {}", def.remedy);
        }
    }
}

/// PDO 线程当前的占用者
enum PdoOccupant {
    Idle,
    Controller(JoinHandle<Box<dyn RealtimeController>>),
    Latency(JoinHandle<()>),
}

/// 协议处理器
///
/// 除标注为任意线程安全的访问器外，公开操作默认只允许在构造线程上
/// 调用；[`Handler::disable_thread_safe_check`] 可以关闭该检查，此时
/// 调用方必须自行用互斥量保证同一时刻只有一个线程在操作。
pub struct Handler {
    shared: Arc<Shared>,
    transport: SharedTransport,

    operation_thread: Mutex<Option<ThreadId>>,
    started: AtomicBool,

    sdo_stop: Arc<AtomicBool>,
    sdo_thread: Mutex<Option<JoinHandle<()>>>,

    pdo_stop: Arc<AtomicBool>,
    pdo_occupant: Mutex<PdoOccupant>,
    /// 手动实时写入路径使用的帧构造器（与 PDO 线程互斥）
    manual_pdo_builder: Mutex<Option<FrameBuilder>>,

    dropped_frames: Arc<AtomicU64>,
}

impl Handler {
    /// 创建处理器；`storage_unit_count` 为可寻址对象总数
    ///
    /// 构造线程被记录为操作线程。
    pub fn new(transport: SharedTransport, storage_unit_count: usize) -> Self {
        Self {
            shared: Arc::new(Shared::new(storage_unit_count)),
            transport,
            operation_thread: Mutex::new(Some(std::thread::current().id())),
            started: AtomicBool::new(false),
            sdo_stop: Arc::new(AtomicBool::new(false)),
            sdo_thread: Mutex::new(None),
            pdo_stop: Arc::new(AtomicBool::new(false)),
            pdo_occupant: Mutex::new(PdoOccupant::Idle),
            manual_pdo_builder: Mutex::new(None),
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 注册一个存储对象
    ///
    /// 只允许在 [`Handler::start_transmit_receive`] 之前调用。
    ///
    /// # Panics
    ///
    /// `storage_id` 超出构造时声明的对象总数时 panic。
    pub fn init_storage_info(
        &mut self,
        storage_id: usize,
        info: StorageInfo,
    ) -> Result<(), ProtocolError> {
        if self.started.load(Ordering::Relaxed) {
            return Err(ProtocolError::RegistrationClosed);
        }
        let shared = Arc::get_mut(&mut self.shared).ok_or(ProtocolError::RegistrationClosed)?;

        shared.storage[storage_id].info = info;
        shared
            .index_map
            .insert(index_map_key(info.index, info.sub_index), storage_id);

        if info.policy & policy::HOST_HEARTBEAT != 0 {
            shared.heartbeat_slot = Some(storage_id);
        }
        Ok(())
    }

    /// 按 `(index, sub_index)` 查询存储号
    pub fn storage_id(&self, index: u16, sub_index: u8) -> Option<usize> {
        self.shared
            .index_map
            .get(&index_map_key(index, sub_index))
            .copied()
    }

    /// 安装接收回调并启动 SDO 轮询线程
    pub fn start_transmit_receive(&self) -> Result<(), ProtocolError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ProtocolError::AlreadyStarted);
        }

        let mut builder = FrameBuilder::new(
            Arc::clone(&self.transport),
            FRAME_TYPE_SDO,
            Arc::clone(&self.dropped_frames),
        )?;

        {
            let shared = Arc::clone(&self.shared);
            self.transport
                .receive(Box::new(move |bytes| shared.handle_rx(bytes)))?;
        }

        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.sdo_stop);
        let thread = std::thread::Builder::new()
            .name("dexhand-sdo".into())
            .spawn(move || shared.sdo_thread_main(&mut builder, &stop))?;
        *self.sdo_thread.lock() = Some(thread);
        Ok(())
    }

    /// 发起非受检异步读：结果被静默丢弃，单元忙时直接返回
    pub fn read_async_unchecked(
        &self,
        storage_id: usize,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        self.operation_thread_check()?;
        let unit = &self.shared.storage[storage_id];

        if Operation::unpack(unit.operation.load(Ordering::Relaxed)).mode != OpMode::None {
            return Ok(());
        }

        unit.timeout_us.store(timeout_us(timeout), Ordering::Relaxed);
        unit.completion.store(None);
        unit.operation.store(
            Operation {
                mode: OpMode::Read,
                state: OpState::Waiting,
            }
            .pack(),
            Ordering::Release,
        );
        Ok(())
    }

    /// 发起受检异步读，完成时在 SDO 线程上回调 `completer`
    pub fn read_async(
        &self,
        storage_id: usize,
        timeout: Duration,
        completer: Arc<dyn Completer>,
    ) -> Result<(), ProtocolError> {
        self.operation_thread_check()?;
        let unit = &self.shared.storage[storage_id];

        if Operation::unpack(unit.operation.load(Ordering::Relaxed)).mode != OpMode::None {
            return Err(ProtocolError::OperationInFlight(storage_id));
        }

        unit.timeout_us.store(timeout_us(timeout), Ordering::Relaxed);
        unit.completion.store(Some(Arc::new(Completion { completer })));
        unit.operation.store(
            Operation {
                mode: OpMode::Read,
                state: OpState::Waiting,
            }
            .pack(),
            Ordering::Release,
        );
        Ok(())
    }

    /// 发起非受检异步写
    pub fn write_async_unchecked(
        &self,
        data: Buffer8,
        storage_id: usize,
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        self.operation_thread_check()?;
        let unit = &self.shared.storage[storage_id];

        unit.store_data(data);

        if Operation::unpack(unit.operation.load(Ordering::Relaxed)).mode != OpMode::None {
            return Ok(());
        }

        unit.timeout_us.store(timeout_us(timeout), Ordering::Relaxed);
        unit.completion.store(None);
        unit.operation.store(
            Operation {
                mode: OpMode::Write,
                state: OpState::Waiting,
            }
            .pack(),
            Ordering::Release,
        );
        Ok(())
    }

    /// 发起受检异步写
    pub fn write_async(
        &self,
        data: Buffer8,
        storage_id: usize,
        timeout: Duration,
        completer: Arc<dyn Completer>,
    ) -> Result<(), ProtocolError> {
        self.operation_thread_check()?;
        let unit = &self.shared.storage[storage_id];

        if Operation::unpack(unit.operation.load(Ordering::Relaxed)).mode != OpMode::None {
            return Err(ProtocolError::OperationInFlight(storage_id));
        }

        unit.store_data(data);
        unit.timeout_us.store(timeout_us(timeout), Ordering::Relaxed);
        unit.completion.store(Some(Arc::new(Completion { completer })));
        unit.operation.store(
            Operation {
                mode: OpMode::Write,
                state: OpState::Waiting,
            }
            .pack(),
            Ordering::Release,
        );
        Ok(())
    }

    /// 读取缓存值（任意线程安全）
    pub fn get(&self, storage_id: usize) -> Buffer8 {
        self.shared.storage[storage_id].load_data()
    }

    /// 读取版本号（任意线程安全；0 表示从未成功读到）
    pub fn version(&self, storage_id: usize) -> u32 {
        self.shared.storage[storage_id]
            .version
            .load(Ordering::Acquire)
    }

    /// 使能主机心跳：SDO 引擎周期性写入心跳对象防止设备看门狗复位
    pub fn enable_host_heartbeat(&self) {
        self.shared.heartbeat_enabled.store(true, Ordering::Relaxed);
    }

    /// 最近一次 PDO 上行数据中的实际位置快照（任意线程安全）
    pub fn realtime_get_joint_actual_position(&self) -> JointMatrix {
        self.shared.snapshot_positions()
    }

    /// 最近一次 PDO 上行数据中的逐关节错误码（任意线程安全）
    pub fn realtime_get_joint_error_code(&self) -> [[u32; JOINT_COUNT]; FINGER_COUNT] {
        let mut codes = [[0u32; JOINT_COUNT]; FINGER_COUNT];
        for (finger_id, finger) in codes.iter_mut().enumerate() {
            for (joint_id, code) in finger.iter_mut().enumerate() {
                *code = self.shared.pdo_error_codes[finger_id][joint_id].load(Ordering::Relaxed);
            }
        }
        codes
    }

    /// 手动流式下发一帧目标位置（未挂载控制器时可用）
    pub fn realtime_set_joint_target_position(
        &self,
        positions: &JointMatrix,
    ) -> Result<(), ProtocolError> {
        self.operation_thread_check()?;

        let occupant = self.pdo_occupant.lock();
        if !matches!(*occupant, PdoOccupant::Idle) {
            return Err(ProtocolError::ControllerAttached);
        }

        let mut builder_guard = self.manual_pdo_builder.lock();
        if builder_guard.is_none() {
            *builder_guard = Some(FrameBuilder::new(
                Arc::clone(&self.transport),
                FRAME_TYPE_PDO,
                Arc::clone(&self.dropped_frames),
            )?);
        }
        if let Some(builder) = builder_guard.as_mut() {
            self.shared
                .pdo_write(builder, pdo::TPDO_POSITIONS, positions, 0);
        }
        Ok(())
    }

    /// 挂载实时控制器并启动 PDO 线程
    pub fn attach_realtime_controller(
        &self,
        controller: Box<dyn RealtimeController>,
        enable_upstream: bool,
    ) -> Result<(), ProtocolError> {
        self.operation_thread_check()?;

        let mut occupant = self.pdo_occupant.lock();
        match *occupant {
            PdoOccupant::Idle => {}
            PdoOccupant::Controller(_) => return Err(ProtocolError::ControllerAttached),
            PdoOccupant::Latency(_) => return Err(ProtocolError::LatencyTestRunning),
        }

        let mut builder = FrameBuilder::new(
            Arc::clone(&self.transport),
            FRAME_TYPE_PDO,
            Arc::clone(&self.dropped_frames),
        )?;

        self.pdo_stop.store(false, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let stop = Arc::clone(&self.pdo_stop);
        let thread = std::thread::Builder::new()
            .name("dexhand-pdo".into())
            .spawn(move || {
                let mut controller = controller;
                shared.pdo_thread_main(&mut builder, &stop, controller.as_mut(), enable_upstream);
                controller
            })?;

        *occupant = PdoOccupant::Controller(thread);
        Ok(())
    }

    /// 停止 PDO 线程并取回控制器
    pub fn detach_realtime_controller(
        &self,
    ) -> Result<Box<dyn RealtimeController>, ProtocolError> {
        self.operation_thread_check()?;

        let mut occupant = self.pdo_occupant.lock();
        let thread = match std::mem::replace(&mut *occupant, PdoOccupant::Idle) {
            PdoOccupant::Controller(thread) => thread,
            other => {
                *occupant = other;
                return Err(ProtocolError::NoController);
            }
        };

        self.pdo_stop.store(true, Ordering::Relaxed);
        thread
            .join()
            .map_err(|_| ProtocolError::RealtimeThreadPanicked)
    }

    /// 启动 PDO 链路延迟测试
    pub fn start_latency_test(&self) -> Result<(), ProtocolError> {
        self.operation_thread_check()?;

        let mut occupant = self.pdo_occupant.lock();
        match *occupant {
            PdoOccupant::Idle => {}
            PdoOccupant::Controller(_) => return Err(ProtocolError::ControllerAttached),
            PdoOccupant::Latency(_) => return Err(ProtocolError::LatencyTestRunning),
        }

        let mut builder = FrameBuilder::new(
            Arc::clone(&self.transport),
            FRAME_TYPE_PDO,
            Arc::clone(&self.dropped_frames),
        )?;

        let tester = Arc::new(LatencyTester::new());
        *self.shared.latency.lock() = Some(Arc::clone(&tester));

        self.pdo_stop.store(false, Ordering::Relaxed);
        let stop = Arc::clone(&self.pdo_stop);
        let thread = std::thread::Builder::new()
            .name("dexhand-pdo".into())
            .spawn(move || tester.spin(&mut builder, &stop))?;

        *occupant = PdoOccupant::Latency(thread);
        Ok(())
    }

    /// 停止延迟测试
    pub fn stop_latency_test(&self) -> Result<(), ProtocolError> {
        self.operation_thread_check()?;

        let mut occupant = self.pdo_occupant.lock();
        let thread = match std::mem::replace(&mut *occupant, PdoOccupant::Idle) {
            PdoOccupant::Latency(thread) => thread,
            other => {
                *occupant = other;
                return Err(ProtocolError::LatencyTestNotStarted);
            }
        };

        self.pdo_stop.store(true, Ordering::Relaxed);
        thread
            .join()
            .map_err(|_| ProtocolError::RealtimeThreadPanicked)?;
        *self.shared.latency.lock() = None;
        Ok(())
    }

    /// 对任意 `(index, sub_index)` 发起带外读（阻塞到完成或超时）
    pub fn raw_sdo_read(
        &self,
        index: u16,
        sub_index: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        self.operation_thread_check()?;

        let slot = self
            .shared
            .raw_sdo
            .iter()
            .find(|slot| slot.try_claim())
            .ok_or(ProtocolError::RawSdoBusy)?;

        {
            let mut request = slot.request.lock();
            request.index = index;
            request.sub_index = sub_index;
            request.mode = RawSdoMode::Read;
            request.phase = RawSdoPhase::Pending;
            request.read_result.clear();
            request.deadline = deadline_after(timeout);
        }

        let success = slot.wait_for_completion();
        let result = std::mem::take(&mut slot.request.lock().read_result);
        slot.release();

        if success {
            Ok(result)
        } else {
            Err(ProtocolError::RawSdoTimeout {
                operation: "read",
                index,
                sub_index,
            })
        }
    }

    /// 对任意 `(index, sub_index)` 发起带外写（阻塞到完成或超时）
    ///
    /// 写数据暂存在槽位中，实际请求帧由 SDO 线程发出。
    pub fn raw_sdo_write(
        &self,
        index: u16,
        sub_index: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), ProtocolError> {
        self.operation_thread_check()?;

        if !matches!(data.len(), 1 | 2 | 4 | 8) {
            return Err(ProtocolError::InvalidRawSdoSize(data.len()));
        }

        let slot = self
            .shared
            .raw_sdo
            .iter()
            .find(|slot| slot.try_claim())
            .ok_or(ProtocolError::RawSdoBusy)?;

        {
            let mut request = slot.request.lock();
            request.index = index;
            request.sub_index = sub_index;
            request.mode = RawSdoMode::Write;
            request.phase = RawSdoPhase::Pending;
            request.write_data = [0; 8];
            request.write_data[..data.len()].copy_from_slice(data);
            request.write_len = data.len();
            request.deadline = deadline_after(timeout);
        }

        let success = slot.wait_for_completion();
        slot.release();

        if success {
            Ok(())
        } else {
            Err(ProtocolError::RawSdoTimeout {
                operation: "write",
                index,
                sub_index,
            })
        }
    }

    /// 关闭操作线程检查
    ///
    /// 关闭后由调用方负责用互斥量串行化所有操作。
    pub fn disable_thread_safe_check(&self) {
        *self.operation_thread.lock() = None;
    }

    /// 被动丢帧计数（发送缓冲池耗尽导致）
    pub fn dropped_frame_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    fn operation_thread_check(&self) -> Result<(), ProtocolError> {
        match *self.operation_thread.lock() {
            None => Ok(()),
            Some(id) if id == std::thread::current().id() => Ok(()),
            Some(_) => Err(ProtocolError::WrongThread),
        }
    }
}

impl Drop for Handler {
    fn drop(&mut self) {
        self.sdo_stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.sdo_thread.lock().take() {
            let _ = thread.join();
        }

        self.pdo_stop.store(true, Ordering::Relaxed);
        match std::mem::replace(&mut *self.pdo_occupant.lock(), PdoOccupant::Idle) {
            PdoOccupant::Idle => {}
            PdoOccupant::Controller(thread) => {
                let _ = thread.join();
            }
            PdoOccupant::Latency(thread) => {
                let _ = thread.join();
            }
        }
    }
}

fn timeout_us(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX)
}
