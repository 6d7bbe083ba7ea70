//! 存储单元
//!
//! SDO 引擎的核心数据结构：每个可寻址对象对应一个 64 字节对齐的存储单元，
//! 持有描述符、8 字节值缓存、单调版本号、原子操作状态机、超时与完成回调。
//! 数值翻译（控制字、弧度↔原始计数、安培↔毫安）在存入/取出缓存时完成，
//! 线缆上永远只有原始整数。

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::sync::Completer;

/// 存储策略位
///
/// 数值翻译层据此决定对外类型与线上编码。
pub mod policy {
    /// 无特殊策略：按声明宽度逐字节拷贝
    pub const NONE: u32 = 0;
    /// 该对象被配置为跳过：操作立即成功且不产生任何传输
    pub const MASKED: u32 = 1 << 0;
    /// 对外布尔值，线上为 u16（true=1，false=5）
    pub const CONTROL_WORD: u32 = 1 << 1;
    /// 对外弧度（f64），线上为 i32 计数（`i32::MAX` ≡ 2π）
    pub const POSITION: u32 = 1 << 2;
    /// 在 POSITION 基础上，存取均对原始值取负
    pub const POSITION_REVERSED: u32 = 1 << 3;
    /// 对外安培（f64），线上为 u16 毫安
    pub const EFFORT_LIMIT: u32 = 1 << 4;
    /// 主机心跳对象：引擎周期性写入以喂狗
    pub const HOST_HEARTBEAT: u32 = 1 << 6;
}

/// 线上数值宽度
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DataWidth {
    W1,
    W2,
    W4,
    W8,
}

impl DataWidth {
    pub const fn bytes(self) -> usize {
        match self {
            DataWidth::W1 => 1,
            DataWidth::W2 => 2,
            DataWidth::W4 => 4,
            DataWidth::W8 => 8,
        }
    }

    /// 按宽度截断 8 字节缓存的比较掩码
    pub(crate) const fn mask(self) -> u64 {
        match self {
            DataWidth::W1 => 0xFF,
            DataWidth::W2 => 0xFFFF,
            DataWidth::W4 => 0xFFFF_FFFF,
            DataWidth::W8 => u64::MAX,
        }
    }

    pub const fn from_size(size: usize) -> DataWidth {
        match size {
            1 => DataWidth::W1,
            2 => DataWidth::W2,
            4 => DataWidth::W4,
            _ => DataWidth::W8,
        }
    }
}

/// 存储对象描述符
#[derive(Clone, Copy, Debug)]
pub struct StorageInfo {
    pub index: u16,
    pub sub_index: u8,
    pub width: DataWidth,
    pub policy: u32,
}

impl StorageInfo {
    pub const fn new(data_size: usize, index: u16, sub_index: u8, policy: u32) -> Self {
        Self {
            index,
            sub_index,
            width: DataWidth::from_size(data_size),
            policy,
        }
    }

    pub(crate) fn has(&self, bit: u32) -> bool {
        self.policy & bit != 0
    }
}

impl Default for StorageInfo {
    fn default() -> Self {
        StorageInfo::new(1, 0, 0, policy::NONE)
    }
}

/// 8 字节类型擦除值
///
/// 所有对象的对外值都放得进 8 字节；解释方式由存储单元的宽度和策略决定。
/// 窄类型零扩展存放，便于与入站响应整体比较。
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct Buffer8([u8; 8]);

impl Buffer8 {
    pub fn from_bits(bits: u64) -> Self {
        Buffer8(bits.to_le_bytes())
    }

    pub fn bits(self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    pub fn from_bool(v: bool) -> Self {
        Self::from_bits(v as u64)
    }

    pub fn as_bool(self) -> bool {
        self.0[0] != 0
    }

    pub fn from_u8(v: u8) -> Self {
        Self::from_bits(v as u64)
    }

    pub fn as_u8(self) -> u8 {
        self.0[0]
    }

    pub fn from_u16(v: u16) -> Self {
        Self::from_bits(v as u64)
    }

    pub fn as_u16(self) -> u16 {
        u16::from_le_bytes([self.0[0], self.0[1]])
    }

    pub fn from_u32(v: u32) -> Self {
        Self::from_bits(v as u64)
    }

    pub fn as_u32(self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn from_u64(v: u64) -> Self {
        Self::from_bits(v)
    }

    pub fn as_u64(self) -> u64 {
        self.bits()
    }

    pub fn from_i32(v: i32) -> Self {
        Self::from_bits(v as u32 as u64)
    }

    pub fn as_i32(self) -> i32 {
        self.as_u32() as i32
    }

    pub fn from_f32(v: f32) -> Self {
        Self::from_bits(v.to_bits() as u64)
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.as_u32())
    }

    pub fn from_f64(v: f64) -> Self {
        Self::from_bits(v.to_bits())
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.bits())
    }
}

/// 可放入 [`Buffer8`] 的标量类型
pub trait Scalar: Copy + Send + 'static {
    const SIZE: usize;
    fn into_buffer8(self) -> Buffer8;
    fn from_buffer8(value: Buffer8) -> Self;
}

macro_rules! impl_scalar {
    ($($ty:ty => ($from:ident, $as:ident);)+) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();
                fn into_buffer8(self) -> Buffer8 {
                    Buffer8::$from(self)
                }
                fn from_buffer8(value: Buffer8) -> Self {
                    value.$as()
                }
            }
        )+
    };
}

impl_scalar! {
    bool => (from_bool, as_bool);
    u8 => (from_u8, as_u8);
    u16 => (from_u16, as_u16);
    u32 => (from_u32, as_u32);
    u64 => (from_u64, as_u64);
    i32 => (from_i32, as_i32);
    f32 => (from_f32, as_f32);
    f64 => (from_f64, as_f64);
}

/// 操作模式
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum OpMode {
    None = 0,
    Read = 1,
    Write = 2,
}

/// 操作状态
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum OpState {
    Success = 0,
    Waiting = 1,
    Reading = 2,
    Writing = 3,
    WritingConfirming = 4,
}

/// 原子可交换的 `{mode, state}` 对，打包进一个 u32
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Operation {
    pub mode: OpMode,
    pub state: OpState,
}

impl Operation {
    pub(crate) const IDLE: Operation = Operation {
        mode: OpMode::None,
        state: OpState::Success,
    };

    pub(crate) fn pack(self) -> u32 {
        ((self.mode as u32) << 16) | self.state as u32
    }

    pub(crate) fn unpack(word: u32) -> Operation {
        let mode = match word >> 16 {
            0 => OpMode::None,
            1 => OpMode::Read,
            _ => OpMode::Write,
        };
        let state = match word & 0xFFFF {
            0 => OpState::Success,
            1 => OpState::Waiting,
            2 => OpState::Reading,
            3 => OpState::Writing,
            _ => OpState::WritingConfirming,
        };
        Operation { mode, state }
    }
}

/// 完成回调载荷
///
/// 由调用线程写入、SDO 线程取走并调用；`ArcSwapOption` 保证交接无锁。
pub(crate) struct Completion {
    pub completer: Arc<dyn Completer>,
}

/// 存储单元
///
/// 缓存值与版本号构成 release/acquire 配对：读到版本 N 的线程
/// 必然读到发布版本 N 之前写入的值。
#[repr(align(64))]
pub(crate) struct StorageUnit {
    pub info: StorageInfo,

    /// 打包的 `{mode, state}`；调用方以 release 发布新操作，引擎以 acquire 读取
    pub operation: AtomicU32,
    /// 单调递增版本号，0 保留为"从未写入"
    pub version: AtomicU32,
    /// 8 字节原始值缓存
    pub value: AtomicU64,

    /// 调用方设定的超时（微秒，饱和；`u64::MAX` 表示永不超时）
    pub timeout_us: AtomicU64,
    /// 首次发送后由引擎推进的绝对截止时刻（进程启动起算的微秒数）
    pub deadline_us: AtomicU64,

    pub completion: ArcSwapOption<Completion>,
}

impl Default for StorageUnit {
    fn default() -> Self {
        Self {
            info: StorageInfo::default(),
            operation: AtomicU32::new(Operation::IDLE.pack()),
            version: AtomicU32::new(0),
            value: AtomicU64::new(0),
            timeout_us: AtomicU64::new(0),
            deadline_us: AtomicU64::new(u64::MAX),
            completion: ArcSwapOption::const_empty(),
        }
    }
}

impl StorageUnit {
    /// 按策略翻译后存入缓存（调用线程 / SDO 线程均可，relaxed）
    pub(crate) fn store_data(&self, data: Buffer8) {
        let raw = if self.info.has(policy::CONTROL_WORD) {
            Buffer8::from_u16(if data.as_bool() { 1 } else { 5 })
        } else if self.info.has(policy::POSITION) {
            let mut value = to_raw_position(data.as_f64());
            if self.info.has(policy::POSITION_REVERSED) {
                value = value.wrapping_neg();
            }
            Buffer8::from_i32(value)
        } else if self.info.has(policy::EFFORT_LIMIT) {
            Buffer8::from_u16(to_raw_effort(data.as_f64()))
        } else {
            data
        };
        self.value.store(raw.bits(), Ordering::Relaxed);
    }

    /// 从缓存取出并按策略翻译为对外值
    pub(crate) fn load_data(&self) -> Buffer8 {
        let raw = Buffer8::from_bits(self.value.load(Ordering::Relaxed));

        if self.info.has(policy::CONTROL_WORD) {
            Buffer8::from_bool(raw.as_u16() == 1)
        } else if self.info.has(policy::POSITION) {
            let mut value = extract_raw_position(raw.as_i32());
            if self.info.has(policy::POSITION_REVERSED) {
                value = -value;
            }
            Buffer8::from_f64(value)
        } else if self.info.has(policy::EFFORT_LIMIT) {
            Buffer8::from_f64(raw.as_u16() as f64 / 1000.0)
        } else {
            raw
        }
    }

    /// 读响应到达时发布新值：先写值，再以 release 发布版本号（跳过 0）
    pub(crate) fn publish_value(&self, raw: u64) {
        self.value.store(raw, Ordering::Relaxed);
        let mut next = self.version.load(Ordering::Relaxed).wrapping_add(1);
        if next == 0 {
            next = 1;
        }
        self.version.store(next, Ordering::Release);
    }
}

/// 弧度 → 原始 i32 计数（先钳位再取整）
pub(crate) fn to_raw_position(angle: f64) -> i32 {
    (angle * (i32::MAX as f64 / TAU))
        .clamp(i32::MIN as f64, i32::MAX as f64)
        .round() as i32
}

/// 原始 i32 计数 → 弧度
pub(crate) fn extract_raw_position(raw: i32) -> f64 {
    raw as f64 * (TAU / i32::MAX as f64)
}

/// 安培 → 毫安（u16，先钳位再取整）
pub(crate) fn to_raw_effort(ampere: f64) -> u16 {
    (ampere * 1000.0).clamp(0.0, u16::MAX as f64).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_with_policy(policy_bits: u32, size: usize) -> StorageUnit {
        StorageUnit {
            info: StorageInfo::new(size, 0x0100, 0, policy_bits),
            ..StorageUnit::default()
        }
    }

    #[test]
    fn test_operation_pack_roundtrip() {
        for mode in [OpMode::None, OpMode::Read, OpMode::Write] {
            for state in [
                OpState::Success,
                OpState::Waiting,
                OpState::Reading,
                OpState::Writing,
                OpState::WritingConfirming,
            ] {
                let op = Operation { mode, state };
                assert_eq!(Operation::unpack(op.pack()), op);
            }
        }
    }

    #[test]
    fn test_position_roundtrip_error_bound() {
        let unit = unit_with_policy(policy::POSITION, 4);
        let tolerance = TAU / i32::MAX as f64;

        for angle in [
            -std::f64::consts::PI,
            -1.0,
            -0.001,
            0.0,
            0.5,
            1.234,
            std::f64::consts::PI,
        ] {
            unit.store_data(Buffer8::from_f64(angle));
            let back = unit.load_data().as_f64();
            assert!(
                (back - angle).abs() <= tolerance,
                "angle {angle} round-tripped to {back}"
            );
        }
    }

    #[test]
    fn test_position_clamps_out_of_range() {
        let unit = unit_with_policy(policy::POSITION, 4);
        unit.store_data(Buffer8::from_f64(1.0e9));
        assert_eq!(
            Buffer8::from_bits(unit.value.load(Ordering::Relaxed)).as_i32(),
            i32::MAX
        );
    }

    #[test]
    fn test_reversed_position_negates_raw() {
        let forward = unit_with_policy(policy::POSITION, 4);
        let reversed = unit_with_policy(policy::POSITION | policy::POSITION_REVERSED, 4);

        forward.store_data(Buffer8::from_f64(0.75));
        reversed.store_data(Buffer8::from_f64(0.75));

        let raw_forward = Buffer8::from_bits(forward.value.load(Ordering::Relaxed)).as_i32();
        let raw_reversed = Buffer8::from_bits(reversed.value.load(Ordering::Relaxed)).as_i32();
        assert_eq!(raw_forward, -raw_reversed);

        // 取出方向同样取负，往返后恢复原值
        let back = reversed.load_data().as_f64();
        assert!((back - 0.75).abs() <= TAU / i32::MAX as f64);
    }

    #[test]
    fn test_control_word_encoding() {
        let unit = unit_with_policy(policy::CONTROL_WORD, 2);

        unit.store_data(Buffer8::from_bool(true));
        assert_eq!(
            Buffer8::from_bits(unit.value.load(Ordering::Relaxed)).as_u16(),
            1
        );
        assert!(unit.load_data().as_bool());

        unit.store_data(Buffer8::from_bool(false));
        assert_eq!(
            Buffer8::from_bits(unit.value.load(Ordering::Relaxed)).as_u16(),
            5
        );
        assert!(!unit.load_data().as_bool());

        // 其他任意原始值取出均为 false
        unit.value.store(0x0003, Ordering::Relaxed);
        assert!(!unit.load_data().as_bool());
    }

    #[test]
    fn test_effort_limit_ampere_to_milliampere() {
        let unit = unit_with_policy(policy::EFFORT_LIMIT, 2);

        unit.store_data(Buffer8::from_f64(0.5));
        assert_eq!(
            Buffer8::from_bits(unit.value.load(Ordering::Relaxed)).as_u16(),
            500
        );
        assert!((unit.load_data().as_f64() - 0.5).abs() < 1e-9);

        // 超出 u16 毫安范围时钳位
        unit.store_data(Buffer8::from_f64(1000.0));
        assert_eq!(
            Buffer8::from_bits(unit.value.load(Ordering::Relaxed)).as_u16(),
            u16::MAX
        );
    }

    #[test]
    fn test_plain_value_raw_copy() {
        let unit = unit_with_policy(policy::NONE, 4);
        unit.store_data(Buffer8::from_u32(0x1234_5678));
        assert_eq!(unit.load_data().as_u32(), 0x1234_5678);
    }

    #[test]
    fn test_publish_value_skips_version_zero() {
        let unit = unit_with_policy(policy::NONE, 4);
        assert_eq!(unit.version.load(Ordering::Acquire), 0);

        unit.publish_value(42);
        assert_eq!(unit.version.load(Ordering::Acquire), 1);

        // 回绕时跳过 0
        unit.version.store(u32::MAX, Ordering::Relaxed);
        unit.publish_value(43);
        assert_eq!(unit.version.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_buffer8_zero_extends_narrow_types() {
        assert_eq!(Buffer8::from_u16(0xABCD).bits(), 0xABCD);
        assert_eq!(Buffer8::from_i32(-1).bits(), 0xFFFF_FFFF);
        assert_eq!(Buffer8::from_i32(-1).as_i32(), -1);
    }
}
