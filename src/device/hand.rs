//! 整手视图
//!
//! 设备入口：Builder 完成 USB 选择、对象注册与启动握手（固件版本
//! 检查、特性探测、关节初始配置），之后的手部级 / 关节级数据操作、
//! 实时控制挂载与延迟测试都从这里出发。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::data::{
    self, hand as hand_data, joint as joint_data, FirmwareVersionData, HandData, JointData,
    JointSlot, Readable, Writable,
};
use crate::filter::LowPass;
use crate::protocol::storage::Scalar;
use crate::protocol::{
    Handler, JointMatrix, RealtimeController, FINGER_COUNT, JOINT_COUNT,
};
use crate::sync::{Completer, Latch};
use crate::usb::{SharedTransport, UsbTransport};

use super::controller::{FilteredController, TargetInbox};
use super::finger::Finger;
use super::joint::Joint;
use super::{HandError, DEFAULT_TIMEOUT};

/// 默认厂商 ID（STMicroelectronics）
pub const DEFAULT_USB_VID: u16 = 0x0483;

/// 最低支持的脊柱板固件版本
const MINIMUM_FIRMWARE: FirmwareVersionData = FirmwareVersionData::new(3, 0, 0, 0);
/// 提供全系统版本号的最低固件
const FULL_SYSTEM_VERSION_FIRMWARE: FirmwareVersionData = FirmwareVersionData::new(3, 1, 0, b'D');
/// 支持固件侧位置滤波的最低关节固件
const FIRMWARE_FILTER_JOINT_FIRMWARE: FirmwareVersionData = FirmwareVersionData::new(6, 4, 0, b'J');
/// 支持 RPDO 直接分发的最低脊柱固件
const RPDO_DIRECT_FIRMWARE: FirmwareVersionData = FirmwareVersionData::new(3, 2, 0, b'B');
/// 支持 TPDO 主动上报的最低全系统版本
const TPDO_PROACTIVE_FULL_SYSTEM: FirmwareVersionData = FirmwareVersionData::new(1, 1, 0, 0);

#[derive(Clone, Copy, Default)]
struct Features {
    firmware_filter: bool,
    rpdo_directly_distribute: bool,
    tpdo_proactively_report: bool,
}

/// 五指灵巧手
pub struct Hand {
    handler: Handler,
    features: Features,
}

/// [`Hand`] 的链式构造器
///
/// # 示例
///
/// ```rust,no_run
/// use dexhand_sdk::Hand;
///
/// # fn main() -> Result<(), dexhand_sdk::HandError> {
/// // 默认配置：接受任意 0x0483 设备（要求唯一）
/// let hand = Hand::builder().build()?;
///
/// // 指定序列号与屏蔽小指远端关节
/// let mut mask = [[false; 4]; 5];
/// mask[4][3] = true;
/// let hand = Hand::builder()
///     .serial_number("HAND001")
///     .mask(mask)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct HandBuilder {
    serial_number: Option<String>,
    usb_pid: Option<u16>,
    usb_vid: u16,
    mask: [[bool; JOINT_COUNT]; FINGER_COUNT],
    transport: Option<SharedTransport>,
}

impl HandBuilder {
    pub fn new() -> Self {
        Self {
            serial_number: None,
            usb_pid: None,
            usb_vid: DEFAULT_USB_VID,
            mask: [[false; JOINT_COUNT]; FINGER_COUNT],
            transport: None,
        }
    }

    /// 按序列号过滤设备
    pub fn serial_number(mut self, serial_number: impl Into<String>) -> Self {
        self.serial_number = Some(serial_number.into());
        self
    }

    /// 按产品 ID 过滤设备（默认接受厂商下所有产品）
    pub fn usb_pid(mut self, usb_pid: u16) -> Self {
        self.usb_pid = Some(usb_pid);
        self
    }

    /// 覆盖厂商 ID
    pub fn usb_vid(mut self, usb_vid: u16) -> Self {
        self.usb_vid = usb_vid;
        self
    }

    /// 屏蔽关节：`mask[finger][joint] == true` 的关节所有对象操作
    /// 立即成功且不产生传输
    pub fn mask(mut self, mask: [[bool; JOINT_COUNT]; FINGER_COUNT]) -> Self {
        self.mask = mask;
        self
    }

    /// 注入自定义传输层（仿真与测试）；设置后忽略 USB 过滤参数
    pub fn transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 连接设备并完成初始化握手
    pub fn build(self) -> Result<Hand, HandError> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(UsbTransport::new(
                self.usb_vid,
                self.usb_pid,
                self.serial_number.as_deref(),
            )?),
        };

        let mut handler = Handler::new(transport, data::TOTAL_OBJECT_COUNT);
        register_objects(&mut handler, &self.mask)?;
        handler.start_transmit_receive()?;

        let mut hand = Hand {
            handler,
            features: Features::default(),
        };

        hand.check_firmware_version()?;

        if hand.features.tpdo_proactively_report {
            hand.handler.enable_host_heartbeat();
        }

        hand.initial_joint_configuration()
            .map_err(|e| match e {
                HandError::Timeout(_) => HandError::InitTimeout,
                other => other,
            })?;

        Ok(hand)
    }
}

impl Default for HandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 按表序注册全部对象：先手部级，再按 手指×关节 展开关节级
fn register_objects(
    handler: &mut Handler,
    mask: &[[bool; JOINT_COUNT]; FINGER_COUNT],
) -> Result<(), HandError> {
    let mut storage_id = 0;

    for descriptor in hand_data::HAND_REGISTRY {
        handler.init_storage_info(storage_id, descriptor(None))?;
        storage_id += 1;
    }

    for finger_id in 0..FINGER_COUNT {
        for joint_id in 0..JOINT_COUNT {
            let slot: JointSlot = Some((finger_id, joint_id));
            for descriptor in joint_data::JOINT_REGISTRY {
                let mut info = descriptor(slot);
                info.index += data::joint_index_offset(finger_id, joint_id);
                if mask[finger_id][joint_id] {
                    info.policy |= crate::protocol::policy::MASKED;
                }
                handler.init_storage_info(storage_id, info)?;
                storage_id += 1;
            }
        }
    }

    debug_assert_eq!(storage_id, data::TOTAL_OBJECT_COUNT);
    Ok(())
}

impl Hand {
    pub fn builder() -> HandBuilder {
        HandBuilder::new()
    }

    pub(crate) fn handler(&self) -> &Handler {
        &self.handler
    }

    // ==================== 手指访问 ====================

    /// 取手指视图，`finger_id ∈ 0..5`
    pub fn finger(&self, finger_id: usize) -> Result<Finger<'_>, HandError> {
        if finger_id >= FINGER_COUNT {
            return Err(HandError::IndexOutOfRange {
                what: "finger index",
                limit: FINGER_COUNT,
                got: finger_id,
            });
        }
        Ok(Finger::new(self, finger_id))
    }

    pub fn finger_thumb(&self) -> Finger<'_> {
        Finger::new(self, 0)
    }

    pub fn finger_index(&self) -> Finger<'_> {
        Finger::new(self, 1)
    }

    pub fn finger_middle(&self) -> Finger<'_> {
        Finger::new(self, 2)
    }

    pub fn finger_ring(&self) -> Finger<'_> {
        Finger::new(self, 3)
    }

    pub fn finger_little(&self) -> Finger<'_> {
        Finger::new(self, 4)
    }

    // ==================== 手部级数据操作 ====================

    fn hand_storage_id<D: HandData>(&self) -> Result<usize, HandError> {
        let info = D::info(None);
        self.handler
            .storage_id(info.index, info.sub_index)
            .ok_or(HandError::ObjectNotRegistered {
                index: info.index,
                sub_index: info.sub_index,
            })
    }

    /// 同步读手部级对象
    pub fn read<D: HandData + Readable>(&self) -> Result<D::Value, HandError> {
        self.read_timeout::<D>(DEFAULT_TIMEOUT)
    }

    pub fn read_timeout<D: HandData + Readable>(
        &self,
        timeout: Duration,
    ) -> Result<D::Value, HandError> {
        let latch = Arc::new(Latch::new());
        self.read_async::<D>(&latch, timeout)?;
        latch.wait()?;
        self.get::<D>()
    }

    pub fn read_async<D: HandData + Readable>(
        &self,
        latch: &Arc<Latch>,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let id = self.hand_storage_id::<D>()?;
        latch.count_up();
        if let Err(e) =
            self.handler
                .read_async(id, timeout, Arc::clone(latch) as Arc<dyn Completer>)
        {
            latch.count_down(false);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn read_async_unchecked<D: HandData + Readable>(
        &self,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let id = self.hand_storage_id::<D>()?;
        self.handler.read_async_unchecked(id, timeout)?;
        Ok(())
    }

    /// 读取手部级对象的缓存值
    pub fn get<D: HandData>(&self) -> Result<D::Value, HandError> {
        let id = self.hand_storage_id::<D>()?;
        Ok(D::Value::from_buffer8(self.handler.get(id)))
    }

    /// 同步写手部级对象
    pub fn write<D: HandData + Writable>(&self, value: D::Value) -> Result<(), HandError> {
        self.write_timeout::<D>(value, DEFAULT_TIMEOUT)
    }

    pub fn write_timeout<D: HandData + Writable>(
        &self,
        value: D::Value,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let latch = Arc::new(Latch::new());
        self.write_async::<D>(&latch, value, timeout)?;
        latch.wait()?;
        Ok(())
    }

    pub fn write_async<D: HandData + Writable>(
        &self,
        latch: &Arc<Latch>,
        value: D::Value,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let id = self.hand_storage_id::<D>()?;
        latch.count_up();
        if let Err(e) = self.handler.write_async(
            value.into_buffer8(),
            id,
            timeout,
            Arc::clone(latch) as Arc<dyn Completer>,
        ) {
            latch.count_down(false);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn write_async_unchecked<D: HandData + Writable>(
        &self,
        value: D::Value,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let id = self.hand_storage_id::<D>()?;
        self.handler
            .write_async_unchecked(value.into_buffer8(), id, timeout)?;
        Ok(())
    }

    // ==================== 关节级批量操作 ====================

    /// 同步读全部 20 个关节的同名对象（共享一个 Latch）
    pub fn read_joints<D: JointData + Readable>(&self) -> Result<(), HandError> {
        let latch = Arc::new(Latch::new());
        self.read_joints_async::<D>(&latch, DEFAULT_TIMEOUT)?;
        latch.wait()?;
        Ok(())
    }

    pub fn read_joints_async<D: JointData + Readable>(
        &self,
        latch: &Arc<Latch>,
        timeout: Duration,
    ) -> Result<(), HandError> {
        for finger_id in 0..FINGER_COUNT {
            Finger::new(self, finger_id).read_joints_async::<D>(latch, timeout)?;
        }
        Ok(())
    }

    /// 同步写全部 20 个关节的同名对象
    pub fn write_joints<D: JointData + Writable>(&self, value: D::Value) -> Result<(), HandError> {
        let latch = Arc::new(Latch::new());
        self.write_joints_async::<D>(&latch, value, DEFAULT_TIMEOUT)?;
        latch.wait()?;
        Ok(())
    }

    pub fn write_joints_async<D: JointData + Writable>(
        &self,
        latch: &Arc<Latch>,
        value: D::Value,
        timeout: Duration,
    ) -> Result<(), HandError> {
        for finger_id in 0..FINGER_COUNT {
            Finger::new(self, finger_id).write_joints_async::<D>(latch, value, timeout)?;
        }
        Ok(())
    }

    // ==================== 初始化 ====================

    fn check_firmware_version(&mut self) -> Result<(), HandError> {
        let latch = Arc::new(Latch::new());
        self.read_async::<hand_data::FirmwareVersion>(&latch, DEFAULT_TIMEOUT)?;
        self.read_joints_async::<joint_data::FirmwareVersion>(&latch, DEFAULT_TIMEOUT)?;
        latch.wait()?;

        let hand_version =
            FirmwareVersionData::from_raw(self.get::<hand_data::FirmwareVersion>()?);
        if hand_version < MINIMUM_FIRMWARE {
            return Err(HandError::FirmwareOutdated { found: hand_version });
        }

        let mut joint_versions = [[FirmwareVersionData::default(); JOINT_COUNT]; FINGER_COUNT];
        for (finger_id, finger) in joint_versions.iter_mut().enumerate() {
            for (joint_id, version) in finger.iter_mut().enumerate() {
                *version = FirmwareVersionData::from_raw(
                    Joint::new(self, finger_id, joint_id).get::<joint_data::FirmwareVersion>(),
                );
            }
        }
        let joint_version = joint_versions[0][0];
        let joint_version_consistent = joint_versions
            .iter()
            .flatten()
            .all(|&version| version == joint_version);

        let mut full_system_version = None;
        if hand_version >= FULL_SYSTEM_VERSION_FIRMWARE {
            let version = FirmwareVersionData::from_raw(
                self.read::<hand_data::FullSystemFirmwareVersion>()?,
            );
            if version.major > 0 {
                info!("Using firmware version: {}", version);
                full_system_version = Some(version);
            }
        }

        if full_system_version.is_none() {
            if joint_version_consistent {
                info!("Using firmware version: {} & {}", hand_version, joint_version);
            } else {
                info!("Using firmware version: {} & [Matrix]", hand_version);
                for finger in &joint_versions {
                    info!(
                        "  {}  {}  {}  {}",
                        finger[0], finger[1], finger[2], finger[3]
                    );
                }
                warn!("Inconsistent driver board firmware version detected");
            }
        }

        if joint_version_consistent && joint_version >= FIRMWARE_FILTER_JOINT_FIRMWARE {
            self.features.firmware_filter = true;
            debug!("Firmware filter enabled");
        }
        if hand_version >= RPDO_DIRECT_FIRMWARE {
            self.features.rpdo_directly_distribute = true;
            debug!("RPdo directly distribute enabled");
        }
        if let Some(version) = full_system_version {
            if version >= TPDO_PROACTIVE_FULL_SYSTEM {
                self.features.tpdo_proactively_report = true;
                debug!("TPdo proactively report enabled");
            }
        }
        Ok(())
    }

    fn initial_joint_configuration(&self) -> Result<(), HandError> {
        self.write_joints::<joint_data::Enabled>(false)?;

        let latch = Arc::new(Latch::new());
        self.write_joints_async::<joint_data::ControlMode>(
            &latch,
            if self.features.firmware_filter { 9 } else { 6 },
            DEFAULT_TIMEOUT,
        )?;

        if self.features.firmware_filter {
            self.write_async::<hand_data::RPdoId>(&latch, 0x01, DEFAULT_TIMEOUT)?;
            self.write_async::<hand_data::TPdoId>(&latch, 0x01, DEFAULT_TIMEOUT)?;
            self.write_async::<hand_data::PdoInterval>(
                &latch,
                if self.features.rpdo_directly_distribute {
                    1000
                } else {
                    2000
                },
                DEFAULT_TIMEOUT,
            )?;
            self.write_async::<hand_data::PdoEnabled>(&latch, 1, DEFAULT_TIMEOUT)?;
        } else {
            // 默认力矩限制 1 A
            self.write_joints_async::<joint_data::EffortLimit>(&latch, 1.0, DEFAULT_TIMEOUT)?;
        }

        if self.features.rpdo_directly_distribute {
            self.write_async::<hand_data::RPdoDirectlyDistribute>(&latch, 1, DEFAULT_TIMEOUT)?;
        }
        if self.features.tpdo_proactively_report {
            self.write_async::<hand_data::TPdoProactivelyReport>(&latch, 1, DEFAULT_TIMEOUT)?;
        }

        latch.wait()?;
        Ok(())
    }

    // ==================== 实时控制 ====================

    /// 最近一帧 PDO 上行的实际位置（任意线程安全）
    pub fn realtime_get_joint_actual_position(&self) -> JointMatrix {
        self.handler.realtime_get_joint_actual_position()
    }

    /// 手动流式下发目标位置（不经控制器；需已配置 PDO 通道）
    pub fn realtime_set_joint_target_position(
        &self,
        positions: &JointMatrix,
    ) -> Result<(), HandError> {
        self.handler.realtime_set_joint_target_position(positions)?;
        Ok(())
    }

    /// 挂载低通滤波实时控制器
    ///
    /// 固件支持时走固件滤波路径（仅写截止频率，直通下发）；否则在
    /// 主机侧运行滤波循环。两条路径对外语义一致，返回的控制句柄
    /// 负责在 Drop 时拆除主机侧循环。
    pub fn realtime_controller(
        &self,
        filter: LowPass,
        enable_upstream: bool,
    ) -> Result<HandController<'_>, HandError> {
        if self.features.firmware_filter {
            self.write_joints::<joint_data::PositionFilterCutoffFreq>(
                filter.cutoff_freq() as f32,
            )?;
            return Ok(HandController {
                hand: self,
                kind: ControllerKind::Firmware,
            });
        }

        // 主机滤波路径：先读一遍实际位置作为滤波器种子
        let last_enabled = self.save_and_enable_joints()?;
        let positions_read = self.read_joints::<joint_data::ActualPosition>();
        self.revert_enabled_joints(&last_enabled)?;
        positions_read?;

        let mut initial = [[0.0; JOINT_COUNT]; FINGER_COUNT];
        for (finger_id, finger) in initial.iter_mut().enumerate() {
            for (joint_id, position) in finger.iter_mut().enumerate() {
                *position =
                    Joint::new(self, finger_id, joint_id).get::<joint_data::ActualPosition>();
            }
        }

        let (controller, inbox) = FilteredController::new(&initial, filter);
        self.attach_realtime_controller(Box::new(controller), enable_upstream)?;

        Ok(HandController {
            hand: self,
            kind: ControllerKind::HostFilter {
                inbox,
                upstream_enabled: enable_upstream,
                detached: std::cell::Cell::new(false),
            },
        })
    }

    fn attach_realtime_controller(
        &self,
        controller: Box<dyn RealtimeController>,
        enable_upstream: bool,
    ) -> Result<(), HandError> {
        let last_enabled = self.save_and_disable_joints()?;

        let latch = Arc::new(Latch::new());
        self.write_joints_async::<joint_data::ControlMode>(&latch, 5, DEFAULT_TIMEOUT)?;
        self.write_async::<hand_data::RPdoId>(&latch, 0x01, DEFAULT_TIMEOUT)?;
        self.write_async::<hand_data::TPdoId>(
            &latch,
            if enable_upstream { 0x01 } else { 0x00 },
            DEFAULT_TIMEOUT,
        )?;
        self.write_async::<hand_data::PdoInterval>(&latch, 2000, DEFAULT_TIMEOUT)?;
        self.write_async::<hand_data::PdoEnabled>(&latch, 1, DEFAULT_TIMEOUT)?;
        latch.wait()?;

        self.revert_disabled_joints(&last_enabled)?;

        self.handler
            .attach_realtime_controller(controller, enable_upstream)?;
        Ok(())
    }

    fn detach_realtime_controller(&self) -> Result<(), HandError> {
        // 先停实时线程，再回写配置
        let _controller = self.handler.detach_realtime_controller()?;

        let last_enabled = self.save_and_disable_joints()?;

        let latch = Arc::new(Latch::new());
        self.write_joints_async::<joint_data::ControlMode>(&latch, 6, DEFAULT_TIMEOUT)?;
        self.write_async::<hand_data::PdoEnabled>(&latch, 0, DEFAULT_TIMEOUT)?;
        latch.wait()?;

        self.revert_disabled_joints(&last_enabled)?;
        Ok(())
    }

    // ==================== 延迟测试 ====================

    pub fn start_latency_test(&self) -> Result<(), HandError> {
        let last_enabled = self.save_and_disable_joints()?;

        let latch = Arc::new(Latch::new());
        self.write_async::<hand_data::RPdoId>(&latch, 0xD0, DEFAULT_TIMEOUT)?;
        self.write_async::<hand_data::TPdoId>(&latch, 0xD0, DEFAULT_TIMEOUT)?;
        self.write_async::<hand_data::PdoInterval>(&latch, 2000, DEFAULT_TIMEOUT)?;
        self.write_async::<hand_data::PdoEnabled>(&latch, 1, DEFAULT_TIMEOUT)?;
        latch.wait()?;

        self.revert_disabled_joints(&last_enabled)?;
        self.handler.start_latency_test()?;
        Ok(())
    }

    pub fn stop_latency_test(&self) -> Result<(), HandError> {
        let last_enabled = self.save_and_disable_joints()?;

        let latch = Arc::new(Latch::new());
        self.write_async::<hand_data::PdoEnabled>(&latch, 0, DEFAULT_TIMEOUT)?;
        latch.wait()?;

        self.revert_disabled_joints(&last_enabled)?;
        self.handler.stop_latency_test()?;
        Ok(())
    }

    // ==================== 带外 SDO ====================

    /// 对任意对象地址发起带外读；`slot` 为 `None` 时按手部级地址
    pub fn raw_sdo_read(
        &self,
        slot: JointSlot,
        index: u16,
        sub_index: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, HandError> {
        let full_index = index + self.raw_index_offset(slot)?;
        Ok(self.handler.raw_sdo_read(full_index, sub_index, timeout)?)
    }

    /// 对任意对象地址发起带外写
    pub fn raw_sdo_write(
        &self,
        slot: JointSlot,
        index: u16,
        sub_index: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), HandError> {
        let full_index = index + self.raw_index_offset(slot)?;
        self.handler
            .raw_sdo_write(full_index, sub_index, data, timeout)?;
        Ok(())
    }

    fn raw_index_offset(&self, slot: JointSlot) -> Result<u16, HandError> {
        match slot {
            None => Ok(0),
            Some((finger_id, joint_id)) => {
                if finger_id >= FINGER_COUNT {
                    return Err(HandError::IndexOutOfRange {
                        what: "finger index",
                        limit: FINGER_COUNT,
                        got: finger_id,
                    });
                }
                if joint_id >= JOINT_COUNT {
                    return Err(HandError::IndexOutOfRange {
                        what: "joint index",
                        limit: JOINT_COUNT,
                        got: joint_id,
                    });
                }
                Ok(data::joint_index_offset(finger_id, joint_id))
            }
        }
    }

    /// 关闭操作线程检查（关闭后调用方自行串行化）
    pub fn disable_thread_safe_check(&self) {
        self.handler.disable_thread_safe_check();
    }

    // ==================== 关节使能现场保存/恢复 ====================

    fn save_and_disable_joints(
        &self,
    ) -> Result<[[bool; JOINT_COUNT]; FINGER_COUNT], HandError> {
        let latch = Arc::new(Latch::new());
        let mut last_enabled = [[false; JOINT_COUNT]; FINGER_COUNT];
        for (finger_id, finger) in last_enabled.iter_mut().enumerate() {
            for (joint_id, enabled) in finger.iter_mut().enumerate() {
                let joint = Joint::new(self, finger_id, joint_id);
                *enabled = joint.get::<joint_data::Enabled>();
                if *enabled {
                    joint.write_async::<joint_data::Enabled>(&latch, false, DEFAULT_TIMEOUT)?;
                }
            }
        }
        latch.wait()?;
        Ok(last_enabled)
    }

    fn revert_disabled_joints(
        &self,
        last_enabled: &[[bool; JOINT_COUNT]; FINGER_COUNT],
    ) -> Result<(), HandError> {
        let latch = Arc::new(Latch::new());
        for (finger_id, finger) in last_enabled.iter().enumerate() {
            for (joint_id, &enabled) in finger.iter().enumerate() {
                if enabled {
                    Joint::new(self, finger_id, joint_id).write_async::<joint_data::Enabled>(
                        &latch,
                        true,
                        DEFAULT_TIMEOUT,
                    )?;
                }
            }
        }
        latch.wait()?;
        Ok(())
    }

    fn save_and_enable_joints(
        &self,
    ) -> Result<[[bool; JOINT_COUNT]; FINGER_COUNT], HandError> {
        let latch = Arc::new(Latch::new());
        let mut last_enabled = [[false; JOINT_COUNT]; FINGER_COUNT];
        for (finger_id, finger) in last_enabled.iter_mut().enumerate() {
            for (joint_id, enabled) in finger.iter_mut().enumerate() {
                let joint = Joint::new(self, finger_id, joint_id);
                *enabled = joint.get::<joint_data::Enabled>();
                if !*enabled {
                    joint.write_async::<joint_data::Enabled>(&latch, true, DEFAULT_TIMEOUT)?;
                }
            }
        }
        latch.wait()?;
        Ok(last_enabled)
    }

    fn revert_enabled_joints(
        &self,
        last_enabled: &[[bool; JOINT_COUNT]; FINGER_COUNT],
    ) -> Result<(), HandError> {
        let latch = Arc::new(Latch::new());
        for (finger_id, finger) in last_enabled.iter().enumerate() {
            for (joint_id, &enabled) in finger.iter().enumerate() {
                if !enabled {
                    Joint::new(self, finger_id, joint_id).write_async::<joint_data::Enabled>(
                        &latch,
                        false,
                        DEFAULT_TIMEOUT,
                    )?;
                }
            }
        }
        latch.wait()?;
        Ok(())
    }
}

enum ControllerKind {
    /// 固件滤波：直通下发，无主机侧循环
    Firmware,
    /// 主机滤波：目标经收件箱进入 PDO 线程的滤波循环
    HostFilter {
        inbox: Arc<TargetInbox>,
        upstream_enabled: bool,
        detached: std::cell::Cell<bool>,
    },
}

/// 实时控制句柄
///
/// 主机滤波路径下，句柄 Drop 时自动拆除 PDO 循环并恢复关节配置。
pub struct HandController<'a> {
    hand: &'a Hand,
    kind: ControllerKind,
}

impl HandController<'_> {
    /// 下发一组目标位置（弧度）
    pub fn set_joint_target_position(&self, positions: &JointMatrix) -> Result<(), HandError> {
        match &self.kind {
            ControllerKind::Firmware => self.hand.realtime_set_joint_target_position(positions),
            ControllerKind::HostFilter { inbox, .. } => {
                inbox.set(positions);
                Ok(())
            }
        }
    }

    /// 最近一帧上行的实际位置
    pub fn joint_actual_position(&self) -> Result<JointMatrix, HandError> {
        match &self.kind {
            ControllerKind::Firmware => Ok(self.hand.realtime_get_joint_actual_position()),
            ControllerKind::HostFilter {
                upstream_enabled, ..
            } => {
                if !upstream_enabled {
                    return Err(HandError::UpstreamDisabled);
                }
                Ok(self.hand.realtime_get_joint_actual_position())
            }
        }
    }

    /// 显式拆除（等价于 Drop，但可以拿到错误）
    pub fn detach(self) -> Result<(), HandError> {
        match &self.kind {
            ControllerKind::Firmware => Ok(()),
            ControllerKind::HostFilter { detached, .. } => {
                detached.set(true);
                self.hand.detach_realtime_controller()
            }
        }
    }
}

impl Drop for HandController<'_> {
    fn drop(&mut self) {
        if let ControllerKind::HostFilter { detached, .. } = &self.kind {
            if !detached.get() {
                if let Err(e) = self.hand.detach_realtime_controller() {
                    warn!("Failed to detach realtime controller on drop: {}", e);
                }
            }
        }
    }
}
