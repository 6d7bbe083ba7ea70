//! 手部级对象
//!
//! 索引无偏移，直接按表中地址上线。

use crate::protocol::{policy, StorageInfo};

use super::define_data_objects;

define_data_objects! {
    HandData, HAND_REGISTRY, HAND_OBJECT_COUNT;

    /// 左右手标识
    Handedness(u8, 0x5090, 0, ro);

    /// 主机心跳计数器，由 SDO 引擎周期性写入喂狗
    HostTimeoutCounter(u32, 0x50A0, 1, wo,
        |_slot| StorageInfo::new(4, 0x50A0, 1, policy::HOST_HEARTBEAT));

    /// 脊柱板固件版本
    FirmwareVersion(u32, 0x5201, 1, ro);
    /// 脊柱板固件构建日期
    FirmwareDate(u32, 0x5201, 2, ro);
    /// 全系统固件版本（≥ 3.1.0-D 的固件提供）
    FullSystemFirmwareVersion(u32, 0x5201, 3, ro);

    // 产品 SN 按 6 段 4 字节存放，适配加速 SDO 传输
    ProductSnPart1(u32, 0x5202, 1, ro);
    ProductSnPart2(u32, 0x5202, 2, ro);
    ProductSnPart3(u32, 0x5202, 3, ro);
    ProductSnPart4(u32, 0x5202, 4, ro);
    ProductSnPart5(u32, 0x5202, 5, ro);
    ProductSnPart6(u32, 0x5202, 6, ro);

    /// 设备系统时间
    SystemTime(u32, 0x520A, 1, ro);
    /// 脊柱板温度（摄氏度）
    Temperature(f32, 0x520A, 9, ro);
    /// 输入电压（伏特）
    InputVoltage(f32, 0x520A, 10, ro);

    /// RPDO 直接分发开关（≥ 3.2.0-B 的固件支持）
    RPdoDirectlyDistribute(u8, 0x52A0, 3, wo);
    /// TPDO 主动上报开关
    TPdoProactivelyReport(u8, 0x52A0, 4, wo);
    /// PDO 通道总开关
    PdoEnabled(u8, 0x52A0, 5, wo);

    /// 下行 PDO 类型
    RPdoId(u16, 0x52A4, 1, wo);
    /// 上行 PDO 类型
    TPdoId(u16, 0x52A4, 2, wo);

    /// PDO 周期（微秒）
    PdoInterval(u32, 0x52A4, 5, wo);
    /// 下行触发偏移
    RPdoTriggerOffset(u32, 0x52A4, 6, wo);
    /// 上行触发偏移
    TPdoTriggerOffset(u32, 0x52A4, 7, wo);
}
