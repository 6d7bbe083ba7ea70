//! 关节级对象
//!
//! 表中是关节内的基础地址，注册时叠加 `0x2000 + finger·0x800 +
//! joint·0x100`。位置类对象对外是弧度（f64），线上是 i32 原始计数；
//! 除拇指外各指的 J1 方向相反，通过 `POSITION_REVERSED` 策略在
//! 存取两侧取负。

use crate::protocol::{policy, StorageInfo};

use super::{define_data_objects, JointSlot};

/// 除拇指外各指的 J1 为反向关节
pub(crate) fn is_reversed_joint(slot: JointSlot) -> bool {
    matches!(slot, Some((finger, 0)) if finger != 0)
}

fn position_policy(slot: JointSlot) -> u32 {
    if is_reversed_joint(slot) {
        policy::POSITION | policy::POSITION_REVERSED
    } else {
        policy::POSITION
    }
}

define_data_objects! {
    JointData, JOINT_REGISTRY, JOINT_OBJECT_COUNT;

    /// 关节驱动板固件版本
    FirmwareVersion(u32, 0x01, 1, ro);
    /// 关节驱动板固件构建日期
    FirmwareDate(u32, 0x01, 2, ro);

    /// 控制模式（5 = 循环同步位置，6 = 轮廓位置，9 = 固件滤波位置）
    ControlMode(u16, 0x02, 1, wo);

    SinLevel(u16, 0x05, 8, wo);
    /// 固件滤波路径的位置滤波截止频率（Hz）
    PositionFilterCutoffFreq(f32, 0x05, 19, wo);
    TorqueSlopeLimitPerCycle(f32, 0x05, 20, wo);

    /// 力矩限制：对外安培（f64），线上毫安（u16）
    EffortLimit(f64, 0x07, 2, rw,
        |_slot| StorageInfo::new(2, 0x07, 2, policy::EFFORT_LIMIT));

    /// 母线电压（伏特）
    BusVoltage(f32, 0x0B, 8, ro);
    /// 驱动板温度（摄氏度）
    Temperature(f32, 0x0B, 9, ro);

    /// 写任意值清除已锁存的错误
    ResetError(u16, 0x0D, 4, wo);

    /// 已锁存的错误码位图
    ErrorCode(u32, 0x3F, 0, ro);

    /// 使能开关：对外布尔，线上控制字 u16（1 使能 / 5 去使能）
    Enabled(bool, 0x40, 0, wo,
        |_slot| StorageInfo::new(2, 0x40, 0, policy::CONTROL_WORD));

    /// 实际位置（弧度）
    ActualPosition(f64, 0x64, 0, ro,
        |slot| StorageInfo::new(4, 0x64, 0, position_policy(slot)));
    /// 目标位置（弧度）
    TargetPosition(f64, 0x7A, 0, wo,
        |slot| StorageInfo::new(4, 0x7A, 0, position_policy(slot)));

    /// 位置上限（弧度）；反向关节上下限在线上互换
    UpperLimit(f64, 0x0E, 27, ro,
        |slot| StorageInfo::new(
            4,
            0x0E,
            if is_reversed_joint(slot) { 28 } else { 27 },
            position_policy(slot),
        ));
    /// 位置下限（弧度）
    LowerLimit(f64, 0x0E, 28, ro,
        |slot| StorageInfo::new(
            4,
            0x0E,
            if is_reversed_joint(slot) { 27 } else { 28 },
            position_policy(slot),
        ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataObject;
    use crate::protocol::DataWidth;

    #[test]
    fn test_reversed_joint_rule() {
        // 拇指 J1 不反向，其余手指的 J1 反向
        assert!(!is_reversed_joint(Some((0, 0))));
        assert!(is_reversed_joint(Some((1, 0))));
        assert!(is_reversed_joint(Some((4, 0))));
        assert!(!is_reversed_joint(Some((1, 1))));
        assert!(!is_reversed_joint(None));
    }

    #[test]
    fn test_position_objects_carry_reversal_policy() {
        let thumb = ActualPosition::info(Some((0, 0)));
        assert_eq!(thumb.policy, policy::POSITION);
        assert_eq!(thumb.width, DataWidth::W4);

        let index_j1 = ActualPosition::info(Some((1, 0)));
        assert_eq!(
            index_j1.policy,
            policy::POSITION | policy::POSITION_REVERSED
        );

        let target = TargetPosition::info(Some((2, 0)));
        assert_eq!(target.policy, policy::POSITION | policy::POSITION_REVERSED);
    }

    #[test]
    fn test_limit_sub_indices_swap_for_reversed_joints() {
        assert_eq!(UpperLimit::info(Some((0, 1))).sub_index, 27);
        assert_eq!(LowerLimit::info(Some((0, 1))).sub_index, 28);

        // 反向关节：线上上下限对调
        assert_eq!(UpperLimit::info(Some((3, 0))).sub_index, 28);
        assert_eq!(LowerLimit::info(Some((3, 0))).sub_index, 27);
    }

    #[test]
    fn test_enabled_is_control_word_u16() {
        let info = Enabled::info(Some((2, 2)));
        assert_eq!(info.width, DataWidth::W2);
        assert_eq!(info.policy, policy::CONTROL_WORD);
    }

    #[test]
    fn test_effort_limit_is_milliampere_u16() {
        let info = EffortLimit::info(Some((0, 0)));
        assert_eq!(info.width, DataWidth::W2);
        assert_eq!(info.policy, policy::EFFORT_LIMIT);
        assert_eq!(info.index, 0x07);
        assert_eq!(info.sub_index, 2);
    }
}
