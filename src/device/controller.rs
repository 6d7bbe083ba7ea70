//! 实时控制器实现
//!
//! 主机滤波路径：[`FilteredController`] 在 PDO 线程上按节拍对每个
//! 关节跑一阶低通；目标值经由 [`TargetInbox`] 从调用线程无锁投递。
//! 固件滤波路径不需要主机侧控制器，由 [`super::HandController`] 的
//! 直通分支覆盖。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::filter::LowPass;
use crate::protocol::{JointMatrix, RealtimeController, FINGER_COUNT, JOINT_COUNT};

/// 目标位置收件箱
///
/// 调用线程写入、PDO 线程每节拍读取，逐元素 relaxed 原子。
pub struct TargetInbox {
    targets: [[AtomicU64; JOINT_COUNT]; FINGER_COUNT],
}

impl TargetInbox {
    fn new(initial: &JointMatrix) -> Self {
        let inbox = Self {
            targets: std::array::from_fn(|_| std::array::from_fn(|_| AtomicU64::new(0))),
        };
        inbox.set(initial);
        inbox
    }

    /// 投递一组新的目标位置（弧度）
    pub fn set(&self, positions: &JointMatrix) {
        for (finger_id, finger) in positions.iter().enumerate() {
            for (joint_id, &position) in finger.iter().enumerate() {
                self.targets[finger_id][joint_id].store(position.to_bits(), Ordering::Relaxed);
            }
        }
    }

    fn load(&self) -> JointMatrix {
        let mut positions = [[0.0; JOINT_COUNT]; FINGER_COUNT];
        for (finger_id, finger) in positions.iter_mut().enumerate() {
            for (joint_id, position) in finger.iter_mut().enumerate() {
                *position =
                    f64::from_bits(self.targets[finger_id][joint_id].load(Ordering::Relaxed));
            }
        }
        positions
    }
}

/// 逐关节低通滤波控制器
///
/// `outputs` 是滤波器状态，只被 PDO 线程触碰；用实际位置初始化，
/// 保证挂载瞬间不产生目标跳变。
pub struct FilteredController {
    filter: LowPass,
    inbox: Arc<TargetInbox>,
    outputs: JointMatrix,
}

impl FilteredController {
    /// 返回控制器与其共享收件箱
    pub fn new(initial: &JointMatrix, filter: LowPass) -> (Self, Arc<TargetInbox>) {
        let inbox = Arc::new(TargetInbox::new(initial));
        (
            Self {
                filter,
                inbox: Arc::clone(&inbox),
                outputs: *initial,
            },
            inbox,
        )
    }
}

impl RealtimeController for FilteredController {
    fn setup(&mut self, sampling_frequency: f64) {
        self.filter.setup(sampling_frequency);
    }

    fn step(&mut self, _actual: Option<&JointMatrix>) -> JointMatrix {
        let targets = self.inbox.load();
        let mut result = [[0.0; JOINT_COUNT]; FINGER_COUNT];
        for finger_id in 0..FINGER_COUNT {
            for joint_id in 0..JOINT_COUNT {
                result[finger_id][joint_id] = self.filter.step(
                    targets[finger_id][joint_id],
                    &mut self.outputs[finger_id][joint_id],
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_output_matches_seed() {
        let mut initial = [[0.0; JOINT_COUNT]; FINGER_COUNT];
        initial[2][1] = 0.8;
        let (mut controller, _inbox) = FilteredController::new(&initial, LowPass::new(10.0));
        controller.setup(500.0);

        // 收件箱播种为初始位置：第一步输出保持不动
        let out = controller.step(None);
        assert!((out[2][1] - 0.8).abs() < 1e-9);
        assert!((out[0][0]).abs() < 1e-9);
    }

    #[test]
    fn test_steps_converge_to_inbox_target() {
        let initial = [[0.0; JOINT_COUNT]; FINGER_COUNT];
        let (mut controller, inbox) = FilteredController::new(&initial, LowPass::new(20.0));
        controller.setup(500.0);

        let mut target = [[0.0; JOINT_COUNT]; FINGER_COUNT];
        target[1][2] = 1.5;
        inbox.set(&target);

        let mut out = controller.step(None);
        let first = out[1][2];
        assert!(first > 0.0 && first < 1.5);

        for _ in 0..3000 {
            out = controller.step(None);
        }
        assert!((out[1][2] - 1.5).abs() < 1e-3);
        assert!(out[0][0].abs() < 1e-9);
    }

    #[test]
    fn test_inbox_set_is_visible_across_threads() {
        let initial = [[0.0; JOINT_COUNT]; FINGER_COUNT];
        let (mut controller, inbox) = FilteredController::new(&initial, LowPass::new(100.0));
        controller.setup(500.0);

        let writer = {
            let inbox = Arc::clone(&inbox);
            std::thread::spawn(move || {
                let mut target = [[0.0; JOINT_COUNT]; FINGER_COUNT];
                target[4][3] = -0.4;
                inbox.set(&target);
            })
        };
        writer.join().unwrap();

        for _ in 0..5000 {
            controller.step(None);
        }
        let out = controller.step(None);
        assert!((out[4][3] - (-0.4)).abs() < 1e-3);
    }
}
