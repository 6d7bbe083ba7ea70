//! 单指视图
//!
//! 手指自身没有数据对象，只是四个关节的分组作用域：数据操作
//! 扇出到本指全部关节并共享同一个 Latch。

use std::sync::Arc;
use std::time::Duration;

use crate::data::{JointData, Readable, Writable};
use crate::protocol::JOINT_COUNT;
use crate::sync::Latch;

use super::hand::Hand;
use super::joint::Joint;
use super::{HandError, DEFAULT_TIMEOUT};

#[derive(Clone, Copy)]
pub struct Finger<'a> {
    hand: &'a Hand,
    finger_id: usize,
}

impl<'a> Finger<'a> {
    pub(crate) fn new(hand: &'a Hand, finger_id: usize) -> Self {
        Self { hand, finger_id }
    }

    pub fn finger_id(&self) -> usize {
        self.finger_id
    }

    /// 取关节视图，`joint_id ∈ 0..4`
    pub fn joint(&self, joint_id: usize) -> Result<Joint<'a>, HandError> {
        if joint_id >= JOINT_COUNT {
            return Err(HandError::IndexOutOfRange {
                what: "joint index",
                limit: JOINT_COUNT,
                got: joint_id,
            });
        }
        Ok(Joint::new(self.hand, self.finger_id, joint_id))
    }

    /// 同步读本指所有关节的同名对象（结果进各关节缓存）
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
        for joint_id in 0..JOINT_COUNT {
            Joint::new(self.hand, self.finger_id, joint_id).read_async::<D>(latch, timeout)?;
        }
        Ok(())
    }

    /// 同步写本指所有关节的同名对象
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
        for joint_id in 0..JOINT_COUNT {
            Joint::new(self.hand, self.finger_id, joint_id)
                .write_async::<D>(latch, value, timeout)?;
        }
        Ok(())
    }
}
