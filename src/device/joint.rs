//! 单关节视图

use std::sync::Arc;
use std::time::Duration;

use crate::data::{joint_index_offset, JointData, Readable, Writable};
use crate::protocol::storage::Scalar;
use crate::sync::{Completer, Latch};

use super::hand::Hand;
use super::{HandError, DEFAULT_TIMEOUT};

/// 单个关节的数据操作视图
#[derive(Clone, Copy)]
pub struct Joint<'a> {
    hand: &'a Hand,
    finger_id: usize,
    joint_id: usize,
}

impl<'a> Joint<'a> {
    pub(crate) fn new(hand: &'a Hand, finger_id: usize, joint_id: usize) -> Self {
        Self {
            hand,
            finger_id,
            joint_id,
        }
    }

    pub fn finger_id(&self) -> usize {
        self.finger_id
    }

    pub fn joint_id(&self) -> usize {
        self.joint_id
    }

    fn storage_id<D: JointData>(&self) -> Result<usize, HandError> {
        let info = D::info(Some((self.finger_id, self.joint_id)));
        let index = info.index + joint_index_offset(self.finger_id, self.joint_id);
        self.hand
            .handler()
            .storage_id(index, info.sub_index)
            .ok_or(HandError::ObjectNotRegistered {
                index,
                sub_index: info.sub_index,
            })
    }

    /// 同步读：下发请求并阻塞到完成，返回翻译后的值
    pub fn read<D: JointData + Readable>(&self) -> Result<D::Value, HandError> {
        self.read_timeout::<D>(DEFAULT_TIMEOUT)
    }

    pub fn read_timeout<D: JointData + Readable>(
        &self,
        timeout: Duration,
    ) -> Result<D::Value, HandError> {
        let latch = Arc::new(Latch::new());
        self.read_async::<D>(&latch, timeout)?;
        latch.wait()?;
        Ok(self.get::<D>())
    }

    /// 异步读，完成回报到 `latch`
    pub fn read_async<D: JointData + Readable>(
        &self,
        latch: &Arc<Latch>,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let id = self.storage_id::<D>()?;
        latch.count_up();
        if let Err(e) = self
            .hand
            .handler()
            .read_async(id, timeout, Arc::clone(latch) as Arc<dyn Completer>)
        {
            latch.count_down(false);
            return Err(e.into());
        }
        Ok(())
    }

    /// 非受检异步读：结果只刷新缓存，不可观测完成
    pub fn read_async_unchecked<D: JointData + Readable>(
        &self,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let id = self.storage_id::<D>()?;
        self.hand.handler().read_async_unchecked(id, timeout)?;
        Ok(())
    }

    /// 读取缓存值（不产生传输）
    pub fn get<D: JointData>(&self) -> D::Value {
        match self.storage_id::<D>() {
            Ok(id) => D::Value::from_buffer8(self.hand.handler().get(id)),
            // 注册表齐备时不可达；返回零值保持取值接口无失败路径
            Err(_) => D::Value::from_buffer8(Default::default()),
        }
    }

    /// 同步写：阻塞到设备确认（写后回读校验通过）
    pub fn write<D: JointData + Writable>(&self, value: D::Value) -> Result<(), HandError> {
        self.write_timeout::<D>(value, DEFAULT_TIMEOUT)
    }

    pub fn write_timeout<D: JointData + Writable>(
        &self,
        value: D::Value,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let latch = Arc::new(Latch::new());
        self.write_async::<D>(&latch, value, timeout)?;
        latch.wait()?;
        Ok(())
    }

    /// 异步写，完成回报到 `latch`
    pub fn write_async<D: JointData + Writable>(
        &self,
        latch: &Arc<Latch>,
        value: D::Value,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let id = self.storage_id::<D>()?;
        latch.count_up();
        if let Err(e) = self.hand.handler().write_async(
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

    /// 非受检异步写
    pub fn write_async_unchecked<D: JointData + Writable>(
        &self,
        value: D::Value,
        timeout: Duration,
    ) -> Result<(), HandError> {
        let id = self.storage_id::<D>()?;
        self.hand
            .handler()
            .write_async_unchecked(value.into_buffer8(), id, timeout)?;
        Ok(())
    }
}
