//! 测试共用设施
//!
//! `MockTransport` 实现 [`Transport`]，把出站帧记录下来并交给
//! `MockDevice`（一个寄存器表驱动的设备模型）在独立应答线程上
//! 生成入站帧，近似真实设备的异步往返。

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use dexhand_sdk::usb::{BufferPool, RxCallback, Transport, TxBuffer, UsbError};

pub const FRAME_TYPE_SDO: u8 = 0x21;
pub const FRAME_TYPE_PDO: u8 = 0x11;

// ==================== 帧构造 / 解析辅助 ====================

/// 按协议布局构造一个完整入站帧（头部 + 载荷 + CRC 槽位 + 16 字节对齐）
pub fn build_frame(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 8];
    frame[0..2].copy_from_slice(&0x55AAu16.to_le_bytes());
    frame[2] = 0xA0; // 设备 → 主机
    frame[3] = 0x00;
    frame[6] = frame_type;
    frame[7] = 0x00;
    frame.extend_from_slice(payload);

    let used = frame.len() + 2;
    let padded = used.div_ceil(16) * 16;
    frame.resize(padded, 0);

    let units = (padded / 16) as u16;
    let description = ((units - 1) << 10) | 0x100;
    frame[4..6].copy_from_slice(&description.to_be_bytes());
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoRequest {
    Read {
        index: u16,
        sub_index: u8,
    },
    Write {
        index: u16,
        sub_index: u8,
        value: u64,
        width: usize,
    },
}

fn write_width(control: u8) -> Option<usize> {
    match control {
        0x20 => Some(1),
        0x22 => Some(2),
        0x24 => Some(4),
        0x28 => Some(8),
        _ => None,
    }
}

fn read_success_control(width: usize) -> u8 {
    match width {
        1 => 0x35,
        2 => 0x37,
        4 => 0x39,
        _ => 0x3D,
    }
}

/// 解析一个出站 SDO 帧中的全部请求
pub fn parse_sdo_requests(frame: &[u8]) -> Vec<SdoRequest> {
    let mut requests = Vec::new();
    if frame.len() < 8 || frame[6] != FRAME_TYPE_SDO {
        return requests;
    }

    let mut offset = 8;
    while offset < frame.len() {
        let control = frame[offset];
        if control == 0x00 {
            break;
        }
        if control == 0x30 {
            if offset + 4 > frame.len() {
                break;
            }
            requests.push(SdoRequest::Read {
                index: u16::from_be_bytes([frame[offset + 1], frame[offset + 2]]),
                sub_index: frame[offset + 3],
            });
            offset += 4;
        } else if let Some(width) = write_width(control) {
            if offset + 4 + width > frame.len() {
                break;
            }
            let mut value_bytes = [0u8; 8];
            value_bytes[..width].copy_from_slice(&frame[offset + 4..offset + 4 + width]);
            requests.push(SdoRequest::Write {
                index: u16::from_be_bytes([frame[offset + 1], frame[offset + 2]]),
                sub_index: frame[offset + 3],
                value: u64::from_le_bytes(value_bytes),
                width,
            });
            offset += 4 + width;
        } else {
            break;
        }
    }
    requests
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PdoRequest {
    /// 空读帧（轮询上行）
    Read,
    /// 目标位置写帧
    Write {
        read_id: u8,
        targets: [[i32; 4]; 5],
        timestamp: u32,
    },
    /// 延迟测试探针
    LatencyProbe { id: u32 },
}

/// 解析一个出站 PDO 帧
pub fn parse_pdo_request(frame: &[u8]) -> Option<PdoRequest> {
    if frame.len() < 10 || frame[6] != FRAME_TYPE_PDO {
        return None;
    }
    let write_id = frame[8];
    let read_id = frame[9];

    match write_id {
        0x00 => Some(PdoRequest::Read),
        0x01 => {
            if frame.len() < 10 + 84 {
                return None;
            }
            let mut targets = [[0i32; 4]; 5];
            let mut offset = 10;
            for finger in targets.iter_mut() {
                for target in finger.iter_mut() {
                    *target = i32::from_le_bytes([
                        frame[offset],
                        frame[offset + 1],
                        frame[offset + 2],
                        frame[offset + 3],
                    ]);
                    offset += 4;
                }
            }
            let timestamp = u32::from_le_bytes([
                frame[offset],
                frame[offset + 1],
                frame[offset + 2],
                frame[offset + 3],
            ]);
            Some(PdoRequest::Write {
                read_id,
                targets,
                timestamp,
            })
        }
        0xD0 => {
            if frame.len() < 14 {
                return None;
            }
            Some(PdoRequest::LatencyProbe {
                id: u32::from_le_bytes([frame[10], frame[11], frame[12], frame[13]]),
            })
        }
        _ => None,
    }
}

// ==================== 设备模型 ====================

struct MockReg {
    width: usize,
    value: u64,
    /// 逐次读响应覆盖：`Some(v)` 用指定值应答，`None` 静默
    read_replies: VecDeque<Option<u64>>,
}

#[derive(Clone, Copy)]
pub enum PdoReply {
    /// TPDO 0x01：仅位置
    Positions([[i32; 4]; 5]),
    /// TPDO 0x02：位置 + 错误码（iq 置零）
    PosIqErr([[i32; 4]; 5], [[u32; 4]; 5]),
}

/// 寄存器表驱动的设备模型
pub struct MockDevice {
    regs: Mutex<HashMap<(u16, u8), MockReg>>,
    /// 清空后设备对 SDO 完全静默（超时测试）
    pub respond_sdo: AtomicBool,
    /// 丢弃写入的地址集合（写既不生效也不应答）
    silent_writes: Mutex<HashSet<(u16, u8)>>,
    pdo_reply: Mutex<Option<PdoReply>>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            regs: Mutex::new(HashMap::new()),
            respond_sdo: AtomicBool::new(true),
            silent_writes: Mutex::new(HashSet::new()),
            pdo_reply: Mutex::new(None),
        })
    }

    pub fn set_reg(&self, index: u16, sub_index: u8, width: usize, value: u64) {
        self.regs.lock().unwrap().insert(
            (index, sub_index),
            MockReg {
                width,
                value,
                read_replies: VecDeque::new(),
            },
        );
    }

    /// 为下一次读安排一条覆盖应答
    pub fn push_read_reply(&self, index: u16, sub_index: u8, reply: Option<u64>) {
        if let Some(reg) = self.regs.lock().unwrap().get_mut(&(index, sub_index)) {
            reg.read_replies.push_back(reply);
        }
    }

    pub fn set_write_silent(&self, index: u16, sub_index: u8) {
        self.silent_writes.lock().unwrap().insert((index, sub_index));
    }

    pub fn reg_value(&self, index: u16, sub_index: u8) -> Option<u64> {
        self.regs
            .lock()
            .unwrap()
            .get(&(index, sub_index))
            .map(|reg| reg.value)
    }

    pub fn set_pdo_reply(&self, reply: Option<PdoReply>) {
        *self.pdo_reply.lock().unwrap() = reply;
    }

    fn respond(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        if frame.len() < 8 {
            return Vec::new();
        }
        match frame[6] {
            FRAME_TYPE_SDO => self.handle_sdo_frame(frame),
            FRAME_TYPE_PDO => self.handle_pdo_frame(frame),
            _ => Vec::new(),
        }
    }

    fn handle_sdo_frame(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        if !self.respond_sdo.load(Ordering::Relaxed) {
            return Vec::new();
        }

        let mut payload = Vec::new();
        for request in parse_sdo_requests(frame) {
            match request {
                SdoRequest::Read { index, sub_index } => {
                    let mut regs = self.regs.lock().unwrap();
                    if let Some(reg) = regs.get_mut(&(index, sub_index)) {
                        let reply = reg.read_replies.pop_front().unwrap_or(Some(reg.value));
                        if let Some(value) = reply {
                            payload.push(read_success_control(reg.width));
                            payload.extend_from_slice(&index.to_be_bytes());
                            payload.push(sub_index);
                            payload.extend_from_slice(&value.to_le_bytes()[..reg.width]);
                        }
                    }
                }
                SdoRequest::Write {
                    index,
                    sub_index,
                    value,
                    width,
                } => {
                    if self.silent_writes.lock().unwrap().contains(&(index, sub_index)) {
                        continue;
                    }
                    let mut regs = self.regs.lock().unwrap();
                    let reg = regs.entry((index, sub_index)).or_insert(MockReg {
                        width,
                        value: 0,
                        read_replies: VecDeque::new(),
                    });
                    reg.value = value;
                    payload.push(0x21);
                    payload.extend_from_slice(&index.to_be_bytes());
                    payload.push(sub_index);
                }
            }
        }

        if payload.is_empty() {
            Vec::new()
        } else {
            vec![build_frame(FRAME_TYPE_SDO, &payload)]
        }
    }

    fn handle_pdo_frame(&self, frame: &[u8]) -> Vec<Vec<u8>> {
        let request = match parse_pdo_request(frame) {
            Some(request) => request,
            None => return Vec::new(),
        };

        match request {
            PdoRequest::LatencyProbe { id } => {
                let mut payload = vec![0x00, 0xD0];
                for _ in 0..20 {
                    payload.extend_from_slice(&id.to_le_bytes());
                    payload.extend_from_slice(&100u32.to_le_bytes()); // t0
                    payload.extend_from_slice(&110u32.to_le_bytes()); // t1
                    payload.extend_from_slice(&120u32.to_le_bytes()); // t2
                    payload.extend_from_slice(&130u32.to_le_bytes()); // t3
                    payload.extend_from_slice(&400u32.to_le_bytes()); // t4
                }
                payload.extend_from_slice(&500u32.to_le_bytes()); // t5
                payload.extend_from_slice(&50u32.to_le_bytes()); // usb rx→tx
                vec![build_frame(FRAME_TYPE_PDO, &payload)]
            }
            PdoRequest::Read | PdoRequest::Write { .. } => {
                // 写帧的 read_id == 0x00 表示不请求上行
                if let PdoRequest::Write { read_id: 0x00, .. } = request {
                    return Vec::new();
                }
                let reply = *self.pdo_reply.lock().unwrap();
                match reply {
                    None => Vec::new(),
                    Some(PdoReply::Positions(positions)) => {
                        let mut payload = vec![0x00, 0x01];
                        for finger in &positions {
                            for &position in finger {
                                payload.extend_from_slice(&position.to_le_bytes());
                            }
                        }
                        vec![build_frame(FRAME_TYPE_PDO, &payload)]
                    }
                    Some(PdoReply::PosIqErr(positions, errors)) => {
                        let mut payload = vec![0x00, 0x02];
                        for finger_id in 0..5 {
                            for joint_id in 0..4 {
                                payload.extend_from_slice(
                                    &positions[finger_id][joint_id].to_le_bytes(),
                                );
                                payload.extend_from_slice(&0f32.to_le_bytes());
                                payload.extend_from_slice(
                                    &errors[finger_id][joint_id].to_le_bytes(),
                                );
                            }
                        }
                        vec![build_frame(FRAME_TYPE_PDO, &payload)]
                    }
                }
            }
        }
    }
}

// ==================== 传输层 Mock ====================

pub struct MockTransport {
    pool: BufferPool,
    callback: Arc<Mutex<Option<RxCallback>>>,
    tx_frames: Arc<Mutex<Vec<Vec<u8>>>>,
    to_responder: Sender<Vec<u8>>,
}

impl MockTransport {
    /// 无设备模型：只记录出站帧，入站帧由测试手动注入
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// 挂上设备模型：出站帧在独立应答线程上生成入站响应
    pub fn with_device(device: Arc<MockDevice>) -> Arc<Self> {
        Self::build(Some(device))
    }

    fn build(device: Option<Arc<MockDevice>>) -> Arc<Self> {
        let (to_responder, from_transport): (Sender<Vec<u8>>, Receiver<Vec<u8>>) =
            crossbeam_channel::unbounded();
        let callback: Arc<Mutex<Option<RxCallback>>> = Arc::new(Mutex::new(None));

        if let Some(device) = device {
            let callback = Arc::clone(&callback);
            std::thread::spawn(move || {
                for frame in from_transport {
                    for reply in device.respond(&frame) {
                        if let Some(cb) = callback.lock().unwrap().as_ref() {
                            cb(&reply);
                        }
                    }
                }
            });
        }

        Arc::new(Self {
            pool: BufferPool::new(64, 2048),
            callback,
            tx_frames: Arc::new(Mutex::new(Vec::new())),
            to_responder,
        })
    }

    /// 直接注入一个入站帧（在调用线程上解析）
    pub fn inject_rx(&self, frame: &[u8]) {
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(frame);
        }
    }

    /// 出站帧快照
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.tx_frames.lock().unwrap().clone()
    }

    pub fn sent_frame_count(&self) -> usize {
        self.tx_frames.lock().unwrap().len()
    }

    /// 出站 SDO 请求（按发送顺序平铺）
    pub fn sent_sdo_requests(&self) -> Vec<SdoRequest> {
        self.sent_frames()
            .iter()
            .flat_map(|frame| parse_sdo_requests(frame))
            .collect()
    }

    /// 出站 PDO 请求（按发送顺序）
    pub fn sent_pdo_requests(&self) -> Vec<PdoRequest> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| parse_pdo_request(frame))
            .collect()
    }
}

impl Transport for MockTransport {
    fn request_transmit_buffer(&self) -> Option<TxBuffer> {
        self.pool.request()
    }

    fn transmit(&self, buffer: TxBuffer, used: usize) {
        let frame = buffer.as_slice()[..used].to_vec();
        self.tx_frames.lock().unwrap().push(frame.clone());
        let _ = self.to_responder.send(frame);
    }

    fn receive(&self, callback: RxCallback) -> Result<(), UsbError> {
        let mut slot = self.callback.lock().unwrap();
        if slot.is_some() {
            return Err(UsbError::CallbackInstalled);
        }
        *slot = Some(callback);
        Ok(())
    }
}

// ==================== 等待辅助 ====================

/// 轮询等待条件成立，超时 panic
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("condition not met within {timeout:?}");
}
