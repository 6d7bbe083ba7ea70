//! PDO 载荷编解码
//!
//! 循环通道的载荷以 2 字节子头 `{write_id, read_id}` 开始。上行
//! （TPDO）按 `read_id` 区分：`0x01` 仅 20 关节位置，`0x02` 位置 +
//! 力矩电流 + 逐关节错误码，`0xD0` 延迟测试结果。下行（RPDO）为
//! 20 个目标位置加微秒时间戳。

use super::{Cursor, ProtocolError, FINGER_COUNT, JOINT_COUNT};

pub(crate) const TPDO_POSITIONS: u8 = 0x01;
pub(crate) const TPDO_POS_IQ_ERR: u8 = 0x02;
pub(crate) const TPDO_LATENCY: u8 = 0xD0;

pub(crate) const READ_REQUEST_LEN: usize = 2;
pub(crate) const WRITE_REQUEST_LEN: usize = 2 + FINGER_COUNT * JOINT_COUNT * 4 + 4;
pub(crate) const LATENCY_REQUEST_LEN: usize = 6;

/// 上行子头
#[derive(Debug, Clone, Copy)]
pub(crate) struct PdoHeader {
    #[allow(dead_code)]
    pub write_id: u8,
    pub read_id: u8,
}

pub(crate) fn parse_header(cursor: &mut Cursor<'_>) -> Result<PdoHeader, ProtocolError> {
    let header = cursor.take(2, "PDO header")?;
    Ok(PdoHeader {
        write_id: header[0],
        read_id: header[1],
    })
}

/// 编码空读请求（轮询上行数据）
pub(crate) fn encode_read(buf: &mut [u8]) {
    buf[0] = 0x00;
    buf[1] = TPDO_POSITIONS;
}

/// 编码目标位置写请求
///
/// `targets` 为已完成方向翻转的原始计数；`read_id` 为 0x01（上行开启）
/// 或 0x00（仅下行）。
pub(crate) fn encode_write(
    buf: &mut [u8],
    read_id: u8,
    targets: &[[i32; JOINT_COUNT]; FINGER_COUNT],
    timestamp_us: u32,
) {
    buf[0] = 0x01;
    buf[1] = read_id;
    let mut offset = 2;
    for finger in targets {
        for &target in finger {
            buf[offset..offset + 4].copy_from_slice(&target.to_le_bytes());
            offset += 4;
        }
    }
    buf[offset..offset + 4].copy_from_slice(&timestamp_us.to_le_bytes());
}

/// 编码延迟测试探针
pub(crate) fn encode_latency_probe(buf: &mut [u8], id: u32) {
    buf[0] = TPDO_LATENCY;
    buf[1] = TPDO_LATENCY;
    buf[2..6].copy_from_slice(&id.to_le_bytes());
}

/// 解析 `read_id == 0x01`：仅位置
pub(crate) fn parse_positions(
    cursor: &mut Cursor<'_>,
) -> Result<[[i32; JOINT_COUNT]; FINGER_COUNT], ProtocolError> {
    let mut positions = [[0i32; JOINT_COUNT]; FINGER_COUNT];
    for finger in positions.iter_mut() {
        for position in finger.iter_mut() {
            *position = cursor.i32_le("TPDO positions")?;
        }
    }
    Ok(positions)
}

/// 单关节的位置 + 力矩电流 + 错误码
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct JointPosIqErr {
    pub position: i32,
    #[allow(dead_code)]
    pub iq_a: f32,
    pub error_code: u32,
}

/// 解析 `read_id == 0x02`：位置 + 力矩电流 + 错误码
pub(crate) fn parse_pos_iq_err(
    cursor: &mut Cursor<'_>,
) -> Result<[[JointPosIqErr; JOINT_COUNT]; FINGER_COUNT], ProtocolError> {
    let mut joints = [[JointPosIqErr::default(); JOINT_COUNT]; FINGER_COUNT];
    for finger in joints.iter_mut() {
        for joint in finger.iter_mut() {
            joint.position = cursor.i32_le("TPDO pos-iq-err")?;
            joint.iq_a = cursor.f32_le("TPDO pos-iq-err")?;
            joint.error_code = cursor.u32_le("TPDO pos-iq-err")?;
        }
    }
    Ok(joints)
}

/// 单关节的延迟测试时间戳（设备时钟，微秒）
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LatencyJointStamps {
    pub id: u32,
    pub t0_spinal_rx: u32,
    #[allow(dead_code)]
    pub t1_spinal_tx: u32,
    #[allow(dead_code)]
    pub t2_joint_rx: u32,
    #[allow(dead_code)]
    pub t3_joint_tx: u32,
    pub t4_spinal_rx: u32,
}

/// `read_id == 0xD0` 的完整载荷
#[derive(Debug, Clone, Copy)]
pub(crate) struct LatencyTestResult {
    pub joints: [LatencyJointStamps; FINGER_COUNT * JOINT_COUNT],
    #[allow(dead_code)]
    pub t5_spinal_tx: u32,
    pub t_usb_rx_tx: u32,
}

pub(crate) fn parse_latency_result(
    cursor: &mut Cursor<'_>,
) -> Result<LatencyTestResult, ProtocolError> {
    let mut joints = [LatencyJointStamps::default(); FINGER_COUNT * JOINT_COUNT];
    for joint in joints.iter_mut() {
        joint.id = cursor.u32_le("latency result")?;
        joint.t0_spinal_rx = cursor.u32_le("latency result")?;
        joint.t1_spinal_tx = cursor.u32_le("latency result")?;
        joint.t2_joint_rx = cursor.u32_le("latency result")?;
        joint.t3_joint_tx = cursor.u32_le("latency result")?;
        joint.t4_spinal_rx = cursor.u32_le("latency result")?;
    }
    let t5_spinal_tx = cursor.u32_le("latency result")?;
    let t_usb_rx_tx = cursor.u32_le("latency result")?;
    Ok(LatencyTestResult {
        joints,
        t5_spinal_tx,
        t_usb_rx_tx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_write_layout() {
        let mut targets = [[0i32; JOINT_COUNT]; FINGER_COUNT];
        targets[0][0] = 1;
        targets[4][3] = -2;

        let mut buf = [0u8; WRITE_REQUEST_LEN];
        encode_write(&mut buf, 0x01, &targets, 0xAABB_CCDD);

        assert_eq!(buf[0], 0x01);
        assert_eq!(buf[1], 0x01);
        assert_eq!(&buf[2..6], &1i32.to_le_bytes());
        assert_eq!(&buf[78..82], &(-2i32).to_le_bytes());
        assert_eq!(&buf[82..86], &0xAABB_CCDDu32.to_le_bytes());
    }

    #[test]
    fn test_positions_roundtrip() {
        let mut payload = Vec::new();
        for i in 0..20i32 {
            payload.extend_from_slice(&(i * 1000 - 7).to_le_bytes());
        }

        let mut cursor = Cursor::new(&payload);
        let positions = parse_positions(&mut cursor).unwrap();
        assert_eq!(positions[0][0], -7);
        assert_eq!(positions[1][0], 4 * 1000 - 7);
        assert_eq!(positions[4][3], 19 * 1000 - 7);
    }

    #[test]
    fn test_pos_iq_err_parses_interleaved_fields() {
        let mut payload = Vec::new();
        for i in 0..20u32 {
            payload.extend_from_slice(&(i as i32).to_le_bytes());
            payload.extend_from_slice(&(i as f32 * 0.5).to_le_bytes());
            payload.extend_from_slice(&(1u32 << (i % 24)).to_le_bytes());
        }

        let mut cursor = Cursor::new(&payload);
        let joints = parse_pos_iq_err(&mut cursor).unwrap();
        assert_eq!(joints[0][1].position, 1);
        assert_eq!(joints[0][1].error_code, 1 << 1);
        assert!((joints[2][3].iq_a - 5.5).abs() < 1e-6);
    }

    #[test]
    fn test_truncated_tpdo_is_error() {
        let payload = [0u8; 30];
        let mut cursor = Cursor::new(&payload);
        assert!(matches!(
            parse_positions(&mut cursor),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_latency_result_length() {
        // 20 × 24 + 8 = 488 字节
        let payload = vec![0u8; 488];
        let mut cursor = Cursor::new(&payload);
        assert!(parse_latency_result(&mut cursor).is_ok());
        assert_eq!(cursor.remaining(), 0);
    }
}
