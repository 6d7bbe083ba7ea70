//! SDO 载荷编解码
//!
//! 请求：读 `{0x30, index:u16(BE), sub_index}`；写 `{控制字节按宽度
//! 0x20/0x22/0x24/0x28, index:u16(BE), sub_index, 小端值}`。
//! 响应：读成功 0x35/0x37/0x39/0x3D（按宽度）、读失败 0x33、
//! 写成功 0x21、写失败 0x23，失败响应附带 4 字节错误码。

use super::storage::DataWidth;
use super::{Cursor, ProtocolError};

pub(crate) const CONTROL_READ: u8 = 0x30;

pub(crate) const READ_REQUEST_LEN: usize = 4;

pub(crate) const fn write_request_len(width: DataWidth) -> usize {
    4 + width.bytes()
}

const fn write_control(width: DataWidth) -> u8 {
    match width {
        DataWidth::W1 => 0x20,
        DataWidth::W2 => 0x22,
        DataWidth::W4 => 0x24,
        DataWidth::W8 => 0x28,
    }
}

fn read_success_width(control: u8) -> Option<DataWidth> {
    match control {
        0x35 => Some(DataWidth::W1),
        0x37 => Some(DataWidth::W2),
        0x39 => Some(DataWidth::W4),
        0x3D => Some(DataWidth::W8),
        _ => None,
    }
}

/// 编码读请求到 `buf`（长度必须为 [`READ_REQUEST_LEN`]）
pub(crate) fn encode_read(buf: &mut [u8], index: u16, sub_index: u8) {
    buf[0] = CONTROL_READ;
    buf[1..3].copy_from_slice(&index.to_be_bytes());
    buf[3] = sub_index;
}

/// 编码写请求到 `buf`（长度必须为 [`write_request_len`]）
///
/// `raw` 是 8 字节值缓存，只取低 `width` 字节上线。
pub(crate) fn encode_write(buf: &mut [u8], index: u16, sub_index: u8, raw: u64, width: DataWidth) {
    buf[0] = write_control(width);
    buf[1..3].copy_from_slice(&index.to_be_bytes());
    buf[3] = sub_index;
    buf[4..4 + width.bytes()].copy_from_slice(&raw.to_le_bytes()[..width.bytes()]);
}

/// 解析出的单条 SDO 响应
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SdoResponse {
    ReadSuccess {
        index: u16,
        sub_index: u8,
        width: DataWidth,
        /// 零扩展到 64 位的小端值
        value: u64,
    },
    ReadError {
        index: u16,
        sub_index: u8,
        error_code: u32,
    },
    WriteSuccess {
        index: u16,
        sub_index: u8,
    },
    WriteError {
        index: u16,
        sub_index: u8,
        error_code: u32,
    },
    /// 帧内填充（0x00），本帧解析结束
    Padding,
}

/// 从游标解析下一条响应
pub(crate) fn parse_response(cursor: &mut Cursor<'_>) -> Result<SdoResponse, ProtocolError> {
    let control = match cursor.peek_u8() {
        Some(control) => control,
        None => return Ok(SdoResponse::Padding),
    };

    if control == 0x00 {
        return Ok(SdoResponse::Padding);
    }

    if let Some(width) = read_success_width(control) {
        let header = cursor.take(4 + width.bytes(), "SDO read-success")?;
        let index = u16::from_be_bytes([header[1], header[2]]);
        let sub_index = header[3];
        let mut value_bytes = [0u8; 8];
        value_bytes[..width.bytes()].copy_from_slice(&header[4..4 + width.bytes()]);
        return Ok(SdoResponse::ReadSuccess {
            index,
            sub_index,
            width,
            value: u64::from_le_bytes(value_bytes),
        });
    }

    match control {
        0x33 => {
            let _ = cursor.u8("SDO read-error")?;
            let index = cursor.u16_be("SDO read-error")?;
            let sub_index = cursor.u8("SDO read-error")?;
            let error_code = cursor.u32_le("SDO read-error")?;
            Ok(SdoResponse::ReadError {
                index,
                sub_index,
                error_code,
            })
        }
        0x21 => {
            let _ = cursor.u8("SDO write-success")?;
            let index = cursor.u16_be("SDO write-success")?;
            let sub_index = cursor.u8("SDO write-success")?;
            Ok(SdoResponse::WriteSuccess { index, sub_index })
        }
        0x23 => {
            let _ = cursor.u8("SDO write-error")?;
            let index = cursor.u16_be("SDO write-error")?;
            let sub_index = cursor.u8("SDO write-error")?;
            let error_code = cursor.u32_le("SDO write-error")?;
            Ok(SdoResponse::WriteError {
                index,
                sub_index,
                error_code,
            })
        }
        other => Err(ProtocolError::InvalidSdoControl(other)),
    }
}
