//! USB 设备实现
//!
//! 基于 rusb（libusb 绑定）：按 VID/PID/序列号选择唯一设备、claim 接口、
//! 收发 Bulk 传输。接收侧由专用事件线程阻塞读取并回调协议层。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rusb::{DeviceHandle, GlobalContext};
use tracing::{error, trace, warn};

use super::{
    BufferPool, RxCallback, Transport, TxBuffer, UsbError, MAX_TRANSFER_LENGTH,
    TRANSMIT_BUFFER_COUNT,
};

const TARGET_INTERFACE: u8 = 0x01;
const OUT_ENDPOINT: u8 = 0x01;
const IN_ENDPOINT: u8 = 0x81;

const TRANSMIT_TIMEOUT: Duration = Duration::from_millis(1000);
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// 灵巧手 USB 传输实现
///
/// `rusb::DeviceHandle` 本身允许多线程并发访问不同端点，
/// SDO/PDO 线程直接在各自线程上提交 OUT 传输，事件线程独占 IN 端点。
pub struct UsbTransport {
    handle: Arc<DeviceHandle<GlobalContext>>,
    pool: BufferPool,
    stop: Arc<AtomicBool>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    callback_installed: AtomicBool,
}

struct Candidate {
    handle: DeviceHandle<GlobalContext>,
    vendor_id: u16,
    product_id: u16,
    serial: String,
    matched: bool,
}

impl UsbTransport {
    /// 扫描并打开唯一匹配的设备
    ///
    /// 匹配规则与固件约定一致：必须带序列号描述符；`product_id` 与
    /// `serial_number` 为可选过滤条件。匹配数不等于 1 时构造失败，
    /// 并在日志中列出所有候选设备帮助定位。
    pub fn new(
        vendor_id: u16,
        product_id: Option<u16>,
        serial_number: Option<&str>,
    ) -> Result<Self, UsbError> {
        let mut handle = Self::select_device(vendor_id, product_id, serial_number)?;

        #[cfg(target_os = "linux")]
        {
            match handle.kernel_driver_active(TARGET_INTERFACE) {
                Ok(true) => handle.detach_kernel_driver(TARGET_INTERFACE)?,
                Ok(false) => {}
                Err(rusb::Error::NotSupported) => {}
                Err(e) => return Err(UsbError::Usb(e)),
            }
        }

        handle.claim_interface(TARGET_INTERFACE)?;

        Ok(Self {
            handle: Arc::new(handle),
            pool: BufferPool::new(TRANSMIT_BUFFER_COUNT, MAX_TRANSFER_LENGTH),
            stop: Arc::new(AtomicBool::new(false)),
            event_thread: Mutex::new(None),
            callback_installed: AtomicBool::new(false),
        })
    }

    fn select_device(
        vendor_id: u16,
        product_id: Option<u16>,
        serial_number: Option<&str>,
    ) -> Result<DeviceHandle<GlobalContext>, UsbError> {
        let mut candidates: Vec<Candidate> = Vec::new();

        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    warn!("A device descriptor failed to get: {}", e);
                    continue;
                }
            };

            if desc.vendor_id() != vendor_id {
                continue;
            }
            let serial_index = match desc.serial_number_string_index() {
                Some(idx) if idx != 0 => idx,
                _ => continue,
            };

            let handle = match device.open() {
                Ok(handle) => handle,
                Err(_) => continue,
            };
            let serial = match handle.read_string_descriptor_ascii(serial_index) {
                Ok(serial) => serial,
                Err(_) => continue,
            };

            let mut matched = true;
            if let Some(pid) = product_id {
                if desc.product_id() != pid {
                    matched = false;
                }
            }
            if let Some(filter) = serial_number {
                if serial != filter {
                    matched = false;
                }
            }

            candidates.push(Candidate {
                handle,
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                serial,
                matched,
            });
        }

        let matched_count = candidates.iter().filter(|c| c.matched).count();
        if matched_count == 1 {
            let selected = candidates
                .into_iter()
                .find(|c| c.matched)
                .ok_or_else(|| UsbError::Selection("candidate list inconsistent".into()))?;
            return Ok(selected.handle);
        }

        // 匹配数不为 1：打印候选清单后报错
        let mut filters = format!("vendor id (0x{:04x})", vendor_id);
        if let Some(pid) = product_id {
            filters.push_str(&format!(", product id (0x{:04x})", pid));
        }
        if let Some(serial) = serial_number {
            filters.push_str(&format!(", serial number ({})", serial));
        }
        if matched_count == 0 {
            error!("No device found with specified {}", filters);
        } else {
            error!("{} devices found with specified {}", matched_count, filters);
        }

        let mut match_index = 0;
        for (i, candidate) in candidates.iter().enumerate() {
            if candidate.matched {
                match_index += 1;
                error!(
                    "Device {} ({:04x}:{:04x}): Serial Number = {} <-- Matched #{}",
                    i + 1,
                    candidate.vendor_id,
                    candidate.product_id,
                    candidate.serial,
                    match_index
                );
            } else {
                error!(
                    "Device {} ({:04x}:{:04x}): Serial Number = {}",
                    i + 1,
                    candidate.vendor_id,
                    candidate.product_id,
                    candidate.serial
                );
            }
        }
        if matched_count == 0 {
            if !candidates.is_empty() {
                error!("Consider relaxing some filters");
            }
            Err(UsbError::Selection(format!("no device matched {}", filters)))
        } else {
            if serial_number.is_none() {
                error!("To ensure correct device selection, please specify the Serial Number");
            } else {
                error!(
                    "Multiple devices found, which is unusual. Consider using a device \
                     with a unique Serial Number"
                );
            }
            Err(UsbError::Selection(format!(
                "{} devices matched {}",
                matched_count, filters
            )))
        }
    }
}

impl Transport for UsbTransport {
    fn request_transmit_buffer(&self) -> Option<TxBuffer> {
        self.pool.request()
    }

    fn transmit(&self, buffer: TxBuffer, used: usize) {
        debug_assert!(used <= buffer.capacity());

        match self
            .handle
            .write_bulk(OUT_ENDPOINT, &buffer.as_slice()[..used], TRANSMIT_TIMEOUT)
        {
            Ok(_) => {}
            Err(rusb::Error::NoDevice) => {
                error!("Failed to submit transmit transfer: Device disconnected. Terminating...");
                std::process::exit(1);
            }
            Err(rusb::Error::Timeout) => {
                // 超时后端点可能进入 STALL，清除 halt 恢复后续传输
                if let Err(e) = self.handle.clear_halt(OUT_ENDPOINT) {
                    warn!("Failed to clear endpoint halt after timeout: {}", e);
                } else {
                    warn!("Transmit timed out, endpoint halt cleared");
                }
            }
            Err(e) => warn!("Transmit transfer failed: {}", e),
        }
        // buffer 在此 drop，自动归还缓冲池
    }

    fn receive(&self, callback: RxCallback) -> Result<(), UsbError> {
        if self.callback_installed.swap(true, Ordering::AcqRel) {
            return Err(UsbError::CallbackInstalled);
        }

        let handle = Arc::clone(&self.handle);
        let stop = Arc::clone(&self.stop);
        let thread = std::thread::Builder::new()
            .name("dexhand-usb-rx".into())
            .spawn(move || {
                let mut buffer = vec![0u8; MAX_TRANSFER_LENGTH];
                while !stop.load(Ordering::Relaxed) {
                    match handle.read_bulk(IN_ENDPOINT, &mut buffer, RECEIVE_TIMEOUT) {
                        Ok(0) | Err(rusb::Error::Timeout) => continue,
                        Ok(len) => callback(&buffer[..len]),
                        Err(e) => {
                            if stop.load(Ordering::Relaxed) {
                                break;
                            }
                            error!("Failed to re-submit receive transfer: {}. Terminating...", e);
                            std::process::exit(1);
                        }
                    }
                }
            })?;

        *self.event_thread.lock() = Some(thread);
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.event_thread.lock().take() {
            let _ = thread.join();
        }

        // 事件线程汇合后句柄只剩本地引用，可以拿到独占访问做清理
        if let Some(handle) = Arc::get_mut(&mut self.handle) {
            let _ = handle.release_interface(TARGET_INTERFACE);
            #[cfg(target_os = "linux")]
            {
                let _ = handle.attach_kernel_driver(TARGET_INTERFACE);
            }
            trace!("USB interface released");
        }
    }
}
