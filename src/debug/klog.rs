//! 内核日志
//!
//! 整个代码库都通过`log` facade打日志，这里提供后端：
//! 裸机上写COM1串口。宿主机构建（单元测试）不装后端，
//! 输出交给测试harness。

use log::{LevelFilter, Metadata, Record};

struct Klogger;

static KLOGGER: Klogger = Klogger;

impl log::Log for Klogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        serial_write_fmt(format_args!(
            "[{:>5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// 安装日志后端。BSP早期调用一次
pub fn klog_init(level: LevelFilter) {
    #[cfg(target_os = "none")]
    serial_init();
    log::set_logger(&KLOGGER).ok();
    log::set_max_level(level);
}

#[cfg(target_os = "none")]
fn serial_init() {
    use crate::config::SERIAL_LOG_PORT;
    use x86::io::outb;
    unsafe {
        // 8N1, 115200
        outb(SERIAL_LOG_PORT + 1, 0x00);
        outb(SERIAL_LOG_PORT + 3, 0x80);
        outb(SERIAL_LOG_PORT, 0x01);
        outb(SERIAL_LOG_PORT + 1, 0x00);
        outb(SERIAL_LOG_PORT + 3, 0x03);
        outb(SERIAL_LOG_PORT + 2, 0xC7);
        outb(SERIAL_LOG_PORT + 4, 0x0B);
    }
}

fn serial_write_fmt(args: core::fmt::Arguments) {
    use core::fmt::Write;
    SerialWriter.write_fmt(args).ok();
}

struct SerialWriter;

impl core::fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        #[cfg(target_os = "none")]
        {
            use crate::config::SERIAL_LOG_PORT;
            use x86::io::{inb, outb};
            for byte in s.bytes() {
                unsafe {
                    while inb(SERIAL_LOG_PORT + 5) & 0x20 == 0 {
                        core::hint::spin_loop();
                    }
                    outb(SERIAL_LOG_PORT, byte);
                }
            }
        }
        #[cfg(not(target_os = "none"))]
        {
            let _ = s;
        }
        return Ok(());
    }
}
