#![cfg_attr(target_os = "none", no_std)]
// clippy的配置
#![deny(clippy::all)]
#![allow(clippy::bad_bit_mask)]
// 我们允许在函数中使用return语句（尤其是长函数时，我们推荐这么做）
#![allow(clippy::let_and_return)]
#![allow(clippy::needless_return)]
#![allow(clippy::upper_case_acronyms)]
#![allow(dead_code)]

#[cfg(test)]
#[macro_use]
extern crate std;

/// 导出x86_64架构相关的代码，命名为arch模块
#[macro_use]
mod arch;
#[macro_use]
mod libs;
mod config;
mod debug;
mod exception;
mod init;
mod mm;
mod smp;
mod time;
mod virt;

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate bitflags;
#[cfg(target_arch = "x86_64")]
extern crate x86;

pub use crate::exception::irqdesc::{IrqHandler, IrqReturn};
pub use crate::exception::manage::irq_manager;
pub use crate::init::init_hypervisor_core;

/// 全局的panic处理函数
#[cfg(target_os = "none")]
#[panic_handler]
#[no_mangle]
pub fn panic(info: &core::panic::PanicInfo) -> ! {
    use log::error;

    error!("Hypervisor Panic Occurred.");

    if let Some(loc) = info.location() {
        error!(
            "Location:\n\tFile: {}\n\tLine: {}, Column: {}",
            loc.file(),
            loc.line(),
            loc.column()
        );
    }
    error!("Message:\n\t{}", info.message());

    unsafe { crate::arch::cpu::halt_forever() }
}

// 裸机环境下使用自带的早期分配器作为全局分配器
#[cfg(target_os = "none")]
#[global_allocator]
static HYPERVISOR_ALLOCATOR: crate::mm::allocator::early::EarlyAllocator =
    crate::mm::allocator::early::EarlyAllocator;
