//! 根模式下的异常路由
//!
//! hypervisor自身几乎不应该收到异常：NMI转交给当前正在
//! 运行的vCPU，机器检查走MC处理器，其余一律是致命错误。

use log::error;

use crate::smp::core::smp_get_processor_id;
use crate::virt::vm::{governing_vcpu, VcpuRequest};

/// 根模式下收到NMI：向当前vCPU注入虚拟NMI
pub fn do_nmi() {
    let cpu = smp_get_processor_id();
    if let Some(vcpu) = governing_vcpu(cpu) {
        vcpu.make_request(VcpuRequest::VIRTUAL_NMI);
    } else {
        error!("NMI in root mode with no governing vcpu on cpu {}", cpu.data());
    }
}

/// 机器检查异常
pub fn do_machine_check() -> ! {
    error!(
        "machine check exception on cpu {}",
        smp_get_processor_id().data()
    );
    panic!("machine check in hypervisor context");
}

/// 其余不应出现的异常：记录现场并停机
pub fn do_unexpected_exception(vector: u32, error_code: u64) -> ! {
    error!(
        "unexpected exception {} (error code {:#x}) on cpu {}",
        vector,
        error_code,
        smp_get_processor_id().data()
    );
    panic!("unexpected exception in hypervisor context");
}
