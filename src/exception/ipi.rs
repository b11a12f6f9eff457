use crate::exception::HardwareIrqNumber;
use crate::smp::cpu::ProcessorId;

/// IPI的种类
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IpiKind {
    /// 踢一脚目标CPU，让它重新评估挂起的请求
    KickCpu,
    /// SMP function call / vCPU notify
    SmpCall,
    /// 指定VM槽位的posted-interrupt通知
    PostedIntr(u32),
    /// 指定的向量
    SpecVector(HardwareIrqNumber),
}

/// IPI投递目标
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IpiTarget {
    /// 当前CPU
    Current,
    /// 所有CPU
    All,
    /// 除了当前CPU以外的所有CPU
    Other,
    /// 指定的CPU
    Specified(ProcessorId),
}

/// 发送一个IPI
#[inline(always)]
pub fn send_ipi(kind: IpiKind, target: IpiTarget) {
    crate::arch::interrupt::ipi::send_ipi(kind, target);
}
