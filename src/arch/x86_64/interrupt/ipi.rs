use x86::apic::{
    ApicId, DeliveryMode, DeliveryStatus, DestinationMode, DestinationShorthand, Icr, Level,
    TriggerMode,
};

use crate::arch::driver::apic::LocalAPIC;
use crate::arch::interrupt::{POSTED_INTR_VECTOR_BASE, VECTOR_NOTIFY_VCPU};
use crate::arch::CurrentApic;
use crate::exception::ipi::{IpiKind, IpiTarget};
use crate::exception::HardwareIrqNumber;
use crate::smp::cpu::ProcessorId;

/// kick CPU使用notify向量：目标CPU在中断返回路径上会
/// 重新评估挂起的请求
const KICK_VECTOR: HardwareIrqNumber = VECTOR_NOTIFY_VCPU;

/// IPI的种类(架构相关，指定了向量号)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ArchIpiKind {
    vector: u8,
}

impl From<IpiKind> for ArchIpiKind {
    fn from(kind: IpiKind) -> Self {
        let vector = match kind {
            IpiKind::KickCpu => KICK_VECTOR.data(),
            IpiKind::SmpCall => VECTOR_NOTIFY_VCPU.data(),
            IpiKind::PostedIntr(vm) => POSTED_INTR_VECTOR_BASE.data() + vm,
            IpiKind::SpecVector(vec) => vec.data(),
        };
        Self {
            vector: (vector & 0xFF) as u8,
        }
    }
}

/// IPI投递目标
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArchIpiTarget {
    Current,
    All,
    Other,
    Specified(ApicId),
}

impl From<IpiTarget> for ArchIpiTarget {
    fn from(target: IpiTarget) -> Self {
        match target {
            IpiTarget::Current => ArchIpiTarget::Current,
            IpiTarget::All => ArchIpiTarget::All,
            IpiTarget::Other => ArchIpiTarget::Other,
            IpiTarget::Specified(cpu_id) => {
                ArchIpiTarget::Specified(Self::cpu_id_to_apic_id(cpu_id))
            }
        }
    }
}

impl From<ArchIpiTarget> for ApicId {
    fn from(val: ArchIpiTarget) -> Self {
        if let ArchIpiTarget::Specified(id) = val {
            return id;
        }
        return ApicId::X2Apic(0);
    }
}

impl From<ArchIpiTarget> for DestinationShorthand {
    fn from(val: ArchIpiTarget) -> Self {
        match val {
            ArchIpiTarget::Specified(_) => DestinationShorthand::NoShorthand,
            ArchIpiTarget::Current => DestinationShorthand::Myself,
            ArchIpiTarget::All => DestinationShorthand::AllIncludingSelf,
            ArchIpiTarget::Other => DestinationShorthand::AllExcludingSelf,
        }
    }
}

impl ArchIpiTarget {
    #[inline(always)]
    fn cpu_id_to_apic_id(cpu_id: ProcessorId) -> ApicId {
        // pCPU id与APIC id同构（见arch_current_cpu_id）
        ApicId::X2Apic(cpu_id.data())
    }
}

#[inline(always)]
pub fn send_ipi(kind: IpiKind, target: IpiTarget) {
    let ipi_vec = ArchIpiKind::from(kind).vector;
    let target = ArchIpiTarget::from(target);
    let shorthand: DestinationShorthand = target.into();
    let destination: ApicId = target.into();

    let icr = Icr::for_x2apic(
        ipi_vec,
        destination,
        shorthand,
        DeliveryMode::Fixed,
        DestinationMode::Physical,
        DeliveryStatus::Idle,
        Level::Assert,
        TriggerMode::Edge,
    );
    CurrentApic.write_icr(icr);
}

/// 向目标CPU发送INIT
///
/// LAPIC直通的vCPU屏蔽了notify向量，INIT是唯一能强制它
/// 退出guest的手段（VM-exit路径会处理挂起的请求）。
pub fn send_init_ipi(target_cpu: ProcessorId) {
    let target: ArchIpiTarget = IpiTarget::Specified(target_cpu).into();
    let icr = Icr::for_x2apic(
        0,
        target.into(),
        DestinationShorthand::NoShorthand,
        DeliveryMode::Init,
        DestinationMode::Physical,
        DeliveryStatus::Idle,
        Level::Assert,
        TriggerMode::Edge,
    );
    CurrentApic.write_icr(icr);
}
