//! VM与vCPU对象
//!
//! 本层只维护资源管理核心需要的最小状态：每个pCPU上当前的
//! governing vCPU、vCPU的挂起请求位、以及VM级的直通配置。
//! 完整的调度器和VM生命周期状态机在上层，不在这里。

use ::core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::warn;
use system_error::SystemError;

use crate::config::MAX_VM_NUM;
use crate::libs::spinlock::SpinLock;
use crate::mm::percpu::{PerCpu, PerCpuVar};
use crate::mm::PhysAddr;
use crate::smp::cpu::ProcessorId;

int_like!(VmId, u32);

bitflags! {
    /// vCPU的挂起请求。VM-entry前由vCPU循环逐位消费
    pub struct VcpuRequest: u64 {
        /// posted-interrupt事件：下次VM-entry时自注入
        const EVENT_POSTED_INTR = 1 << 0;
        /// 处理SMP call（LAPIC直通目标的VM-exit路径）
        const SMP_CALL = 1 << 1;
        /// 注入虚拟NMI
        const VIRTUAL_NMI = 1 << 2;
    }
}

/// vCPU的运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VcpuState {
    Init = 0,
    Running = 1,
    Zombie = 2,
}

/// vCPU
#[derive(Debug)]
pub struct VirtCpu {
    vm_id: VmId,
    vcpu_id: u32,
    /// 绑定的物理CPU（分区式，不迁移）
    pcpu: ProcessorId,
    state: AtomicU8,
    requests: AtomicU64,
    /// local APIC是否直通给guest
    lapic_pt: bool,
}

impl VirtCpu {
    pub fn new(vm_id: VmId, vcpu_id: u32, pcpu: ProcessorId, lapic_pt: bool) -> Arc<Self> {
        Arc::new(Self {
            vm_id,
            vcpu_id,
            pcpu,
            state: AtomicU8::new(VcpuState::Init as u8),
            requests: AtomicU64::new(0),
            lapic_pt,
        })
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    pub fn vcpu_id(&self) -> u32 {
        self.vcpu_id
    }

    pub fn pcpu(&self) -> ProcessorId {
        self.pcpu
    }

    pub fn has_lapic_pt(&self) -> bool {
        self.lapic_pt
    }

    pub fn state(&self) -> VcpuState {
        match self.state.load(Ordering::Acquire) {
            1 => VcpuState::Running,
            2 => VcpuState::Zombie,
            _ => VcpuState::Init,
        }
    }

    pub fn set_state(&self, state: VcpuState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.state() == VcpuState::Running
    }

    /// 挂起一个请求，vCPU会在下次VM-entry前处理
    pub fn make_request(&self, request: VcpuRequest) {
        self.requests.fetch_or(request.bits(), Ordering::AcqRel);
    }

    /// 取出并清除一个请求位
    pub fn test_and_clear_request(&self, request: VcpuRequest) -> bool {
        let prev = self.requests.fetch_and(!request.bits(), Ordering::AcqRel);
        return prev & request.bits() != 0;
    }

    pub fn pending_requests(&self) -> VcpuRequest {
        VcpuRequest::from_bits_truncate(self.requests.load(Ordering::Acquire))
    }
}

/// VM级配置与状态
#[derive(Debug)]
pub struct Vm {
    id: VmId,
    inner: SpinLock<InnerVm>,
    /// local APIC直通
    lapic_pt: bool,
    /// PMU直通
    pmu_pt: bool,
}

#[derive(Debug)]
struct InnerVm {
    vcpus: Vec<Arc<VirtCpu>>,
    /// EPT根页表。映射内容由per-VM的ept锁序列化
    ept_root: Option<PhysAddr>,
}

impl Vm {
    pub fn new(id: VmId, lapic_pt: bool, pmu_pt: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            inner: SpinLock::new(InnerVm {
                vcpus: Vec::new(),
                ept_root: None,
            }),
            lapic_pt,
            pmu_pt,
        })
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn has_lapic_pt(&self) -> bool {
        self.lapic_pt
    }

    pub fn has_pmu_pt(&self) -> bool {
        self.pmu_pt
    }

    pub fn add_vcpu(&self, vcpu: Arc<VirtCpu>) {
        self.inner.lock_irqsave().vcpus.push(vcpu);
    }

    pub fn vcpus(&self) -> Vec<Arc<VirtCpu>> {
        self.inner.lock_irqsave().vcpus.clone()
    }

    pub fn set_ept_root(&self, root: PhysAddr) {
        self.inner.lock_irqsave().ept_root = Some(root);
    }

    pub fn ept_root(&self) -> Option<PhysAddr> {
        self.inner.lock_irqsave().ept_root
    }

    /// 创建本VM的EPT根页表
    ///
    /// 后续的映射操作通过[`crate::arch::vm::ept::EptPageMapper`]
    /// 进行，由per-VM的ept锁序列化，修改后由调用方发INVEPT。
    pub fn init_ept<A: crate::mm::allocator::page_frame::FrameAllocator>(
        &self,
        allocator: A,
    ) -> Result<A, SystemError> {
        let mapper = crate::arch::vm::ept::EptPageMapper::create(allocator)
            .ok_or(SystemError::ENOMEM)?;
        self.set_ept_root(mapper.root_phys());
        return Ok(mapper.into_allocator());
    }

    /// 按本VM的直通配置构建vCPU的MSR拦截位图
    ///
    /// `apicv_advanced`由平台能力决定（见
    /// `is_apicv_advanced_feature_supported`）。
    pub fn build_msr_bitmap(
        &self,
        apicv_advanced: bool,
    ) -> crate::arch::vm::vmx::VmxMsrBitmap {
        return crate::arch::vm::vmx::msr::init_msr_bitmap(
            self.lapic_pt,
            self.pmu_pt,
            apicv_advanced,
        );
    }
}

/// VM槽位表
static VM_TABLE: SpinLock<[Option<Arc<Vm>>; MAX_VM_NUM]> =
    SpinLock::new([const { None }; MAX_VM_NUM]);

/// 每个pCPU上当前的governing vCPU
static mut GOVERNING_VCPU: Option<PerCpuVar<Option<Arc<VirtCpu>>>> = None;

/// 初始化virt层的每CPU状态。只应在BSP早期调用一次
pub fn virt_init() -> Result<(), SystemError> {
    let mut governing = Vec::with_capacity(PerCpu::MAX_CPU_NUM as usize);
    for _ in 0..PerCpu::MAX_CPU_NUM {
        governing.push(None);
    }
    unsafe {
        GOVERNING_VCPU = Some(PerCpuVar::new(governing).ok_or(SystemError::ENOMEM)?);
    }
    return Ok(());
}

#[cfg(test)]
pub fn virt_init_for_test() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        virt_init().unwrap();
    });
}

/// 注册一个VM到槽位表
pub fn register_vm(vm: Arc<Vm>) -> Result<(), SystemError> {
    let id = vm.id().data() as usize;
    if id >= MAX_VM_NUM {
        return Err(SystemError::EINVAL);
    }
    let mut table = VM_TABLE.lock_irqsave();
    if table[id].is_some() {
        return Err(SystemError::EEXIST);
    }
    table[id] = Some(vm);
    return Ok(());
}

pub fn get_vm(id: VmId) -> Option<Arc<Vm>> {
    let table = VM_TABLE.lock_irqsave();
    return table.get(id.data() as usize)?.clone();
}

/// 指定pCPU上当前的governing vCPU
pub fn governing_vcpu(cpu: ProcessorId) -> Option<Arc<VirtCpu>> {
    let var = unsafe { GOVERNING_VCPU.as_ref() }?;
    return var.force_get(cpu).clone();
}

/// 切换pCPU的governing vCPU（调度切入/切出路径调用）
pub fn set_governing_vcpu(cpu: ProcessorId, vcpu: Option<Arc<VirtCpu>>) {
    if let Some(var) = unsafe { GOVERNING_VCPU.as_ref() } {
        unsafe {
            *var.force_get_mut(cpu) = vcpu;
        }
    }
}

/// 踢一脚远端vCPU，让它尽快回到hypervisor重新评估挂起的请求
///
/// LAPIC直通的运行中vCPU屏蔽了通知向量，只能用INIT强制
/// VM-exit；其余情况一个普通的kick IPI就够了。
pub fn kick_vcpu(vcpu: &Arc<VirtCpu>) {
    use crate::exception::ipi::{send_ipi, IpiKind, IpiTarget};

    if vcpu.has_lapic_pt() && vcpu.is_running() {
        crate::arch::interrupt::ipi::send_init_ipi(vcpu.pcpu());
    } else {
        send_ipi(IpiKind::KickCpu, IpiTarget::Specified(vcpu.pcpu()));
    }
}

/// posted-interrupt通知到达：给目标VM在本pCPU上的vCPU挂事件
///
/// 分区式设计下每个pCPU上一个VM至多运行一个vCPU，找当前
/// governing vCPU即可。
pub fn signal_posted_intr(vm_id: u32) {
    let cpu = crate::smp::core::smp_get_processor_id();
    if let Some(vcpu) = governing_vcpu(cpu) {
        if vcpu.vm_id().data() == vm_id {
            vcpu.make_request(VcpuRequest::EVENT_POSTED_INTR);
            return;
        }
    }
    warn!(
        "posted-interrupt for vm {} but no matching vcpu on cpu {}",
        vm_id,
        cpu.data()
    );
}
