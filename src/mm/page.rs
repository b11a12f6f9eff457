use core::fmt::Debug;
use core::marker::PhantomData;
use core::ops::{Add, Sub};
use core::sync::atomic::{compiler_fence, AtomicU64, Ordering};

use log::warn;
use system_error::SystemError;

use crate::mm::allocator::page_frame::FrameAllocator;
use crate::mm::{MemoryManagementArch, MMArch, PhysAddr, VirtAddr};

/// 页表层级
///
/// `Level4K`表示页表项直接映射4K页的那一级，`Level512G`是根页表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum PageLevel {
    None,
    Level4K,
    Level2M,
    Level1G,
    Level512G,
    LevelNum,
}

impl Add<usize> for PageLevel {
    type Output = Self;

    fn add(self, other: usize) -> Self {
        let result = self as usize + other;
        match result {
            0 => PageLevel::None,
            1 => PageLevel::Level4K,
            2 => PageLevel::Level2M,
            3 => PageLevel::Level1G,
            4 => PageLevel::Level512G,
            _ => PageLevel::LevelNum,
        }
    }
}

impl Sub<usize> for PageLevel {
    type Output = Self;

    fn sub(self, other: usize) -> Self {
        let result = (self as isize) - other as isize;
        match result {
            0 => PageLevel::None,
            1 => PageLevel::Level4K,
            2 => PageLevel::Level2M,
            3 => PageLevel::Level1G,
            4 => PageLevel::Level512G,
            _ => PageLevel::None,
        }
    }
}

impl PageLevel {
    /// 此级页表中，一个页表项所映射的地址范围大小
    #[inline(always)]
    pub const fn entry_page_size(&self) -> usize {
        match self {
            PageLevel::Level4K => 1 << 12,
            PageLevel::Level2M => 1 << 21,
            PageLevel::Level1G => 1 << 30,
            PageLevel::Level512G => 1 << 39,
            _ => 0,
        }
    }

    /// 此级页表项下标在虚拟地址中的偏移量
    #[inline(always)]
    pub const fn entry_shift(&self) -> usize {
        match self {
            PageLevel::Level4K => 12,
            PageLevel::Level2M => 21,
            PageLevel::Level1G => 30,
            PageLevel::Level512G => 39,
            _ => 0,
        }
    }
}

/// 允许大页叶子/大页拆分的层级
///
/// 只有L3（1G）和L2（2M）能承载大页。把层级约束放进类型里，
/// 拆分函数就不可能收到别的层级。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LargePageLevel {
    Level2M,
    Level1G,
}

impl TryFrom<PageLevel> for LargePageLevel {
    type Error = SystemError;

    fn try_from(level: PageLevel) -> Result<Self, Self::Error> {
        match level {
            PageLevel::Level2M => Ok(LargePageLevel::Level2M),
            PageLevel::Level1G => Ok(LargePageLevel::Level1G),
            _ => Err(SystemError::EINVAL),
        }
    }
}

/// 分页flavor：宿主机MMU与EPT共享一套页表引擎，
/// 差异全部集中在这个trait的实现里。
pub trait PagingFlavor: Debug + Clone + Copy + 'static {
    /// 本flavor的页表项中允许出现的全部属性位
    const PROT_MASK: u64;
    /// 大页的size位
    const HUGE_BIT: u64 = 1 << 7;
    /// 新分配的中间页表项携带的访问权限
    const DEFAULT_TABLE_PROT: u64;

    /// 页表项是否存在（映射或指向下级页表）
    fn entry_present(entry: u64) -> bool;

    /// `level`上是否允许以`prot`建立大页映射
    fn large_page_supported(level: LargePageLevel, prot: u64) -> bool;

    /// 建立大页叶子时调整执行权限
    fn tweak_exe_right(prot: u64) -> u64;

    /// 拆分大页、为后继页表项恢复执行权限
    fn recover_exe_right(prot: u64) -> u64;

    /// 页表项写入后的缓存行维护
    fn flush_cacheline(entry_virt: VirtAddr);
}

/// 修改映射还是删除映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageModifyKind {
    Modify,
    Del,
}

// L1TF：所有"不存在"的页表项都指向这张专门的页，
// 错误预测的访问只能读到它，而不是任意的L1D残留。
static SANITIZED_PAGE_PATTERN: AtomicU64 = AtomicU64::new(0);

/// 初始化sanitized page
///
/// `page`自身的每个槽位都会被写成指向自己的absence模式，
/// 之后所有转为absent的页表项都会复用这个模式。
///
/// ## Safety
///
/// `page`必须是一个专门保留的、不再另作他用的物理页
pub unsafe fn init_sanitized_page(page: PhysAddr) -> Result<(), SystemError> {
    if !page.check_aligned(MMArch::PAGE_SIZE) {
        return Err(SystemError::EINVAL);
    }
    let pattern = page.data() as u64 & MMArch::ENTRY_ADDRESS_MASK;
    let virt = MMArch::phys_2_virt(page).ok_or(SystemError::EFAULT)?;
    for i in 0..MMArch::PAGE_ENTRY_NUM {
        MMArch::write::<u64>(virt.add(i * MMArch::PAGE_ENTRY_SIZE), pattern);
    }
    compiler_fence(Ordering::SeqCst);
    SANITIZED_PAGE_PATTERN.store(pattern, Ordering::Release);
    return Ok(());
}

/// 当前的absence模式
#[inline(always)]
pub fn sanitized_entry() -> u64 {
    SANITIZED_PAGE_PATTERN.load(Ordering::Acquire)
}

/// 某一级页表。只是一个(物理地址, 层级)的轻量视图，
/// 真正的页面归属于整个层级结构。
#[derive(Debug, Clone, Copy)]
pub struct PageTable {
    /// 当前页表所在的物理地址
    phys: PhysAddr,
    /// 当前页表的层级
    level: PageLevel,
}

impl PageTable {
    pub fn new(phys: PhysAddr, level: PageLevel) -> Self {
        Self { phys, level }
    }

    #[inline(always)]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    #[inline(always)]
    pub fn level(&self) -> PageLevel {
        self.level
    }

    /// 获取当前页表自身所在的虚拟地址
    ///
    /// ## Safety
    ///
    /// `phys`必须指向一张仍然有效的页表页
    #[inline(always)]
    pub unsafe fn virt(&self) -> VirtAddr {
        return MMArch::phys_2_virt(self.phys).unwrap();
    }

    /// 获取当前页表的第i个页表项所在的虚拟地址
    ///
    /// ## Safety
    ///
    /// 同[`PageTable::virt`]
    pub unsafe fn entry_virt(&self, i: usize) -> Option<VirtAddr> {
        if i < MMArch::PAGE_ENTRY_NUM {
            return Some(self.virt().add(i * MMArch::PAGE_ENTRY_SIZE));
        }
        return None;
    }

    /// 获取当前页表的第i个页表项
    ///
    /// ## Safety
    ///
    /// 同[`PageTable::virt`]
    pub unsafe fn entry(&self, i: usize) -> Option<u64> {
        let entry_virt = self.entry_virt(i)?;
        return Some(MMArch::read::<u64>(entry_virt));
    }

    /// 根据虚拟地址，获取对应的页表项在当前页表中的下标
    pub fn index_of(&self, addr: VirtAddr) -> usize {
        return (addr.data() >> self.level.entry_shift()) & MMArch::PAGE_ENTRY_MASK;
    }
}

/// 页表映射器
///
/// 以[`PagingFlavor`]为参数的通用4级页表引擎，
/// 宿主机MMU和EPT各自给出flavor即可复用全部逻辑。
///
/// 引擎本身从不发出TLB/EPT失效；修改或删除映射之后，
/// 由调用方负责失效相应的翻译缓存。
#[derive(Debug)]
pub struct PageMapper<F: PagingFlavor, A: FrameAllocator> {
    /// 根页表的物理地址
    root: PhysAddr,
    /// 页表页的分配器
    allocator: A,
    phantom: PhantomData<F>,
}

impl<F: PagingFlavor, A: FrameAllocator> PageMapper<F, A> {
    /// 创建一套新的页表。根页表被初始化为全absent
    pub fn create(mut allocator: A) -> Option<Self> {
        let root = unsafe { allocator.allocate_one() }?;
        unsafe { Self::sanitize_table(root) };
        return Some(Self {
            root,
            allocator,
            phantom: PhantomData,
        });
    }

    /// 接管一套已有的页表
    ///
    /// ## Safety
    ///
    /// `root`必须是一个由同类mapper创建的根页表
    pub unsafe fn new(root: PhysAddr, allocator: A) -> Self {
        Self {
            root,
            allocator,
            phantom: PhantomData,
        }
    }

    #[inline(always)]
    pub fn root_phys(&self) -> PhysAddr {
        self.root
    }

    /// 返回最上层的页表
    pub fn table(&self) -> PageTable {
        PageTable::new(self.root, PageLevel::Level512G)
    }

    /// 把整页写成absence模式
    unsafe fn sanitize_table(page: PhysAddr) {
        let pattern = sanitized_entry();
        let virt = MMArch::phys_2_virt(page).unwrap();
        for i in 0..MMArch::PAGE_ENTRY_NUM {
            MMArch::write::<u64>(virt.add(i * MMArch::PAGE_ENTRY_SIZE), pattern);
        }
    }

    /// 写入一个页表项并做缓存行维护
    unsafe fn set_entry(table: &PageTable, index: usize, entry: u64) {
        let entry_virt = table.entry_virt(index).unwrap();
        MMArch::write::<u64>(entry_virt, entry);
        F::flush_cacheline(entry_virt);
    }

    #[inline(always)]
    fn entry_is_leaf(level: PageLevel, entry: u64) -> bool {
        return level == PageLevel::Level4K || (entry & F::HUGE_BIT) != 0;
    }

    /// 建立`[vaddr, vaddr+size)`到`[paddr, ...)`的映射
    ///
    /// 前置条件：三个参数都按4K对齐，目标范围当前未映射。
    /// 对齐和长度允许时优先使用1G/2M大页。
    ///
    /// ## Safety
    ///
    /// 新映射生效后由此hierarchy翻译的访问都指向`paddr`一侧，
    /// 调用方要保证目标物理范围确实归这段映射使用
    pub unsafe fn add_map(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        prot: u64,
    ) -> Result<(), SystemError> {
        if !vaddr.check_aligned(MMArch::PAGE_SIZE)
            || !paddr.check_aligned(MMArch::PAGE_SIZE)
            || size == 0
            || size & (MMArch::PAGE_SIZE - 1) != 0
        {
            return Err(SystemError::EINVAL);
        }
        // 引擎绝不发出flavor词汇表之外的属性位
        if prot & !F::PROT_MASK != 0 {
            return Err(SystemError::EINVAL);
        }

        let table = self.table();
        return self.do_add(&table, vaddr, paddr, size, prot);
    }

    unsafe fn do_add(
        &mut self,
        table: &PageTable,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        size: usize,
        prot: u64,
    ) -> Result<(), SystemError> {
        let level = table.level();
        let entry_size = level.entry_page_size();
        let mut va = vaddr;
        let mut pa = paddr;
        let mut remain = size;

        while remain > 0 {
            let index = table.index_of(va);
            // 本页表项覆盖的范围内还剩多少
            let offset_in_entry = va.data() & (entry_size - 1);
            let chunk = core::cmp::min(remain, entry_size - offset_in_entry);
            let entry = table.entry(index).unwrap();

            if level == PageLevel::Level4K {
                if F::entry_present(entry) {
                    warn!(
                        "add_map: {:?} already mapped (entry={:#x}), skip",
                        va, entry
                    );
                } else {
                    let new = (pa.data() as u64 & MMArch::ENTRY_ADDRESS_MASK) | prot;
                    Self::set_entry(table, index, new);
                }
            } else if offset_in_entry == 0
                && chunk == entry_size
                && pa.check_aligned(entry_size)
                && LargePageLevel::try_from(level)
                    .map(|l| F::large_page_supported(l, prot))
                    .unwrap_or(false)
            {
                // 大页叶子
                if F::entry_present(entry) {
                    warn!(
                        "add_map: large page at {:?} already mapped (entry={:#x}), skip",
                        va, entry
                    );
                } else {
                    let leaf_prot = F::tweak_exe_right(prot) | F::HUGE_BIT;
                    let new = (pa.data() as u64 & MMArch::ENTRY_ADDRESS_MASK) | leaf_prot;
                    Self::set_entry(table, index, new);
                }
            } else {
                // 需要下降一级
                if F::entry_present(entry) && (entry & F::HUGE_BIT) != 0 {
                    // 调用方违反了"目标范围未映射"的约定
                    warn!(
                        "add_map: {:?} overlaps an existing large page (entry={:#x}), skip",
                        va, entry
                    );
                } else {
                    let next = if F::entry_present(entry) {
                        PhysAddr::new((entry & MMArch::ENTRY_ADDRESS_MASK) as usize)
                    } else {
                        let page = self.allocator.allocate_one().ok_or(SystemError::ENOMEM)?;
                        Self::sanitize_table(page);
                        let new = (page.data() as u64 & MMArch::ENTRY_ADDRESS_MASK)
                            | F::DEFAULT_TABLE_PROT;
                        Self::set_entry(table, index, new);
                        page
                    };
                    let next_table = PageTable::new(next, level - 1);
                    self.do_add(&next_table, va, pa, chunk, prot)?;
                }
            }

            va = va.add(chunk);
            pa = pa.add(chunk);
            remain -= chunk;
        }
        return Ok(());
    }

    /// 修改或删除`[vaddr, vaddr+size)`的映射
    ///
    /// - 完整落在范围内的大页叶子被原地修改/删除；
    /// - 只被部分覆盖的大页叶子先被拆分成512个后继项；
    /// - 删除后全为absent的中间页表会被回收，其父项被sanitize。
    ///
    /// 修改路径遇到absent项只告警（低端内存的MTRR设置会路过
    /// 这样的空洞）；删除路径在顶级页表遇到absent项是致命错误。
    ///
    /// ## Safety
    ///
    /// 本函数不发出TLB/EPT失效，调用方必须在使用旧翻译的路径
    /// 恢复之前完成失效
    pub unsafe fn modify_or_del_map(
        &mut self,
        vaddr: VirtAddr,
        size: usize,
        prot_set: u64,
        prot_clr: u64,
        kind: PageModifyKind,
    ) -> Result<(), SystemError> {
        if !vaddr.check_aligned(MMArch::PAGE_SIZE) || size == 0 || size & (MMArch::PAGE_SIZE - 1) != 0
        {
            return Err(SystemError::EINVAL);
        }
        if (prot_set | prot_clr) & !F::PROT_MASK != 0 {
            return Err(SystemError::EINVAL);
        }

        let table = self.table();
        return self.do_modify(&table, vaddr, size, prot_set, prot_clr, kind);
    }

    unsafe fn do_modify(
        &mut self,
        table: &PageTable,
        vaddr: VirtAddr,
        size: usize,
        prot_set: u64,
        prot_clr: u64,
        kind: PageModifyKind,
    ) -> Result<(), SystemError> {
        let level = table.level();
        let entry_size = level.entry_page_size();
        let mut va = vaddr;
        let mut remain = size;

        while remain > 0 {
            let index = table.index_of(va);
            let offset_in_entry = va.data() & (entry_size - 1);
            let chunk = core::cmp::min(remain, entry_size - offset_in_entry);
            let mut entry = table.entry(index).unwrap();

            if !F::entry_present(entry) {
                match kind {
                    PageModifyKind::Modify => {
                        warn!("modify_or_del_map: {:?} not mapped, skip", va);
                    }
                    PageModifyKind::Del => {
                        if level == PageLevel::Level512G {
                            panic!(
                                "modify_or_del_map: delete an unmapped top-level range at {:?}",
                                va
                            );
                        }
                    }
                }
                va = va.add(chunk);
                remain -= chunk;
                continue;
            }

            if Self::entry_is_leaf(level, entry) {
                let fully_covered = offset_in_entry == 0 && chunk == entry_size;
                if !fully_covered {
                    // 部分覆盖的大页：先拆分再走下级
                    let large = LargePageLevel::try_from(level)?;
                    self.split_large_page(table, index, large)?;
                    entry = table.entry(index).unwrap();
                } else {
                    match kind {
                        PageModifyKind::Modify => {
                            let addr_and_size = entry & (MMArch::ENTRY_ADDRESS_MASK | F::HUGE_BIT);
                            let old_prot = entry & F::PROT_MASK & !F::HUGE_BIT;
                            let new_prot = (old_prot | prot_set) & !prot_clr;
                            Self::set_entry(table, index, addr_and_size | new_prot);
                        }
                        PageModifyKind::Del => {
                            Self::set_entry(table, index, sanitized_entry());
                        }
                    }
                    va = va.add(chunk);
                    remain -= chunk;
                    continue;
                }
            }

            // 中间页表项：递归处理子范围
            let child = PhysAddr::new((entry & MMArch::ENTRY_ADDRESS_MASK) as usize);
            let child_table = PageTable::new(child, level - 1);
            self.do_modify(&child_table, va, chunk, prot_set, prot_clr, kind)?;

            // 子页表全空则回收
            if kind == PageModifyKind::Del && Self::table_fully_absent(&child_table) {
                Self::set_entry(table, index, sanitized_entry());
                self.allocator.free_one(child);
            }

            va = va.add(chunk);
            remain -= chunk;
        }
        return Ok(());
    }

    /// 把一个大页叶子拆分成512个下一级的叶子
    ///
    /// 新页表继承原叶子的基址和（经`recover_exe_right`修正的）
    /// 权限；1G拆成2M时保留size位，2M拆成4K时清除size位。
    unsafe fn split_large_page(
        &mut self,
        table: &PageTable,
        index: usize,
        level: LargePageLevel,
    ) -> Result<(), SystemError> {
        let entry = table.entry(index).unwrap();
        debug_assert!((entry & F::HUGE_BIT) != 0);

        let page = self.allocator.allocate_one().ok_or(SystemError::ENOMEM)?;
        let base = entry & MMArch::ENTRY_ADDRESS_MASK;
        let mut child_prot = F::recover_exe_right(entry & F::PROT_MASK & !F::HUGE_BIT);
        let child_size = match level {
            LargePageLevel::Level1G => {
                // 2M的后继叶子仍然是大页
                child_prot |= F::HUGE_BIT;
                PageLevel::Level2M.entry_page_size()
            }
            LargePageLevel::Level2M => PageLevel::Level4K.entry_page_size(),
        };

        let table_virt = MMArch::phys_2_virt(page).unwrap();
        for i in 0..MMArch::PAGE_ENTRY_NUM {
            let child_entry = (base + (i * child_size) as u64) | child_prot;
            let entry_virt = table_virt.add(i * MMArch::PAGE_ENTRY_SIZE);
            MMArch::write::<u64>(entry_virt, child_entry);
            F::flush_cacheline(entry_virt);
        }

        compiler_fence(Ordering::SeqCst);
        let new = (page.data() as u64 & MMArch::ENTRY_ADDRESS_MASK) | F::DEFAULT_TABLE_PROT;
        Self::set_entry(table, index, new);
        // 此处不失效TLB：和其余修改路径一样交由调用方处理
        return Ok(());
    }

    unsafe fn table_fully_absent(table: &PageTable) -> bool {
        for i in 0..MMArch::PAGE_ENTRY_NUM {
            let entry = table.entry(i).unwrap();
            if F::entry_present(entry) {
                return false;
            }
        }
        return true;
    }

    /// 查询`vaddr`的映射，命中时返回(页表项, 所在页的大小)
    pub fn lookup_entry(&self, vaddr: VirtAddr) -> Option<(u64, usize)> {
        let mut table = self.table();
        loop {
            let index = table.index_of(vaddr);
            let entry = unsafe { table.entry(index) }?;
            if !F::entry_present(entry) {
                return None;
            }
            if Self::entry_is_leaf(table.level(), entry) {
                return Some((entry, table.level().entry_page_size()));
            }
            let child = PhysAddr::new((entry & MMArch::ENTRY_ADDRESS_MASK) as usize);
            table = PageTable::new(child, table.level() - 1);
        }
    }

    /// 拿回分配器（销毁mapper但不回收页表页）
    pub fn into_allocator(self) -> A {
        self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::allocator::page_frame::HeapFrameAllocator;

    /// 测试用flavor：IA-32e风格的位含义
    #[derive(Debug, Clone, Copy)]
    struct TestFlavor;

    const PRESENT: u64 = 1 << 0;
    const RW: u64 = 1 << 1;
    const NX: u64 = 1 << 63;

    impl PagingFlavor for TestFlavor {
        const PROT_MASK: u64 = PRESENT | RW | (1 << 7) | NX;
        const DEFAULT_TABLE_PROT: u64 = PRESENT | RW;

        fn entry_present(entry: u64) -> bool {
            entry & PRESENT != 0
        }

        fn large_page_supported(_level: LargePageLevel, _prot: u64) -> bool {
            true
        }

        fn tweak_exe_right(prot: u64) -> u64 {
            prot
        }

        fn recover_exe_right(prot: u64) -> u64 {
            prot
        }

        fn flush_cacheline(_entry_virt: VirtAddr) {}
    }

    fn new_mapper() -> PageMapper<TestFlavor, HeapFrameAllocator> {
        PageMapper::create(HeapFrameAllocator::new()).unwrap()
    }

    fn init_sanitizer() -> u64 {
        use std::sync::OnceLock;
        // 各测试共享同一张sanitized page，避免互相覆盖模式
        static PATTERN: OnceLock<u64> = OnceLock::new();
        *PATTERN.get_or_init(|| {
            let mut alloc = HeapFrameAllocator::new();
            let page = unsafe { alloc.allocate_one() }.unwrap();
            unsafe { init_sanitized_page(page).unwrap() };
            page.data() as u64 & MMArch::ENTRY_ADDRESS_MASK
        })
    }

    #[test]
    fn test_one_gig_leaf() {
        init_sanitizer();
        let mut mapper = new_mapper();
        // S1: 1GiB对齐的映射应该恰好生成一个1G叶子
        unsafe {
            mapper
                .add_map(
                    VirtAddr::new(0x8000_0000),
                    PhysAddr::new(0x8000_0000),
                    0x4000_0000,
                    PRESENT | RW,
                )
                .unwrap();
        }
        // 根页表之外只应分配一个L3页表页
        assert_eq!(mapper.allocator_mut().outstanding(), 2);

        let (entry, size) = mapper.lookup_entry(VirtAddr::new(0x8000_1000)).unwrap();
        assert_eq!(size, 0x4000_0000);
        assert_eq!(entry & MMArch::ENTRY_ADDRESS_MASK, 0x8000_0000);
        assert_ne!(entry & (1 << 7), 0);
    }

    #[test]
    fn test_lookup_offsets() {
        init_sanitizer();
        let mut mapper = new_mapper();
        unsafe {
            mapper
                .add_map(
                    VirtAddr::new(0x20_0000),
                    PhysAddr::new(0x4000_0000),
                    0x40_0000,
                    PRESENT | RW,
                )
                .unwrap();
        }
        // 属性1：范围内每个地址都能查到对应的物理地址
        for k in [0usize, 0x1000, 0x1F_F000, 0x20_0000, 0x3F_F000] {
            let va = VirtAddr::new(0x20_0000 + k);
            let (entry, size) = mapper.lookup_entry(va).unwrap();
            let base = (entry & MMArch::ENTRY_ADDRESS_MASK) as usize;
            let pa = base + (va.data() & (size - 1));
            assert_eq!(pa, 0x4000_0000 + k);
        }
        assert!(mapper.lookup_entry(VirtAddr::new(0x60_0000)).is_none());
    }

    #[test]
    fn test_split_large_page() {
        let pattern = init_sanitizer();
        let mut mapper = new_mapper();
        unsafe {
            mapper
                .add_map(
                    VirtAddr::new(0x8000_0000),
                    PhysAddr::new(0x8000_0000),
                    0x4000_0000,
                    PRESENT | RW,
                )
                .unwrap();
            // S2: 删除1G大页中间的一个2M块，触发拆分
            mapper
                .modify_or_del_map(
                    VirtAddr::new(0x8020_0000),
                    0x20_0000,
                    0,
                    0,
                    PageModifyKind::Del,
                )
                .unwrap();
        }

        // 拆出来的页表里，被删的那项是absence模式，其余是2M叶子
        assert!(mapper.lookup_entry(VirtAddr::new(0x8020_0000)).is_none());
        let (entry, size) = mapper.lookup_entry(VirtAddr::new(0x8000_0000)).unwrap();
        assert_eq!(size, 0x20_0000);
        assert_eq!(entry & MMArch::ENTRY_ADDRESS_MASK, 0x8000_0000);
        let (entry, _) = mapper.lookup_entry(VirtAddr::new(0x8040_0000)).unwrap();
        assert_eq!(entry & MMArch::ENTRY_ADDRESS_MASK, 0x8040_0000);

        // 属性4：转为absent的页表项就是sanitized模式
        let l3 = {
            let root = mapper.table();
            let e = unsafe { root.entry(root.index_of(VirtAddr::new(0x8000_0000))) }.unwrap();
            PageTable::new(
                PhysAddr::new((e & MMArch::ENTRY_ADDRESS_MASK) as usize),
                PageLevel::Level1G,
            )
        };
        let l2 = {
            let e = unsafe { l3.entry(l3.index_of(VirtAddr::new(0x8000_0000))) }.unwrap();
            PageTable::new(
                PhysAddr::new((e & MMArch::ENTRY_ADDRESS_MASK) as usize),
                PageLevel::Level2M,
            )
        };
        let deleted = unsafe { l2.entry(1) }.unwrap();
        assert_eq!(deleted, pattern);
        // 拆分不满足回收条件，不应释放任何页表页
        assert_eq!(mapper.allocator_mut().freed(), 0);
    }

    #[test]
    fn test_del_reclaims_interior_pages() {
        init_sanitizer();
        let mut mapper = new_mapper();
        unsafe {
            mapper
                .add_map(
                    VirtAddr::new(0x20_0000),
                    PhysAddr::new(0x4000_0000),
                    0x1000,
                    PRESENT | RW,
                )
                .unwrap();
        }
        // root + L3 + L2 + L1
        assert_eq!(mapper.allocator_mut().outstanding(), 4);

        unsafe {
            mapper
                .modify_or_del_map(VirtAddr::new(0x20_0000), 0x1000, 0, 0, PageModifyKind::Del)
                .unwrap();
        }
        // 属性2：全空的中间页表逐级回收，只剩根页表
        assert_eq!(mapper.allocator_mut().outstanding(), 1);
        assert!(mapper.lookup_entry(VirtAddr::new(0x20_0000)).is_none());
    }

    #[test]
    fn test_modify_prot_bits() {
        init_sanitizer();
        let mut mapper = new_mapper();
        unsafe {
            mapper
                .add_map(
                    VirtAddr::new(0x1000),
                    PhysAddr::new(0x2000),
                    0x1000,
                    PRESENT | RW,
                )
                .unwrap();
            mapper
                .modify_or_del_map(
                    VirtAddr::new(0x1000),
                    0x1000,
                    NX,
                    RW,
                    PageModifyKind::Modify,
                )
                .unwrap();
        }
        let (entry, _) = mapper.lookup_entry(VirtAddr::new(0x1000)).unwrap();
        assert_ne!(entry & NX, 0);
        assert_eq!(entry & RW, 0);
        assert_eq!(entry & MMArch::ENTRY_ADDRESS_MASK, 0x2000);
    }

    #[test]
    fn test_misaligned_rejected() {
        init_sanitizer();
        let mut mapper = new_mapper();
        let err = unsafe {
            mapper.add_map(
                VirtAddr::new(0x1001),
                PhysAddr::new(0x2000),
                0x1000,
                PRESENT,
            )
        };
        assert_eq!(err, Err(SystemError::EINVAL));
        // flavor词汇表之外的位被拒绝
        let err = unsafe {
            mapper.add_map(
                VirtAddr::new(0x1000),
                PhysAddr::new(0x2000),
                0x1000,
                PRESENT | (1 << 9),
            )
        };
        assert_eq!(err, Err(SystemError::EINVAL));
    }
}
