//! GDT, TSS, and the per-thread ring-0 stack slot.

use lazy_static::lazy_static;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PrivilegeLevel, VirtAddr};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Stack for the double-fault handler: faults on a broken stack must
/// land somewhere intact.
const DF_STACK_SIZE: usize = 4096 * 5;
static mut DF_STACK: [u8; DF_STACK_SIZE] = [0; DF_STACK_SIZE];

/// Ring-0 stack used before the scheduler installs a thread's own.
const BOOT_STACK_SIZE: usize = 4096 * 5;
static mut BOOT_STACK: [u8; BOOT_STACK_SIZE] = [0; BOOT_STACK_SIZE];

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            let base = VirtAddr::from_ptr(unsafe { &raw const DF_STACK });
            base + DF_STACK_SIZE as u64
        };
        tss.privilege_stack_table[0] = {
            let base = VirtAddr::from_ptr(unsafe { &raw const BOOT_STACK });
            base + BOOT_STACK_SIZE as u64
        };
        tss
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub user_data: SegmentSelector,
    pub tss: SegmentSelector,
}

lazy_static! {
    pub static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_data = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_data = gdt.add_entry(Descriptor::user_data_segment());
        let user_code = gdt.add_entry(Descriptor::user_code_segment());
        let tss = gdt.add_entry(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                user_code,
                user_data,
                tss,
            },
        )
    };
}

pub fn init() {
    use x86_64::instructions::segmentation::{Segment, CS, DS, SS};
    use x86_64::instructions::tables::load_tss;

    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Selector pair for entering ring 3.
pub fn user_selectors() -> (SegmentSelector, SegmentSelector) {
    (
        SegmentSelector::new(GDT.1.user_code.index(), PrivilegeLevel::Ring3),
        SegmentSelector::new(GDT.1.user_data.index(), PrivilegeLevel::Ring3),
    )
}

/// Points the TSS ring-0 slot at the given kernel stack top, so traps
/// out of ring 3 land on the current thread's own stack. Called during
/// every context switch with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    unsafe {
        let tss = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}
