pub mod gdt;
pub mod idt;
pub mod usermode;

pub use usermode::jump_to_usermode;

pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
}
