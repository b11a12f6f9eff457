pub mod apic;
pub mod hpet;
pub mod tsc;
