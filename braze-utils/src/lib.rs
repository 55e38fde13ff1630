pub mod arm;
pub mod elf;
