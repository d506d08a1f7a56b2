pub mod mem;
pub mod pkru;
