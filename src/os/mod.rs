pub mod mem;
pub mod phdr;
pub mod pkey;
