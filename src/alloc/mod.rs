pub mod bookkeeper;
pub mod bootstrap;
pub mod rawbuf;
pub mod region;
pub mod registry;
pub mod safe_heap;
pub mod worklist;
