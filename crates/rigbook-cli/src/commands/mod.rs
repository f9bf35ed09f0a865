pub mod checklist;
pub mod common;
pub mod export;
pub mod log;
pub mod sync;
pub mod trailer;
pub mod vehicle;
