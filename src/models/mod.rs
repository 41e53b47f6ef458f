pub mod job;
pub mod state;
