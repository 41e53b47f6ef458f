pub mod download;
pub mod driver;
pub mod runner;
pub mod state_store;
pub mod store;
