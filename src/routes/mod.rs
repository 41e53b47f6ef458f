pub mod control;
pub mod health;
pub mod images;
pub mod metrics;
