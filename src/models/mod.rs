pub mod api;
pub mod job;
pub mod message;
pub mod recognition;
pub mod task;
