pub mod connect;
pub mod kv;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod recognizer;
pub mod storage;
pub mod submit;
pub mod tracker;
