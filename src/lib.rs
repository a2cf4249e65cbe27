//! Asynchronous CAPTCHA recognition.
//!
//! An HTTP producer stores submitted images in a chunked key-value blob
//! store, records a task and publishes a message per job type. Workers
//! consume their job type's queue, run preprocessing, the recognizer and
//! postprocessing, and write the result back to the task record.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
