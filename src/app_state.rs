use std::sync::Arc;

use crate::services::kv::KvBackend;
use crate::services::queue::Broker;
use crate::services::submit::CaptchaService;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub captcha: Arc<CaptchaService>,
    pub kv: Arc<dyn KvBackend>,
    pub broker: Arc<dyn Broker>,
}

impl AppState {
    pub fn new(captcha: CaptchaService, kv: Arc<dyn KvBackend>, broker: Arc<dyn Broker>) -> Self {
        Self {
            captcha: Arc::new(captcha),
            kv,
            broker,
        }
    }
}
