use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// CAPTCHA family. Each job type has its own queue, blob namespace and
/// preprocessing rules.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Captchas from the federal tax service site.
    #[strum(to_string = "fns")]
    Fns,

    /// Captchas from the alcohol declaration site.
    #[strum(to_string = "alco", serialize = "alcolicenziat")]
    #[serde(alias = "alcolicenziat")]
    Alco,
}

impl JobType {
    pub const ALL: [JobType; 2] = [JobType::Fns, JobType::Alco];

    /// Routing key binding this job type's queue to the shared exchange.
    pub fn routing_key(self) -> &'static str {
        match self {
            JobType::Fns => "fns",
            JobType::Alco => "alco",
        }
    }

    /// Blob store namespace holding this job type's payloads.
    pub fn namespace(self) -> &'static str {
        self.routing_key()
    }

    /// Expected `(height, width)` of a submitted image.
    pub fn image_dimensions(self) -> (u32, u32) {
        match self {
            JobType::Fns => (100, 200),
            JobType::Alco => (80, 160),
        }
    }
}
