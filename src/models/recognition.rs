use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates, `[x_min, y_min, x_max, y_max]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl From<[f32; 4]> for BoundingBox {
    fn from([x_min, y_min, x_max, y_max]: [f32; 4]) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }
}

impl From<BoundingBox> for [f32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x_min, b.y_min, b.x_max, b.y_max]
    }
}

/// One object found by the recognizer: a character label, where it is, and
/// how sure the model is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub score: f64,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: impl Into<BoundingBox>, score: f64) -> Self {
        Self {
            label: label.into(),
            bbox: bbox.into(),
            score,
        }
    }
}

/// Preprocessed image in channel-first (CHW) layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInput {
    /// `[channels, height, width]`
    pub shape: [usize; 3],
    pub data: Vec<f32>,
}

impl ModelInput {
    pub fn channels(&self) -> usize {
        self.shape[0]
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }

    /// Value at channel `c`, row `y`, column `x`.
    pub fn at(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[c * self.height() * self.width() + y * self.width() + x]
    }
}
