use anyhow::Result;

use crate::detect::result::RawDetection;

/// RGB24 pixels at model input resolution.
#[derive(Clone, Copy, Debug)]
pub struct ModelInput<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// Uniform call into a detection model.
///
/// One adapter instance is loaded per process and shared by every pipeline,
/// so `infer` takes `&self` and implementations must tolerate concurrent
/// calls. Returned boxes are in the coordinate frame of the given input, and
/// detections with confidence strictly below `threshold` are already removed.
///
/// Output order is adapter-defined. Callers must not assume a tie-break among
/// equal-confidence detections.
pub trait InferenceAdapter: Send + Sync {
    /// Adapter identifier for logs.
    fn name(&self) -> &'static str;

    fn infer(&self, input: &ModelInput<'_>, threshold: f32) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook, called once after loading.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}
