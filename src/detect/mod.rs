//! Detection model seam.
//!
//! The pipelines only see [`InferenceAdapter`]; concrete backends live in
//! `backends/`. A process loads one adapter and shares it as
//! `Arc<dyn InferenceAdapter>`.

mod adapter;
pub mod backends;
mod result;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};

pub use adapter::{InferenceAdapter, ModelInput};
pub use backends::StubAdapter;
pub use result::{BoundingBox, Detection, DetectionBatch, RawDetection};

#[cfg(feature = "backend-tract")]
pub use backends::TractAdapter;

/// Load the shared adapter for this process.
///
/// With a model path, loads it through the tract backend (feature
/// `backend-tract`). Without one, falls back to the stub adapter only when
/// `allow_stub` is set.
pub fn open_adapter(
    model_path: Option<&Path>,
    model_input_size: (u32, u32),
    allow_stub: bool,
) -> Result<Arc<dyn InferenceAdapter>> {
    let adapter: Arc<dyn InferenceAdapter> = match model_path {
        Some(path) => load_model(path, model_input_size)?,
        None if allow_stub => {
            log::warn!("no model configured; using stub adapter");
            Arc::new(StubAdapter::default())
        }
        None => {
            return Err(anyhow!(
                "no model configured (set ROADGUARD_MODEL_PATH or pass --stub)"
            ))
        }
    };
    adapter.warm_up()?;
    log::info!("inference adapter ready: {}", adapter.name());
    Ok(adapter)
}

#[cfg(feature = "backend-tract")]
fn load_model(path: &Path, (width, height): (u32, u32)) -> Result<Arc<dyn InferenceAdapter>> {
    log::info!("loading model {} at {}x{}", path.display(), width, height);
    Ok(Arc::new(TractAdapter::new(path, width, height)?))
}

#[cfg(not(feature = "backend-tract"))]
fn load_model(path: &Path, _size: (u32, u32)) -> Result<Arc<dyn InferenceAdapter>> {
    Err(anyhow!(
        "cannot load {}: built without the backend-tract feature",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_adapter_requires_model_or_stub() {
        assert!(open_adapter(None, (640, 640), false).is_err());
        let adapter = open_adapter(None, (640, 640), true).expect("stub adapter");
        assert_eq!(adapter.name(), "stub");
    }
}
