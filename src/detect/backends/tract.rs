#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::adapter::{InferenceAdapter, ModelInput};
use crate::detect::backends::{non_max_suppression, NMS_IOU_THRESHOLD};
use crate::detect::result::{BoundingBox, RawDetection};

/// YOLOv8 ONNX model run through tract.
///
/// Expects a `[1, 3, H, W]` f32 input in `0..1` and a `[1, 4 + C, N]` output
/// holding `(cx, cy, w, h)` followed by one score per class for each of the
/// N candidate boxes. Output is confidence-descending after NMS.
pub struct TractAdapter {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
}

impl TractAdapter {
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }

    fn build_input(&self, input: &ModelInput<'_>) -> Result<Tensor> {
        if input.width != self.width || input.height != self.height {
            return Err(anyhow!(
                "input size {}x{} does not match model input {}x{}",
                input.width,
                input.height,
                self.width,
                self.height
            ));
        }
        let expected_len = (input.width as usize)
            .checked_mul(input.height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("input dimensions overflow"))?;
        if input.pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                input.pixels.len()
            ));
        }

        let width = input.width as usize;
        let pixels = input.pixels;
        let tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 3, input.height as usize, width),
            |(_, channel, y, x)| pixels[(y * width + x) * 3 + channel] as f32 / 255.0,
        );
        Ok(tensor.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, threshold: f32) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[0] != 1 || shape[1] < 5 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let num_classes = shape[1] - 4;
        let candidates = shape[2];

        let mut found = Vec::new();
        for i in 0..candidates {
            let mut best_class = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for c in 0..num_classes {
                let score = view[[0, 4 + c, i]];
                if score > best_score {
                    best_score = score;
                    best_class = c;
                }
            }
            if !best_score.is_finite() || best_score < threshold {
                continue;
            }
            found.push(RawDetection {
                class_id: best_class as u32,
                confidence: best_score,
                bbox: BoundingBox::from_center(
                    view[[0, 0, i]],
                    view[[0, 1, i]],
                    view[[0, 2, i]],
                    view[[0, 3, i]],
                ),
            });
        }
        Ok(non_max_suppression(found, NMS_IOU_THRESHOLD))
    }
}

impl InferenceAdapter for TractAdapter {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&self, input: &ModelInput<'_>, threshold: f32) -> Result<Vec<RawDetection>> {
        let tensor = self.build_input(input)?;
        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, threshold)
    }

    fn warm_up(&self) -> Result<()> {
        let pixels = vec![0u8; self.width as usize * self.height as usize * 3];
        let input = ModelInput {
            pixels: &pixels,
            width: self.width,
            height: self.height,
        };
        self.infer(&input, 1.0).map(|_| ())
    }
}
