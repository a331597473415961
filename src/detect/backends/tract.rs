#![cfg(feature = "backend-tract")]

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{Detector, InferenceError};
use crate::detect::result::RawDetection;
use crate::detect::yolo::{self, DecodeGeometry};
use crate::frame::Frame;

/// YOLOv8 ONNX model run on the CPU through tract.
///
/// Frames are resized (nearest neighbour) to the model input and fed as
/// NCHW float RGB in 0..1. Only the model file is read from disk.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_width: u32,
    input_height: u32,
    classes: usize,
    score_threshold: f32,
    nms_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
        classes: usize,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
            classes,
            score_threshold: 0.25,
            nms_threshold: yolo::DEFAULT_NMS_THRESHOLD,
        })
    }

    pub fn with_thresholds(mut self, score: f32, nms: f32) -> Self {
        self.score_threshold = score;
        self.nms_threshold = nms;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let expected_len = (frame.width as usize)
            .checked_mul(frame.height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        let pixels = frame.pixels();
        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                pixels.len()
            ));
        }

        let src_w = frame.width as usize;
        let src_h = frame.height as usize;
        let dst_w = self.input_width as usize;
        let dst_h = self.input_height as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, dst_h, dst_w), |(_, c, y, x)| {
            let sx = (x * src_w / dst_w).min(src_w - 1);
            let sy = (y * src_h / dst_h).min(src_h - 1);
            pixels[(sy * src_w + sx) * 3 + c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn run(&self, frame: &Frame) -> Result<Vec<RawDetection>> {
        if frame.width == 0 || frame.height == 0 {
            return Err(anyhow!("empty frame"));
        }
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let flat: Vec<f32> = view.iter().copied().collect();
        let geometry = DecodeGeometry {
            input_width: self.input_width,
            input_height: self.input_height,
            frame_width: frame.width,
            frame_height: frame.height,
        };
        let candidates = yolo::decode(&flat, self.classes, self.score_threshold, geometry);
        Ok(yolo::nms(candidates, self.nms_threshold))
    }
}

impl Detector for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(
        &mut self,
        frame: &Frame,
        _timeout: Duration,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        self.run(frame).map_err(InferenceError::failed)
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::new(
            vec![0u8; (self.input_width * self.input_height * 3) as usize],
            self.input_width,
            self.input_height,
            std::time::Instant::now(),
            0,
        );
        self.run(&blank).map(|_| ())
    }
}
