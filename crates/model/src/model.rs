//! Hybrid convolution/attention classifier assembled from the stage table.

use candle_core::{Error, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::{
    config::{ArchDescriptor, ModelConfig},
    head::ClassifierHead,
    stage::HybridStage,
};
use layers::Stem;

pub struct HybridClassifier {
    config: ModelConfig,
    varmap: VarMap,
    stem: Stem,
    stages: Vec<HybridStage>,
    head: ClassifierHead,
}

impl HybridClassifier {
    /// Builds the network and registers every parameter in one `VarMap`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &config.device);

        let stem = Stem::new(config.in_channels, config.stem_channels, vb.pp("stem"))?;
        let mut stages = Vec::with_capacity(config.stages.len());
        for (index, stage_cfg) in config.stages.iter().enumerate() {
            stages.push(HybridStage::new(
                &config,
                stage_cfg,
                index == 0,
                vb.pp(format!("stage{index}")),
            )?);
        }
        let head = ClassifierHead::new(&config, vb.pp("head"))?;

        Ok(Self {
            config,
            varmap,
            stem,
            stages,
            head,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn descriptor(&self) -> ArchDescriptor {
        self.config.descriptor()
    }

    /// The parameter registry backing this model. Checkpointing and the
    /// optimizer both operate on it.
    pub fn var_map(&self) -> &VarMap {
        &self.varmap
    }

    /// Named parameters sorted by name, so checkpoint contents are stable.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap();
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }

    /// Human-readable architecture summary for startup logging.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "hybrid classifier: {} classes, stem {} ch, window {}",
            self.config.num_classes, self.config.stem_channels, self.config.window_size
        )];
        for (index, stage) in self.config.stages.iter().enumerate() {
            lines.push(format!(
                "  stage {}: {} -> {} channels, {} heads, drop_path {:.2}",
                index, stage.channels_in, stage.channels_out, stage.num_heads, stage.drop_path
            ));
        }
        lines.push(format!("  parameters: {}", self.num_parameters()));
        lines.join("\n")
    }

    /// Full forward pass: `(batch, in_channels, h, w)` pixels in `[0, 1]` to
    /// `(batch, num_classes)` probabilities.
    pub fn forward_t(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let (_, channels, _, _) = images.dims4()?;
        if channels != self.config.in_channels {
            return Err(Error::Msg(format!(
                "model expects {} input channels, got {}",
                self.config.in_channels, channels
            )));
        }

        let mut h = self.stem.forward(images, train)?;
        for stage in &self.stages {
            h = stage.forward(&h, train)?;
        }
        self.head.forward(&h, train)
    }
}
