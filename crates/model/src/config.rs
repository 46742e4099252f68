use candle_core::{Device, Error, Result};
use serde::{Deserialize, Serialize};

/// One resolution stage of the hybrid network.
///
/// The table is explicit configuration, never derived from input shapes: a
/// checkpoint written for one table must refuse to load into another.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub channels_in: usize,
    pub channels_out: usize,
    pub num_heads: usize,
    pub drop_path: f64,
}

impl StageConfig {
    pub const fn new(
        channels_in: usize,
        channels_out: usize,
        num_heads: usize,
        drop_path: f64,
    ) -> Self {
        Self {
            channels_in,
            channels_out,
            num_heads,
            drop_path,
        }
    }
}

/// High-level configuration for assembling the hybrid classifier.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub num_classes: usize,
    pub in_channels: usize,
    pub image_size: usize,
    pub stem_channels: usize,
    pub window_size: usize,
    pub expansion_ratio: usize,
    pub mlp_ratio: usize,
    pub head_hidden: usize,
    pub head_num_heads: usize,
    pub head_attn_dropout: f32,
    pub head_dropout: (f32, f32),
    pub stages: Vec<StageConfig>,
    pub device: Device,
}

impl ModelConfig {
    /// Defaults matching the reference network: 224x224 RGB input, a
    /// 24-channel stem, four stages widening 32 -> 48 -> 64 -> 96 with
    /// 2/3/4/6 heads, 7x7 attention windows.
    pub fn new(num_classes: usize, device: Device) -> Self {
        Self {
            num_classes,
            in_channels: 3,
            image_size: 224,
            stem_channels: 24,
            window_size: 7,
            expansion_ratio: 4,
            mlp_ratio: 4,
            head_hidden: 192,
            head_num_heads: 6,
            head_attn_dropout: 0.1,
            head_dropout: (0.3, 0.2),
            stages: vec![
                StageConfig::new(24, 32, 2, 0.1),
                StageConfig::new(32, 48, 3, 0.2),
                StageConfig::new(48, 64, 4, 0.3),
                StageConfig::new(64, 96, 6, 0.4),
            ],
            device,
        }
    }

    pub fn final_channels(&self) -> usize {
        self.stages
            .last()
            .map(|stage| stage.channels_out)
            .unwrap_or(self.stem_channels)
    }

    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::Msg("num_classes must be greater than zero".into()));
        }
        if self.in_channels == 0 {
            return Err(Error::Msg("in_channels must be greater than zero".into()));
        }
        if self.image_size == 0 {
            return Err(Error::Msg("image_size must be greater than zero".into()));
        }
        if self.stem_channels == 0 {
            return Err(Error::Msg("stem_channels must be greater than zero".into()));
        }
        if self.window_size == 0 {
            return Err(Error::Msg("window_size must be greater than zero".into()));
        }
        if self.expansion_ratio == 0 || self.mlp_ratio == 0 {
            return Err(Error::Msg("expansion ratios must be greater than zero".into()));
        }
        if self.stages.is_empty() {
            return Err(Error::Msg("stage table must not be empty".into()));
        }

        let mut incoming = self.stem_channels;
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.channels_in != incoming {
                return Err(Error::Msg(format!(
                    "stage {} expects {} input channels but receives {}",
                    index, stage.channels_in, incoming
                )));
            }
            if stage.num_heads == 0 {
                return Err(Error::Msg(format!(
                    "stage {} must have at least one attention head",
                    index
                )));
            }
            if stage.channels_out % stage.num_heads != 0 {
                return Err(Error::Msg(format!(
                    "stage {} width {} is not divisible by its head count {}",
                    index, stage.channels_out, stage.num_heads
                )));
            }
            if !(0.0..1.0).contains(&stage.drop_path) {
                return Err(Error::Msg(format!(
                    "stage {} drop_path {} must be in [0, 1)",
                    index, stage.drop_path
                )));
            }
            incoming = stage.channels_out;
        }

        if self.final_channels() % self.head_num_heads != 0 {
            return Err(Error::Msg(format!(
                "classifier width {} is not divisible by its head count {}",
                self.final_channels(),
                self.head_num_heads
            )));
        }
        for p in [
            self.head_attn_dropout,
            self.head_dropout.0,
            self.head_dropout.1,
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Msg(format!("dropout {p} must be in [0, 1)")));
            }
        }
        Ok(())
    }

    /// Serializable architecture identity stored inside checkpoints.
    pub fn descriptor(&self) -> ArchDescriptor {
        ArchDescriptor {
            num_classes: self.num_classes,
            in_channels: self.in_channels,
            image_size: self.image_size,
            stem_channels: self.stem_channels,
            window_size: self.window_size,
            expansion_ratio: self.expansion_ratio,
            mlp_ratio: self.mlp_ratio,
            head_hidden: self.head_hidden,
            head_num_heads: self.head_num_heads,
            stages: self.stages.clone(),
        }
    }
}

/// Architecture metadata persisted alongside model weights. Two checkpoints
/// are interchangeable exactly when their descriptors are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchDescriptor {
    pub num_classes: usize,
    pub in_channels: usize,
    pub image_size: usize,
    pub stem_channels: usize,
    pub window_size: usize,
    pub expansion_ratio: usize,
    pub mlp_ratio: usize,
    pub head_hidden: usize,
    pub head_num_heads: usize,
    pub stages: Vec<StageConfig>,
}
