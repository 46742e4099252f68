//! Tensor building blocks for the hybrid convolution/attention classifier.
//!
//! Everything here operates on Candle tensors and registers its parameters
//! through a [`candle_nn::VarBuilder`], so the model crate can assemble
//! blocks under one `VarMap` and checkpoint them by name.

pub mod attention;
pub mod conv;
pub mod drop;
pub mod se;
pub mod window;

pub use attention::{GlobalAttention, WindowAttention};
pub use conv::{DownsampleBlock, InvertedResidual, Stem};
pub use drop::DropPath;
pub use se::SqueezeExcite;
pub use window::{window_partition, window_reverse, WindowGrid};
