//! Batch sources feeding the epoch loop.
//!
//! The orchestrator treats data as an opaque source of `(image, one-hot
//! label)` batches with one finite pass per epoch. [`ShardImageSource`]
//! streams safetensors shard files — each holding an `images` tensor of
//! shape `(n, channels, h, w)` (u8 pixels or pre-normalized f32) and a
//! `labels` index tensor of shape `(n,)` — shuffling shard order and
//! example order with a seeded RNG. [`InMemorySource`] serves tests and
//! small fixtures from tensors already in memory.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::TrainingError;

/// One step's worth of examples.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    /// `(batch, channels, h, w)` pixels in `[0, 1]`.
    pub images: Tensor,
    /// `(batch, num_classes)` one-hot rows.
    pub labels: Tensor,
}

/// A finite, restartable stream of batches.
pub trait BatchSource {
    /// Next batch of the current pass, or `None` once the pass is exhausted.
    fn next_batch(&mut self) -> Result<Option<ImageBatch>, TrainingError>;

    /// Starts a fresh pass over the whole source, reshuffled.
    fn reset(&mut self) -> Result<(), TrainingError>;

    fn num_classes(&self) -> usize;
}

/// Lists `*.safetensors` shard files in a directory, sorted by name.
pub fn discover_shards(dir: &Path) -> Result<Vec<PathBuf>, TrainingError> {
    let entries = std::fs::read_dir(dir).map_err(|err| {
        TrainingError::initialization(format!(
            "failed to read shard directory {}: {err}",
            dir.display()
        ))
    })?;
    let mut shards = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| {
            TrainingError::initialization(format!("failed to read shard entry: {err}"))
        })?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("safetensors") {
            shards.push(path);
        }
    }
    if shards.is_empty() {
        return Err(TrainingError::initialization(format!(
            "no .safetensors shards found in {}",
            dir.display()
        )));
    }
    shards.sort();
    Ok(shards)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

/// Casts pixel data to f32 in `[0, 1]`; u8 shards carry raw bytes.
fn normalize_images(images: Tensor) -> Result<Tensor, TrainingError> {
    if images.dims().len() != 4 {
        return Err(TrainingError::runtime(format!(
            "image tensor must be rank 4 (n, c, h, w), got {:?}",
            images.dims()
        )));
    }
    match images.dtype() {
        DType::U8 => {
            let floats = images.to_dtype(DType::F32).map_err(to_runtime_error)?;
            floats.affine(1.0 / 255.0, 0.0).map_err(to_runtime_error)
        }
        DType::F32 => Ok(images),
        other => Err(TrainingError::runtime(format!(
            "unsupported image dtype {other:?}, expected u8 or f32"
        ))),
    }
}

/// Expands class indices into one-hot rows.
fn one_hot(labels: &Tensor, num_classes: usize, device: &Device) -> Result<Tensor, TrainingError> {
    let labels = labels.to_dtype(DType::U32).map_err(to_runtime_error)?;
    let indices = labels
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<u32>()
        .map_err(to_runtime_error)?;

    let mut rows = vec![0f32; indices.len() * num_classes];
    for (example, &class) in indices.iter().enumerate() {
        if class as usize >= num_classes {
            return Err(TrainingError::runtime(format!(
                "label {} out of range for {} classes",
                class, num_classes
            )));
        }
        rows[example * num_classes + class as usize] = 1.0;
    }
    Tensor::from_vec(rows, (indices.len(), num_classes), device).map_err(to_runtime_error)
}

/// Batches served from tensors held in memory.
pub struct InMemorySource {
    images: Tensor,
    labels: Tensor,
    num_classes: usize,
    batch_size: usize,
    order: Vec<u32>,
    cursor: usize,
    rng: StdRng,
}

impl InMemorySource {
    /// `images` is `(n, c, h, w)` u8 or f32; `labels` is `(n,)` class indices.
    pub fn new(
        images: Tensor,
        labels: Tensor,
        num_classes: usize,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if num_classes == 0 {
            return Err(TrainingError::initialization(
                "batch source requires at least one class",
            ));
        }
        let images = normalize_images(images)?;
        let examples = images.dim(0).map_err(to_runtime_error)?;
        if examples == 0 {
            return Err(TrainingError::initialization(
                "batch source received an empty shard",
            ));
        }
        let device = images.device().clone();
        let labels = one_hot(&labels, num_classes, &device)?;
        if labels.dim(0).map_err(to_runtime_error)? != examples {
            return Err(TrainingError::runtime(
                "image and label counts disagree within a shard",
            ));
        }

        let mut source = Self {
            images,
            labels,
            num_classes,
            batch_size,
            order: (0..examples as u32).collect(),
            cursor: 0,
            rng: StdRng::seed_from_u64(seed),
        };
        source.shuffle();
        Ok(source)
    }

    fn shuffle(&mut self) {
        self.order.shuffle(&mut self.rng);
        self.cursor = 0;
    }

    pub fn examples(&self) -> usize {
        self.order.len()
    }
}

impl BatchSource for InMemorySource {
    fn next_batch(&mut self) -> Result<Option<ImageBatch>, TrainingError> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let picks = &self.order[self.cursor..end];
        self.cursor = end;

        let indices = Tensor::from_vec(picks.to_vec(), picks.len(), self.images.device())
            .map_err(to_runtime_error)?;
        let images = self
            .images
            .index_select(&indices, 0)
            .map_err(to_runtime_error)?;
        let labels = self
            .labels
            .index_select(&indices, 0)
            .map_err(to_runtime_error)?;
        Ok(Some(ImageBatch { images, labels }))
    }

    fn reset(&mut self) -> Result<(), TrainingError> {
        self.shuffle();
        Ok(())
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

/// Streams batches out of safetensors shard files, one shard in memory at a
/// time, shard order reshuffled each pass.
pub struct ShardImageSource {
    shards: Vec<PathBuf>,
    device: Device,
    num_classes: usize,
    batch_size: usize,
    rng: StdRng,
    shard_order: Vec<usize>,
    next_shard: usize,
    current: Option<InMemorySource>,
}

impl ShardImageSource {
    pub fn new(
        shards: Vec<PathBuf>,
        num_classes: usize,
        batch_size: usize,
        device: Device,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        if shards.is_empty() {
            return Err(TrainingError::initialization(
                "shard source requires at least one shard",
            ));
        }
        let mut source = Self {
            shard_order: (0..shards.len()).collect(),
            shards,
            device,
            num_classes,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
            next_shard: 0,
            current: None,
        };
        source.shard_order.shuffle(&mut source.rng);
        Ok(source)
    }

    fn load_shard(&mut self, index: usize) -> Result<InMemorySource, TrainingError> {
        let path = &self.shards[index];
        let tensors = candle_core::safetensors::load(path, &self.device).map_err(|err| {
            TrainingError::runtime(format!("failed to load shard {}: {err}", path.display()))
        })?;
        let images = tensors.get("images").cloned().ok_or_else(|| {
            TrainingError::runtime(format!(
                "shard {} is missing an 'images' tensor",
                path.display()
            ))
        })?;
        let labels = tensors.get("labels").cloned().ok_or_else(|| {
            TrainingError::runtime(format!(
                "shard {} is missing a 'labels' tensor",
                path.display()
            ))
        })?;
        InMemorySource::new(
            images,
            labels,
            self.num_classes,
            self.batch_size,
            self.rng.gen(),
        )
    }
}

impl BatchSource for ShardImageSource {
    fn next_batch(&mut self) -> Result<Option<ImageBatch>, TrainingError> {
        loop {
            if let Some(current) = self.current.as_mut() {
                if let Some(batch) = current.next_batch()? {
                    return Ok(Some(batch));
                }
                self.current = None;
            }
            if self.next_shard >= self.shard_order.len() {
                return Ok(None);
            }
            let index = self.shard_order[self.next_shard];
            self.next_shard += 1;
            self.current = Some(self.load_shard(index)?);
        }
    }

    fn reset(&mut self) -> Result<(), TrainingError> {
        self.shard_order.shuffle(&mut self.rng);
        self.next_shard = 0;
        self.current = None;
        Ok(())
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn fixture_images(n: usize) -> Tensor {
        let data: Vec<u8> = (0..n * 3 * 4 * 4).map(|v| (v % 256) as u8).collect();
        Tensor::from_vec(data, (n, 3, 4, 4), &Device::Cpu).unwrap()
    }

    fn fixture_labels(n: usize, num_classes: usize) -> Tensor {
        let data: Vec<u32> = (0..n as u32).map(|v| v % num_classes as u32).collect();
        Tensor::from_vec(data, n, &Device::Cpu).unwrap()
    }

    #[test]
    fn in_memory_pass_covers_every_example_once() -> Result<(), TrainingError> {
        let mut source = InMemorySource::new(fixture_images(10), fixture_labels(10, 3), 3, 4, 7)?;
        let mut seen = 0;
        while let Some(batch) = source.next_batch()? {
            seen += batch.images.dim(0).unwrap();
            assert_eq!(batch.labels.dim(1).unwrap(), 3);
        }
        assert_eq!(seen, 10);

        // A fresh pass serves the same example count again.
        source.reset()?;
        let mut second = 0;
        while let Some(batch) = source.next_batch()? {
            second += batch.images.dim(0).unwrap();
        }
        assert_eq!(second, 10);
        Ok(())
    }

    #[test]
    fn pixels_are_normalized_and_labels_one_hot() -> Result<(), TrainingError> {
        let mut source = InMemorySource::new(fixture_images(4), fixture_labels(4, 2), 2, 4, 1)?;
        let batch = source.next_batch()?.expect("one batch");
        let pixels = batch.images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(pixels.iter().all(|&p| (0.0..=1.0).contains(&p)));

        let rows = batch.labels.sum(1).unwrap().to_vec1::<f32>().unwrap();
        assert!(rows.iter().all(|&sum| (sum - 1.0).abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn out_of_range_labels_are_rejected() {
        let labels = Tensor::from_vec(vec![0u32, 5], 2, &Device::Cpu).unwrap();
        assert!(InMemorySource::new(fixture_images(2), labels, 3, 2, 1).is_err());
    }

    #[test]
    fn shard_source_streams_all_shards() -> Result<(), TrainingError> {
        let dir = tempdir().unwrap();
        for shard in 0..2 {
            let mut tensors = HashMap::new();
            tensors.insert("images".to_string(), fixture_images(6));
            tensors.insert("labels".to_string(), fixture_labels(6, 3));
            candle_core::safetensors::save(
                &tensors,
                dir.path().join(format!("shard-{shard}.safetensors")),
            )
            .unwrap();
        }

        let shards = discover_shards(dir.path())?;
        assert_eq!(shards.len(), 2);

        let mut source = ShardImageSource::new(shards, 3, 4, Device::Cpu, 11)?;
        let mut seen = 0;
        while let Some(batch) = source.next_batch()? {
            seen += batch.images.dim(0).unwrap();
        }
        assert_eq!(seen, 12);

        source.reset()?;
        let mut second = 0;
        while let Some(batch) = source.next_batch()? {
            second += batch.images.dim(0).unwrap();
        }
        assert_eq!(second, 12);
        Ok(())
    }

    #[test]
    fn missing_shard_directory_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent");
        assert!(discover_shards(&missing).is_err());
        assert!(discover_shards(dir.path()).is_err(), "empty dir has no shards");
    }
}
