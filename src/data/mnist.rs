//! MNIST IDX reader, downloader and batcher.

use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::time::Duration;

use flate2::read::GzDecoder;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::Batch;
use crate::error::{Error, Result};
use crate::Tensor;

pub const MNIST_CLASSES: usize = 10;
const SIDE: usize = 28;
const PIXELS: usize = SIDE * SIDE;

const IMAGES_MAGIC: u32 = 0x0000_0803;
const LABELS_MAGIC: u32 = 0x0000_0801;

const MNIST_URLS: &[&str] = &[
    "https://ossci-datasets.s3.amazonaws.com/mnist/",
    "https://storage.googleapis.com/cvdf-datasets/mnist/",
    "http://yann.lecun.com/exdb/mnist/",
];

// (archive, cached file, decompressed size)
const MNIST_FILES: &[(&str, &str, usize)] = &[
    ("train-images-idx3-ubyte.gz", "train_images", 47_040_016),
    ("train-labels-idx1-ubyte.gz", "train_labels", 60_008),
    ("t10k-images-idx3-ubyte.gz", "test_images", 7_840_016),
    ("t10k-labels-idx1-ubyte.gz", "test_labels", 10_008),
];

/// Images as `[N, 1, 28, 28]` with pixels in `[0, 1]`, labels as class indices.
#[derive(Debug, Clone)]
pub struct MnistDataset {
    images: Vec<f32>,
    labels: Vec<usize>,
}

impl MnistDataset {
    /// Loads the train or test split from `data_dir`, downloading missing files.
    pub fn load(data_dir: &Path, train: bool) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        download_if_needed(data_dir)?;
        let (images, labels) = if train {
            ("train_images", "train_labels")
        } else {
            ("test_images", "test_labels")
        };
        Self::from_files(&data_dir.join(images), &data_dir.join(labels))
    }

    /// Reads an uncompressed IDX image file and its label file.
    pub fn from_files(images_path: &Path, labels_path: &Path) -> Result<Self> {
        let images = parse_images(&fs::read(images_path)?, images_path)?;
        let labels = parse_labels(&fs::read(labels_path)?, labels_path)?;
        if images.len() != labels.len() * PIXELS {
            return Err(Error::Idx {
                path: labels_path.to_path_buf(),
                reason: format!(
                    "{} labels for {} images",
                    labels.len(),
                    images.len() / PIXELS
                ),
            });
        }
        info!(samples = labels.len(), path = ?images_path, "loaded MNIST split");
        Ok(Self { images, labels })
    }

    /// MNIST-shaped stand-in for offline runs: every pixel of a class-`k`
    /// image is `(k + 0.5) / num_classes` plus uniform noise in `±0.05`.
    pub fn synthetic(samples: usize, num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Uniform::new_inclusive(-0.05f32, 0.05);
        let classes = num_classes.max(1);
        let labels: Vec<usize> = (0..samples).map(|i| i % classes).collect();
        let images = labels
            .iter()
            .flat_map(|&k| {
                let level = (k as f32 + 0.5) / classes as f32;
                (0..PIXELS)
                    .map(|_| (level + noise.sample(&mut rng)).clamp(0.0, 1.0))
                    .collect::<Vec<_>>()
            })
            .collect();
        Self { images, labels }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Gathers the samples at `indices` into one batch.
    pub fn get_batch(&self, indices: &[usize]) -> Batch {
        let mut images = vec![0.0f32; indices.len() * PIXELS];
        images
            .par_chunks_mut(PIXELS)
            .zip(indices.par_iter())
            .for_each(|(dst, &idx)| {
                dst.copy_from_slice(&self.images[idx * PIXELS..(idx + 1) * PIXELS]);
            });
        Batch {
            images: Tensor::new(images, &[indices.len(), 1, SIDE, SIDE]),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn idx_error(path: &Path, reason: String) -> Error {
    Error::Idx {
        path: path.to_path_buf(),
        reason,
    }
}

fn parse_images(bytes: &[u8], path: &Path) -> Result<Vec<f32>> {
    if bytes.len() < 16 {
        return Err(idx_error(path, format!("{} byte header", bytes.len())));
    }
    let magic = read_u32(bytes, 0);
    if magic != IMAGES_MAGIC {
        return Err(idx_error(path, format!("bad image magic {magic:#010x}")));
    }
    let count = read_u32(bytes, 4) as usize;
    let (rows, cols) = (read_u32(bytes, 8) as usize, read_u32(bytes, 12) as usize);
    if rows != SIDE || cols != SIDE {
        return Err(idx_error(path, format!("images are {rows}x{cols}, not 28x28")));
    }
    let expected = 16 + count * PIXELS;
    if bytes.len() != expected {
        return Err(idx_error(
            path,
            format!("expected {expected} bytes, found {}", bytes.len()),
        ));
    }
    Ok(bytes[16..].iter().map(|&p| p as f32 / 255.0).collect())
}

fn parse_labels(bytes: &[u8], path: &Path) -> Result<Vec<usize>> {
    if bytes.len() < 8 {
        return Err(idx_error(path, format!("{} byte header", bytes.len())));
    }
    let magic = read_u32(bytes, 0);
    if magic != LABELS_MAGIC {
        return Err(idx_error(path, format!("bad label magic {magic:#010x}")));
    }
    let count = read_u32(bytes, 4) as usize;
    if bytes.len() != 8 + count {
        return Err(idx_error(
            path,
            format!("expected {} bytes, found {}", 8 + count, bytes.len()),
        ));
    }
    let labels: Vec<usize> = bytes[8..].iter().map(|&l| l as usize).collect();
    if let Some(&bad) = labels.iter().find(|&&l| l >= MNIST_CLASSES) {
        return Err(idx_error(path, format!("label {bad} out of range")));
    }
    Ok(labels)
}

fn download_if_needed(data_dir: &Path) -> Result<()> {
    for &(archive, cached, size) in MNIST_FILES {
        let path = data_dir.join(cached);
        if let Ok(meta) = fs::metadata(&path) {
            if meta.len() as usize > size / 2 {
                continue;
            }
            warn!(path = ?path, "cached file looks truncated, downloading again");
            fs::remove_file(&path)?;
        }

        let mut last_error = None;
        for base in MNIST_URLS {
            let url = format!("{base}{archive}");
            info!(%url, "downloading");
            match download_and_extract(&url, &path, size) {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    warn!(%url, error = %e, "mirror failed, trying next");
                    last_error = Some(e);
                }
            }
        }
        if let Some(e) = last_error {
            return Err(e);
        }
    }
    Ok(())
}

fn download_and_extract(url: &str, save_path: &Path, expected_size: usize) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(120))
        .user_agent("Mozilla/5.0 (X11; Linux x86_64)")
        .build()
        .map_err(|e| Error::Download(e.to_string()))?;
    let response = client
        .get(url)
        .send()
        .map_err(|e| Error::Download(format!("{url}: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Download(format!("{url}: HTTP {}", response.status())));
    }
    let compressed = response
        .bytes()
        .map_err(|e| Error::Download(format!("{url}: {e}")))?;
    debug!(bytes = compressed.len(), "downloaded archive");

    let data = decompress_gzip(&compressed)?;
    if data.len() < expected_size / 2 {
        return Err(Error::Download(format!(
            "{url}: decompressed {} bytes, expected about {expected_size}",
            data.len()
        )));
    }
    File::create(save_path)?.write_all(&data)?;
    info!(path = ?save_path, bytes = data.len(), "saved");
    Ok(())
}

/// Gunzips `data`, skipping any junk before the gzip magic.
fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let start = data
        .windows(2)
        .position(|w| w == [0x1f, 0x8b])
        .ok_or_else(|| Error::Download("no gzip header in response".to_string()))?;
    let mut out = Vec::new();
    GzDecoder::new(Cursor::new(&data[start..])).read_to_end(&mut out)?;
    Ok(out)
}

/// Sequential batcher. Never shuffles, so every pass sees the same batches.
pub struct DataLoader {
    dataset: MnistDataset,
    batch_size: usize,
    drop_last: bool,
    current: usize,
}

impl DataLoader {
    pub fn new(dataset: MnistDataset, batch_size: usize, drop_last: bool) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".to_string()));
        }
        Ok(Self {
            dataset,
            batch_size,
            drop_last,
            current: 0,
        })
    }

    pub fn reset(&mut self) {
        self.current = 0;
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &MnistDataset {
        &self.dataset
    }

    pub fn num_batches(&self) -> usize {
        let n = self.dataset.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }
}

impl Iterator for DataLoader {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let n = self.dataset.len();
        let end = (self.current + self.batch_size).min(n);
        let short = end - self.current < self.batch_size;
        if self.current >= n || (short && self.drop_last) {
            return None;
        }
        let indices: Vec<usize> = (self.current..end).collect();
        self.current = end;
        Some(self.dataset.get_batch(&indices))
    }
}
