//! DCT perceptual hash for grayscale images.
//!
//! The image is box-sampled down to 32x32, transformed with an orthonormal
//! 2-D DCT-II, and the 8x8 lowest-frequency coefficients are thresholded
//! against their median (DC term excluded from the median). Resizing and mild
//! compression noise move few of those coefficients across the median, so the
//! Hamming distance between hashes tracks visual similarity.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::FingerprintError;

const SAMPLE: usize = 32;
const LOW: usize = 8;

/// An 8-bit grayscale raster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, FingerprintError> {
        if width == 0 || height == 0 || pixels.len() != width as usize * height as usize {
            return Err(FingerprintError::InvalidDimensions {
                width,
                height,
                len: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn at(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width as usize + x]
    }

    /// Decode a binary PGM (`P5`) payload. 16-bit rasters are scaled to 8 bits.
    pub fn decode(bytes: &[u8]) -> Result<Self, FingerprintError> {
        let mut pos = 0usize;
        let magic = next_token(bytes, &mut pos)?;
        if magic != b"P5" {
            return Err(FingerprintError::Decode {
                reason: "unsupported image format (expected binary PGM)".to_string(),
            });
        }
        let width = parse_header_number(next_token(bytes, &mut pos)?)?;
        let height = parse_header_number(next_token(bytes, &mut pos)?)?;
        let maxval = parse_header_number(next_token(bytes, &mut pos)?)?;
        if maxval == 0 || maxval > 65535 {
            return Err(FingerprintError::Decode {
                reason: format!("invalid PGM maxval {maxval}"),
            });
        }
        // Exactly one whitespace byte separates the header from the raster.
        pos += 1;

        let count = width as usize * height as usize;
        let raster = bytes.get(pos..).unwrap_or_default();
        let pixels: Vec<u8> = if maxval < 256 {
            if raster.len() < count {
                return Err(truncated(count, raster.len()));
            }
            raster[..count]
                .iter()
                .map(|&p| ((u32::from(p) * 255) / maxval) as u8)
                .collect()
        } else {
            if raster.len() < count * 2 {
                return Err(truncated(count * 2, raster.len()));
            }
            raster[..count * 2]
                .chunks_exact(2)
                .map(|c| ((u32::from(u16::from_be_bytes([c[0], c[1]])) * 255) / maxval) as u8)
                .collect()
        };
        Self::new(width, height, pixels)
    }

    /// Encode as binary PGM.
    pub fn to_pgm(&self) -> Vec<u8> {
        let mut out = format!("P5\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.pixels);
        out
    }

    /// Box-sample to `SAMPLE x SAMPLE` luminance values.
    fn downsample(&self) -> Vec<f64> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut out = Vec::with_capacity(SAMPLE * SAMPLE);
        for ty in 0..SAMPLE {
            let y0 = ty * h / SAMPLE;
            let y1 = ((ty + 1) * h / SAMPLE).max(y0 + 1).min(h);
            for tx in 0..SAMPLE {
                let x0 = tx * w / SAMPLE;
                let x1 = ((tx + 1) * w / SAMPLE).max(x0 + 1).min(w);
                let mut sum = 0u64;
                for y in y0..y1 {
                    for x in x0..x1 {
                        sum += u64::from(self.at(x, y));
                    }
                }
                out.push(sum as f64 / ((y1 - y0) * (x1 - x0)) as f64);
            }
        }
        out
    }
}

fn truncated(expected: usize, got: usize) -> FingerprintError {
    FingerprintError::Decode {
        reason: format!("truncated raster: expected {expected} bytes, got {got}"),
    }
}

fn next_token<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a [u8], FingerprintError> {
    loop {
        while *pos < bytes.len() && bytes[*pos].is_ascii_whitespace() {
            *pos += 1;
        }
        if *pos < bytes.len() && bytes[*pos] == b'#' {
            while *pos < bytes.len() && bytes[*pos] != b'\n' {
                *pos += 1;
            }
            continue;
        }
        break;
    }
    let start = *pos;
    while *pos < bytes.len() && !bytes[*pos].is_ascii_whitespace() {
        *pos += 1;
    }
    if start == *pos {
        return Err(FingerprintError::Decode {
            reason: "truncated PGM header".to_string(),
        });
    }
    Ok(&bytes[start..*pos])
}

fn parse_header_number(token: &[u8]) -> Result<u32, FingerprintError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| FingerprintError::Decode {
            reason: format!(
                "invalid PGM header field '{}'",
                String::from_utf8_lossy(token)
            ),
        })
}

/// 64-bit perceptual hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    pub const BITS: u32 = 64;

    pub fn hamming(&self, other: &PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// `1 - hamming / 64`.
    pub fn similarity(&self, other: &PerceptualHash) -> f64 {
        1.0 - f64::from(self.hamming(other)) / f64::from(Self::BITS)
    }
}

impl std::fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Compute the perceptual hash of a decoded image.
pub fn perceptual_hash(image: &GrayImage) -> PerceptualHash {
    let samples = image.downsample();
    let coeffs = dct_low_block(&samples);

    let mut ac: Vec<f64> = coeffs[1..].to_vec();
    ac.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = ac[ac.len() / 2];

    let bits = coeffs
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, &c)| if c > median { acc | (1 << i) } else { acc });
    PerceptualHash(bits)
}

/// Orthonormal DCT-II of a `SAMPLE x SAMPLE` block, returning the
/// `LOW x LOW` top-left coefficients in row-major order.
fn dct_low_block(samples: &[f64]) -> Vec<f64> {
    let n = SAMPLE as f64;
    let cos_table: Vec<Vec<f64>> = (0..LOW)
        .map(|u| {
            (0..SAMPLE)
                .map(|x| ((2 * x + 1) as f64 * u as f64 * PI / (2.0 * n)).cos())
                .collect()
        })
        .collect();
    let scale = |u: usize| if u == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };

    // Rows first: for every sample row y, the LOW horizontal frequencies.
    let mut rows = vec![0.0; SAMPLE * LOW];
    for y in 0..SAMPLE {
        for u in 0..LOW {
            let mut acc = 0.0;
            for x in 0..SAMPLE {
                acc += samples[y * SAMPLE + x] * cos_table[u][x];
            }
            rows[y * LOW + u] = acc * scale(u);
        }
    }

    let mut out = vec![0.0; LOW * LOW];
    for v in 0..LOW {
        for u in 0..LOW {
            let mut acc = 0.0;
            for y in 0..SAMPLE {
                acc += rows[y * LOW + u] * cos_table[v][y];
            }
            out[v * LOW + u] = acc * scale(v);
        }
    }
    out
}
