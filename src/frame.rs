//! Frames and frame sources.
//!
//! A [`Frame`] is one grayscale image of a movie: a row-major `f32` intensity
//! buffer plus the frame's index within its source sequence. Frames are
//! immutable once read.
//!
//! A [`FrameSource`] yields frames on demand. The pipeline never holds more
//! than one chunk of frames in memory at a time; see [`iterate_chunks`].
//! [`MemorySource`] wraps an in-memory stack of frames (used by tests and by
//! callers that decode images themselves). With the `image` feature enabled,
//! [`ImageSequenceSource`] reads a movie stored as a directory of per-frame
//! image files.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A rectangular crop, in pixel coordinates of the uncropped frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRegion {
    /// Top row of the crop (inclusive).
    pub y0: usize,
    /// Left column of the crop (inclusive).
    pub x0: usize,
    /// Crop height in pixels.
    pub height: usize,
    /// Crop width in pixels.
    pub width: usize,
}

/// Options restricting which part of a source is processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceOptions {
    /// First frame to process (inclusive). Default: 0.
    #[serde(default)]
    pub start_frame: Option<usize>,
    /// Last frame to process (exclusive). Default: end of the source.
    #[serde(default)]
    pub stop_frame: Option<usize>,
    /// Rectangular region to crop each frame to before processing.
    #[serde(default)]
    pub crop_region: Option<CropRegion>,
}

/// One grayscale movie frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Index of this frame within its source sequence.
    pub index: usize,
    /// Width in pixels (number of columns).
    pub width: usize,
    /// Height in pixels (number of rows).
    pub height: usize,
    /// Row-major intensity values, length `width * height`.
    pub pixels: Vec<f32>,
}

impl Frame {
    /// Build a frame from row-major pixel data.
    ///
    /// # Panics
    /// Panics if `pixels.len() != width * height`.
    pub fn new(index: usize, width: usize, height: usize, pixels: Vec<f32>) -> Self {
        assert_eq!(
            pixels.len(),
            width * height,
            "pixel buffer length must equal width * height"
        );
        Self {
            index,
            width,
            height,
            pixels,
        }
    }

    /// Intensity at `(row, col)`.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.pixels[row * self.width + col]
    }

    /// Crop to `region`, clamped to the frame bounds. The frame index is
    /// preserved; pixel coordinates in the result are relative to the crop
    /// origin.
    pub fn crop(&self, region: &CropRegion) -> Frame {
        let y0 = region.y0.min(self.height);
        let x0 = region.x0.min(self.width);
        let y1 = (y0 + region.height).min(self.height);
        let x1 = (x0 + region.width).min(self.width);
        let (h, w) = (y1 - y0, x1 - x0);

        let mut pixels = Vec::with_capacity(h * w);
        for row in y0..y1 {
            let off = row * self.width;
            pixels.extend_from_slice(&self.pixels[off + x0..off + x1]);
        }
        Frame::new(self.index, w, h, pixels)
    }
}

/// A sequence of frames readable by index.
///
/// Implementations must be deterministic: reading the same index twice
/// returns identical pixel data.
pub trait FrameSource {
    /// Total number of frames in the source.
    fn num_frames(&self) -> usize;

    /// Read the frame at `index` synchronously.
    fn read_frame(&self, index: usize) -> Result<Frame>;
}

/// Iterate over a source in bounded-memory chunks of `chunk_size` frames,
/// honoring the start/stop/crop options.
///
/// Chunking is purely a memory-management partition: frame indices and
/// ordering are identical for any chunk size.
pub fn iterate_chunks<'a, S: FrameSource + ?Sized>(
    source: &'a S,
    chunk_size: usize,
    options: &SourceOptions,
) -> Chunks<'a, S> {
    let stop = options
        .stop_frame
        .unwrap_or(usize::MAX)
        .min(source.num_frames());
    let start = options.start_frame.unwrap_or(0).min(stop);
    Chunks {
        source,
        next: start,
        stop,
        chunk_size: chunk_size.max(1),
        crop: options.crop_region,
    }
}

/// Iterator over chunks of frames. See [`iterate_chunks`].
pub struct Chunks<'a, S: FrameSource + ?Sized> {
    source: &'a S,
    next: usize,
    stop: usize,
    chunk_size: usize,
    crop: Option<CropRegion>,
}

impl<S: FrameSource + ?Sized> Iterator for Chunks<'_, S> {
    type Item = Result<Vec<Frame>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.stop {
            return None;
        }
        let end = (self.next + self.chunk_size).min(self.stop);
        let mut frames = Vec::with_capacity(end - self.next);
        for index in self.next..end {
            match self.source.read_frame(index) {
                Ok(frame) => {
                    let frame = match &self.crop {
                        Some(region) => frame.crop(region),
                        None => frame,
                    };
                    frames.push(frame);
                }
                Err(e) => {
                    // Leave the iterator exhausted; a read failure is fatal
                    // for this source.
                    self.next = self.stop;
                    return Some(Err(e));
                }
            }
        }
        self.next = end;
        Some(Ok(frames))
    }
}

/// An in-memory stack of frames.
#[derive(Debug, Clone)]
pub struct MemorySource {
    frames: Vec<Frame>,
}

impl MemorySource {
    /// Wrap owned frames. Frame indices are rewritten to their position in
    /// the stack so that `read_frame(i).index == i`.
    pub fn new(mut frames: Vec<Frame>) -> Self {
        for (i, f) in frames.iter_mut().enumerate() {
            f.index = i;
        }
        Self { frames }
    }
}

impl FrameSource for MemorySource {
    fn num_frames(&self) -> usize {
        self.frames.len()
    }

    fn read_frame(&self, index: usize) -> Result<Frame> {
        self.frames
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("frame index {} out of range", index))
    }
}

// ── Image-file frame source (feature `image`) ───────────────────────────────

#[cfg(feature = "image")]
pub use self::image_source::ImageSequenceSource;

#[cfg(feature = "image")]
mod image_source {
    use std::path::{Path, PathBuf};

    use anyhow::{Context, Result};
    use image::GenericImageView;

    use super::{Frame, FrameSource};

    /// File extensions recognized as movie frames.
    const FRAME_EXTENSIONS: [&str; 5] = ["tif", "tiff", "png", "jpg", "jpeg"];

    /// A movie stored as a directory of per-frame image files, ordered by
    /// file name, or as a single image file (a one-frame movie).
    #[derive(Debug, Clone)]
    pub struct ImageSequenceSource {
        paths: Vec<PathBuf>,
    }

    impl ImageSequenceSource {
        /// Open `path` as an image sequence.
        ///
        /// If `path` is a directory, every file with a recognized image
        /// extension becomes one frame, sorted by file name. If it is a
        /// single image file, the source has one frame.
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            if path.is_dir() {
                let mut paths: Vec<PathBuf> = std::fs::read_dir(path)
                    .with_context(|| format!("Failed to read directory {}", path.display()))?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| p.is_file() && has_frame_extension(p))
                    .collect();
                anyhow::ensure!(
                    !paths.is_empty(),
                    "No image files found in {}",
                    path.display()
                );
                paths.sort();
                Ok(Self { paths })
            } else if path.is_file() {
                Ok(Self {
                    paths: vec![path.to_path_buf()],
                })
            } else {
                anyhow::bail!("No such file or directory: {}", path.display());
            }
        }

        /// Whether `path` looks like something [`open`](Self::open) accepts:
        /// an image file or a directory containing at least one.
        pub fn is_movie_path(path: &Path) -> bool {
            if path.is_file() {
                return has_frame_extension(path);
            }
            if path.is_dir() {
                if let Ok(entries) = std::fs::read_dir(path) {
                    return entries
                        .filter_map(|e| e.ok().map(|e| e.path()))
                        .any(|p| p.is_file() && has_frame_extension(&p));
                }
            }
            false
        }
    }

    fn has_frame_extension(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_ascii_lowercase();
                FRAME_EXTENSIONS.iter().any(|&x| x == e)
            })
            .unwrap_or(false)
    }

    impl FrameSource for ImageSequenceSource {
        fn num_frames(&self) -> usize {
            self.paths.len()
        }

        fn read_frame(&self, index: usize) -> Result<Frame> {
            let path = self
                .paths
                .get(index)
                .ok_or_else(|| anyhow::anyhow!("frame index {} out of range", index))?;
            let img = image::open(path)
                .with_context(|| format!("Failed to open image: {}", path.display()))?;
            let (width, height) = img.dimensions();
            let pixels = to_grayscale_f32(&img);
            Ok(Frame::new(index, width as usize, height as usize, pixels))
        }
    }

    /// Convert a DynamicImage to a Vec<f32> of grayscale values.
    ///
    /// 16-bit microscopy exports keep their full dynamic range; color images
    /// are reduced with Rec. 709 luma weights.
    fn to_grayscale_f32(img: &image::DynamicImage) -> Vec<f32> {
        use image::DynamicImage;
        match img {
            DynamicImage::ImageLuma16(g) => g.as_raw().iter().map(|&v| v as f32).collect(),
            DynamicImage::ImageLumaA16(g) => g.pixels().map(|p| p.0[0] as f32).collect(),
            DynamicImage::ImageRgb16(rgb) => rgb
                .pixels()
                .map(|p| {
                    let [r, g, b] = p.0;
                    0.2126 * r as f32 + 0.7152 * g as f32 + 0.0722 * b as f32
                })
                .collect(),
            DynamicImage::ImageRgb32F(rgb) => rgb
                .pixels()
                .map(|p| {
                    let [r, g, b] = p.0;
                    0.2126 * r + 0.7152 * g + 0.0722 * b
                })
                .collect(),
            _ => {
                let gray = img.to_luma8();
                gray.as_raw().iter().map(|&v| v as f32).collect()
            }
        }
    }
}
