//! Still image naming and encoding.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::debug;

use crate::settings::ImageFormat;
use crate::traits::{FourCC, Frame, FrameMetadata, StreamInfo};

/// What triggered a still capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOrigin {
    /// A one-shot capture request.
    Still,
    /// A timelapse interval.
    Timelapse,
}

/// Where and how an in-flight still capture is saved.
///
/// Latched when the pipeline switches to the still stream, so later settings
/// changes do not redirect a capture already under way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveTarget {
    /// What triggered the capture.
    pub origin: CaptureOrigin,
    /// Output encoding.
    pub format: ImageFormat,
    /// Destination folder.
    pub folder: PathBuf,
}

/// Error raised while saving a still image.
#[derive(Debug, Error)]
pub enum SaveError {
    /// The stream's pixel format cannot be converted.
    #[error("unsupported pixel format {0}")]
    UnsupportedPixelFormat(FourCC),
    /// The driver reported a zero line stride.
    #[error("invalid stride for {0}: zero bytes per line")]
    ZeroStride(FourCC),
    /// The frame holds fewer bytes than its layout requires.
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    ShortFrame {
        /// Bytes required by the stream layout.
        expected: usize,
        /// Bytes present.
        actual: usize,
    },
    /// The encoder rejected the image.
    #[error("failed to encode {path}: {source}")]
    Encode {
        /// Destination file.
        path: PathBuf,
        /// Encoder error.
        source: image::ImageError,
    },
    /// The file could not be written.
    #[error("failed to write {path}: {source}")]
    Io {
        /// Destination file.
        path: PathBuf,
        /// I/O error.
        source: std::io::Error,
    },
}

/// Build `<folder>/MMDDhhmmss.<ext>` for the given instant.
///
/// A separator is appended to a non-empty folder unless it already ends in `/`.
pub fn generate_filename(folder: &Path, format: ImageFormat, now: &DateTime<Local>) -> PathBuf {
    let mut name = folder.to_string_lossy().into_owned();
    if !name.is_empty() && !name.ends_with('/') {
        name.push('/');
    }
    name.push_str(&now.format("%m%d%H%M%S").to_string());
    name.push('.');
    name.push_str(format.extension());
    PathBuf::from(name)
}

/// Image-encoding collaborator used by the save path.
pub trait ImageEncoder: Send {
    /// Encode `pixels`, laid out as described by `info`, and write them to `path`.
    fn encode(
        &self,
        pixels: &[u8],
        info: &StreamInfo,
        metadata: &FrameMetadata,
        path: &Path,
        format: ImageFormat,
    ) -> Result<(), SaveError>;
}

/// Encoder backed by the `image` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateEncoder;

impl ImageEncoder for ImageCrateEncoder {
    fn encode(
        &self,
        pixels: &[u8],
        info: &StreamInfo,
        metadata: &FrameMetadata,
        path: &Path,
        format: ImageFormat,
    ) -> Result<(), SaveError> {
        if info.fourcc == FourCC::MJPG {
            return encode_mjpeg(pixels, path, format);
        }

        let rgb = to_rgb8(pixels, info)?;
        let target = match format {
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Png => image::ImageFormat::Png,
        };
        image::save_buffer_with_format(
            path,
            &rgb,
            info.width,
            info.height,
            image::ExtendedColorType::Rgb8,
            target,
        )
        .map_err(|source| SaveError::Encode {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(
            sequence = metadata.sequence,
            width = info.width,
            height = info.height,
            path = %path.display(),
            "still image encoded"
        );
        Ok(())
    }
}

/// Encode a completed still frame to `path`.
pub fn save_still(
    encoder: &dyn ImageEncoder,
    frame: &Frame,
    info: &StreamInfo,
    path: &Path,
    format: ImageFormat,
) -> Result<(), SaveError> {
    encoder.encode(&frame.data, info, &frame.metadata, path, format)
}

fn encode_mjpeg(pixels: &[u8], path: &Path, format: ImageFormat) -> Result<(), SaveError> {
    match format {
        ImageFormat::Jpeg => fs::write(path, pixels).map_err(|source| SaveError::Io {
            path: path.to_path_buf(),
            source,
        }),
        ImageFormat::Png => {
            let decoded =
                image::load_from_memory_with_format(pixels, image::ImageFormat::Jpeg).map_err(
                    |source| SaveError::Encode {
                        path: path.to_path_buf(),
                        source,
                    },
                )?;
            decoded
                .save_with_format(path, image::ImageFormat::Png)
                .map_err(|source| SaveError::Encode {
                    path: path.to_path_buf(),
                    source,
                })
        }
    }
}

fn require(pixels: &[u8], expected: usize) -> Result<(), SaveError> {
    if pixels.len() < expected {
        return Err(SaveError::ShortFrame {
            expected,
            actual: pixels.len(),
        });
    }
    Ok(())
}

/// Convert a frame to packed RGB8.
fn to_rgb8(pixels: &[u8], info: &StreamInfo) -> Result<Vec<u8>, SaveError> {
    let width = info.width as usize;
    let height = info.height as usize;
    let stride = info.stride as usize;
    if stride == 0 {
        return Err(SaveError::ZeroStride(info.fourcc));
    }
    let mut rgb = Vec::with_capacity(width * height * 3);

    if info.fourcc == FourCC::YUYV {
        require(pixels, stride * height)?;
        for row in pixels.chunks_exact(stride).take(height) {
            let line = row.get(..width * 2).unwrap_or(row);
            for quad in line.chunks_exact(4) {
                if let [y0, u, y1, v] = *quad {
                    let (r, g, b) = yuv_to_rgb(y0, u, v);
                    rgb.extend_from_slice(&[r, g, b]);
                    let (r, g, b) = yuv_to_rgb(y1, u, v);
                    rgb.extend_from_slice(&[r, g, b]);
                }
            }
        }
    } else if info.fourcc == FourCC::RGB3 || info.fourcc == FourCC::BGR3 {
        require(pixels, stride * height)?;
        let swap = info.fourcc == FourCC::BGR3;
        for row in pixels.chunks_exact(stride).take(height) {
            let line = row.get(..width * 3).unwrap_or(row);
            for px in line.chunks_exact(3) {
                if let [a, b, c] = *px {
                    if swap {
                        rgb.extend_from_slice(&[c, b, a]);
                    } else {
                        rgb.extend_from_slice(&[a, b, c]);
                    }
                }
            }
        }
    } else if info.fourcc == FourCC::YU12 {
        let chroma_stride = stride / 2;
        let luma_size = stride * height;
        let chroma_size = chroma_stride * height.div_ceil(2);
        require(pixels, luma_size + 2 * chroma_size)?;
        let (luma, chroma) = pixels.split_at(luma_size);
        let (u_plane, v_plane) = chroma.split_at(chroma_size);
        for y in 0..height {
            for x in 0..width {
                let chroma_at = (y / 2) * chroma_stride + x / 2;
                let lum = luma.get(y * stride + x).copied().unwrap_or(0);
                let u = u_plane.get(chroma_at).copied().unwrap_or(128);
                let v = v_plane.get(chroma_at).copied().unwrap_or(128);
                let (r, g, b) = yuv_to_rgb(lum, u, v);
                rgb.extend_from_slice(&[r, g, b]);
            }
        }
    } else {
        return Err(SaveError::UnsupportedPixelFormat(info.fourcc));
    }

    Ok(rgb)
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
///
/// # Arguments
///
/// * `y` - Luminance value (16-235 for studio range)
/// * `u` - Blue-difference chroma value (16-240)
/// * `v` - Red-difference chroma value (16-240)
///
/// # Returns
///
/// RGB tuple with values clamped to 0-255 range.
#[must_use]
#[allow(clippy::many_single_char_names)]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}
