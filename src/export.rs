//! Export of the current settings as a libcamera-apps config file.
//!
//! The output is the flat `key=value` format accepted by `libcamera-still -c`:
//! a comment header, the basic image settings, then whichever optional
//! sections were selected.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::info;

use crate::config::AppConfig;
use crate::settings::TimelapseSettings;

/// Error writing an exported config file.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The output file could not be created.
    #[error("failed to create {path}: {source}")]
    Create {
        /// File attempted.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// Writing the file failed part way.
    #[error("failed to write {path}: {source}")]
    Write {
        /// File being written.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

/// Which `libcamera-still` settings to include. A file describes either a
/// timelapse or a single capture, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillSection {
    /// Timelapse interval, duration and image size.
    Timelapse,
    /// Single capture image size.
    Capture,
}

/// Optional sections written after the basic settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSections {
    /// Preview window placement and visibility.
    pub preview: bool,
    /// Sensor crop.
    pub zoom: bool,
    /// Still capture settings.
    pub still: Option<StillSection>,
}

/// Write `config` to `out` in libcamera-apps format.
pub fn write_config<W: Write>(
    out: &mut W,
    config: &AppConfig,
    sections: ExportSections,
    comment: Option<&str>,
    now: &DateTime<Local>,
) -> io::Result<()> {
    writeln!(out, "# libcamera-app config file")?;
    writeln!(
        out,
        "# generated by pi-cam-control {}",
        now.format("%b-%d-%Y %H:%M:%S")
    )?;
    if let Some(comment) = comment {
        for line in comment.lines() {
            writeln!(out, "# {line}")?;
        }
    }

    let camera = &config.camera;
    writeln!(out)?;
    writeln!(out, "# basic settings")?;
    writeln!(out, "analoggain={}", camera.analog_gain)?;
    writeln!(out, "brightness={}", camera.brightness)?;
    writeln!(out, "contrast={}", camera.contrast)?;
    writeln!(out, "ev={}", camera.ev)?;
    writeln!(out, "exposure={}", camera.exposure.as_str())?;
    writeln!(out, "hflip={}", camera.hflip)?;
    writeln!(out, "metering={}", camera.metering.as_str())?;
    writeln!(out, "saturation={}", camera.saturation)?;
    writeln!(out, "sharpness={}", camera.sharpness)?;
    writeln!(out, "vflip={}", camera.vflip)?;

    if sections.preview {
        let preview = &config.preview;
        writeln!(out)?;
        writeln!(out, "# preview settings")?;
        writeln!(out, "fullscreen=false")?;
        writeln!(out, "nopreview={}", !preview.enabled)?;
        writeln!(
            out,
            "preview={},{},{},{}",
            preview.x, preview.y, preview.width, preview.height
        )?;
    }

    match sections.still {
        Some(StillSection::Timelapse) => write_timelapse(out, &config.timelapse)?,
        Some(StillSection::Capture) => {
            let capture = &config.capture;
            writeln!(out)?;
            writeln!(out, "# capture settings")?;
            writeln!(out, "encoding={}", capture.format.extension())?;
            writeln!(out, "height={}", capture.height)?;
            writeln!(out, "timestamp=true")?;
            writeln!(out, "width={}", capture.width)?;
        }
        None => {}
    }

    if sections.zoom {
        let zoom = &camera.zoom;
        writeln!(out)?;
        writeln!(out, "# zoom setting")?;
        writeln!(
            out,
            "roi={},{},{},{}",
            zoom.pan_h, zoom.pan_v, zoom.zoom, zoom.zoom
        )?;
    }

    Ok(())
}

fn write_timelapse<W: Write>(out: &mut W, timelapse: &TimelapseSettings) -> io::Result<()> {
    let step_ms = timelapse.step.as_millis();
    let timeout_ms = step_ms * u128::from(timelapse.frame_limit());
    writeln!(out)?;
    writeln!(out, "# timelapse settings")?;
    writeln!(out, "timelapse={step_ms}")?;
    writeln!(out, "timeout={timeout_ms}")?;
    writeln!(out, "encoding={}", timelapse.format.extension())?;
    writeln!(out, "height={}", timelapse.height)?;
    writeln!(out, "timestamp=true")?;
    writeln!(out, "width={}", timelapse.width)
}

/// Write the config file to `path`, replacing any existing file.
pub fn export_to_path(
    path: &Path,
    config: &AppConfig,
    sections: ExportSections,
    comment: Option<&str>,
) -> Result<(), ExportError> {
    let file = File::create(path).map_err(|source| ExportError::Create {
        path: path.to_path_buf(),
        source,
    })?;
    let mut out = BufWriter::new(file);
    write_config(&mut out, config, sections, comment, &Local::now())
        .and_then(|()| out.flush())
        .map_err(|source| ExportError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    info!(path = %path.display(), ?sections, "settings exported");
    Ok(())
}
