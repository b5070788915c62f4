//! Screenshot writer for scheduled captures.
//!
//! Pixels arrive as BGRA8 rows read back from the render target and are
//! written as a binary PPM named after the capture parameters, e.g.
//! `screenshot_restir-spatial_0-3_1.ppm`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use image::codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding};
use image::{ExtendedColorType, ImageEncoder};
use tracing::{error, info};

use crate::error::{ResourceError, ResourceResult};

/// One captured frame plus the tags that name it.
#[derive(Clone, Debug)]
pub struct SnapshotRequest {
    /// BGRA8 pixels, `row_pitch` bytes per row.
    pub pixels: Vec<u8>,
    pub row_pitch: usize,
    pub width: u32,
    pub height: u32,
    pub method: String,
    pub samples: u32,
    pub tolerance: u64,
    pub frame: u64,
}

impl SnapshotRequest {
    pub fn file_name(&self) -> String {
        format!(
            "screenshot_{}_{}-{}_{}.ppm",
            self.method.replace('/', "-"),
            self.tolerance,
            self.frame,
            self.samples
        )
    }

    fn check(&self) -> ResourceResult<()> {
        let row_bytes = self.width as usize * 4;
        if self.width == 0 || self.height == 0 {
            return Err(ResourceError::Snapshot("empty image".to_string()));
        }
        if self.row_pitch < row_bytes {
            return Err(ResourceError::Snapshot(format!(
                "row pitch {} smaller than {} bytes per row",
                self.row_pitch, row_bytes
            )));
        }
        let needed = self.row_pitch * (self.height as usize - 1) + row_bytes;
        if self.pixels.len() < needed {
            return Err(ResourceError::Snapshot(format!(
                "{} bytes of pixels, {} needed",
                self.pixels.len(),
                needed
            )));
        }
        Ok(())
    }

    /// Swizzles BGRA rows into tightly packed RGB.
    pub fn to_rgb(&self) -> ResourceResult<Vec<u8>> {
        self.check()?;
        let width = self.width as usize;
        let mut rgb = Vec::with_capacity(width * self.height as usize * 3);
        for row in self.pixels.chunks(self.row_pitch).take(self.height as usize) {
            for px in row[..width * 4].chunks_exact(4) {
                rgb.extend_from_slice(&[px[2], px[1], px[0]]);
            }
        }
        Ok(rgb)
    }
}

/// Writes the snapshot into `dir` and returns the file path.
pub fn save_blocking(request: &SnapshotRequest, dir: &Path) -> ResourceResult<PathBuf> {
    let rgb = request.to_rgb()?;
    let path = dir.join(request.file_name());
    let file = File::create(&path).map_err(|source| ResourceError::Io {
        path: path.clone(),
        source,
    })?;

    let encoder = PnmEncoder::new(BufWriter::new(file))
        .with_subtype(PnmSubtype::Pixmap(SampleEncoding::Binary));
    encoder.write_image(&rgb, request.width, request.height, ExtendedColorType::Rgb8)?;

    info!(
        "Saved {}x{} snapshot to {:?}",
        request.width, request.height, path
    );
    Ok(path)
}

/// Background thread writing one snapshot.
pub struct SaveWorker {
    handle: JoinHandle<ResourceResult<PathBuf>>,
}

impl SaveWorker {
    /// Starts writing `request` on a new thread.
    pub fn spawn(request: SnapshotRequest, dir: PathBuf) -> Self {
        let handle = std::thread::spawn(move || {
            let result = save_blocking(&request, &dir);
            if let Err(e) = &result {
                error!("Snapshot {} failed: {}", request.file_name(), e);
            }
            result
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the write to finish.
    pub fn join(self) -> ResourceResult<PathBuf> {
        self.handle
            .join()
            .map_err(|_| ResourceError::Snapshot("save thread panicked".to_string()))?
    }
}
