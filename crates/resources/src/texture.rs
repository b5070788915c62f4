//! Diffuse texture records.

use std::path::Path;

use tracing::debug;

use crate::error::{ResourceError, ResourceResult};

/// Bytes per RGBA8 texel.
pub const TEXEL_SIZE: usize = 4;

/// Decoded RGBA8 texture, rows top to bottom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureRecord {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl TextureRecord {
    /// Wraps decoded pixels.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::InvalidTexture`] when either dimension is
    /// zero or `pixels` is not `width * height * 4` bytes long.
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> ResourceResult<Self> {
        if width == 0 || height == 0 {
            return Err(ResourceError::InvalidTexture(format!(
                "{width}x{height} texture has no texels"
            )));
        }
        let expected = width as usize * height as usize * TEXEL_SIZE;
        if pixels.len() != expected {
            return Err(ResourceError::InvalidTexture(format!(
                "{width}x{height} texture needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Decodes any format the `image` crate reads and converts it to RGBA8.
    pub fn load(path: impl AsRef<Path>) -> ResourceResult<Self> {
        let path = path.as_ref();
        let decoded = image::open(path)?.to_rgba8();
        let (width, height) = decoded.dimensions();
        debug!("Loaded texture {} ({}x{})", path.display(), width, height);
        Self::new(width, height, decoded.into_raw())
    }

    /// Two-color checkerboard with `cells` squares per side.
    pub fn checker(size: u32, cells: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let size = size.max(1);
        let cell = (size / cells.max(1)).max(1);
        let pixels = (0..size)
            .flat_map(|y| (0..size).map(move |x| (x / cell + y / cell) % 2 == 0))
            .flat_map(|even| if even { a } else { b })
            .collect();
        Self {
            width: size,
            height: size,
            pixels,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Tightly packed RGBA8 bytes.
    #[inline]
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}
