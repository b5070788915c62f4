//! Shader module management.
//!
//! SPIR-V modules are loaded from `<dir>/<name>.<stage extension>.spv`, the
//! naming `glslangValidator -o` produces for the sources under `shaders/`.
//! The closest-hit module is picked by method name, so
//! `shader_path(dir, "restir", ShaderStage::ClosestHit)` resolves to
//! `dir/restir.rchit.spv`.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Pipeline stage a module is compiled for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    RayGen,
    Miss,
    ClosestHit,
    Compute,
}

impl ShaderStage {
    pub fn to_vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
            ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }

    /// File extension glslang uses for the stage.
    pub fn extension(self) -> &'static str {
        match self {
            ShaderStage::RayGen => "rgen",
            ShaderStage::Miss => "rmiss",
            ShaderStage::ClosestHit => "rchit",
            ShaderStage::Compute => "comp",
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Path of the compiled module `name` for `stage` inside `dir`.
pub fn shader_path(dir: &Path, name: &str, stage: ShaderStage) -> PathBuf {
    // method names may carry a variant suffix such as "restir/spatial"
    let file = name.replace('/', "-");
    dir.join(format!("{file}.{}.spv", stage.extension()))
}

/// Converts SPIR-V bytes to words, checking length and magic number.
pub fn spirv_words(bytes: &[u8]) -> RhiResult<Vec<u32>> {
    if bytes.len() < 4 || bytes.len() % 4 != 0 {
        return Err(RhiError::ShaderError(format!(
            "SPIR-V code must be a non-empty multiple of 4 bytes, got {}",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(RhiError::ShaderError(format!(
            "bad SPIR-V magic number {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

/// A shader module with its stage and entry point.
pub struct Shader {
    device: Arc<Device>,
    module: vk::ShaderModule,
    stage: ShaderStage,
    entry_point: CString,
}

impl Shader {
    /// Loads `<dir>/<name>.<ext>.spv` with entry point `main`.
    pub fn load(device: Arc<Device>, dir: &Path, name: &str, stage: ShaderStage) -> RhiResult<Self> {
        let path = shader_path(dir, name, stage);
        debug!("Loading {} shader from {:?}", stage, path);
        let bytes = std::fs::read(&path).map_err(|e| {
            RhiError::ShaderError(format!("Failed to read shader file {:?}: {}", path, e))
        })?;
        Self::from_spirv_bytes(device, &bytes, stage, "main")
    }

    pub fn from_spirv_bytes(
        device: Arc<Device>,
        bytes: &[u8],
        stage: ShaderStage,
        entry_point: &str,
    ) -> RhiResult<Self> {
        let code = spirv_words(bytes)?;
        let entry_point = CString::new(entry_point)
            .map_err(|e| RhiError::ShaderError(format!("Invalid entry point name: {}", e)))?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let module = unsafe { device.handle().create_shader_module(&create_info, None)? };

        Ok(Self {
            device,
            module,
            stage,
            entry_point,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.to_vk_stage())
            .module(self.module)
            .name(&self.entry_point)
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_shader_module(self.module, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_flags() {
        assert_eq!(
            ShaderStage::RayGen.to_vk_stage(),
            vk::ShaderStageFlags::RAYGEN_KHR
        );
        assert_eq!(
            ShaderStage::ClosestHit.to_vk_stage(),
            vk::ShaderStageFlags::CLOSEST_HIT_KHR
        );
        assert_eq!(
            ShaderStage::Compute.to_vk_stage(),
            vk::ShaderStageFlags::COMPUTE
        );
    }

    #[test]
    fn test_shader_path_by_method() {
        let dir = Path::new("shaders/spirv");
        assert_eq!(
            shader_path(dir, "restir", ShaderStage::ClosestHit),
            Path::new("shaders/spirv/restir.rchit.spv")
        );
        assert_eq!(
            shader_path(dir, "restir/spatial", ShaderStage::ClosestHit),
            Path::new("shaders/spirv/restir-spatial.rchit.spv")
        );
        assert_eq!(
            shader_path(dir, "shadow", ShaderStage::Miss),
            Path::new("shaders/spirv/shadow.rmiss.spv")
        );
    }

    #[test]
    fn test_spirv_words_checks_length() {
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
    }

    #[test]
    fn test_spirv_words_checks_magic() {
        assert!(spirv_words(&[0, 0, 0, 0]).is_err());
        let words = spirv_words(&[0x03, 0x02, 0x23, 0x07, 1, 0, 0, 0]).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 1]);
    }
}
