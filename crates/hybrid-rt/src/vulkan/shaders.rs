//! SPIR-V shader loading from an explicit list of search paths.

use ash::vk;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{Result, RtError};

/// Resolves shader files against search paths and creates shader modules.
#[derive(Debug, Clone)]
pub struct ShaderLoader {
    search_paths: Vec<PathBuf>,
}

impl ShaderLoader {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// First existing file for `name`, trying each search path in order.
    /// Absolute names are used as-is.
    pub fn find(&self, name: &Path) -> Result<PathBuf> {
        if name.is_absolute() {
            if name.is_file() {
                return Ok(name.to_path_buf());
            }
        } else if let Some(found) = self.search_paths.iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
        {
            return Ok(found);
        }

        Err(RtError::ShaderNotFound {
            name: name.display().to_string(),
            paths: self.search_paths.clone(),
        })
    }

    /// Load SPIR-V words for `name`.
    pub fn load_spirv(&self, name: &Path) -> Result<Vec<u32>> {
        let path = self.find(name)?;
        let mut file = File::open(&path)
            .map_err(|source| RtError::ShaderRead { path: path.clone(), source })?;
        let code = ash::util::read_spv(&mut file)
            .map_err(|source| RtError::ShaderRead { path: path.clone(), source })?;

        tracing::debug!("loaded shader {} ({} words)", path.display(), code.len());
        Ok(code)
    }

    /// Load `name` and create a shader module from it.
    pub unsafe fn create_module(&self, device: &ash::Device, name: &Path) -> Result<vk::ShaderModule> {
        let code = self.load_spirv(name)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
        device.create_shader_module(&create_info, None)
            .map_err(RtError::vk("Failed to create shader module"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn write_spirv(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = File::create(&path).unwrap();
        for word in [SPIRV_MAGIC, 0x0001_0600, 0, 8, 0] {
            file.write_all(&word.to_le_bytes()).unwrap();
        }
        path
    }

    #[test]
    fn test_find_in_second_search_path() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let expected = write_spirv(second.path(), "shaders/raytrace.rgen.spv");

        let loader = ShaderLoader::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
        let found = loader.find(Path::new("shaders/raytrace.rgen.spv")).unwrap();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_first_search_path_wins() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let expected = write_spirv(first.path(), "a.spv");
        write_spirv(second.path(), "a.spv");

        let loader = ShaderLoader::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
        assert_eq!(loader.find(Path::new("a.spv")).unwrap(), expected);
    }

    #[test]
    fn test_missing_shader_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ShaderLoader::new(vec![dir.path().to_path_buf()]);
        let err = loader.load_spirv(Path::new("shaders/missing.rmiss.spv")).unwrap_err();
        match &err {
            RtError::ShaderNotFound { name, paths } => {
                assert!(name.contains("missing.rmiss.spv"));
                assert_eq!(paths, &vec![dir.path().to_path_buf()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_configuration());
    }

    #[test]
    fn test_load_spirv_words() {
        let dir = tempfile::tempdir().unwrap();
        write_spirv(dir.path(), "ok.spv");
        let loader = ShaderLoader::new(vec![dir.path().to_path_buf()]);
        let words = loader.load_spirv(Path::new("ok.spv")).unwrap();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn test_truncated_spirv_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.spv"), [0x03u8, 0x02, 0x23]).unwrap();
        let loader = ShaderLoader::new(vec![dir.path().to_path_buf()]);
        let err = loader.load_spirv(Path::new("bad.spv")).unwrap_err();
        assert!(matches!(err, RtError::ShaderRead { .. }));
    }

    #[test]
    fn test_absolute_path_ignores_search_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_spirv(dir.path(), "abs.spv");
        let loader = ShaderLoader::new(Vec::new());
        assert_eq!(loader.find(&path).unwrap(), path);
    }
}
