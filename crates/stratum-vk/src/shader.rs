// SPDX-License-Identifier: CEPL-1.0
use crate::dealloc::ReturnProxy;
use crate::error::{Error, Result};
use ash::vk;
use std::ffi::CStr;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

const ENTRY_POINT: &CStr = c"main";

/// Include search path and preprocessor defines for GLSL compilation.
#[derive(Clone, Debug, Default)]
pub struct ShaderOptions {
    pub include_dirs: Vec<PathBuf>,
    pub defines: Vec<(String, Option<String>)>,
}

impl ShaderOptions {
    pub fn include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(dir.into());
        self
    }

    /// `NAME` or `NAME=VALUE`.
    pub fn define(mut self, define: &str) -> Self {
        let (name, value) = match define.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().to_string())),
            None => (define.trim(), None),
        };
        self.defines.push((name.to_string(), value));
        self
    }
}

fn shader_kind(stage: vk::ShaderStageFlags) -> Result<shaderc::ShaderKind> {
    use shaderc::ShaderKind as K;
    Ok(match stage {
        vk::ShaderStageFlags::VERTEX => K::Vertex,
        vk::ShaderStageFlags::FRAGMENT => K::Fragment,
        vk::ShaderStageFlags::COMPUTE => K::Compute,
        vk::ShaderStageFlags::GEOMETRY => K::Geometry,
        vk::ShaderStageFlags::TESSELLATION_CONTROL => K::TessControl,
        vk::ShaderStageFlags::TESSELLATION_EVALUATION => K::TessEvaluation,
        other => {
            return Err(Error::Configuration(format!(
                "no GLSL shader kind for stage {other:?}"
            )))
        }
    })
}

/// Prefix every line with its 1-based number, right aligned.
pub fn number_lines(source: &str) -> String {
    let width = source.lines().count().max(1).to_string().len();
    let mut out = String::with_capacity(source.len() + source.len() / 8);
    for (i, line) in source.lines().enumerate() {
        let _ = writeln!(out, "{:>width$}: {line}", i + 1);
    }
    out
}

fn resolve_include(
    requested: &str,
    ty: shaderc::IncludeType,
    requesting: &str,
    dirs: &[PathBuf],
) -> std::result::Result<shaderc::ResolvedInclude, String> {
    let mut candidates = Vec::new();
    if matches!(ty, shaderc::IncludeType::Relative) {
        if let Some(parent) = Path::new(requesting).parent() {
            candidates.push(parent.join(requested));
        }
    }
    candidates.extend(dirs.iter().map(|d| d.join(requested)));

    for path in candidates {
        if let Ok(content) = fs::read_to_string(&path) {
            return Ok(shaderc::ResolvedInclude {
                resolved_name: path.to_string_lossy().into_owned(),
                content,
            });
        }
    }
    Err(format!("cannot resolve #include \"{requested}\" from {requesting}"))
}

/// Compile GLSL to SPIR-V words. On failure the numbered source and the
/// compiler log are written to the error log.
pub fn compile(
    source: &str,
    name: &str,
    stage: vk::ShaderStageFlags,
    options: &ShaderOptions,
) -> Result<Vec<u32>> {
    let fail = |log: String| Error::ShaderCompile {
        name: name.to_string(),
        log,
    };
    let kind = shader_kind(stage)?;
    let compiler = shaderc::Compiler::new().map_err(|e| fail(e.to_string()))?;
    let mut opts = shaderc::CompileOptions::new().map_err(|e| fail(e.to_string()))?;
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );
    for (define, value) in &options.defines {
        opts.add_macro_definition(define, value.as_deref());
    }
    let dirs = options.include_dirs.clone();
    opts.set_include_callback(move |requested, ty, requesting, _depth| {
        resolve_include(requested, ty, requesting, &dirs)
    });

    match compiler.compile_into_spirv(source, kind, name, "main", Some(&opts)) {
        Ok(artifact) => {
            if artifact.get_num_warnings() > 0 {
                debug!("{name}: {}", artifact.get_warning_messages());
            }
            Ok(artifact.as_binary().to_vec())
        }
        Err(e) => {
            error!("shader {name} failed to compile\n{}\n{e}", number_lines(source));
            Err(fail(e.to_string()))
        }
    }
}

pub fn compile_file(
    path: impl AsRef<Path>,
    stage: vk::ShaderStageFlags,
    options: &ShaderOptions,
) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|e| Error::ShaderCompile {
        name: path.display().to_string(),
        log: e.to_string(),
    })?;
    let mut options = options.clone();
    if let Some(parent) = path.parent() {
        options.include_dirs.insert(0, parent.to_path_buf());
    }
    compile(&source, &path.to_string_lossy(), stage, &options)
}

pub fn shader_module(device: &ash::Device, spirv: &[u32]) -> ReturnProxy<vk::ShaderModule> {
    let info = vk::ShaderModuleCreateInfo::default().code(spirv);
    ReturnProxy::from_result(
        "vkCreateShaderModule",
        unsafe { device.create_shader_module(&info, None) },
        |d, m| unsafe { d.destroy_shader_module(m, None) },
    )
}

/// Compile and wrap in one step; a compile error yields a failed proxy.
pub fn shader_module_from_source(
    device: &ash::Device,
    source: &str,
    name: &str,
    stage: vk::ShaderStageFlags,
    options: &ShaderOptions,
) -> ReturnProxy<vk::ShaderModule> {
    match compile(source, name, stage, options) {
        Ok(spirv) => shader_module(device, &spirv),
        Err(_) => ReturnProxy::failed("shader compile"),
    }
}

/// Modules and the stage each one feeds, in pipeline order.
#[derive(Clone, Debug, Default)]
pub struct ShaderStageBundle {
    stages: Vec<(vk::ShaderModule, vk::ShaderStageFlags)>,
}

impl ShaderStageBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(mut self, module: vk::ShaderModule, stage: vk::ShaderStageFlags) -> Self {
        self.stages.push((module, stage));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        self.stages
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |acc, (_, s)| acc | *s)
    }

    pub fn create_infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo<'static>> {
        self.stages
            .iter()
            .map(|&(module, stage)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(ENTRY_POINT)
            })
            .collect()
    }
}
