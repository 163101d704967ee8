// SPDX-License-Identifier: CEPL-1.0
//! Graphics and compute pipeline assembly.
//!
//! Both assemblers share a [`LayoutAssembler`] (descriptor bindings plus
//! push-constant ranges) through the [`PipelineLayoutBuilder`] trait.
//! `compile` creates, in order: the descriptor-set layout (only when
//! bindings were declared), the pipeline layout and the pipeline. All
//! three are staged in one [`Composer`], so a failure part way through
//! destroys what was already built and the returned proxy is empty.
//! Viewport and scissor are always dynamic state.

use crate::dealloc::{ComposedProxy, Composer, ReturnProxy};
use crate::error::{Error, Result};
use crate::format::VertexLayout;
use crate::shader::ShaderStageBundle;
use ash::vk;
use bytemuck::Pod;
use std::collections::BTreeMap;
use tracing::{error, warn};

const DYNAMIC_STATES: [vk::DynamicState; 2] = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];

/// Declared shape of one descriptor binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingInfo {
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Binding index to declared shape, kept on the pipeline to validate
/// descriptor writes.
pub type BindingMap = BTreeMap<u32, BindingInfo>;

#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub dsl: Option<vk::DescriptorSetLayout>,
    pub bind_point: vk::PipelineBindPoint,
    pub bindings: BindingMap,
}

impl Pipeline {
    pub fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe { device.cmd_bind_pipeline(cmd, self.bind_point, self.handle) };
    }

    pub fn bind_descriptor_set(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            device.cmd_bind_descriptor_sets(
                cmd,
                self.bind_point,
                self.layout,
                0,
                std::slice::from_ref(&set),
                &[],
            )
        };
    }

    pub fn push_constants<T: Pod>(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        stages: vk::ShaderStageFlags,
        offset: u32,
        value: &T,
    ) {
        unsafe {
            device.cmd_push_constants(
                cmd,
                self.layout,
                stages,
                offset,
                bytemuck::bytes_of(value),
            )
        };
    }
}

/// Descriptor bindings and push-constant ranges of a pipeline layout.
#[derive(Clone, Debug, Default)]
pub struct LayoutAssembler {
    bindings: BindingMap,
    push_constants: Vec<vk::PushConstantRange>,
}

impl LayoutAssembler {
    pub fn bindings(&self) -> &BindingMap {
        &self.bindings
    }

    pub fn push_constants(&self) -> &[vk::PushConstantRange] {
        &self.push_constants
    }

    fn add_binding(&mut self, binding: u32, info: BindingInfo) {
        if self.bindings.insert(binding, info).is_some() {
            warn!("descriptor binding {binding} declared twice; keeping the last one");
        }
    }

    fn dsl_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings
            .iter()
            .map(|(&binding, info)| vk::DescriptorSetLayoutBinding {
                binding,
                descriptor_type: info.descriptor_type,
                descriptor_count: info.count,
                stage_flags: info.stages,
                ..Default::default()
            })
            .collect()
    }

    /// Stage the descriptor-set layout (if any) and the pipeline layout.
    fn stage(
        &self,
        device: &ash::Device,
        c: &mut Composer,
    ) -> Option<(Option<vk::DescriptorSetLayout>, vk::PipelineLayout)> {
        let dsl = if self.bindings.is_empty() {
            None
        } else {
            let bindings = self.dsl_bindings();
            let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
            Some(c.stage(ReturnProxy::from_result(
                "vkCreateDescriptorSetLayout",
                unsafe { device.create_descriptor_set_layout(&info, None) },
                |d, l| unsafe { d.destroy_descriptor_set_layout(l, None) },
            ))?)
        };

        let set_layouts: Vec<_> = dsl.into_iter().collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&self.push_constants);
        let layout = c.stage(ReturnProxy::from_result(
            "vkCreatePipelineLayout",
            unsafe { device.create_pipeline_layout(&info, None) },
            |d, l| unsafe { d.destroy_pipeline_layout(l, None) },
        ))?;
        Some((dsl, layout))
    }
}

/// Layout declarations shared by every pipeline assembler.
pub trait PipelineLayoutBuilder: Sized {
    fn layout_mut(&mut self) -> &mut LayoutAssembler;

    fn with_dsl_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        self.layout_mut().add_binding(
            binding,
            BindingInfo {
                descriptor_type,
                count,
                stages,
            },
        );
        self
    }

    /// Push-constant range sized for `T`.
    fn with_push_constant<T: Pod>(mut self, stages: vk::ShaderStageFlags, offset: u32) -> Self {
        self.layout_mut().push_constants.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size: std::mem::size_of::<T>() as u32,
        });
        self
    }
}

#[derive(Clone, Debug)]
pub struct GraphicsPipelineAssembler {
    layout: LayoutAssembler,
    vertex: Option<VertexLayout>,
    shaders: ShaderStageBundle,
    render_pass: vk::RenderPass,
    subpass: u32,
    topology: vk::PrimitiveTopology,
    fill: vk::PolygonMode,
    cull: vk::CullModeFlags,
    front_face: vk::FrontFace,
    depth_test: bool,
    depth_write: bool,
    depth_op: vk::CompareOp,
    alpha_blend: bool,
    color_attachments: u32,
}

impl Default for GraphicsPipelineAssembler {
    fn default() -> Self {
        GraphicsPipelineAssembler {
            layout: LayoutAssembler::default(),
            vertex: None,
            shaders: ShaderStageBundle::default(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            fill: vk::PolygonMode::FILL,
            cull: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_op: vk::CompareOp::LESS,
            alpha_blend: false,
            color_attachments: 1,
        }
    }
}

impl PipelineLayoutBuilder for GraphicsPipelineAssembler {
    fn layout_mut(&mut self) -> &mut LayoutAssembler {
        &mut self.layout
    }
}

impl GraphicsPipelineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_render_pass(mut self, render_pass: vk::RenderPass, subpass: u32) -> Self {
        self.render_pass = render_pass;
        self.subpass = subpass;
        self
    }

    pub fn with_vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex = Some(layout);
        self
    }

    pub fn with_shader_bundle(mut self, shaders: ShaderStageBundle) -> Self {
        self.shaders = shaders;
        self
    }

    pub fn topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn polygon_mode(mut self, fill: vk::PolygonMode) -> Self {
        self.fill = fill;
        self
    }

    pub fn cull_mode(mut self, cull: vk::CullModeFlags) -> Self {
        self.cull = cull;
        self
    }

    pub fn front_face(mut self, front_face: vk::FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    pub fn depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self
    }

    pub fn alpha_blending(mut self, on: bool) -> Self {
        self.alpha_blend = on;
        self
    }

    /// Number of color attachments written by the target subpass.
    pub fn color_attachments(mut self, count: u32) -> Self {
        self.color_attachments = count;
        self
    }

    pub fn bindings(&self) -> &BindingMap {
        self.layout.bindings()
    }

    pub fn validate(&self) -> Result<()> {
        if self.shaders.is_empty() {
            return Err(Error::Configuration(
                "graphics pipeline has no shader stages".into(),
            ));
        }
        if self.render_pass == vk::RenderPass::null() {
            return Err(Error::Configuration(
                "graphics pipeline has no render pass".into(),
            ));
        }
        Ok(())
    }

    fn blend_attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        let mut state = vk::PipelineColorBlendAttachmentState {
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        };
        if self.alpha_blend {
            state.blend_enable = vk::TRUE;
            state.src_color_blend_factor = vk::BlendFactor::SRC_ALPHA;
            state.dst_color_blend_factor = vk::BlendFactor::ONE_MINUS_SRC_ALPHA;
            state.color_blend_op = vk::BlendOp::ADD;
            state.src_alpha_blend_factor = vk::BlendFactor::ONE;
            state.dst_alpha_blend_factor = vk::BlendFactor::ZERO;
            state.alpha_blend_op = vk::BlendOp::ADD;
        }
        state
    }

    pub fn compile(self, device: &ash::Device) -> ComposedProxy<Pipeline> {
        const OP: &str = "graphics pipeline";
        if let Err(e) = self.validate() {
            error!("{OP}: {e}");
            return ComposedProxy::failed(OP);
        }

        let mut c = Composer::new(OP);
        let Some((dsl, layout)) = self.layout.stage(device, &mut c) else {
            return c.finish(device, Pipeline::default());
        };

        let stages = self.shaders.create_infos();
        let (vertex_bindings, vertex_attributes) = match &self.vertex {
            Some(v) => (vec![v.binding_description()], v.attributes()),
            None => (Vec::new(), Vec::new()),
        };
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(self.topology);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let raster = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(self.fill)
            .cull_mode(self.cull)
            .front_face(self.front_face)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_test)
            .depth_write_enable(self.depth_write)
            .depth_compare_op(self.depth_op);
        let attachments = vec![self.blend_attachment(); self.color_attachments as usize];
        let blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&attachments);
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&DYNAMIC_STATES);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(self.render_pass)
            .subpass(self.subpass);

        let created = unsafe {
            device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&info),
                None,
            )
        }
        .map(|pipelines| pipelines[0])
        .map_err(|(_, e)| e);
        let handle = c
            .stage(ReturnProxy::from_result(
                "vkCreateGraphicsPipelines",
                created,
                |d, p| unsafe { d.destroy_pipeline(p, None) },
            ))
            .unwrap_or_default();

        c.finish(
            device,
            Pipeline {
                handle,
                layout,
                dsl,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                bindings: self.layout.bindings,
            },
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct ComputePipelineAssembler {
    layout: LayoutAssembler,
    shader: Option<vk::ShaderModule>,
}

impl PipelineLayoutBuilder for ComputePipelineAssembler {
    fn layout_mut(&mut self) -> &mut LayoutAssembler {
        &mut self.layout
    }
}

impl ComputePipelineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shader(mut self, module: vk::ShaderModule) -> Self {
        self.shader = Some(module);
        self
    }

    pub fn bindings(&self) -> &BindingMap {
        self.layout.bindings()
    }

    pub fn validate(&self) -> Result<()> {
        match self.shader {
            Some(m) if m != vk::ShaderModule::null() => Ok(()),
            _ => Err(Error::Configuration(
                "compute pipeline has no shader module".into(),
            )),
        }
    }

    pub fn compile(self, device: &ash::Device) -> ComposedProxy<Pipeline> {
        const OP: &str = "compute pipeline";
        if let Err(e) = self.validate() {
            error!("{OP}: {e}");
            return ComposedProxy::failed(OP);
        }
        let Some(module) = self.shader else {
            return ComposedProxy::failed(OP);
        };

        let mut c = Composer::new(OP);
        let Some((dsl, layout)) = self.layout.stage(device, &mut c) else {
            return c.finish(device, Pipeline::default());
        };

        let stage = ShaderStageBundle::new()
            .attach(module, vk::ShaderStageFlags::COMPUTE)
            .create_infos()
            .remove(0);
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        let created = unsafe {
            device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&info),
                None,
            )
        }
        .map(|pipelines| pipelines[0])
        .map_err(|(_, e)| e);
        let handle = c
            .stage(ReturnProxy::from_result(
                "vkCreateComputePipelines",
                created,
                |d, p| unsafe { d.destroy_pipeline(p, None) },
            ))
            .unwrap_or_default();

        c.finish(
            device,
            Pipeline {
                handle,
                layout,
                dsl,
                bind_point: vk::PipelineBindPoint::COMPUTE,
                bindings: self.layout.bindings,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn binding_map_holds_exactly_declared_bindings() {
        let asm = GraphicsPipelineAssembler::new()
            .with_dsl_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                1,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .with_dsl_binding(
                1,
                vk::DescriptorType::UNIFORM_BUFFER,
                1,
                vk::ShaderStageFlags::VERTEX,
            );
        let map = asm.bindings();
        assert_eq!(map.len(), 2);
        assert_eq!(
            map[&0],
            BindingInfo {
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count: 1,
                stages: vk::ShaderStageFlags::FRAGMENT,
            }
        );
        assert_eq!(map[&1].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(map[&1].stages, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn redeclared_binding_replaces_previous() {
        let asm = ComputePipelineAssembler::new()
            .with_dsl_binding(2, vk::DescriptorType::STORAGE_BUFFER, 1, vk::ShaderStageFlags::COMPUTE)
            .with_dsl_binding(2, vk::DescriptorType::STORAGE_IMAGE, 4, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(asm.bindings().len(), 1);
        assert_eq!(asm.bindings()[&2].count, 4);
    }

    #[test]
    fn dsl_bindings_are_sorted_by_index() {
        let asm = GraphicsPipelineAssembler::new()
            .with_dsl_binding(3, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX)
            .with_dsl_binding(0, vk::DescriptorType::SAMPLER, 2, vk::ShaderStageFlags::FRAGMENT);
        let raw = asm.layout.dsl_bindings();
        assert_eq!(raw.iter().map(|b| b.binding).collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(raw[0].descriptor_count, 2);
    }

    #[test]
    fn push_constant_range_matches_type_size() {
        #[repr(C)]
        #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct Push {
            time: f32,
            scale: [f32; 3],
        }
        let asm = GraphicsPipelineAssembler::new()
            .with_push_constant::<Push>(vk::ShaderStageFlags::VERTEX, 0);
        let ranges = asm.layout.push_constants();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].size, 16);
        assert_eq!(ranges[0].stage_flags, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn missing_stages_are_configuration_errors() {
        let asm = GraphicsPipelineAssembler::new().with_render_pass(vk::RenderPass::from_raw(1), 0);
        assert!(matches!(asm.validate(), Err(Error::Configuration(_))));

        let asm = GraphicsPipelineAssembler::new().with_shader_bundle(
            ShaderStageBundle::new().attach(vk::ShaderModule::from_raw(1), vk::ShaderStageFlags::VERTEX),
        );
        assert!(asm.validate().is_err(), "render pass is required");

        assert!(ComputePipelineAssembler::new().validate().is_err());
        assert!(ComputePipelineAssembler::new()
            .with_shader(vk::ShaderModule::from_raw(7))
            .validate()
            .is_ok());
    }

    #[test]
    fn blending_defaults() {
        let asm = GraphicsPipelineAssembler::new();
        assert_eq!(asm.blend_attachment().blend_enable, vk::FALSE);
        assert_eq!(asm.cull, vk::CullModeFlags::NONE);
        assert_eq!(asm.front_face, vk::FrontFace::CLOCKWISE);
        let asm = asm.alpha_blending(true);
        let state = asm.blend_attachment();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(state.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }

    #[test]
    fn viewport_and_scissor_are_dynamic() {
        assert!(DYNAMIC_STATES.contains(&vk::DynamicState::VIEWPORT));
        assert!(DYNAMIC_STATES.contains(&vk::DynamicState::SCISSOR));
    }
}
