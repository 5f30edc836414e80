use ash::{vk, Device};

use crate::error::InitError;
use crate::shader::{LinkedProgram, Stage, UniformLocation, VertexInput};

pub struct ShaderProgram {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

fn attribute_format(components: u32) -> vk::Format {
    match components {
        1 => vk::Format::R32_SFLOAT,
        2 => vk::Format::R32G32_SFLOAT,
        3 => vk::Format::R32G32B32_SFLOAT,
        _ => vk::Format::R32G32B32A32_SFLOAT,
    }
}

// Interleaved, location order, binding 0.
fn vertex_layout(
    inputs: &[VertexInput],
) -> (vk::VertexInputBindingDescription, Vec<vk::VertexInputAttributeDescription>) {
    let mut offset = 0;
    let attributes = inputs
        .iter()
        .map(|input| {
            let attribute = vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(input.location)
                .format(attribute_format(input.components))
                .offset(offset);
            offset += input.components * std::mem::size_of::<f32>() as u32;
            attribute
        })
        .collect();
    let binding = vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(offset)
        .input_rate(vk::VertexInputRate::VERTEX);
    (binding, attributes)
}

impl ShaderProgram {
    pub fn new(
        device: &Device,
        render_pass: vk::RenderPass,
        program: &LinkedProgram,
    ) -> Result<Self, InitError> {
        let create_module = |stage| {
            let info = vk::ShaderModuleCreateInfo::default().code(program.spirv(stage));
            let module = unsafe { device.create_shader_module(&info, None) };
            module.map_err(InitError::vk("create shader module"))
        };
        let vert_module = create_module(Stage::Vertex)?;
        let frag_module = match create_module(Stage::Fragment) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.destroy_shader_module(vert_module, None) };
                return Err(e);
            }
        };
        let built = Self::build(device, render_pass, program, vert_module, frag_module);
        // Modules are only needed until the pipeline exists.
        unsafe {
            device.destroy_shader_module(vert_module, None);
            device.destroy_shader_module(frag_module, None);
        }
        let (pipeline, layout) = built?;
        Ok(ShaderProgram { pipeline, layout })
    }

    fn build(
        device: &Device,
        render_pass: vk::RenderPass,
        program: &LinkedProgram,
        vert_module: vk::ShaderModule,
        frag_module: vk::ShaderModule,
    ) -> Result<(vk::Pipeline, vk::PipelineLayout), InitError> {
        let shader_stage = |module, flags| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(flags)
                .module(module)
                .name(c"main")
        };
        let shader_stage_info = [
            shader_stage(vert_module, vk::ShaderStageFlags::VERTEX),
            shader_stage(frag_module, vk::ShaderStageFlags::FRAGMENT),
        ];
        let (binding, attributes) = vertex_layout(program.vertex_inputs());
        let bindings = [binding];
        let vert_in_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dyn_state_info =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dyn_states);
        let input_assembly_info = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);
        let viewport_info = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterizer_info = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);
        let multisampling_info = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let blending_attachment = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let blending_info = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blending_attachment);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .push_constant_ranges(program.push_constant_ranges());
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .map_err(InitError::vk("create pipeline layout"))?;
        let pipeline_info = [vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stage_info)
            .vertex_input_state(&vert_in_info)
            .input_assembly_state(&input_assembly_info)
            .viewport_state(&viewport_info)
            .rasterization_state(&rasterizer_info)
            .multisample_state(&multisampling_info)
            .color_blend_state(&blending_info)
            .dynamic_state(&dyn_state_info)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)];
        match unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &pipeline_info, None)
        } {
            Ok(pipelines) => Ok((pipelines[0], layout)),
            Err((_, result)) => {
                unsafe { device.destroy_pipeline_layout(layout, None) };
                Err(InitError::vk("create graphics pipeline")(result))
            }
        }
    }

    pub fn bind(&self, device: &Device, cmd: vk::CommandBuffer) {
        unsafe { device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline) }
    }

    pub fn push(
        &self,
        device: &Device,
        cmd: vk::CommandBuffer,
        location: UniformLocation,
        data: &[u8],
    ) {
        debug_assert!(data.len() as u32 <= location.size);
        unsafe {
            device.cmd_push_constants(cmd, self.layout, location.stages, location.offset, data)
        }
    }

    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_vec3_attribute_layout() {
        let (binding, attributes) = vertex_layout(&[VertexInput {
            location: 0,
            components: 3,
        }]);
        assert_eq!(binding.stride, 12);
        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].location, 0);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[0].format, vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn attributes_are_interleaved() {
        let (binding, attributes) = vertex_layout(&[
            VertexInput {
                location: 0,
                components: 3,
            },
            VertexInput {
                location: 1,
                components: 2,
            },
        ]);
        assert_eq!(binding.stride, 20);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[1].format, vk::Format::R32G32_SFLOAT);
    }
}
