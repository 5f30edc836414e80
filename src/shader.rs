//! Runtime GLSL compilation and program linking.
//!
//! Each stage is parsed, validated and lowered to SPIR-V with naga. Linking
//! checks the interface between the two stages and reflects the vertex
//! attributes and push-constant uniforms the pipeline needs.

use ash::vk;
use naga::{
    back::spv,
    front::glsl,
    valid::{Capabilities, ValidationFlags, Validator},
    AddressSpace, Binding, Handle, Module, ScalarKind, ShaderStage, Type, TypeInner,
};
use std::collections::{hash_map::Entry, HashMap};
use std::fmt;

use crate::error::{CompileError, LinkError};

pub const VERTEX_SOURCE: &str = include_str!("../shaders/triangle.vert");
pub const FRAGMENT_SOURCE: &str = include_str!("../shaders/triangle.frag");

/// Push-constant member holding the per-draw colour.
pub const COLOR_UNIFORM: &str = "ourColor";

pub const ENTRY_POINT: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Vertex,
    Fragment,
}

impl Stage {
    fn naga(self) -> ShaderStage {
        match self {
            Stage::Vertex => ShaderStage::Vertex,
            Stage::Fragment => ShaderStage::Fragment,
        }
    }

    pub fn vk_flags(self) -> vk::ShaderStageFlags {
        match self {
            Stage::Vertex => vk::ShaderStageFlags::VERTEX,
            Stage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Vertex => "vertex",
            Stage::Fragment => "fragment",
        })
    }
}

/// One successfully compiled stage: the naga module kept for reflection and
/// the SPIR-V words handed to Vulkan.
#[derive(Debug)]
pub struct CompiledStage {
    stage: Stage,
    module: Module,
    spirv: Vec<u32>,
}

pub fn compile(source: &str, stage: Stage) -> Result<CompiledStage, CompileError> {
    let fail = |log: String| CompileError { stage, log };
    let module = glsl::Frontend::default()
        .parse(&glsl::Options::from(stage.naga()), source)
        .map_err(|e| fail(e.emit_to_string(source)))?;
    if !module
        .entry_points
        .iter()
        .any(|ep| ep.stage == stage.naga() && ep.name == ENTRY_POINT)
    {
        return Err(fail(format!("no {stage} entry point named `{ENTRY_POINT}`")));
    }
    let info = Validator::new(ValidationFlags::all(), Capabilities::PUSH_CONSTANT)
        .validate(&module)
        .map_err(|e| fail(e.emit_to_string(source)))?;
    let options = spv::Options {
        // Flip gl_Position.y so y-up coordinates land the right way up.
        flags: spv::WriterFlags::ADJUST_COORDINATE_SPACE,
        ..Default::default()
    };
    let pipeline = spv::PipelineOptions {
        shader_stage: stage.naga(),
        entry_point: ENTRY_POINT.to_owned(),
    };
    let spirv = spv::write_vec(&module, &info, &options, Some(&pipeline))
        .map_err(|e| fail(e.to_string()))?;
    log::debug!("compiled {stage} shader to {} SPIR-V words", spirv.len());
    Ok(CompiledStage {
        stage,
        module,
        spirv,
    })
}

impl CompiledStage {
    #[cfg(test)]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    #[cfg(test)]
    pub fn spirv(&self) -> &[u32] {
        &self.spirv
    }

    fn entry_point(&self) -> Option<&naga::EntryPoint> {
        self.module
            .entry_points
            .iter()
            .find(|ep| ep.stage == self.stage.naga())
    }

    fn inputs(&self) -> Vec<(u32, TypeInner)> {
        let mut out = Vec::new();
        if let Some(ep) = self.entry_point() {
            for arg in &ep.function.arguments {
                self.located(arg.ty, arg.binding.as_ref(), &mut out);
            }
        }
        out
    }

    fn outputs(&self) -> Vec<(u32, TypeInner)> {
        let mut out = Vec::new();
        if let Some(result) = self.entry_point().and_then(|ep| ep.function.result.as_ref()) {
            self.located(result.ty, result.binding.as_ref(), &mut out);
        }
        out
    }

    // Built-ins are skipped; unbound structs are flattened.
    fn located(
        &self,
        ty: Handle<Type>,
        binding: Option<&Binding>,
        out: &mut Vec<(u32, TypeInner)>,
    ) {
        match binding {
            Some(Binding::Location { location, .. }) => {
                out.push((*location, self.module.types[ty].inner.clone()))
            }
            Some(Binding::BuiltIn(_)) => {}
            None => {
                if let TypeInner::Struct { members, .. } = &self.module.types[ty].inner {
                    for member in members {
                        self.located(member.ty, member.binding.as_ref(), out);
                    }
                }
            }
        }
    }

    /// `(name, offset, size)` of every push-constant value the stage declares.
    fn push_constants(&self) -> Vec<(String, u32, u32)> {
        let ctx = self.module.to_ctx();
        let mut out = Vec::new();
        for (_, var) in self.module.global_variables.iter() {
            if var.space != AddressSpace::PushConstant {
                continue;
            }
            match &self.module.types[var.ty].inner {
                TypeInner::Struct { members, .. } => {
                    for member in members {
                        if let Some(name) = &member.name {
                            let size = self.module.types[member.ty].inner.size(ctx);
                            out.push((name.clone(), member.offset, size));
                        }
                    }
                }
                inner => {
                    if let Some(name) = &var.name {
                        out.push((name.clone(), 0, inner.size(ctx)));
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexInput {
    pub location: u32,
    pub components: u32,
}

/// Where a named uniform lives in the push-constant block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformLocation {
    pub offset: u32,
    pub size: u32,
    /// Stages to name when pushing this value.
    pub stages: vk::ShaderStageFlags,
}

#[derive(Debug)]
pub struct LinkedProgram {
    vertex_spirv: Vec<u32>,
    fragment_spirv: Vec<u32>,
    vertex_inputs: Vec<VertexInput>,
    push_ranges: Vec<vk::PushConstantRange>,
    uniforms: HashMap<String, UniformLocation>,
}

pub fn link(vertex: &CompiledStage, fragment: &CompiledStage) -> Result<LinkedProgram, LinkError> {
    let mut log = Vec::new();
    if vertex.stage != Stage::Vertex {
        log.push(format!("expected a vertex stage, got {}", vertex.stage));
    }
    if fragment.stage != Stage::Fragment {
        log.push(format!("expected a fragment stage, got {}", fragment.stage));
    }
    if !log.is_empty() {
        return Err(LinkError {
            log: log.join("\n"),
        });
    }

    let produced = vertex.outputs();
    for (location, ty) in fragment.inputs() {
        match produced.iter().find(|(l, _)| *l == location) {
            None => log.push(format!(
                "fragment input at location {location} is not written by the vertex stage"
            )),
            Some((_, written)) if *written != ty => log.push(format!(
                "location {location}: vertex stage writes {written:?}, fragment stage reads {ty:?}"
            )),
            Some(_) => {}
        }
    }

    let mut vertex_inputs = Vec::new();
    for (location, ty) in vertex.inputs() {
        match float_components(&ty) {
            Some(components) => vertex_inputs.push(VertexInput {
                location,
                components,
            }),
            None => log.push(format!(
                "vertex input at location {location} has unsupported type {ty:?}"
            )),
        }
    }
    vertex_inputs.sort_by_key(|input| input.location);

    let mut uniforms: HashMap<String, UniformLocation> = HashMap::new();
    for compiled in [vertex, fragment] {
        let flags = compiled.stage.vk_flags();
        for (name, offset, size) in compiled.push_constants() {
            match uniforms.entry(name) {
                Entry::Vacant(slot) => {
                    slot.insert(UniformLocation {
                        offset,
                        size,
                        stages: flags,
                    });
                }
                Entry::Occupied(mut slot) => {
                    let known = *slot.get();
                    if known.offset != offset || known.size != size {
                        log.push(format!(
                            "uniform `{}` is at {}+{} in one stage, {offset}+{size} in the other",
                            slot.key(),
                            known.offset,
                            known.size,
                        ));
                    } else {
                        slot.get_mut().stages |= flags;
                    }
                }
            }
        }
    }

    if !log.is_empty() {
        return Err(LinkError {
            log: log.join("\n"),
        });
    }

    let push_ranges = push_constant_ranges(&uniforms);
    for location in uniforms.values_mut() {
        let (start, end) = (location.offset, location.offset + location.size);
        location.stages = push_ranges
            .iter()
            .filter(|r| r.offset < end && start < r.offset + r.size)
            .fold(vk::ShaderStageFlags::empty(), |acc, r| acc | r.stage_flags);
    }
    log::debug!(
        "linked program: {} vertex inputs, uniforms {:?}",
        vertex_inputs.len(),
        uniforms.keys().collect::<Vec<_>>()
    );
    Ok(LinkedProgram {
        vertex_spirv: vertex.spirv.clone(),
        fragment_spirv: fragment.spirv.clone(),
        vertex_inputs,
        push_ranges,
        uniforms,
    })
}

fn float_components(ty: &TypeInner) -> Option<u32> {
    match *ty {
        TypeInner::Scalar(s) if s.kind == ScalarKind::Float && s.width == 4 => Some(1),
        TypeInner::Vector { size, scalar }
            if scalar.kind == ScalarKind::Float && scalar.width == 4 =>
        {
            Some(size as u32)
        }
        _ => None,
    }
}

// Vulkan allows one range per stage, so each stage gets the span covering
// every uniform it reads.
fn push_constant_ranges(uniforms: &HashMap<String, UniformLocation>) -> Vec<vk::PushConstantRange> {
    [vk::ShaderStageFlags::VERTEX, vk::ShaderStageFlags::FRAGMENT]
        .into_iter()
        .filter_map(|stage| {
            let used = uniforms.values().filter(|u| u.stages.contains(stage));
            let (start, end) = used.fold(None, |span: Option<(u32, u32)>, u| {
                let end = u.offset + u.size;
                Some(match span {
                    Some((s, e)) => (s.min(u.offset), e.max(end)),
                    None => (u.offset, end),
                })
            })?;
            Some(
                vk::PushConstantRange::default()
                    .stage_flags(stage)
                    .offset(start)
                    .size(end - start),
            )
        })
        .collect()
}

impl LinkedProgram {
    pub fn spirv(&self, stage: Stage) -> &[u32] {
        match stage {
            Stage::Vertex => &self.vertex_spirv,
            Stage::Fragment => &self.fragment_spirv,
        }
    }

    pub fn vertex_inputs(&self) -> &[VertexInput] {
        &self.vertex_inputs
    }

    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_ranges
    }

    #[cfg(test)]
    pub fn uniforms(&self) -> &HashMap<String, UniformLocation> {
        &self.uniforms
    }

    pub fn uniform(&self, name: &str) -> Option<UniformLocation> {
        self.uniforms.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    const BROKEN: &str = r#"
#version 450
void main() {
    this is not glsl;
}
"#;

    const VERT_WITH_VARYING: &str = r#"
#version 450
layout(location = 0) in vec3 aPos;
layout(location = 0) out vec3 tint;
void main() {
    tint = aPos;
    gl_Position = vec4(aPos, 1.0);
}
"#;

    const FRAG_WITH_VARYING: &str = r#"
#version 450
layout(location = 0) in vec3 tint;
layout(location = 0) out vec4 FragColor;
void main() {
    FragColor = vec4(tint, 1.0);
}
"#;

    const FRAG_WITH_VEC2_VARYING: &str = r#"
#version 450
layout(location = 0) in vec2 tint;
layout(location = 0) out vec4 FragColor;
void main() {
    FragColor = vec4(tint, 0.0, 1.0);
}
"#;

    const VERT_SHARING_COLOR: &str = r#"
#version 450
layout(location = 0) in vec3 aPos;
layout(push_constant) uniform Uniforms {
    vec4 ourColor;
} uniforms;
void main() {
    gl_Position = vec4(aPos, 1.0) + uniforms.ourColor * 0.0;
}
"#;

    const VERT_MISPLACED_COLOR: &str = r#"
#version 450
layout(location = 0) in vec3 aPos;
layout(push_constant) uniform Uniforms {
    vec4 shift;
    vec4 ourColor;
} uniforms;
void main() {
    gl_Position = vec4(aPos, 1.0) + uniforms.shift + uniforms.ourColor * 0.0;
}
"#;

    fn stage(source: &str, stage: Stage) -> CompiledStage {
        compile(source, stage).unwrap()
    }

    #[test]
    fn builtin_sources_compile() {
        let vert = stage(VERTEX_SOURCE, Stage::Vertex);
        let frag = stage(FRAGMENT_SOURCE, Stage::Fragment);
        assert_eq!(vert.stage(), Stage::Vertex);
        assert_eq!(frag.stage(), Stage::Fragment);
        assert_eq!(vert.spirv()[0], SPIRV_MAGIC);
        assert_eq!(frag.spirv()[0], SPIRV_MAGIC);
    }

    #[test]
    fn invalid_source_reports_stage_and_log() {
        for s in [Stage::Vertex, Stage::Fragment] {
            let err = compile(BROKEN, s).unwrap_err();
            assert_eq!(err.stage, s);
            assert!(!err.log.trim().is_empty());
            assert!(err.to_string().contains(&s.to_string()));
        }
    }

    #[test]
    fn link_reflects_color_uniform() {
        let program = link(
            &stage(VERTEX_SOURCE, Stage::Vertex),
            &stage(FRAGMENT_SOURCE, Stage::Fragment),
        )
        .unwrap();
        let color = program.uniform("ourColor").unwrap();
        assert_eq!(color.offset, 0);
        assert_eq!(color.size, 16);
        assert_eq!(color.stages, vk::ShaderStageFlags::FRAGMENT);
        assert!(program.uniform("missing").is_none());
        assert_eq!(program.uniforms().len(), 1);

        let ranges = program.push_constant_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].stage_flags, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!((ranges[0].offset, ranges[0].size), (0, 16));
    }

    #[test]
    fn link_reflects_position_attribute() {
        let program = link(
            &stage(VERTEX_SOURCE, Stage::Vertex),
            &stage(FRAGMENT_SOURCE, Stage::Fragment),
        )
        .unwrap();
        assert_eq!(
            program.vertex_inputs(),
            &[VertexInput {
                location: 0,
                components: 3
            }]
        );
        assert_eq!(program.spirv(Stage::Vertex)[0], SPIRV_MAGIC);
        assert_eq!(program.spirv(Stage::Fragment)[0], SPIRV_MAGIC);
    }

    #[test]
    fn link_rejects_swapped_stages() {
        let vert = stage(VERTEX_SOURCE, Stage::Vertex);
        let frag = stage(FRAGMENT_SOURCE, Stage::Fragment);
        let err = link(&frag, &vert).unwrap_err();
        assert!(err.log.contains("expected a vertex stage"));
        assert!(err.log.contains("expected a fragment stage"));
    }

    #[test]
    fn link_rejects_unwritten_fragment_input() {
        let err = link(
            &stage(VERTEX_SOURCE, Stage::Vertex),
            &stage(FRAG_WITH_VARYING, Stage::Fragment),
        )
        .unwrap_err();
        assert!(err.log.contains("location 0"), "{}", err.log);
    }

    #[test]
    fn link_matches_varyings() {
        link(
            &stage(VERT_WITH_VARYING, Stage::Vertex),
            &stage(FRAG_WITH_VARYING, Stage::Fragment),
        )
        .unwrap();
        let err = link(
            &stage(VERT_WITH_VARYING, Stage::Vertex),
            &stage(FRAG_WITH_VEC2_VARYING, Stage::Fragment),
        )
        .unwrap_err();
        assert!(err.log.contains("location 0"), "{}", err.log);
    }

    #[test]
    fn shared_uniform_covers_both_stages() {
        let program = link(
            &stage(VERT_SHARING_COLOR, Stage::Vertex),
            &stage(FRAGMENT_SOURCE, Stage::Fragment),
        )
        .unwrap();
        let color = program.uniform("ourColor").unwrap();
        assert_eq!(
            color.stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(program.push_constant_ranges().len(), 2);
    }

    #[test]
    fn shared_uniform_layouts_must_agree() {
        let err = link(
            &stage(VERT_MISPLACED_COLOR, Stage::Vertex),
            &stage(FRAGMENT_SOURCE, Stage::Fragment),
        )
        .unwrap_err();
        assert!(err.log.contains("ourColor"), "{}", err.log);
    }
}
