//! Fixed-function state of a graphics pipeline.
//!
//! Every aspect of the pipeline is either configured statically or handed
//! over to dynamic state. [`GraphicsPipelineState::validate`] is the gate
//! that refuses to build a pipeline with an aspect left undecided.

use crate::error::{GpuError, Result};
use crate::shader_module::ShaderStage;
use ash::vk;
use std::fmt;

/// Depth bias applied by light accumulation passes.
pub const LIGHT_PASS_DEPTH_BIAS_CONSTANT: f32 = -4.0;
/// Slope factor of the light pass depth bias.
pub const LIGHT_PASS_DEPTH_BIAS_SLOPE: f32 = 0.0;
/// Clamp of the light pass depth bias.
pub const LIGHT_PASS_DEPTH_BIAS_CLAMP: f32 = 0.0;

/// Which pass of the renderer a pipeline draws in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPassType {
    Simple,
    SimpleWithFakeLight,
    AmbientPass,
    DirectionalLightPass,
    DirectionalLightPassNoShadow,
    PointLightPass,
    PointLightPassNoShadow,
    SpotLightPass,
    SpotLightPassNoShadow,
}

impl RenderPassType {
    /// Passes that accumulate light over the ambient result.
    pub fn is_light_pass(self) -> bool {
        matches!(
            self,
            Self::DirectionalLightPass
                | Self::DirectionalLightPassNoShadow
                | Self::PointLightPass
                | Self::PointLightPassNoShadow
                | Self::SpotLightPass
                | Self::SpotLightPassNoShadow
        )
    }
}

/// Blend equation of a translucent material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendingMode {
    #[default]
    Normal,
    Add,
    Multiply,
    Screen,
}

/// One of the eight fixed-function aspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineAspect {
    VertexInput,
    InputAssembly,
    Tessellation,
    Viewport,
    Rasterization,
    Multisample,
    DepthStencil,
    ColorBlend,
}

impl PipelineAspect {
    pub fn name(self) -> &'static str {
        match self {
            Self::VertexInput => "vertex input",
            Self::InputAssembly => "input assembly",
            Self::Tessellation => "tessellation",
            Self::Viewport => "viewport",
            Self::Rasterization => "rasterization",
            Self::Multisample => "multisample",
            Self::DepthStencil => "depth/stencil",
            Self::ColorBlend => "color blend",
        }
    }

    /// Aspect a dynamic state token stands in for.
    pub fn of_dynamic_state(token: vk::DynamicState) -> Option<Self> {
        let aspect = match token {
            vk::DynamicState::VERTEX_INPUT_EXT | vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE => {
                Self::VertexInput
            }
            vk::DynamicState::PRIMITIVE_TOPOLOGY | vk::DynamicState::PRIMITIVE_RESTART_ENABLE => {
                Self::InputAssembly
            }
            vk::DynamicState::PATCH_CONTROL_POINTS_EXT => Self::Tessellation,
            vk::DynamicState::VIEWPORT
            | vk::DynamicState::SCISSOR
            | vk::DynamicState::VIEWPORT_WITH_COUNT
            | vk::DynamicState::SCISSOR_WITH_COUNT => Self::Viewport,
            vk::DynamicState::LINE_WIDTH
            | vk::DynamicState::DEPTH_BIAS
            | vk::DynamicState::DEPTH_BIAS_ENABLE
            | vk::DynamicState::CULL_MODE
            | vk::DynamicState::FRONT_FACE
            | vk::DynamicState::RASTERIZER_DISCARD_ENABLE
            | vk::DynamicState::POLYGON_MODE_EXT => Self::Rasterization,
            vk::DynamicState::RASTERIZATION_SAMPLES_EXT | vk::DynamicState::SAMPLE_MASK_EXT => {
                Self::Multisample
            }
            vk::DynamicState::DEPTH_BOUNDS
            | vk::DynamicState::STENCIL_COMPARE_MASK
            | vk::DynamicState::STENCIL_WRITE_MASK
            | vk::DynamicState::STENCIL_REFERENCE
            | vk::DynamicState::DEPTH_TEST_ENABLE
            | vk::DynamicState::DEPTH_WRITE_ENABLE
            | vk::DynamicState::DEPTH_COMPARE_OP
            | vk::DynamicState::DEPTH_BOUNDS_TEST_ENABLE
            | vk::DynamicState::STENCIL_TEST_ENABLE
            | vk::DynamicState::STENCIL_OP => Self::DepthStencil,
            vk::DynamicState::BLEND_CONSTANTS
            | vk::DynamicState::LOGIC_OP_EXT
            | vk::DynamicState::COLOR_BLEND_ENABLE_EXT
            | vk::DynamicState::COLOR_BLEND_EQUATION_EXT
            | vk::DynamicState::COLOR_WRITE_MASK_EXT => Self::ColorBlend,
            _ => return None,
        };
        Some(aspect)
    }
}

impl fmt::Display for PipelineAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An aspect configured up front, or left to dynamic state tokens.
#[derive(Debug, Clone)]
pub enum StateBlock<T> {
    Static(T),
    Dynamic(Vec<vk::DynamicState>),
}

impl<T> StateBlock<T> {
    pub fn as_static(&self) -> Option<&T> {
        match self {
            Self::Static(state) => Some(state),
            Self::Dynamic(_) => None,
        }
    }

    pub fn dynamic_tokens(&self) -> &[vk::DynamicState] {
        match self {
            Self::Static(_) => &[],
            Self::Dynamic(tokens) => tokens,
        }
    }
}

/// Satisfied when configured, or dynamic with at least one token.
fn is_decided<T>(block: Option<&StateBlock<T>>) -> bool {
    match block {
        Some(StateBlock::Static(_)) => true,
        Some(StateBlock::Dynamic(tokens)) => !tokens.is_empty(),
        None => false,
    }
}

#[derive(Debug, Clone, Default)]
pub struct VertexInputState {
    pub bindings: Vec<vk::VertexInputBindingDescription>,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
}

#[derive(Debug, Clone, Copy)]
pub struct InputAssemblyState {
    pub topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
}

impl Default for InputAssemblyState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            primitive_restart: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TessellationState {
    pub patch_control_points: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ViewportState {
    pub viewports: Vec<vk::Viewport>,
    pub scissors: Vec<vk::Rect2D>,
}

impl ViewportState {
    /// One viewport and scissor covering `extent`.
    pub fn covering(extent: vk::Extent2D) -> Self {
        Self {
            viewports: vec![vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            }],
            scissors: vec![vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant: f32,
    pub slope: f32,
    pub clamp: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizationState {
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub depth_clamp: bool,
    pub depth_bias: Option<DepthBias>,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            depth_clamp: false,
            depth_bias: None,
        }
    }
}

impl RasterizationState {
    /// Defaults with the depth bias policy of `pass` applied.
    pub fn for_pass(pass: RenderPassType) -> Self {
        let depth_bias = pass.is_light_pass().then_some(DepthBias {
            constant: LIGHT_PASS_DEPTH_BIAS_CONSTANT,
            slope: LIGHT_PASS_DEPTH_BIAS_SLOPE,
            clamp: LIGHT_PASS_DEPTH_BIAS_CLAMP,
        });
        Self {
            depth_bias,
            ..Self::default()
        }
    }

    pub fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_polygon_mode(mut self, polygon_mode: vk::PolygonMode) -> Self {
        self.polygon_mode = polygon_mode;
        self
    }

    pub fn with_front_face(mut self, front_face: vk::FrontFace) -> Self {
        self.front_face = front_face;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultisampleState {
    pub samples: vk::SampleCountFlags,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            samples: vk::SampleCountFlags::TYPE_1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare_op: vk::CompareOp,
    pub stencil_test: bool,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare_op: vk::CompareOp::LESS_OR_EQUAL,
            stencil_test: false,
        }
    }
}

impl DepthStencilState {
    /// Light passes test against the existing depth without writing it;
    /// other passes follow the renderable's own flags.
    pub fn for_pass(pass: RenderPassType, depth_test: bool, depth_write: bool) -> Self {
        if pass.is_light_pass() {
            Self {
                depth_test: true,
                depth_write: false,
                ..Self::default()
            }
        } else {
            Self {
                depth_test,
                depth_write,
                ..Self::default()
            }
        }
    }
}

const COLOR_WRITE_ALL: vk::ColorComponentFlags = vk::ColorComponentFlags::RGBA;

/// Attachment state with blending off.
pub fn opaque_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .src_color_blend_factor(vk::BlendFactor::ONE)
        .dst_color_blend_factor(vk::BlendFactor::ZERO)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
        .alpha_blend_op(vk::BlendOp::ADD)
        .color_write_mask(COLOR_WRITE_ALL)
}

fn blended(
    src_color: vk::BlendFactor,
    dst_color: vk::BlendFactor,
    src_alpha: vk::BlendFactor,
    dst_alpha: vk::BlendFactor,
) -> vk::PipelineColorBlendAttachmentState {
    opaque_blend_attachment()
        .blend_enable(true)
        .src_color_blend_factor(src_color)
        .dst_color_blend_factor(dst_color)
        .src_alpha_blend_factor(src_alpha)
        .dst_alpha_blend_factor(dst_alpha)
}

/// Attachment blend state for a material drawn in `pass`.
pub fn blend_attachment_for(
    pass: RenderPassType,
    opaque: bool,
    mode: BlendingMode,
) -> vk::PipelineColorBlendAttachmentState {
    use vk::BlendFactor as F;

    if pass.is_light_pass() {
        return blended(F::ONE, F::ONE, F::ONE, F::ONE);
    }
    if opaque {
        return opaque_blend_attachment();
    }
    match mode {
        BlendingMode::Normal => blended(F::SRC_ALPHA, F::ONE_MINUS_SRC_ALPHA, F::ONE, F::ONE_MINUS_SRC_ALPHA),
        BlendingMode::Add => blended(F::SRC_ALPHA, F::ONE, F::ONE, F::ONE),
        BlendingMode::Multiply => blended(F::DST_COLOR, F::ZERO, F::DST_ALPHA, F::ZERO),
        BlendingMode::Screen => blended(F::ONE, F::ONE_MINUS_SRC_COLOR, F::ONE, F::ONE_MINUS_SRC_ALPHA),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ColorBlendState {
    pub attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub blend_constants: [f32; 4],
}

/// Every fixed-function aspect of a graphics pipeline.
#[derive(Debug, Clone, Default)]
pub struct GraphicsPipelineState {
    pub vertex_input: Option<StateBlock<VertexInputState>>,
    pub input_assembly: Option<StateBlock<InputAssemblyState>>,
    pub tessellation: Option<StateBlock<TessellationState>>,
    pub viewport: Option<StateBlock<ViewportState>>,
    pub rasterization: Option<StateBlock<RasterizationState>>,
    pub multisample: Option<StateBlock<MultisampleState>>,
    pub depth_stencil: Option<StateBlock<DepthStencilState>>,
    pub color_blend: Option<StateBlock<ColorBlendState>>,
    /// Tokens for aspects that are also configured statically, such as
    /// dynamic viewport rectangles over a static viewport count.
    extra_dynamic: Vec<vk::DynamicState>,
}

impl GraphicsPipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure_vertex_input(
        &mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> &mut Self {
        self.vertex_input = Some(StateBlock::Static(VertexInputState {
            bindings,
            attributes,
        }));
        self
    }

    pub fn configure_input_assembly(&mut self, topology: vk::PrimitiveTopology, primitive_restart: bool) -> &mut Self {
        self.input_assembly = Some(StateBlock::Static(InputAssemblyState {
            topology,
            primitive_restart,
        }));
        self
    }

    pub fn configure_tessellation(&mut self, patch_control_points: u32) -> &mut Self {
        self.tessellation = Some(StateBlock::Static(TessellationState {
            patch_control_points,
        }));
        self
    }

    pub fn configure_viewport(&mut self, extent: vk::Extent2D) -> &mut Self {
        self.viewport = Some(StateBlock::Static(ViewportState::covering(extent)));
        self
    }

    pub fn configure_rasterization(&mut self, state: RasterizationState) -> &mut Self {
        self.rasterization = Some(StateBlock::Static(state));
        self
    }

    pub fn configure_multisample(&mut self, samples: vk::SampleCountFlags) -> &mut Self {
        self.multisample = Some(StateBlock::Static(MultisampleState { samples }));
        self
    }

    pub fn configure_depth_stencil(&mut self, state: DepthStencilState) -> &mut Self {
        self.depth_stencil = Some(StateBlock::Static(state));
        self
    }

    /// Explicit attachment blend states.
    pub fn configure_color_blend(&mut self, attachments: Vec<vk::PipelineColorBlendAttachmentState>) -> &mut Self {
        self.color_blend = Some(StateBlock::Static(ColorBlendState {
            attachments,
            blend_constants: [0.0; 4],
        }));
        self
    }

    /// Blend state derived from the pass and the material, one attachment.
    pub fn configure_color_blend_for(&mut self, pass: RenderPassType, opaque: bool, mode: BlendingMode) -> &mut Self {
        self.configure_color_blend(vec![blend_attachment_for(pass, opaque, mode)])
    }

    /// Configure every per-pass aspect with the renderer's policies.
    pub fn configure_for_pass(
        &mut self,
        pass: RenderPassType,
        extent: vk::Extent2D,
        depth_test: bool,
        depth_write: bool,
    ) -> &mut Self {
        self.configure_viewport(extent)
            .configure_rasterization(RasterizationState::for_pass(pass))
            .configure_multisample(vk::SampleCountFlags::TYPE_1)
            .configure_depth_stencil(DepthStencilState::for_pass(pass, depth_test, depth_write))
    }

    /// Hand `token`'s aspect to dynamic state.
    ///
    /// On a statically configured aspect the token overrides only the values
    /// it names. Unknown tokens are kept and passed through.
    pub fn add_dynamic_state(&mut self, token: vk::DynamicState) -> &mut Self {
        fn push<T>(block: &mut Option<StateBlock<T>>, extra: &mut Vec<vk::DynamicState>, token: vk::DynamicState) {
            match block {
                Some(StateBlock::Dynamic(tokens)) => {
                    if !tokens.contains(&token) {
                        tokens.push(token);
                    }
                }
                Some(StateBlock::Static(_)) => {
                    if !extra.contains(&token) {
                        extra.push(token);
                    }
                }
                None => *block = Some(StateBlock::Dynamic(vec![token])),
            }
        }

        let extra = &mut self.extra_dynamic;
        match PipelineAspect::of_dynamic_state(token) {
            Some(PipelineAspect::VertexInput) => push(&mut self.vertex_input, extra, token),
            Some(PipelineAspect::InputAssembly) => push(&mut self.input_assembly, extra, token),
            Some(PipelineAspect::Tessellation) => push(&mut self.tessellation, extra, token),
            Some(PipelineAspect::Viewport) => push(&mut self.viewport, extra, token),
            Some(PipelineAspect::Rasterization) => push(&mut self.rasterization, extra, token),
            Some(PipelineAspect::Multisample) => push(&mut self.multisample, extra, token),
            Some(PipelineAspect::DepthStencil) => push(&mut self.depth_stencil, extra, token),
            Some(PipelineAspect::ColorBlend) => push(&mut self.color_blend, extra, token),
            None => {
                if !extra.contains(&token) {
                    extra.push(token);
                }
            }
        }
        self
    }

    /// Every dynamic token declared, without duplicates.
    pub fn dynamic_states(&self) -> Vec<vk::DynamicState> {
        let blocks: [&[vk::DynamicState]; 8] = [
            self.vertex_input.as_ref().map_or(&[], StateBlock::dynamic_tokens),
            self.input_assembly.as_ref().map_or(&[], StateBlock::dynamic_tokens),
            self.tessellation.as_ref().map_or(&[], StateBlock::dynamic_tokens),
            self.viewport.as_ref().map_or(&[], StateBlock::dynamic_tokens),
            self.rasterization.as_ref().map_or(&[], StateBlock::dynamic_tokens),
            self.multisample.as_ref().map_or(&[], StateBlock::dynamic_tokens),
            self.depth_stencil.as_ref().map_or(&[], StateBlock::dynamic_tokens),
            self.color_blend.as_ref().map_or(&[], StateBlock::dynamic_tokens),
        ];
        let mut tokens: Vec<vk::DynamicState> = Vec::new();
        for token in blocks.into_iter().flatten().chain(&self.extra_dynamic) {
            if !tokens.contains(token) {
                tokens.push(*token);
            }
        }
        tokens
    }

    /// Check that the pipeline can be built.
    ///
    /// Shader stages must be present. Each aspect must be configured or
    /// dynamic; tessellation only counts when `uses_tessellation` is set,
    /// and tessellation stages are rejected when it is not.
    /// A missing color blend state is not an error: a single opaque
    /// attachment is substituted at creation.
    pub fn validate(&self, pipeline: &str, stages: &[ShaderStage], uses_tessellation: bool) -> Result<()> {
        if stages.is_empty() {
            return Err(GpuError::MissingState {
                pipeline: pipeline.to_string(),
                aspect: "shader stage",
            });
        }
        let has_tessellation_stage = stages.iter().any(|stage| stage.is_tessellation());
        if uses_tessellation && !has_tessellation_stage {
            return Err(GpuError::MissingState {
                pipeline: pipeline.to_string(),
                aspect: "tessellation shader",
            });
        }
        if !uses_tessellation && has_tessellation_stage {
            return Err(GpuError::InvalidState(format!(
                "Pipeline '{pipeline}' has tessellation stages but does not use tessellation"
            )));
        }

        let checks = [
            (PipelineAspect::VertexInput, is_decided(self.vertex_input.as_ref())),
            (PipelineAspect::InputAssembly, is_decided(self.input_assembly.as_ref())),
            (
                PipelineAspect::Tessellation,
                !uses_tessellation || is_decided(self.tessellation.as_ref()),
            ),
            (PipelineAspect::Viewport, is_decided(self.viewport.as_ref())),
            (PipelineAspect::Rasterization, is_decided(self.rasterization.as_ref())),
            (PipelineAspect::Multisample, is_decided(self.multisample.as_ref())),
            (PipelineAspect::DepthStencil, is_decided(self.depth_stencil.as_ref())),
        ];

        match checks.iter().find(|(_, decided)| !decided) {
            Some((aspect, _)) => Err(GpuError::MissingState {
                pipeline: pipeline.to_string(),
                aspect: aspect.name(),
            }),
            None => Ok(()),
        }
    }

    /// Color blend state used at creation: the configured one, or a single
    /// opaque attachment.
    pub fn effective_color_blend(&self) -> ColorBlendState {
        match &self.color_blend {
            Some(StateBlock::Static(state)) => state.clone(),
            _ => ColorBlendState {
                attachments: vec![opaque_blend_attachment()],
                blend_constants: [0.0; 4],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAGES: [ShaderStage; 2] = [ShaderStage::Vertex, ShaderStage::Fragment];

    fn complete_without_vertex_input() -> GraphicsPipelineState {
        let mut state = GraphicsPipelineState::new();
        state
            .configure_input_assembly(vk::PrimitiveTopology::TRIANGLE_LIST, false)
            .configure_for_pass(
                RenderPassType::Simple,
                vk::Extent2D {
                    width: 1280,
                    height: 720,
                },
                true,
                true,
            );
        state
    }

    #[test]
    fn missing_vertex_input_is_rejected_until_made_dynamic() {
        let mut state = complete_without_vertex_input();

        let err = state.validate("mesh", &STAGES, false).unwrap_err();
        assert!(matches!(
            err,
            GpuError::MissingState { aspect: "vertex input", .. }
        ));

        state.add_dynamic_state(vk::DynamicState::VERTEX_INPUT_EXT);
        assert!(state.validate("mesh", &STAGES, false).is_ok());
        assert_eq!(state.dynamic_states(), vec![vk::DynamicState::VERTEX_INPUT_EXT]);
    }

    #[test]
    fn unrelated_tokens_do_not_satisfy_an_aspect() {
        let mut state = complete_without_vertex_input();
        state.add_dynamic_state(vk::DynamicState::VIEWPORT);
        assert!(state.validate("mesh", &STAGES, false).is_err());
    }

    #[test]
    fn shader_stages_are_required() {
        let mut state = complete_without_vertex_input();
        state.configure_vertex_input(Vec::new(), Vec::new());
        assert!(matches!(
            state.validate("mesh", &[], false),
            Err(GpuError::MissingState { aspect: "shader stage", .. })
        ));
        assert!(state.validate("mesh", &STAGES, false).is_ok());
    }

    #[test]
    fn tessellation_is_checked_only_when_requested() {
        let mut state = complete_without_vertex_input();
        state.configure_vertex_input(Vec::new(), Vec::new());
        let stages = [
            ShaderStage::Vertex,
            ShaderStage::TessellationControl,
            ShaderStage::TessellationEvaluation,
            ShaderStage::Fragment,
        ];
        assert!(state.validate("mesh", &STAGES, false).is_ok());
        assert!(matches!(
            state.validate("terrain", &stages, true),
            Err(GpuError::MissingState { aspect: "tessellation", .. })
        ));
        state.configure_tessellation(3);
        assert!(state.validate("terrain", &stages, true).is_ok());
        assert!(state.validate("terrain", &STAGES, true).is_err());
    }

    #[test]
    fn tessellation_stages_require_tessellation() {
        let mut state = complete_without_vertex_input();
        state.configure_vertex_input(Vec::new(), Vec::new());
        state.configure_tessellation(3);
        let stages = [
            ShaderStage::Vertex,
            ShaderStage::TessellationEvaluation,
            ShaderStage::Fragment,
        ];
        assert!(matches!(
            state.validate("terrain", &stages, false),
            Err(GpuError::InvalidState(_))
        ));
        assert!(state.validate("terrain", &stages, true).is_ok());
    }

    #[test]
    fn color_blend_defaults_to_one_opaque_attachment() {
        let mut state = complete_without_vertex_input();
        state.configure_vertex_input(Vec::new(), Vec::new());
        assert!(state.validate("mesh", &STAGES, false).is_ok());

        let blend = state.effective_color_blend();
        assert_eq!(blend.attachments.len(), 1);
        assert_eq!(blend.attachments[0].blend_enable, vk::FALSE);
    }

    #[test]
    fn static_aspects_keep_extra_tokens() {
        let mut state = complete_without_vertex_input();
        state
            .add_dynamic_state(vk::DynamicState::VIEWPORT)
            .add_dynamic_state(vk::DynamicState::SCISSOR)
            .add_dynamic_state(vk::DynamicState::VIEWPORT);
        assert!(state.viewport.as_ref().unwrap().as_static().is_some());
        assert_eq!(
            state.dynamic_states(),
            vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        );
    }

    #[test]
    fn light_passes_get_depth_bias_and_read_only_depth() {
        let light = RasterizationState::for_pass(RenderPassType::PointLightPass);
        let bias = light.depth_bias.unwrap();
        assert_eq!(bias.constant, LIGHT_PASS_DEPTH_BIAS_CONSTANT);
        assert_eq!(bias.slope, LIGHT_PASS_DEPTH_BIAS_SLOPE);
        assert!(RasterizationState::for_pass(RenderPassType::AmbientPass)
            .depth_bias
            .is_none());

        let depth = DepthStencilState::for_pass(RenderPassType::SpotLightPassNoShadow, false, true);
        assert!(depth.depth_test);
        assert!(!depth.depth_write);
        assert_eq!(depth.compare_op, vk::CompareOp::LESS_OR_EQUAL);

        let own = DepthStencilState::for_pass(RenderPassType::Simple, false, true);
        assert!(!own.depth_test);
        assert!(own.depth_write);
    }

    #[test]
    fn blending_follows_pass_and_material() {
        let opaque = blend_attachment_for(RenderPassType::Simple, true, BlendingMode::Add);
        assert_eq!(opaque.blend_enable, vk::FALSE);

        let light = blend_attachment_for(RenderPassType::DirectionalLightPass, true, BlendingMode::Normal);
        assert_eq!(light.blend_enable, vk::TRUE);
        assert_eq!(light.src_color_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(light.dst_color_blend_factor, vk::BlendFactor::ONE);

        let normal = blend_attachment_for(RenderPassType::Simple, false, BlendingMode::Normal);
        assert_eq!(normal.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        let multiply = blend_attachment_for(RenderPassType::Simple, false, BlendingMode::Multiply);
        assert_eq!(multiply.src_color_blend_factor, vk::BlendFactor::DST_COLOR);
        let screen = blend_attachment_for(RenderPassType::AmbientPass, false, BlendingMode::Screen);
        assert_eq!(screen.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_COLOR);
    }

    #[test]
    fn light_pass_classification() {
        assert!(RenderPassType::DirectionalLightPassNoShadow.is_light_pass());
        assert!(!RenderPassType::SimpleWithFakeLight.is_light_pass());
        assert!(!RenderPassType::AmbientPass.is_light_pass());
    }

    #[test]
    fn tokens_map_to_aspects() {
        assert_eq!(
            PipelineAspect::of_dynamic_state(vk::DynamicState::DEPTH_BIAS),
            Some(PipelineAspect::Rasterization)
        );
        assert_eq!(
            PipelineAspect::of_dynamic_state(vk::DynamicState::STENCIL_REFERENCE),
            Some(PipelineAspect::DepthStencil)
        );
        assert_eq!(
            PipelineAspect::of_dynamic_state(vk::DynamicState::BLEND_CONSTANTS),
            Some(PipelineAspect::ColorBlend)
        );
    }
}
