//! Resource limits handed to the GLSL front end.

/// Built-in resource limits the compiler validates shaders against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_lights: i32,
    pub max_clip_planes: i32,
    pub max_texture_units: i32,
    pub max_texture_coords: i32,
    pub max_vertex_attribs: i32,
    pub max_vertex_uniform_components: i32,
    pub max_varying_floats: i32,
    pub max_vertex_texture_image_units: i32,
    pub max_combined_texture_image_units: i32,
    pub max_texture_image_units: i32,
    pub max_fragment_uniform_components: i32,
    pub max_draw_buffers: i32,
    pub max_vertex_uniform_vectors: i32,
    pub max_varying_vectors: i32,
    pub max_fragment_uniform_vectors: i32,
    pub max_vertex_output_vectors: i32,
    pub max_fragment_input_vectors: i32,
    pub max_program_texel_offset: i32,
    pub max_clip_distances: i32,
    pub max_cull_distances: i32,
    pub max_compute_work_group_count: [i32; 3],
    pub max_compute_work_group_size: [i32; 3],
    pub max_compute_uniform_components: i32,
    pub max_compute_texture_image_units: i32,
    pub max_compute_image_uniforms: i32,
    pub max_geometry_output_vertices: i32,
    pub max_patch_vertices: i32,
    pub max_tess_gen_level: i32,
    pub max_viewports: i32,
    pub max_samples: i32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_lights: 32,
            max_clip_planes: 6,
            max_texture_units: 32,
            max_texture_coords: 32,
            max_vertex_attribs: 64,
            max_vertex_uniform_components: 4096,
            max_varying_floats: 64,
            max_vertex_texture_image_units: 32,
            max_combined_texture_image_units: 80,
            max_texture_image_units: 32,
            max_fragment_uniform_components: 4096,
            max_draw_buffers: 32,
            max_vertex_uniform_vectors: 128,
            max_varying_vectors: 8,
            max_fragment_uniform_vectors: 16,
            max_vertex_output_vectors: 16,
            max_fragment_input_vectors: 15,
            max_program_texel_offset: 7,
            max_clip_distances: 8,
            max_cull_distances: 8,
            max_compute_work_group_count: [65535, 65535, 65535],
            max_compute_work_group_size: [1024, 1024, 64],
            max_compute_uniform_components: 1024,
            max_compute_texture_image_units: 16,
            max_compute_image_uniforms: 8,
            max_geometry_output_vertices: 256,
            max_patch_vertices: 32,
            max_tess_gen_level: 64,
            max_viewports: 16,
            max_samples: 4,
        }
    }
}

impl ResourceLimits {
    /// Limits keyed by the names glslang uses in its configuration files.
    pub fn entries(&self) -> Vec<(&'static str, i32)> {
        let [count_x, count_y, count_z] = self.max_compute_work_group_count;
        let [size_x, size_y, size_z] = self.max_compute_work_group_size;
        vec![
            ("MaxLights", self.max_lights),
            ("MaxClipPlanes", self.max_clip_planes),
            ("MaxTextureUnits", self.max_texture_units),
            ("MaxTextureCoords", self.max_texture_coords),
            ("MaxVertexAttribs", self.max_vertex_attribs),
            ("MaxVertexUniformComponents", self.max_vertex_uniform_components),
            ("MaxVaryingFloats", self.max_varying_floats),
            ("MaxVertexTextureImageUnits", self.max_vertex_texture_image_units),
            ("MaxCombinedTextureImageUnits", self.max_combined_texture_image_units),
            ("MaxTextureImageUnits", self.max_texture_image_units),
            ("MaxFragmentUniformComponents", self.max_fragment_uniform_components),
            ("MaxDrawBuffers", self.max_draw_buffers),
            ("MaxVertexUniformVectors", self.max_vertex_uniform_vectors),
            ("MaxVaryingVectors", self.max_varying_vectors),
            ("MaxFragmentUniformVectors", self.max_fragment_uniform_vectors),
            ("MaxVertexOutputVectors", self.max_vertex_output_vectors),
            ("MaxFragmentInputVectors", self.max_fragment_input_vectors),
            ("MaxProgramTexelOffset", self.max_program_texel_offset),
            ("MaxClipDistances", self.max_clip_distances),
            ("MaxCullDistances", self.max_cull_distances),
            ("MaxComputeWorkGroupCountX", count_x),
            ("MaxComputeWorkGroupCountY", count_y),
            ("MaxComputeWorkGroupCountZ", count_z),
            ("MaxComputeWorkGroupSizeX", size_x),
            ("MaxComputeWorkGroupSizeY", size_y),
            ("MaxComputeWorkGroupSizeZ", size_z),
            ("MaxComputeUniformComponents", self.max_compute_uniform_components),
            ("MaxComputeTextureImageUnits", self.max_compute_texture_image_units),
            ("MaxComputeImageUniforms", self.max_compute_image_uniforms),
            ("MaxGeometryOutputVertices", self.max_geometry_output_vertices),
            ("MaxPatchVertices", self.max_patch_vertices),
            ("MaxTessGenLevel", self.max_tess_gen_level),
            ("MaxViewports", self.max_viewports),
            ("MaxSamples", self.max_samples),
        ]
    }

    /// Render as a glslang `.conf` file.
    pub fn to_glslang_config(&self) -> String {
        let mut text: String = self
            .entries()
            .into_iter()
            .map(|(name, value)| format!("{name} {value}\n"))
            .collect();
        // Loop and indexing relaxations
        for flag in [
            "nonInductiveForLoops",
            "whileLoops",
            "doWhileLoops",
            "generalUniformIndexing",
            "generalAttributeMatrixVectorIndexing",
            "generalVaryingIndexing",
            "generalSamplerIndexing",
            "generalVariableIndexing",
            "generalConstantMatrixVectorIndexing",
        ] {
            text.push_str(flag);
            text.push_str(" 1\n");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_desktop_table() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_lights, 32);
        assert_eq!(limits.max_clip_planes, 6);
        assert_eq!(limits.max_compute_work_group_size, [1024, 1024, 64]);
    }

    #[test]
    fn config_file_lists_every_entry() {
        let config = ResourceLimits::default().to_glslang_config();
        assert!(config.contains("MaxComputeWorkGroupSizeZ 64\n"));
        assert!(config.contains("MaxTextureUnits 32\n"));
        assert!(config.ends_with("generalConstantMatrixVectorIndexing 1\n"));
        assert_eq!(
            config.lines().count(),
            ResourceLimits::default().entries().len() + 9
        );
    }
}
