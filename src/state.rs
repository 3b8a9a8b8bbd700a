//! Global GPU state mirror.
//!
//! Every stateful toggle or binding the core touches has exactly one
//! authoritative in-memory shadow here, owned by the renderer and passed
//! `&mut` into geometry/program methods together with the context. All
//! mutations go through the setters below, each of which is a no-op when
//! the requested value already matches the mirror. Redundant GPU calls are
//! eliminated by construction, not left to the driver.
//!
//! Fields start out as `None` ("unknown"), so the first call of each kind
//! always reaches the GPU.

use std::collections::HashMap;

use crate::context::{
    BlendEquation, BlendFunc, BufferId, BufferTarget, Capability, CullFace, DepthFunc,
    FramebufferId, FrontFace, GlContext, UniformLocation, VertexArrayId,
};

/// Flattened uniform snapshot used for change detection.
///
/// Array-valued uniforms compare element-wise; replacing a value with one of
/// a different length simply replaces the cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedUniform {
    Float(f32),
    Int(i32),
    Floats(Vec<f32>),
    Ints(Vec<i32>),
}

/// In-memory shadow of the GPU's mutable global state.
#[derive(Default)]
pub struct RenderState {
    enabled: HashMap<Capability, bool>,
    blend_func: Option<BlendFunc>,
    blend_equation: Option<BlendEquation>,
    cull_face: Option<CullFace>,
    front_face: Option<FrontFace>,
    depth_mask: Option<bool>,
    depth_func: Option<DepthFunc>,
    active_texture_unit: Option<u32>,
    clear_color: Option<[f32; 4]>,
    viewport: Option<(i32, i32, i32, i32)>,
    framebuffer: Option<FramebufferId>,
    bound_buffer: Option<BufferId>,
    bound_vertex_array: Option<VertexArrayId>,
    /// Id of the program currently in use.
    pub current_program: Option<u64>,
    /// (geometry id, attribute-layout signature) of the vertex state
    /// currently bound.
    pub current_geometry: Option<(u64, String)>,
    uniforms: HashMap<UniformLocation, CachedUniform>,
}

impl RenderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, cap: Capability) -> bool {
        self.enabled.get(&cap).copied().unwrap_or(false)
    }

    pub fn enable(&mut self, gl: &mut dyn GlContext, cap: Capability) {
        if self.enabled.get(&cap) == Some(&true) {
            return;
        }
        self.enabled.insert(cap, true);
        gl.enable(cap);
    }

    pub fn disable(&mut self, gl: &mut dyn GlContext, cap: Capability) {
        if self.enabled.get(&cap) == Some(&false) {
            return;
        }
        self.enabled.insert(cap, false);
        gl.disable(cap);
    }

    pub fn set_blend_func(&mut self, gl: &mut dyn GlContext, func: BlendFunc) {
        if self.blend_func == Some(func) {
            return;
        }
        self.blend_func = Some(func);
        gl.blend_func_separate(
            func.src,
            func.dst,
            func.src_alpha.unwrap_or(func.src),
            func.dst_alpha.unwrap_or(func.dst),
        );
    }

    pub fn set_blend_equation(&mut self, gl: &mut dyn GlContext, equation: BlendEquation) {
        if self.blend_equation == Some(equation) {
            return;
        }
        self.blend_equation = Some(equation);
        gl.blend_equation_separate(equation.rgb, equation.alpha.unwrap_or(equation.rgb));
    }

    pub fn set_cull_face(&mut self, gl: &mut dyn GlContext, face: CullFace) {
        if self.cull_face == Some(face) {
            return;
        }
        self.cull_face = Some(face);
        gl.cull_face(face);
    }

    pub fn set_front_face(&mut self, gl: &mut dyn GlContext, winding: FrontFace) {
        if self.front_face == Some(winding) {
            return;
        }
        self.front_face = Some(winding);
        gl.front_face(winding);
    }

    pub fn depth_mask(&self) -> bool {
        self.depth_mask.unwrap_or(true)
    }

    pub fn set_depth_mask(&mut self, gl: &mut dyn GlContext, enabled: bool) {
        if self.depth_mask == Some(enabled) {
            return;
        }
        self.depth_mask = Some(enabled);
        gl.depth_mask(enabled);
    }

    pub fn set_depth_func(&mut self, gl: &mut dyn GlContext, func: DepthFunc) {
        if self.depth_func == Some(func) {
            return;
        }
        self.depth_func = Some(func);
        gl.depth_func(func);
    }

    pub fn active_texture(&mut self, gl: &mut dyn GlContext, unit: u32) {
        if self.active_texture_unit == Some(unit) {
            return;
        }
        self.active_texture_unit = Some(unit);
        gl.active_texture(unit);
    }

    pub fn set_clear_color(&mut self, gl: &mut dyn GlContext, color: [f32; 4]) {
        if self.clear_color == Some(color) {
            return;
        }
        self.clear_color = Some(color);
        gl.clear_color(color[0], color[1], color[2], color[3]);
    }

    pub fn set_viewport(&mut self, gl: &mut dyn GlContext, x: i32, y: i32, width: i32, height: i32) {
        if self.viewport == Some((x, y, width, height)) {
            return;
        }
        self.viewport = Some((x, y, width, height));
        gl.viewport(x, y, width, height);
    }

    pub fn bind_framebuffer(&mut self, gl: &mut dyn GlContext, framebuffer: Option<FramebufferId>) {
        if self.framebuffer == framebuffer {
            return;
        }
        self.framebuffer = framebuffer;
        gl.bind_framebuffer(framebuffer);
    }

    /// Binds `buffer` unless it is already the globally bound buffer.
    pub fn bind_buffer(&mut self, gl: &mut dyn GlContext, target: BufferTarget, buffer: BufferId) {
        if self.bound_buffer == Some(buffer) {
            return;
        }
        self.bound_buffer = Some(buffer);
        gl.bind_buffer(target, Some(buffer));
    }

    /// Marks the bound-buffer shadow without touching the GPU. Used when a
    /// bind happens as a side effect of vertex-array setup.
    pub fn note_bound_buffer(&mut self, buffer: Option<BufferId>) {
        self.bound_buffer = buffer;
    }

    pub fn bind_vertex_array(&mut self, gl: &mut dyn GlContext, vao: Option<VertexArrayId>) {
        if self.bound_vertex_array == vao {
            return;
        }
        self.bound_vertex_array = vao;
        gl.bind_vertex_array(vao);
    }

    /// Change detection for a uniform location. Returns `true` (and records
    /// the new value) when the value differs from the last one uploaded.
    pub fn uniform_needs_update(
        &mut self,
        location: UniformLocation,
        value: &CachedUniform,
    ) -> bool {
        if self.uniforms.get(&location) == Some(value) {
            return false;
        }
        self.uniforms.insert(location, value.clone());
        true
    }

    /// Drops cached uniform values for a removed program's locations.
    pub fn forget_uniforms(&mut self, locations: impl IntoIterator<Item = UniformLocation>) {
        for location in locations {
            self.uniforms.remove(&location);
        }
    }
}
