//! Shared test scaffolding: a recording fake GPU context plus builders.
//!
//! `RecordingGl` implements `GlContext` over shared interior state so a
//! test can keep a handle while the renderer owns a boxed clone. Every call
//! is counted by name (the call-count spy the state-elision properties
//! need) and appended to an ordered log with its arguments, and linked
//! programs report whatever introspection data the test queued up.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use luster::context::{
    ActiveAttribute, ActiveUniform, AttributeType, BlendFactor, BlendOp, BufferId, BufferTarget,
    BufferUsage, Capabilities, Capability, ClearMask, CullFace, DataType, DepthFunc, DrawMode,
    FramebufferId, FrontFace, GlContext, ProgramHandle, ShaderError, ShaderId, ShaderStage,
    UniformLocation, UniformType, VertexArrayId,
};
use luster::program::{Program, ProgramOptions};
use luster::render::{Renderer, RendererOptions};

/// Introspection data a fake linked program should report.
#[derive(Clone, Default)]
pub struct FakeProgram {
    pub uniforms: Vec<ActiveUniform>,
    pub attributes: Vec<ActiveAttribute>,
}

impl FakeProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attributes(attributes: &[(&str, AttributeType)]) -> Self {
        Self::new().attributes(attributes)
    }

    pub fn with_uniforms(uniforms: &[(&str, UniformType)]) -> Self {
        Self::new().uniforms(uniforms)
    }

    pub fn attributes(mut self, attributes: &[(&str, AttributeType)]) -> Self {
        let mut location = 0u32;
        for (name, atype) in attributes {
            self.attributes.push(ActiveAttribute {
                name: (*name).to_string(),
                atype: *atype,
                location,
            });
            location += atype.locations() as u32;
        }
        self
    }

    pub fn uniforms(mut self, uniforms: &[(&str, UniformType)]) -> Self {
        for (name, utype) in uniforms {
            self.uniforms.push(ActiveUniform {
                name: (*name).to_string(),
                utype: *utype,
                size: 1,
            });
        }
        self
    }
}

struct LinkedProgram {
    uniforms: Vec<ActiveUniform>,
    attributes: Vec<ActiveAttribute>,
    locations: HashMap<String, UniformLocation>,
}

#[derive(Default)]
pub struct GlLog {
    next_id: u32,
    counts: BTreeMap<String, usize>,
    /// Ordered call log with formatted arguments.
    pub calls: Vec<String>,
    pub capabilities: Capabilities,
    /// When set, the next `compile_shader` fails with this log.
    pub fail_compile: Option<String>,
    /// Introspection data handed to linked programs, in link order.
    pending_programs: Vec<FakeProgram>,
    linked: HashMap<u32, LinkedProgram>,
    bound_array: Option<BufferId>,
    bound_element: Option<BufferId>,
    /// Last uploaded bytes per buffer.
    pub buffers: HashMap<BufferId, Vec<u8>>,
}

impl GlLog {
    fn record(&mut self, name: &str, call: String) {
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
        self.calls.push(call);
    }

    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// Cloneable recording context; all clones share one log.
#[derive(Clone, Default)]
pub struct RecordingGl(pub Rc<RefCell<GlLog>>);

impl RecordingGl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        let gl = Self::new();
        gl.0.borrow_mut().capabilities = capabilities;
        gl
    }

    /// Queues introspection data for the next linked program.
    pub fn push_program(&self, program: FakeProgram) {
        self.0.borrow_mut().pending_programs.push(program);
    }

    pub fn count(&self, name: &str) -> usize {
        self.0.borrow().counts.get(name).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }

    pub fn calls_containing(&self, needle: &str) -> Vec<String> {
        self.0
            .borrow()
            .calls
            .iter()
            .filter(|call| call.contains(needle))
            .cloned()
            .collect()
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.0.borrow().buffers.get(&buffer).cloned()
    }

    fn record(&self, name: &str, call: String) {
        self.0.borrow_mut().record(name, call);
    }
}

impl GlContext for RecordingGl {
    fn create_buffer(&mut self) -> BufferId {
        self.record("create_buffer", "create_buffer".into());
        BufferId(self.0.borrow_mut().next())
    }

    fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<BufferId>) {
        self.record("bind_buffer", format!("bind_buffer({:?}, {:?})", target, buffer));
        match target {
            BufferTarget::Array => self.0.borrow_mut().bound_array = buffer,
            BufferTarget::ElementArray => self.0.borrow_mut().bound_element = buffer,
        }
    }

    fn buffer_data(&mut self, target: BufferTarget, data: &[u8], _usage: BufferUsage) {
        self.record("buffer_data", format!("buffer_data({:?}, {} bytes)", target, data.len()));
        let mut log = self.0.borrow_mut();
        let bound = match target {
            BufferTarget::Array => log.bound_array,
            BufferTarget::ElementArray => log.bound_element,
        };
        if let Some(buffer) = bound {
            log.buffers.insert(buffer, data.to_vec());
        }
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        self.record("delete_buffer", format!("delete_buffer({:?})", buffer));
        self.0.borrow_mut().buffers.remove(&buffer);
    }

    fn create_vertex_array(&mut self) -> VertexArrayId {
        self.record("create_vertex_array", "create_vertex_array".into());
        VertexArrayId(self.0.borrow_mut().next())
    }

    fn bind_vertex_array(&mut self, vao: Option<VertexArrayId>) {
        self.record("bind_vertex_array", format!("bind_vertex_array({:?})", vao));
    }

    fn delete_vertex_array(&mut self, vao: VertexArrayId) {
        self.record("delete_vertex_array", format!("delete_vertex_array({:?})", vao));
    }

    fn enable_vertex_attrib(&mut self, location: u32) {
        self.record("enable_vertex_attrib", format!("enable_vertex_attrib({})", location));
    }

    fn vertex_attrib_pointer(
        &mut self,
        location: u32,
        size: usize,
        dtype: DataType,
        normalized: bool,
        stride: usize,
        offset: usize,
    ) {
        self.record(
            "vertex_attrib_pointer",
            format!(
                "vertex_attrib_pointer({}, {}, {:?}, {}, {}, {})",
                location, size, dtype, normalized, stride, offset
            ),
        );
    }

    fn vertex_attrib_divisor(&mut self, location: u32, divisor: u32) {
        self.record(
            "vertex_attrib_divisor",
            format!("vertex_attrib_divisor({}, {})", location, divisor),
        );
    }

    fn compile_shader(&mut self, stage: ShaderStage, _source: &str) -> Result<ShaderId, ShaderError> {
        self.record("compile_shader", format!("compile_shader({:?})", stage));
        if let Some(log) = self.0.borrow_mut().fail_compile.take() {
            return Err(ShaderError::Compile { stage, log });
        }
        Ok(ShaderId(self.0.borrow_mut().next()))
    }

    fn link_program(
        &mut self,
        _vertex: ShaderId,
        _fragment: ShaderId,
    ) -> Result<ProgramHandle, ShaderError> {
        self.record("link_program", "link_program".into());
        let mut log = self.0.borrow_mut();
        let fake = if log.pending_programs.is_empty() {
            FakeProgram::default()
        } else {
            log.pending_programs.remove(0)
        };
        let handle = log.next();
        let mut locations = HashMap::new();
        for uniform in &fake.uniforms {
            let location = UniformLocation(log.next());
            locations.insert(uniform.name.clone(), location);
        }
        log.linked.insert(
            handle,
            LinkedProgram { uniforms: fake.uniforms, attributes: fake.attributes, locations },
        );
        Ok(ProgramHandle(handle))
    }

    fn delete_shader(&mut self, shader: ShaderId) {
        self.record("delete_shader", format!("delete_shader({:?})", shader));
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.record("delete_program", format!("delete_program({:?})", program));
    }

    fn use_program(&mut self, program: ProgramHandle) {
        self.record("use_program", format!("use_program({:?})", program));
    }

    fn active_uniforms(&self, program: ProgramHandle) -> Vec<ActiveUniform> {
        self.0
            .borrow()
            .linked
            .get(&program.0)
            .map(|p| p.uniforms.clone())
            .unwrap_or_default()
    }

    fn active_attributes(&self, program: ProgramHandle) -> Vec<ActiveAttribute> {
        self.0
            .borrow()
            .linked
            .get(&program.0)
            .map(|p| p.attributes.clone())
            .unwrap_or_default()
    }

    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation> {
        self.0.borrow().linked.get(&program.0).and_then(|p| p.locations.get(name)).copied()
    }

    fn uniform1f(&mut self, location: UniformLocation, value: f32) {
        self.record("uniform1f", format!("uniform1f({:?}, {})", location, value));
    }

    fn uniform1i(&mut self, location: UniformLocation, value: i32) {
        self.record("uniform1i", format!("uniform1i({:?}, {})", location, value));
    }

    fn uniform1fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.record("uniform1fv", format!("uniform1fv({:?}, {:?})", location, values));
    }

    fn uniform1iv(&mut self, location: UniformLocation, values: &[i32]) {
        self.record("uniform1iv", format!("uniform1iv({:?}, {:?})", location, values));
    }

    fn uniform2fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.record("uniform2fv", format!("uniform2fv({:?}, {:?})", location, values));
    }

    fn uniform3fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.record("uniform3fv", format!("uniform3fv({:?}, {:?})", location, values));
    }

    fn uniform4fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.record("uniform4fv", format!("uniform4fv({:?}, {:?})", location, values));
    }

    fn uniform2iv(&mut self, location: UniformLocation, values: &[i32]) {
        self.record("uniform2iv", format!("uniform2iv({:?}, {:?})", location, values));
    }

    fn uniform3iv(&mut self, location: UniformLocation, values: &[i32]) {
        self.record("uniform3iv", format!("uniform3iv({:?}, {:?})", location, values));
    }

    fn uniform4iv(&mut self, location: UniformLocation, values: &[i32]) {
        self.record("uniform4iv", format!("uniform4iv({:?}, {:?})", location, values));
    }

    fn uniform_matrix2fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.record("uniform_matrix2fv", format!("uniform_matrix2fv({:?}, {:?})", location, values));
    }

    fn uniform_matrix3fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.record("uniform_matrix3fv", format!("uniform_matrix3fv({:?}, {:?})", location, values));
    }

    fn uniform_matrix4fv(&mut self, location: UniformLocation, values: &[f32]) {
        self.record("uniform_matrix4fv", format!("uniform_matrix4fv({:?}, {:?})", location, values));
    }

    fn enable(&mut self, cap: Capability) {
        self.record("enable", format!("enable({:?})", cap));
    }

    fn disable(&mut self, cap: Capability) {
        self.record("disable", format!("disable({:?})", cap));
    }

    fn blend_func_separate(
        &mut self,
        src: BlendFactor,
        dst: BlendFactor,
        src_alpha: BlendFactor,
        dst_alpha: BlendFactor,
    ) {
        self.record(
            "blend_func_separate",
            format!("blend_func_separate({:?}, {:?}, {:?}, {:?})", src, dst, src_alpha, dst_alpha),
        );
    }

    fn blend_equation_separate(&mut self, rgb: BlendOp, alpha: BlendOp) {
        self.record(
            "blend_equation_separate",
            format!("blend_equation_separate({:?}, {:?})", rgb, alpha),
        );
    }

    fn cull_face(&mut self, face: CullFace) {
        self.record("cull_face", format!("cull_face({:?})", face));
    }

    fn front_face(&mut self, winding: FrontFace) {
        self.record("front_face", format!("front_face({:?})", winding));
    }

    fn depth_mask(&mut self, enabled: bool) {
        self.record("depth_mask", format!("depth_mask({})", enabled));
    }

    fn depth_func(&mut self, func: DepthFunc) {
        self.record("depth_func", format!("depth_func({:?})", func));
    }

    fn active_texture(&mut self, unit: u32) {
        self.record("active_texture", format!("active_texture({})", unit));
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        self.record("bind_framebuffer", format!("bind_framebuffer({:?})", framebuffer));
    }

    fn viewport(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.record("viewport", format!("viewport({}, {}, {}, {})", x, y, width, height));
    }

    fn clear_color(&mut self, r: f32, g: f32, b: f32, a: f32) {
        self.record("clear_color", format!("clear_color({}, {}, {}, {})", r, g, b, a));
    }

    fn clear(&mut self, mask: ClearMask) {
        self.record("clear", format!("clear({:?})", mask));
    }

    fn draw_arrays(&mut self, mode: DrawMode, first: usize, count: usize) {
        self.record("draw_arrays", format!("draw_arrays({:?}, {}, {})", mode, first, count));
    }

    fn draw_elements(&mut self, mode: DrawMode, count: usize, dtype: DataType, offset: usize) {
        self.record(
            "draw_elements",
            format!("draw_elements({:?}, {}, {:?}, {})", mode, count, dtype, offset),
        );
    }

    fn draw_arrays_instanced(
        &mut self,
        mode: DrawMode,
        first: usize,
        count: usize,
        instances: usize,
    ) {
        self.record(
            "draw_arrays_instanced",
            format!("draw_arrays_instanced({:?}, {}, {}, {})", mode, first, count, instances),
        );
    }

    fn draw_elements_instanced(
        &mut self,
        mode: DrawMode,
        count: usize,
        dtype: DataType,
        offset: usize,
        instances: usize,
    ) {
        self.record(
            "draw_elements_instanced",
            format!(
                "draw_elements_instanced({:?}, {}, {:?}, {}, {})",
                mode, count, dtype, offset, instances
            ),
        );
    }

    fn capabilities(&self) -> Capabilities {
        self.0.borrow().capabilities
    }

    fn drawing_buffer_size(&self) -> (u32, u32) {
        (300, 150)
    }
}

/// Texture stub handed to sampler uniforms; records the units it was
/// updated on.
#[derive(Default)]
pub struct UnitTexture {
    pub units: Vec<u32>,
}

impl luster::context::Texture for UnitTexture {
    fn update(
        &mut self,
        _gl: &mut dyn GlContext,
        _state: &mut luster::state::RenderState,
        unit: u32,
    ) {
        self.units.push(unit);
    }
}

/// Offscreen target stub.
pub struct FakeTarget {
    pub width: u32,
    pub height: u32,
    pub framebuffer: FramebufferId,
}

impl luster::context::RenderSurface for FakeTarget {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn framebuffer(&self) -> FramebufferId {
        self.framebuffer
    }
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A renderer over a fresh recording context, plus a handle to the log.
pub fn test_renderer() -> (Renderer, RecordingGl) {
    init_logger();
    let gl = RecordingGl::new();
    let renderer = Renderer::new(Box::new(gl.clone()), RendererOptions::default());
    (renderer, gl)
}

/// Compiles a program whose link-time introspection reports `fake`.
pub fn make_program(renderer: &mut Renderer, gl: &RecordingGl, fake: FakeProgram) -> Program {
    make_program_with(renderer, gl, fake, ProgramOptions::default())
}

pub fn make_program_with(
    renderer: &mut Renderer,
    gl: &RecordingGl,
    fake: FakeProgram,
    options: ProgramOptions,
) -> Program {
    gl.push_program(fake);
    let (context, _) = renderer.parts();
    Program::new(context, "void main() {}", "void main() {}", options)
}
