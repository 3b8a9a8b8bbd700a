//! GPU context boundary.
//!
//! The core never talks to a concrete graphics binding. Everything it needs
//! from the platform is expressed by the [`GlContext`] trait: an
//! immediate-mode API of buffer objects, shader programs, vertex arrays,
//! state toggles and draw calls, plus a capability query for the optional
//! features (vertex arrays, instancing, multiple render targets) that older
//! tiers shim through extensions. Embedders implement the trait over their
//! platform binding; tests implement it over a recording fake.
//!
//! Handles are opaque newtypes handed out by the context. The core owns a
//! handle for exactly as long as the owning [`Geometry`](crate::geometry::Geometry)
//! or [`Program`](crate::program::Program) lives and releases it only
//! through an explicit `remove()`.

use thiserror::Error;

use crate::state::RenderState;

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);
    };
}

handle!(/// GPU buffer object handle.
    BufferId);
handle!(/// Compiled shader stage handle.
    ShaderId);
handle!(/// Linked shader program handle.
    ProgramHandle);
handle!(/// Vertex array object handle.
    VertexArrayId);
handle!(/// Framebuffer object handle.
    FramebufferId);
handle!(/// Texture object handle.
    TextureHandle);
handle!(/// Resolved uniform binding location.
    UniformLocation);

/// Buffer binding target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTarget {
    Array,
    ElementArray,
}

/// Upload usage hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    StaticDraw,
    DynamicDraw,
}

/// Element type of an attribute's backing array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    UnsignedByte,
    UnsignedShort,
    UnsignedInt,
    Float,
}

impl DataType {
    pub fn byte_size(self) -> usize {
        match self {
            DataType::UnsignedByte => 1,
            DataType::UnsignedShort => 2,
            DataType::UnsignedInt | DataType::Float => 4,
        }
    }
}

/// Primitive assembly mode for draw calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawMode {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

/// Togglable GPU capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Blend,
    CullFace,
    DepthTest,
    StencilTest,
    ScissorTest,
}

/// Face culling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullFace {
    Front,
    Back,
    FrontAndBack,
}

/// Winding order that counts as front-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontFace {
    Ccw,
    Cw,
}

impl FrontFace {
    /// The opposite winding, used when a negatively scaled transform turns
    /// geometry inside out.
    pub fn flipped(self) -> FrontFace {
        match self {
            FrontFace::Ccw => FrontFace::Cw,
            FrontFace::Cw => FrontFace::Ccw,
        }
    }
}

/// Depth comparison function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthFunc {
    Never,
    Less,
    Equal,
    Lequal,
    Greater,
    Notequal,
    Gequal,
    Always,
}

/// Blend factor for source/destination terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Blend equation operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Separate source/destination blend factors, with optional distinct alpha
/// factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendFunc {
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub src_alpha: Option<BlendFactor>,
    pub dst_alpha: Option<BlendFactor>,
}

impl BlendFunc {
    pub fn new(src: BlendFactor, dst: BlendFactor) -> Self {
        Self { src, dst, src_alpha: None, dst_alpha: None }
    }
}

/// Separate RGB/alpha blend equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendEquation {
    pub rgb: BlendOp,
    pub alpha: Option<BlendOp>,
}

impl Default for BlendEquation {
    fn default() -> Self {
        Self { rgb: BlendOp::Add, alpha: None }
    }
}

/// Bitmask of buffers to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClearMask {
    pub color: bool,
    pub depth: bool,
    pub stencil: bool,
}

/// Shader stage identifier, kept for compile diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderStage::Vertex => write!(f, "vertex"),
            ShaderStage::Fragment => write!(f, "fragment"),
        }
    }
}

/// Compile or link failure, carrying the driver's info log.
#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("{stage} shader failed to compile: {log}")]
    Compile { stage: ShaderStage, log: String },
    #[error("program failed to link: {log}")]
    Link { log: String },
}

/// Data type of an active uniform reported by program introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformType {
    Float,
    FloatVec2,
    FloatVec3,
    FloatVec4,
    Int,
    IntVec2,
    IntVec3,
    IntVec4,
    Bool,
    Mat2,
    Mat3,
    Mat4,
    Sampler2D,
    SamplerCube,
}

impl UniformType {
    pub fn is_sampler(self) -> bool {
        matches!(self, UniformType::Sampler2D | UniformType::SamplerCube)
    }
}

/// Data type of an active vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    Float,
    FloatVec2,
    FloatVec3,
    FloatVec4,
    Mat2,
    Mat3,
    Mat4,
}

impl AttributeType {
    /// Matrix attributes occupy one binding location per column.
    pub fn locations(self) -> usize {
        match self {
            AttributeType::Mat2 => 2,
            AttributeType::Mat3 => 3,
            AttributeType::Mat4 => 4,
            _ => 1,
        }
    }
}

/// One active uniform discovered on a linked program. Array uniforms report
/// their base name suffixed with `[0]` and a `size` greater than one.
#[derive(Debug, Clone)]
pub struct ActiveUniform {
    pub name: String,
    pub utype: UniformType,
    pub size: usize,
}

/// One active attribute discovered on a linked program.
#[derive(Debug, Clone)]
pub struct ActiveAttribute {
    pub name: String,
    pub atype: AttributeType,
    pub location: u32,
}

/// Optional device features and limits.
///
/// Instancing, vertex arrays and multiple render targets are extension-tier
/// features on older targets; the renderer resolves this table once and the
/// core degrades (with a warning) where a feature is absent.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub vertex_arrays: bool,
    pub instanced_arrays: bool,
    pub multiple_render_targets: bool,
    pub max_texture_units: u32,
    pub max_anisotropy: f32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            vertex_arrays: true,
            instanced_arrays: true,
            multiple_render_targets: true,
            max_texture_units: 16,
            max_anisotropy: 1.0,
        }
    }
}

/// The immediate-mode GPU API surface the core renders through.
///
/// Calls are assumed asynchronous-but-ordered on the device's command queue;
/// nothing here blocks on GPU completion. The trait is object safe so the
/// renderer can own any binding as `Box<dyn GlContext>`.
pub trait GlContext {
    // -- buffer objects --
    fn create_buffer(&mut self) -> BufferId;
    fn bind_buffer(&mut self, target: BufferTarget, buffer: Option<BufferId>);
    fn buffer_data(&mut self, target: BufferTarget, data: &[u8], usage: BufferUsage);
    fn delete_buffer(&mut self, buffer: BufferId);

    // -- vertex arrays --
    fn create_vertex_array(&mut self) -> VertexArrayId;
    fn bind_vertex_array(&mut self, vao: Option<VertexArrayId>);
    fn delete_vertex_array(&mut self, vao: VertexArrayId);
    fn enable_vertex_attrib(&mut self, location: u32);
    fn vertex_attrib_pointer(
        &mut self,
        location: u32,
        size: usize,
        dtype: DataType,
        normalized: bool,
        stride: usize,
        offset: usize,
    );
    fn vertex_attrib_divisor(&mut self, location: u32, divisor: u32);

    // -- shaders and programs --
    fn compile_shader(&mut self, stage: ShaderStage, source: &str) -> Result<ShaderId, ShaderError>;
    fn link_program(
        &mut self,
        vertex: ShaderId,
        fragment: ShaderId,
    ) -> Result<ProgramHandle, ShaderError>;
    fn delete_shader(&mut self, shader: ShaderId);
    fn delete_program(&mut self, program: ProgramHandle);
    fn use_program(&mut self, program: ProgramHandle);
    fn active_uniforms(&self, program: ProgramHandle) -> Vec<ActiveUniform>;
    fn active_attributes(&self, program: ProgramHandle) -> Vec<ActiveAttribute>;
    fn uniform_location(&self, program: ProgramHandle, name: &str) -> Option<UniformLocation>;

    // -- uniform upload --
    fn uniform1f(&mut self, location: UniformLocation, value: f32);
    fn uniform1i(&mut self, location: UniformLocation, value: i32);
    fn uniform1fv(&mut self, location: UniformLocation, values: &[f32]);
    fn uniform1iv(&mut self, location: UniformLocation, values: &[i32]);
    fn uniform2fv(&mut self, location: UniformLocation, values: &[f32]);
    fn uniform3fv(&mut self, location: UniformLocation, values: &[f32]);
    fn uniform4fv(&mut self, location: UniformLocation, values: &[f32]);
    fn uniform2iv(&mut self, location: UniformLocation, values: &[i32]);
    fn uniform3iv(&mut self, location: UniformLocation, values: &[i32]);
    fn uniform4iv(&mut self, location: UniformLocation, values: &[i32]);
    fn uniform_matrix2fv(&mut self, location: UniformLocation, values: &[f32]);
    fn uniform_matrix3fv(&mut self, location: UniformLocation, values: &[f32]);
    fn uniform_matrix4fv(&mut self, location: UniformLocation, values: &[f32]);

    // -- global state --
    fn enable(&mut self, cap: Capability);
    fn disable(&mut self, cap: Capability);
    fn blend_func_separate(
        &mut self,
        src: BlendFactor,
        dst: BlendFactor,
        src_alpha: BlendFactor,
        dst_alpha: BlendFactor,
    );
    fn blend_equation_separate(&mut self, rgb: BlendOp, alpha: BlendOp);
    fn cull_face(&mut self, face: CullFace);
    fn front_face(&mut self, winding: FrontFace);
    fn depth_mask(&mut self, enabled: bool);
    fn depth_func(&mut self, func: DepthFunc);
    fn active_texture(&mut self, unit: u32);
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>);
    fn viewport(&mut self, x: i32, y: i32, width: i32, height: i32);
    fn clear_color(&mut self, r: f32, g: f32, b: f32, a: f32);
    fn clear(&mut self, mask: ClearMask);

    // -- draw dispatch --
    fn draw_arrays(&mut self, mode: DrawMode, first: usize, count: usize);
    fn draw_elements(&mut self, mode: DrawMode, count: usize, dtype: DataType, offset: usize);
    fn draw_arrays_instanced(
        &mut self,
        mode: DrawMode,
        first: usize,
        count: usize,
        instances: usize,
    );
    fn draw_elements_instanced(
        &mut self,
        mode: DrawMode,
        count: usize,
        dtype: DataType,
        offset: usize,
        instances: usize,
    );

    // -- device queries --
    fn capabilities(&self) -> Capabilities;
    fn drawing_buffer_size(&self) -> (u32, u32);
}

/// External texture collaborator.
///
/// The program calls [`Texture::update`] once per frame for every sampler
/// uniform, after assigning the texture its unit and before uploading the
/// sampler index. Implementations bind/refresh their GPU texture on the
/// given unit.
pub trait Texture {
    fn update(&mut self, gl: &mut dyn GlContext, state: &mut RenderState, unit: u32);
}

/// External render-target collaborator: an offscreen destination the
/// renderer can bind in place of the default framebuffer.
pub trait RenderSurface {
    fn size(&self) -> (u32, u32);
    fn framebuffer(&self) -> FramebufferId;
}
