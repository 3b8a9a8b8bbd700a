//! Shader program abstraction.
//!
//! A [`Program`] owns a compiled-and-linked GPU program plus everything the
//! renderer needs to drive it: the introspected uniform and attribute
//! bindings, the per-program render-state flags (blend, cull, depth) and an
//! externally mutated [`Uniforms`] map. Uniform values are resolved into
//! tagged [`UniformValue`] variants once, diffed against the state mirror's
//! per-location cache on every [`Program::use_program`], and only uploaded
//! when they actually changed.
//!
//! Compile and link failures are logged with line-numbered source and leave
//! the program half-initialized; `use_program` on such a program warns and
//! does nothing.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use cgmath::{Matrix2, Matrix3, Matrix4, Vector2, Vector3, Vector4};

use crate::context::{
    ActiveAttribute, BlendEquation, BlendFactor, BlendFunc, Capability, CullFace, DepthFunc,
    FrontFace, GlContext, ProgramHandle, ShaderStage, Texture, UniformLocation, UniformType,
};
use crate::state::{CachedUniform, RenderState};
use crate::warnings::warn_capped;

static PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to an external texture collaborator.
pub type TextureRef = Rc<RefCell<dyn Texture>>;

/// A uniform value supplied by the application.
///
/// The variant is matched against the introspected uniform type at upload
/// time; struct and struct-array variants hold nested maps addressed by the
/// parsed uniform name (`lights[0].position` reads
/// `StructArray[0]["position"]`).
#[derive(Clone)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2(Vector2<f32>),
    Vec3(Vector3<f32>),
    Vec4(Vector4<f32>),
    Mat2(Matrix2<f32>),
    Mat3(Matrix3<f32>),
    Mat4(Matrix4<f32>),
    /// Flat float data for array uniforms (`float[]`, `vec3[]`, ...).
    FloatArray(Vec<f32>),
    /// Flat integer data for array uniforms.
    IntArray(Vec<i32>),
    Texture(TextureRef),
    TextureArray(Vec<TextureRef>),
    Struct(HashMap<String, UniformValue>),
    StructArray(Vec<HashMap<String, UniformValue>>),
}

impl UniformValue {
    /// Flattened snapshot for change detection and upload. Texture variants
    /// have no snapshot; their sampler unit is diffed instead.
    fn snapshot(&self) -> Option<CachedUniform> {
        match self {
            UniformValue::Float(v) => Some(CachedUniform::Float(*v)),
            UniformValue::Int(v) => Some(CachedUniform::Int(*v)),
            UniformValue::Bool(v) => Some(CachedUniform::Int(*v as i32)),
            UniformValue::Vec2(v) => Some(CachedUniform::Floats(vec![v.x, v.y])),
            UniformValue::Vec3(v) => Some(CachedUniform::Floats(vec![v.x, v.y, v.z])),
            UniformValue::Vec4(v) => Some(CachedUniform::Floats(vec![v.x, v.y, v.z, v.w])),
            UniformValue::Mat2(m) => {
                let m: &[f32; 4] = m.as_ref();
                Some(CachedUniform::Floats(m.to_vec()))
            }
            UniformValue::Mat3(m) => {
                let m: &[f32; 9] = m.as_ref();
                Some(CachedUniform::Floats(m.to_vec()))
            }
            UniformValue::Mat4(m) => {
                let m: &[f32; 16] = m.as_ref();
                Some(CachedUniform::Floats(m.to_vec()))
            }
            UniformValue::FloatArray(v) => Some(CachedUniform::Floats(v.clone())),
            UniformValue::IntArray(v) => Some(CachedUniform::Ints(v.clone())),
            UniformValue::Texture(_)
            | UniformValue::TextureArray(_)
            | UniformValue::Struct(_)
            | UniformValue::StructArray(_) => None,
        }
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        UniformValue::Float(v)
    }
}
impl From<i32> for UniformValue {
    fn from(v: i32) -> Self {
        UniformValue::Int(v)
    }
}
impl From<bool> for UniformValue {
    fn from(v: bool) -> Self {
        UniformValue::Bool(v)
    }
}
impl From<Vector2<f32>> for UniformValue {
    fn from(v: Vector2<f32>) -> Self {
        UniformValue::Vec2(v)
    }
}
impl From<Vector3<f32>> for UniformValue {
    fn from(v: Vector3<f32>) -> Self {
        UniformValue::Vec3(v)
    }
}
impl From<Vector4<f32>> for UniformValue {
    fn from(v: Vector4<f32>) -> Self {
        UniformValue::Vec4(v)
    }
}
impl From<[f32; 2]> for UniformValue {
    fn from(v: [f32; 2]) -> Self {
        UniformValue::Vec2(v.into())
    }
}
impl From<[f32; 3]> for UniformValue {
    fn from(v: [f32; 3]) -> Self {
        UniformValue::Vec3(v.into())
    }
}
impl From<[f32; 4]> for UniformValue {
    fn from(v: [f32; 4]) -> Self {
        UniformValue::Vec4(v.into())
    }
}
impl From<Matrix3<f32>> for UniformValue {
    fn from(v: Matrix3<f32>) -> Self {
        UniformValue::Mat3(v)
    }
}
impl From<Matrix4<f32>> for UniformValue {
    fn from(v: Matrix4<f32>) -> Self {
        UniformValue::Mat4(v)
    }
}
impl From<Vec<f32>> for UniformValue {
    fn from(v: Vec<f32>) -> Self {
        UniformValue::FloatArray(v)
    }
}
impl From<Vec<i32>> for UniformValue {
    fn from(v: Vec<i32>) -> Self {
        UniformValue::IntArray(v)
    }
}
impl From<TextureRef> for UniformValue {
    fn from(v: TextureRef) -> Self {
        UniformValue::Texture(v)
    }
}

/// Name → value map the application owns and mutates between frames.
///
/// Entries never need re-registering; the program re-reads them on every
/// `use_program`.
#[derive(Clone, Default)]
pub struct Uniforms {
    values: HashMap<String, UniformValue>,
}

impl Uniforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<UniformValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&UniformValue> {
        self.values.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut UniformValue> {
        self.values.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<UniformValue> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// How an active uniform name addresses into the supplied uniforms map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UniformAccess {
    /// Plain uniform, including flat arrays (`color`, `weights[0]`).
    Direct,
    /// Struct member (`material.shininess`).
    Struct { property: String },
    /// Struct-array member (`lights[1].position`).
    StructArray { index: usize, property: String },
}

/// One introspected uniform with its resolved addressing, built once at
/// link time and never re-sniffed.
#[derive(Debug, Clone)]
struct UniformBinding {
    location: UniformLocation,
    utype: UniformType,
    name: String,
    base: String,
    access: UniformAccess,
}

/// Splits an active uniform name into its base name and nested access path.
pub fn parse_uniform_name(name: &str) -> (String, UniformAccess) {
    let parts: Vec<&str> = name
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|s| !s.is_empty())
        .collect();
    match parts.as_slice() {
        [base, index, property] => match index.parse::<usize>() {
            Ok(index) => (
                (*base).to_string(),
                UniformAccess::StructArray { index, property: (*property).to_string() },
            ),
            Err(_) => ((*base).to_string(), UniformAccess::Direct),
        },
        [base, second] if second.parse::<usize>().is_err() => (
            (*base).to_string(),
            UniformAccess::Struct { property: (*second).to_string() },
        ),
        [base, _] => ((*base).to_string(), UniformAccess::Direct),
        _ => (name.to_string(), UniformAccess::Direct),
    }
}

/// Construction-time render-state flags for a [`Program`].
pub struct ProgramOptions {
    pub uniforms: Uniforms,
    pub transparent: bool,
    pub cull_face: Option<CullFace>,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: DepthFunc,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self {
            uniforms: Uniforms::new(),
            transparent: false,
            cull_face: Some(CullFace::Back),
            front_face: FrontFace::Ccw,
            depth_test: true,
            depth_write: true,
            depth_func: DepthFunc::Less,
        }
    }
}

/// A compiled, linked and introspected GPU program.
pub struct Program {
    pub id: u64,
    handle: Option<ProgramHandle>,
    pub uniforms: Uniforms,
    uniform_bindings: Vec<UniformBinding>,
    /// Active attributes ordered by binding location. The concatenated name
    /// sequence is this program's attribute-layout signature.
    pub attribute_locations: Vec<ActiveAttribute>,
    pub attribute_order: String,
    pub transparent: bool,
    pub cull_face: Option<CullFace>,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_func: DepthFunc,
    pub blend_func: Option<BlendFunc>,
    pub blend_equation: BlendEquation,
}

impl Program {
    /// Compiles, links and introspects a program.
    ///
    /// Failures are logged with line-numbered source and the program is
    /// left half-initialized rather than failing construction; callers are
    /// responsible for checking logs.
    pub fn new(
        gl: &mut dyn GlContext,
        vertex: &str,
        fragment: &str,
        options: ProgramOptions,
    ) -> Self {
        let mut program = Self {
            id: PROGRAM_ID.fetch_add(1, Ordering::Relaxed),
            handle: None,
            uniforms: options.uniforms,
            uniform_bindings: Vec::new(),
            attribute_locations: Vec::new(),
            attribute_order: String::new(),
            transparent: options.transparent,
            cull_face: options.cull_face,
            front_face: options.front_face,
            depth_test: options.depth_test,
            depth_write: options.depth_write,
            depth_func: options.depth_func,
            blend_func: None,
            blend_equation: BlendEquation::default(),
        };

        if program.transparent {
            program.blend_func =
                Some(BlendFunc::new(BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha));
        }

        let vs = match gl.compile_shader(ShaderStage::Vertex, vertex) {
            Ok(vs) => vs,
            Err(err) => {
                log::error!("{}\n{}", err, add_line_numbers(vertex));
                return program;
            }
        };
        let fs = match gl.compile_shader(ShaderStage::Fragment, fragment) {
            Ok(fs) => fs,
            Err(err) => {
                log::error!("{}\n{}", err, add_line_numbers(fragment));
                gl.delete_shader(vs);
                return program;
            }
        };
        let handle = match gl.link_program(vs, fs) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("{}", err);
                gl.delete_shader(vs);
                gl.delete_shader(fs);
                return program;
            }
        };
        gl.delete_shader(vs);
        gl.delete_shader(fs);
        program.handle = Some(handle);
        program.introspect(gl, handle);
        program
    }

    fn introspect(&mut self, gl: &mut dyn GlContext, handle: ProgramHandle) {
        for uniform in gl.active_uniforms(handle) {
            let Some(location) = gl.uniform_location(handle, &uniform.name) else {
                continue;
            };
            let (base, access) = parse_uniform_name(&uniform.name);
            self.uniform_bindings.push(UniformBinding {
                location,
                utype: uniform.utype,
                name: uniform.name,
                base,
                access,
            });
        }

        let mut attributes = gl.active_attributes(handle);
        attributes.sort_by_key(|a| a.location);
        self.attribute_order = attributes
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        self.attribute_locations = attributes;
    }

    /// Whether compile, link and introspection all succeeded.
    pub fn is_linked(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<ProgramHandle> {
        self.handle
    }

    /// Makes this the active program, reconciles every active uniform with
    /// the supplied values and applies the program's render-state flags.
    ///
    /// `flip_faces` inverts the front-face winding for meshes whose world
    /// matrix has a negative determinant.
    pub fn use_program(&mut self, gl: &mut dyn GlContext, state: &mut RenderState, flip_faces: bool) {
        let Some(handle) = self.handle else {
            warn_capped!("program {} failed to build, skipping use", self.id);
            return;
        };

        if state.current_program != Some(self.id) {
            gl.use_program(handle);
            state.current_program = Some(self.id);
        }

        // Texture units are assigned sequentially across both single
        // textures and texture arrays.
        let mut next_unit: i32 = -1;

        for binding in &self.uniform_bindings {
            let Some(value) = resolve(&self.uniforms, binding) else {
                warn_capped!("uniform {} is missing a value", binding.name);
                continue;
            };

            match value {
                UniformValue::Texture(texture) => {
                    next_unit += 1;
                    texture.borrow_mut().update(gl, state, next_unit as u32);
                    if state.uniform_needs_update(binding.location, &CachedUniform::Int(next_unit))
                    {
                        gl.uniform1i(binding.location, next_unit);
                    }
                }
                UniformValue::TextureArray(textures) => {
                    let mut units = Vec::with_capacity(textures.len());
                    for texture in textures {
                        next_unit += 1;
                        texture.borrow_mut().update(gl, state, next_unit as u32);
                        units.push(next_unit);
                    }
                    if state
                        .uniform_needs_update(binding.location, &CachedUniform::Ints(units.clone()))
                    {
                        gl.uniform1iv(binding.location, &units);
                    }
                }
                other => {
                    let Some(snapshot) = other.snapshot() else {
                        warn_capped!(
                            "uniform {} has a struct value but a non-struct binding",
                            binding.name
                        );
                        continue;
                    };
                    if state.uniform_needs_update(binding.location, &snapshot) {
                        upload(gl, binding.location, binding.utype, &binding.name, &snapshot);
                    }
                }
            }
        }

        self.apply_state(gl, state, flip_faces);
    }

    fn apply_state(&self, gl: &mut dyn GlContext, state: &mut RenderState, flip_faces: bool) {
        if self.depth_test {
            state.enable(gl, Capability::DepthTest);
        } else {
            state.disable(gl, Capability::DepthTest);
        }

        match self.cull_face {
            Some(face) => {
                state.enable(gl, Capability::CullFace);
                state.set_cull_face(gl, face);
            }
            None => state.disable(gl, Capability::CullFace),
        }

        if self.blend_func.is_some() {
            state.enable(gl, Capability::Blend);
        } else {
            state.disable(gl, Capability::Blend);
        }

        let winding = if flip_faces { self.front_face.flipped() } else { self.front_face };
        state.set_front_face(gl, winding);
        state.set_depth_mask(gl, self.depth_write);
        state.set_depth_func(gl, self.depth_func);
        if let Some(func) = self.blend_func {
            state.set_blend_func(gl, func);
        }
        state.set_blend_equation(gl, self.blend_equation);
    }

    /// Releases the GPU program handle. Must be called by the owner; the
    /// handle leaks otherwise.
    pub fn remove(&mut self, gl: &mut dyn GlContext, state: &mut RenderState) {
        if let Some(handle) = self.handle.take() {
            state.forget_uniforms(self.uniform_bindings.iter().map(|b| b.location));
            if state.current_program == Some(self.id) {
                state.current_program = None;
            }
            gl.delete_program(handle);
        }
        self.uniform_bindings.clear();
    }
}

fn resolve<'a>(uniforms: &'a Uniforms, binding: &UniformBinding) -> Option<&'a UniformValue> {
    let root = uniforms.get(&binding.base)?;
    match &binding.access {
        UniformAccess::Direct => Some(root),
        UniformAccess::Struct { property } => match root {
            UniformValue::Struct(members) => members.get(property),
            _ => None,
        },
        UniformAccess::StructArray { index, property } => match root {
            UniformValue::StructArray(elements) => elements.get(*index)?.get(property),
            _ => None,
        },
    }
}

fn upload(
    gl: &mut dyn GlContext,
    location: UniformLocation,
    utype: UniformType,
    name: &str,
    value: &CachedUniform,
) {
    use CachedUniform::{Float, Floats, Int, Ints};
    match (utype, value) {
        (UniformType::Float, Float(v)) => gl.uniform1f(location, *v),
        (UniformType::Float, Floats(v)) => gl.uniform1fv(location, v),
        (UniformType::FloatVec2, Floats(v)) => gl.uniform2fv(location, v),
        (UniformType::FloatVec3, Floats(v)) => gl.uniform3fv(location, v),
        (UniformType::FloatVec4, Floats(v)) => gl.uniform4fv(location, v),
        (UniformType::Int | UniformType::Bool, Int(v)) => gl.uniform1i(location, *v),
        (UniformType::Int | UniformType::Bool, Ints(v)) => gl.uniform1iv(location, v),
        (UniformType::Sampler2D | UniformType::SamplerCube, Int(v)) => gl.uniform1i(location, *v),
        (UniformType::IntVec2, Ints(v)) => gl.uniform2iv(location, v),
        (UniformType::IntVec3, Ints(v)) => gl.uniform3iv(location, v),
        (UniformType::IntVec4, Ints(v)) => gl.uniform4iv(location, v),
        (UniformType::Mat2, Floats(v)) => gl.uniform_matrix2fv(location, v),
        (UniformType::Mat3, Floats(v)) => gl.uniform_matrix3fv(location, v),
        (UniformType::Mat4, Floats(v)) => gl.uniform_matrix4fv(location, v),
        _ => warn_capped!("uniform {} value does not match its declared type", name),
    }
}

fn add_line_numbers(source: &str) -> String {
    source
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{}: {}", i + 1, line))
        .collect::<Vec<_>>()
        .join("\n")
}
