//! Attribute buffer store.
//!
//! A [`Geometry`] owns named per-vertex data streams, their GPU buffer
//! handles and the draw-count bookkeeping derived from them. The `"index"`
//! attribute is special: its presence switches the geometry to indexed
//! drawing and its count governs the draw range. Vertex-array state is
//! cached per distinct program attribute-layout signature, because binding
//! order depends on which program is drawing; distinct programs with the
//! same layout share one cached binding.
//!
//! Buffer uploads go through the renderer's state mirror so an already
//! bound buffer is not re-bound. GPU handles are released only by an
//! explicit [`Geometry::remove`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use cgmath::{InnerSpace, Vector3};

use crate::context::{
    BufferId, BufferTarget, BufferUsage, Capabilities, DataType, DrawMode, GlContext,
    VertexArrayId,
};
use crate::program::Program;
use crate::state::RenderState;
use crate::warnings::warn_capped;

static GEOMETRY_ID: AtomicU64 = AtomicU64::new(1);

/// Typed backing storage for one attribute.
#[derive(Debug, Clone)]
pub enum AttributeData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    F32(Vec<f32>),
}

impl AttributeData {
    pub fn len(&self) -> usize {
        match self {
            AttributeData::U8(v) => v.len(),
            AttributeData::U16(v) => v.len(),
            AttributeData::U32(v) => v.len(),
            AttributeData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.data_type().byte_size()
    }

    pub fn data_type(&self) -> DataType {
        match self {
            AttributeData::U8(_) => DataType::UnsignedByte,
            AttributeData::U16(_) => DataType::UnsignedShort,
            AttributeData::U32(_) => DataType::UnsignedInt,
            AttributeData::F32(_) => DataType::Float,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeData::U8(v) => v,
            AttributeData::U16(v) => bytemuck::cast_slice(v),
            AttributeData::U32(v) => bytemuck::cast_slice(v),
            AttributeData::F32(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            AttributeData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut Vec<f32>> {
        match self {
            AttributeData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Reads element `i` as an index value.
    fn index_at(&self, i: usize) -> usize {
        match self {
            AttributeData::U8(v) => v[i] as usize,
            AttributeData::U16(v) => v[i] as usize,
            AttributeData::U32(v) => v[i] as usize,
            AttributeData::F32(v) => v[i] as usize,
        }
    }
}

impl From<Vec<u8>> for AttributeData {
    fn from(v: Vec<u8>) -> Self {
        AttributeData::U8(v)
    }
}
impl From<Vec<u16>> for AttributeData {
    fn from(v: Vec<u16>) -> Self {
        AttributeData::U16(v)
    }
}
impl From<Vec<u32>> for AttributeData {
    fn from(v: Vec<u32>) -> Self {
        AttributeData::U32(v)
    }
}
impl From<Vec<f32>> for AttributeData {
    fn from(v: Vec<f32>) -> Self {
        AttributeData::F32(v)
    }
}

/// One named per-vertex data stream and its GPU buffer.
#[derive(Debug, Clone)]
pub struct Attribute {
    /// Elements per vertex (3 for a vec3 stream, 16 for a mat4 stream).
    pub size: usize,
    pub data: AttributeData,
    pub dtype: DataType,
    pub normalized: bool,
    /// Byte stride between vertices, for interleaved buffers. 0 = tight.
    pub stride: usize,
    /// Byte offset of the first element, for interleaved buffers.
    pub offset: usize,
    /// Vertex count; derived from data length and size/stride when left 0.
    pub count: usize,
    /// Instancing divisor. 0 = per-vertex, n = advance every n instances.
    pub divisor: usize,
    pub buffer: Option<BufferId>,
    /// Set by the application after mutating `data`; the next draw that
    /// uses this attribute re-uploads it.
    pub needs_update: bool,
    target: BufferTarget,
}

impl Attribute {
    pub fn new(size: usize, data: impl Into<AttributeData>) -> Self {
        let data = data.into();
        Self {
            size,
            dtype: data.data_type(),
            data,
            normalized: false,
            stride: 0,
            offset: 0,
            count: 0,
            divisor: 0,
            buffer: None,
            needs_update: false,
            target: BufferTarget::Array,
        }
    }

    /// Marks the attribute as advancing once every `divisor` instances.
    pub fn instanced(mut self, divisor: usize) -> Self {
        self.divisor = divisor;
        self
    }

    pub fn normalized(mut self) -> Self {
        self.normalized = true;
        self
    }

    /// Byte stride/offset for interleaved layouts.
    pub fn interleaved(mut self, stride: usize, offset: usize) -> Self {
        self.stride = stride;
        self.offset = offset;
        self
    }

    /// Reuses an existing GPU buffer instead of allocating and uploading.
    pub fn with_buffer(mut self, buffer: BufferId, count: usize) -> Self {
        self.buffer = Some(buffer);
        self.count = count;
        self
    }

    pub fn target(&self) -> BufferTarget {
        self.target
    }
}

/// Axis-aligned bounding box plus the bounding sphere derived from it.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub min: Vector3<f32>,
    pub max: Vector3<f32>,
    pub center: Vector3<f32>,
    pub scale: Vector3<f32>,
    pub radius: f32,
}

/// The (start, count) window of vertices or indices submitted to a draw.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrawRange {
    pub start: usize,
    pub count: usize,
}

/// Named attribute streams plus GPU buffer lifecycle and draw dispatch.
pub struct Geometry {
    pub id: u64,
    attributes: HashMap<String, Attribute>,
    /// One cached vertex-array binding per program attribute-layout
    /// signature.
    vaos: HashMap<String, VertexArrayId>,
    pub draw_range: DrawRange,
    pub instanced_count: usize,
    pub is_instanced: bool,
    bounds: Option<Bounds>,
}

impl Geometry {
    pub fn new(gl: &mut dyn GlContext, state: &mut RenderState) -> Self {
        // Unbind the current vertex array so new buffers don't get recorded
        // into another geometry's binding.
        state.bind_vertex_array(gl, None);
        state.current_geometry = None;

        Self {
            id: GEOMETRY_ID.fetch_add(1, Ordering::Relaxed),
            attributes: HashMap::new(),
            vaos: HashMap::new(),
            draw_range: DrawRange::default(),
            instanced_count: 0,
            is_instanced: false,
            bounds: None,
        }
    }

    pub fn with_attributes(
        gl: &mut dyn GlContext,
        state: &mut RenderState,
        attributes: Vec<(&str, Attribute)>,
    ) -> Self {
        let mut geometry = Self::new(gl, state);
        for (name, attribute) in attributes {
            geometry.add_attribute(gl, state, name, attribute);
        }
        geometry
    }

    /// One oversized screen-covering triangle, for full-screen passes.
    pub fn screen_triangle(gl: &mut dyn GlContext, state: &mut RenderState) -> Self {
        Self::with_attributes(
            gl,
            state,
            vec![
                ("position", Attribute::new(2, vec![-1.0f32, -1.0, 3.0, -1.0, -1.0, 3.0])),
                ("uv", Attribute::new(2, vec![0.0f32, 0.0, 2.0, 0.0, 0.0, 2.0])),
            ],
        )
    }

    /// Registers an attribute, allocating and uploading a GPU buffer when
    /// none was supplied, then updates the aggregate draw bookkeeping.
    pub fn add_attribute(
        &mut self,
        gl: &mut dyn GlContext,
        state: &mut RenderState,
        name: &str,
        mut attr: Attribute,
    ) {
        attr.target =
            if name == "index" { BufferTarget::ElementArray } else { BufferTarget::Array };
        if attr.count == 0 {
            attr.count = if attr.stride > 0 {
                attr.data.byte_len() / attr.stride
            } else if attr.size > 0 {
                attr.data.len() / attr.size
            } else {
                attr.data.len()
            };
        }

        if attr.buffer.is_none() {
            attr.buffer = Some(gl.create_buffer());
            upload_attribute(gl, state, &mut attr);
        }

        // Indexed geometries are driven by the index count, not the vertex
        // count; instanced attributes drive the instance count instead.
        if attr.divisor > 0 {
            self.is_instanced = true;
            let count = attr.count * attr.divisor;
            if self.instanced_count != 0 && self.instanced_count != count {
                warn_capped!(
                    "geometry {} has instanced attributes of different lengths, clamping to the shortest",
                    self.id
                );
                self.instanced_count = self.instanced_count.min(count);
            } else {
                self.instanced_count = count;
            }
        } else if name == "index" {
            self.draw_range.count = attr.count;
        } else if !self.attributes.contains_key("index") {
            self.draw_range.count = self.draw_range.count.max(attr.count);
        }

        self.attributes.insert(name.to_string(), attr);
    }

    /// Registers the index attribute.
    pub fn set_index(&mut self, gl: &mut dyn GlContext, state: &mut RenderState, attr: Attribute) {
        self.add_attribute(gl, state, "index", attr);
    }

    /// Narrows the submitted vertex/index window for partial draws.
    pub fn set_draw_range(&mut self, start: usize, count: usize) {
        self.draw_range.start = start;
        self.draw_range.count = count;
    }

    pub fn set_instanced_count(&mut self, count: usize) {
        self.instanced_count = count;
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Attribute> {
        self.attributes.get_mut(name)
    }

    pub fn attributes(&self) -> &HashMap<String, Attribute> {
        &self.attributes
    }

    pub fn bounds(&self) -> Option<&Bounds> {
        self.bounds.as_ref()
    }

    /// Re-uploads an attribute's backing array to its GPU buffer.
    pub fn update_attribute(&mut self, gl: &mut dyn GlContext, state: &mut RenderState, name: &str) {
        match self.attributes.get_mut(name) {
            Some(attr) => upload_attribute(gl, state, attr),
            None => warn_capped!("geometry {} has no attribute {} to update", self.id, name),
        }
    }

    fn create_vao(
        &mut self,
        gl: &mut dyn GlContext,
        state: &mut RenderState,
        caps: &Capabilities,
        program: &Program,
    ) -> VertexArrayId {
        let vao = gl.create_vertex_array();
        state.bind_vertex_array(gl, Some(vao));
        self.bind_attributes(gl, state, caps, program);
        self.vaos.insert(program.attribute_order.clone(), vao);
        vao
    }

    /// Binds every attribute the program expects, in the program's layout
    /// order. A missing attribute logs and is skipped; rendering continues.
    pub fn bind_attributes(
        &self,
        gl: &mut dyn GlContext,
        state: &mut RenderState,
        caps: &Capabilities,
        program: &Program,
    ) {
        for active in &program.attribute_locations {
            let Some(attr) = self.attributes.get(&active.name) else {
                warn_capped!(
                    "active attribute {} not supplied by geometry {}",
                    active.name,
                    self.id
                );
                continue;
            };
            let Some(buffer) = attr.buffer else {
                continue;
            };

            gl.bind_buffer(attr.target, Some(buffer));
            state.note_bound_buffer(Some(buffer));

            // Matrix attributes take one binding location per column.
            let columns = active.atype.locations();
            let size = attr.size / columns;
            let column_bytes = size * attr.dtype.byte_size();
            let (stride, column_stride) = if columns == 1 {
                (attr.stride, 0)
            } else {
                (attr.stride + columns * column_bytes, column_bytes)
            };

            for column in 0..columns {
                let location = active.location + column as u32;
                gl.vertex_attrib_pointer(
                    location,
                    size,
                    attr.dtype,
                    attr.normalized,
                    stride,
                    attr.offset + column * column_stride,
                );
                gl.enable_vertex_attrib(location);
                if caps.instanced_arrays {
                    // Reset to 0 for non-instanced attributes so a previous
                    // instanced draw doesn't leak its divisor.
                    gl.vertex_attrib_divisor(location, attr.divisor as u32);
                } else if attr.divisor > 0 {
                    warn_capped!(
                        "instanced attribute {} ignored, context lacks instancing",
                        active.name
                    );
                }
            }
        }

        if let Some(index) = self.attributes.get("index") {
            gl.bind_buffer(BufferTarget::ElementArray, index.buffer);
            state.note_bound_buffer(index.buffer);
        }
    }

    /// Binds vertex state for `program` (from the cache where possible),
    /// re-uploads dirty attributes and issues the draw call.
    pub fn draw(
        &mut self,
        gl: &mut dyn GlContext,
        state: &mut RenderState,
        caps: &Capabilities,
        program: &Program,
        mode: DrawMode,
    ) {
        let key = (self.id, program.attribute_order.clone());
        if state.current_geometry.as_ref() != Some(&key) {
            if caps.vertex_arrays {
                let vao = match self.vaos.get(&program.attribute_order).copied() {
                    Some(vao) => vao,
                    None => self.create_vao(gl, state, caps, program),
                };
                state.bind_vertex_array(gl, Some(vao));
            } else {
                // No vertex-array objects on this tier: attribute pointers
                // are global state, rebound on every geometry switch.
                self.bind_attributes(gl, state, caps, program);
            }
            state.current_geometry = Some(key);
        }

        for active in &program.attribute_locations {
            if let Some(attr) = self.attributes.get_mut(&active.name) {
                if attr.needs_update {
                    upload_attribute(gl, state, attr);
                }
            }
        }
        if let Some(index) = self.attributes.get_mut("index") {
            if index.needs_update {
                upload_attribute(gl, state, index);
            }
        }

        let instanced = if self.is_instanced && !caps.instanced_arrays {
            warn_capped!(
                "geometry {} is instanced but the context lacks instancing, drawing one instance",
                self.id
            );
            false
        } else {
            self.is_instanced
        };

        match (self.attributes.get("index"), instanced) {
            (Some(index), true) => gl.draw_elements_instanced(
                mode,
                self.draw_range.count,
                index.dtype,
                index.offset + self.draw_range.start * index.dtype.byte_size(),
                self.instanced_count,
            ),
            (Some(index), false) => gl.draw_elements(
                mode,
                self.draw_range.count,
                index.dtype,
                index.offset + self.draw_range.start * index.dtype.byte_size(),
            ),
            (None, true) => gl.draw_arrays_instanced(
                mode,
                self.draw_range.start,
                self.draw_range.count,
                self.instanced_count,
            ),
            (None, false) => gl.draw_arrays(mode, self.draw_range.start, self.draw_range.count),
        }
    }

    /// Reduces the position attribute into an axis-aligned box. Cached
    /// until explicitly recomputed.
    pub fn compute_bounding_box(&mut self) {
        let Some(array) = self.position_array() else {
            return;
        };

        let mut min = Vector3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY);
        let mut max = Vector3::new(f32::NEG_INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY);
        let mut i = 0;
        while i + 2 < array.len() {
            let (x, y, z) = (array[i], array[i + 1], array[i + 2]);
            min.x = min.x.min(x);
            min.y = min.y.min(y);
            min.z = min.z.min(z);
            max.x = max.x.max(x);
            max.y = max.y.max(y);
            max.z = max.z.max(z);
            i += 3;
        }

        let radius = self.bounds.map_or(f32::INFINITY, |b| b.radius);
        self.bounds = Some(Bounds {
            min,
            max,
            center: (min + max) / 2.0,
            scale: max - min,
            radius,
        });
    }

    /// Sphere radius is the farthest vertex distance from the box center.
    pub fn compute_bounding_sphere(&mut self) {
        if self.bounds.is_none() {
            self.compute_bounding_box();
        }
        let Some(bounds) = self.bounds else {
            return;
        };
        let Some(array) = self.position_array() else {
            return;
        };

        let mut max_radius_sq = 0.0f32;
        let mut i = 0;
        while i + 2 < array.len() {
            let v = Vector3::new(array[i], array[i + 1], array[i + 2]);
            max_radius_sq = max_radius_sq.max((v - bounds.center).magnitude2());
            i += 3;
        }

        if let Some(bounds) = self.bounds.as_mut() {
            bounds.radius = max_radius_sq.sqrt();
        }
    }

    fn position_array(&self) -> Option<&[f32]> {
        match self.attributes.get("position").and_then(|attr| attr.data.as_f32()) {
            Some(array) => Some(array),
            None => {
                warn_capped!("geometry {} has no position data to compute bounds from", self.id);
                None
            }
        }
    }

    /// Computes per-vertex normals from triangle faces.
    ///
    /// Indexed geometry accumulates every adjacent face's normal into each
    /// shared vertex; unindexed triangle soup assigns each face's normal to
    /// its own three vertices. A final pass normalizes to unit length; a
    /// vertex referenced by no triangle keeps a zero vector, which
    /// normalizes to NaN.
    pub fn compute_vertex_normals(&mut self, gl: &mut dyn GlContext, state: &mut RenderState) {
        let Some(position) = self.attributes.get("position") else {
            return;
        };
        let Some(positions) = position.data.as_f32() else {
            return;
        };
        let positions = positions.to_vec();
        let position_size = position.size;
        let position_count = position.count;

        let index: Option<(usize, Vec<usize>)> = self
            .attributes
            .get("index")
            .map(|attr| (attr.count, (0..attr.count).map(|i| attr.data.index_at(i)).collect()));

        if self.attributes.contains_key("normal") {
            if let Some(data) =
                self.attributes.get_mut("normal").and_then(|normal| normal.data.as_f32_mut())
            {
                data.fill(0.0);
            }
        } else {
            self.add_attribute(
                gl,
                state,
                "normal",
                Attribute::new(3, vec![0.0f32; position_count * 3]),
            );
        }

        let Some(normal) = self.attributes.get_mut("normal") else {
            return;
        };
        let normal_size = normal.size;
        let normal_count = normal.count;
        let Some(normals) = normal.data.as_f32_mut() else {
            return;
        };

        let read = |array: &[f32], vertex: usize, size: usize| {
            Vector3::new(array[vertex * size], array[vertex * size + 1], array[vertex * size + 2])
        };

        match &index {
            Some((index_count, indices)) => {
                let mut i = 0;
                while i + 2 < *index_count {
                    let (ia, ib, ic) = (indices[i], indices[i + 1], indices[i + 2]);
                    let pa = read(&positions, ia, position_size);
                    let pb = read(&positions, ib, position_size);
                    let pc = read(&positions, ic, position_size);
                    let face = (pc - pb).cross(pa - pb);

                    for vertex in [ia, ib, ic] {
                        normals[vertex * normal_size] += face.x;
                        normals[vertex * normal_size + 1] += face.y;
                        normals[vertex * normal_size + 2] += face.z;
                    }
                    i += 3;
                }
            }
            None => {
                // Unconnected triangle soup: no accumulation across faces.
                let mut i = 0;
                while i + 2 < position_count {
                    let pa = read(&positions, i, position_size);
                    let pb = read(&positions, i + 1, position_size);
                    let pc = read(&positions, i + 2, position_size);
                    let face = (pc - pb).cross(pa - pb);

                    for vertex in [i, i + 1, i + 2] {
                        normals[vertex * normal_size] = face.x;
                        normals[vertex * normal_size + 1] = face.y;
                        normals[vertex * normal_size + 2] = face.z;
                    }
                    i += 3;
                }
            }
        }

        for vertex in 0..normal_count {
            let v = read(normals, vertex, normal_size).normalize();
            normals[vertex * normal_size] = v.x;
            normals[vertex * normal_size + 1] = v.y;
            normals[vertex * normal_size + 2] = v.z;
        }

        normal.needs_update = true;
    }

    /// Releases every GPU buffer and cached vertex array. Must be called by
    /// the owner; the handles leak otherwise.
    pub fn remove(&mut self, gl: &mut dyn GlContext, state: &mut RenderState) {
        for (_, attr) in self.attributes.drain() {
            if let Some(buffer) = attr.buffer {
                gl.delete_buffer(buffer);
            }
        }
        for (_, vao) in self.vaos.drain() {
            gl.delete_vertex_array(vao);
        }
        if state.current_geometry.as_ref().is_some_and(|(id, _)| *id == self.id) {
            state.current_geometry = None;
        }
    }
}

fn upload_attribute(gl: &mut dyn GlContext, state: &mut RenderState, attr: &mut Attribute) {
    let Some(buffer) = attr.buffer else {
        return;
    };
    state.bind_buffer(gl, attr.target, buffer);
    gl.buffer_data(attr.target, attr.data.as_bytes(), BufferUsage::StaticDraw);
    attr.needs_update = false;
}
