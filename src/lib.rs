//! luster
//!
//! A lightweight, stateful real-time 3D rendering core. The crate wraps an
//! immediate-mode GPU API behind a context trait and layers a scene graph,
//! attribute buffer management, shader-program handling and a culled,
//! sorted draw loop on top. The design emphasizes correct tracking of
//! mutable GPU state: every toggle and binding has one in-memory mirror and
//! redundant GPU calls are elided by construction.
//!
//! High-level modules
//! - `context`: the GPU boundary: the `GlContext` trait, opaque handles,
//!   API enums and the external texture/render-target traits
//! - `state`: the global GPU state mirror with read-before-write setters
//! - `geometry`: named attribute streams, buffer lifecycles, bounds and
//!   vertex-array caching
//! - `program`: shader compilation, uniform introspection and diffing,
//!   per-program render state
//! - `scene_graph`: arena-based transform hierarchy and drawable meshes
//! - `camera`: view/projection derivation and frustum tests
//! - `render`: render-list construction (cull + sort) and frame dispatch
//!

pub mod camera;
pub mod context;
pub mod geometry;
pub mod program;
pub mod render;
pub mod scene_graph;
pub mod state;
pub mod warnings;

// Re-exports commonly used types for convenience in downstream code.
pub use camera::{Camera, Projection};
pub use cgmath::*;
pub use context::{
    ActiveAttribute, ActiveUniform, AttributeType, BlendEquation, BlendFactor, BlendFunc, BlendOp,
    BufferId, BufferTarget, BufferUsage, Capabilities, Capability, ClearMask, CullFace, DataType,
    DepthFunc, DrawMode, FramebufferId, FrontFace, GlContext, ProgramHandle, RenderSurface,
    ShaderError, ShaderStage, Texture, UniformLocation, UniformType, VertexArrayId,
};
pub use geometry::{Attribute, AttributeData, Bounds, DrawRange, Geometry};
pub use program::{Program, ProgramOptions, TextureRef, UniformValue, Uniforms};
pub use render::{RenderOptions, Renderer, RendererOptions};
pub use scene_graph::{GeometryRef, Mesh, Node, NodeId, ProgramRef, Scene};
pub use state::RenderState;
