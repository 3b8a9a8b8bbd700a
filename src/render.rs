//! Renderer: render-list construction and draw dispatch.
//!
//! The [`Renderer`] owns the GPU context, the global [`RenderState`] mirror
//! and the lazily resolved device [`Capabilities`]. All GPU state changes
//! issued by the core funnel through the renderer's eliding setters (or the
//! state mirror they delegate to), so a redundant toggle never reaches the
//! context.
//!
//! Each frame, [`Renderer::render`] binds the destination framebuffer,
//! optionally clears it (forcing depth writes back on first so a previous
//! depth-write-disabled program cannot suppress the clear), propagates
//! world matrices for the scene and the camera, builds the filtered and
//! sorted render list, and draws it in order.

use std::cell::OnceCell;
use std::cmp::Ordering;

use cgmath::{Matrix, Matrix3, SquareMatrix};

use crate::camera::Camera;
use crate::context::{
    BlendEquation, BlendFunc, Capabilities, Capability, ClearMask, CullFace, DepthFunc,
    FramebufferId, FrontFace, GlContext, RenderSurface,
};
use crate::scene_graph::{NodeId, RenderCallback, Scene};
use crate::state::RenderState;

/// Construction parameters for a [`Renderer`].
pub struct RendererOptions {
    /// Canvas size in logical pixels.
    pub width: u32,
    pub height: u32,
    /// Device pixel ratio; the default framebuffer's viewport is
    /// width × dpr by height × dpr.
    pub dpr: f32,
    pub color: bool,
    pub depth: bool,
    pub stencil: bool,
    pub auto_clear: bool,
    pub clear_color: [f32; 4],
}

impl Default for RendererOptions {
    fn default() -> Self {
        Self {
            width: 300,
            height: 150,
            dpr: 1.0,
            color: true,
            depth: true,
            stencil: false,
            auto_clear: true,
            clear_color: [0.0, 0.0, 0.0, 0.0],
        }
    }
}

/// Per-call switches for [`Renderer::render`].
pub struct RenderOptions {
    /// Propagate world matrices before drawing.
    pub update: bool,
    /// Partition and sort the render list.
    pub sort: bool,
    /// Frustum-cull meshes that opt in.
    pub frustum_cull: bool,
    /// Override for the renderer's `auto_clear`.
    pub clear: Option<bool>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { update: true, sort: true, frustum_cull: true, clear: None }
    }
}

/// Sort record for one drawable node.
struct RenderItem {
    node: NodeId,
    mesh_id: u64,
    program_id: u64,
    render_order: i32,
    z_depth: f32,
}

/// GPU-state-tracking renderer.
pub struct Renderer {
    gl: Box<dyn GlContext>,
    pub state: RenderState,
    capabilities: OnceCell<Capabilities>,
    pub width: u32,
    pub height: u32,
    pub dpr: f32,
    pub color: bool,
    pub depth: bool,
    pub stencil: bool,
    pub auto_clear: bool,
    pub clear_color: [f32; 4],
}

impl Renderer {
    pub fn new(gl: Box<dyn GlContext>, options: RendererOptions) -> Self {
        let mut renderer = Self {
            gl,
            state: RenderState::new(),
            capabilities: OnceCell::new(),
            width: options.width,
            height: options.height,
            dpr: options.dpr,
            color: options.color,
            depth: options.depth,
            stencil: options.stencil,
            auto_clear: options.auto_clear,
            clear_color: options.clear_color,
        };
        if renderer.depth {
            renderer.state.enable(&mut *renderer.gl, Capability::DepthTest);
            renderer.state.set_depth_func(&mut *renderer.gl, DepthFunc::Less);
        }
        renderer
    }

    /// Escape hatch to the raw context.
    pub fn gl(&mut self) -> &mut dyn GlContext {
        &mut *self.gl
    }

    /// Simultaneous access to the context and the state mirror, for
    /// constructing geometries and programs against this renderer.
    pub fn parts(&mut self) -> (&mut dyn GlContext, &mut RenderState) {
        (&mut *self.gl, &mut self.state)
    }

    /// Device capabilities, resolved from the context on first use.
    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.get_or_init(|| self.gl.capabilities())
    }

    pub fn set_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    // Eliding state setters. Components must route GPU state through these
    // (or the state mirror itself); a call matching the mirror is a no-op.

    pub fn enable(&mut self, cap: Capability) {
        self.state.enable(&mut *self.gl, cap);
    }

    pub fn disable(&mut self, cap: Capability) {
        self.state.disable(&mut *self.gl, cap);
    }

    pub fn set_blend_func(&mut self, func: BlendFunc) {
        self.state.set_blend_func(&mut *self.gl, func);
    }

    pub fn set_blend_equation(&mut self, equation: BlendEquation) {
        self.state.set_blend_equation(&mut *self.gl, equation);
    }

    pub fn set_cull_face(&mut self, face: CullFace) {
        self.state.set_cull_face(&mut *self.gl, face);
    }

    pub fn set_front_face(&mut self, winding: FrontFace) {
        self.state.set_front_face(&mut *self.gl, winding);
    }

    pub fn set_depth_mask(&mut self, enabled: bool) {
        self.state.set_depth_mask(&mut *self.gl, enabled);
    }

    pub fn set_depth_func(&mut self, func: DepthFunc) {
        self.state.set_depth_func(&mut *self.gl, func);
    }

    pub fn active_texture(&mut self, unit: u32) {
        self.state.active_texture(&mut *self.gl, unit);
    }

    pub fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferId>) {
        self.state.bind_framebuffer(&mut *self.gl, framebuffer);
    }

    pub fn set_viewport(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.state.set_viewport(&mut *self.gl, x, y, width, height);
    }

    /// Builds the filtered, ordered draw sequence for one frame.
    ///
    /// Invisible nodes hide their whole subtree. Frustum culling excludes
    /// meshes (that opt in) whose bounds fall outside the camera's current
    /// frustum. With `sort`, nodes are partitioned into opaque, transparent
    /// and non-depth-tested overlay buckets, each stable-sorted with its
    /// own comparator, and concatenated in that order so blending is
    /// correct.
    pub fn get_render_list(
        &self,
        scene: &Scene,
        camera: Option<&Camera>,
        root: NodeId,
        frustum_cull: bool,
        sort: bool,
    ) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        scene.traverse(root, &mut |scene, id| {
            let node = scene.node(id);
            if !node.visible {
                return true;
            }
            let Some(mesh) = node.mesh.as_ref() else {
                return false;
            };
            if frustum_cull && mesh.frustum_culled {
                if let Some(camera) = camera {
                    if !camera.frustum_intersects_node(scene, id) {
                        return false;
                    }
                }
            }
            nodes.push(id);
            false
        });

        if !sort {
            return nodes;
        }

        let mut opaque = Vec::new();
        let mut transparent = Vec::new();
        let mut ui = Vec::new();

        for id in nodes {
            let node = scene.node(id);
            let Some(mesh) = node.mesh.as_ref() else {
                continue;
            };
            let program = mesh.program.borrow();

            // Depth is only computed where it can influence the order.
            let z_depth = match camera {
                Some(camera) if mesh.render_order == 0 && program.depth_test => {
                    let projected =
                        camera.projection_view_matrix * node.world_position().extend(1.0);
                    if projected.w != 0.0 { projected.z / projected.w } else { projected.z }
                }
                _ => 0.0,
            };

            let item = RenderItem {
                node: id,
                mesh_id: mesh.id,
                program_id: program.id,
                render_order: mesh.render_order,
                z_depth,
            };
            if !program.transparent {
                opaque.push(item);
            } else if program.depth_test {
                transparent.push(item);
            } else {
                ui.push(item);
            }
        }

        opaque.sort_by(sort_opaque);
        transparent.sort_by(sort_transparent);
        ui.sort_by(sort_ui);

        opaque
            .into_iter()
            .chain(transparent)
            .chain(ui)
            .map(|item| item.node)
            .collect()
    }

    /// Renders one frame into the default framebuffer or `target`.
    pub fn render(
        &mut self,
        scene: &mut Scene,
        root: NodeId,
        mut camera: Option<&mut Camera>,
        target: Option<&dyn RenderSurface>,
        options: &RenderOptions,
    ) {
        match target {
            None => {
                self.state.bind_framebuffer(&mut *self.gl, None);
                let width = (self.width as f32 * self.dpr) as i32;
                let height = (self.height as f32 * self.dpr) as i32;
                self.state.set_viewport(&mut *self.gl, 0, 0, width, height);
            }
            Some(target) => {
                self.state.bind_framebuffer(&mut *self.gl, Some(target.framebuffer()));
                let (width, height) = target.size();
                self.state.set_viewport(&mut *self.gl, 0, 0, width as i32, height as i32);
            }
        }

        if options.clear.unwrap_or(self.auto_clear) {
            // The depth buffer can't be cleared while depth writes are off,
            // and the last program drawn may have disabled them.
            if self.depth {
                self.state.enable(&mut *self.gl, Capability::DepthTest);
                self.state.set_depth_mask(&mut *self.gl, true);
            }
            self.state.set_clear_color(&mut *self.gl, self.clear_color);
            self.gl.clear(ClearMask {
                color: self.color,
                depth: self.depth,
                stencil: self.stencil,
            });
        }

        if options.update {
            scene.update_matrix_world(root, false);
        }

        // The camera may live outside the rendered graph, so it updates
        // separately from the scene pass.
        if let Some(camera) = camera.as_deref_mut() {
            camera.update(scene);
            if options.frustum_cull {
                camera.update_frustum();
            }
        }

        let camera = camera.as_deref();
        let list = self.get_render_list(scene, camera, root, options.frustum_cull, options.sort);
        for id in list {
            self.draw_node(scene, id, camera);
        }
    }

    /// Draws a single mesh node: before-render hooks, matrix uniforms,
    /// program activation, geometry dispatch, after-render hooks.
    pub fn draw_node(&mut self, scene: &mut Scene, id: NodeId, camera: Option<&Camera>) {
        let Some(mut callbacks) = take_callbacks(scene, id, Hook::Before) else {
            return;
        };
        for callback in callbacks.iter_mut() {
            callback(scene, id, camera);
        }
        restore_callbacks(scene, id, Hook::Before, callbacks);

        let Some((geometry, program, mode, flip_faces)) = self.prepare_node(scene, id, camera)
        else {
            return;
        };

        {
            let mut program = program.borrow_mut();
            program.use_program(&mut *self.gl, &mut self.state, flip_faces);
            let caps = self.capabilities();
            geometry.borrow_mut().draw(&mut *self.gl, &mut self.state, &caps, &program, mode);
        }

        let Some(mut callbacks) = take_callbacks(scene, id, Hook::After) else {
            return;
        };
        for callback in callbacks.iter_mut() {
            callback(scene, id, camera);
        }
        restore_callbacks(scene, id, Hook::After, callbacks);
    }

    /// Pushes the per-draw matrix uniforms into the mesh's program and
    /// snapshots what the draw needs from the scene.
    fn prepare_node(
        &mut self,
        scene: &mut Scene,
        id: NodeId,
        camera: Option<&Camera>,
    ) -> Option<(
        crate::scene_graph::GeometryRef,
        crate::scene_graph::ProgramRef,
        crate::context::DrawMode,
        bool,
    )> {
        let node = scene.node_mut(id);
        let world = node.world_matrix;
        let mesh = node.mesh.as_mut()?;

        if let Some(camera) = camera {
            mesh.model_view_matrix = camera.view_matrix * world;
            let mv = &mesh.model_view_matrix;
            let linear =
                Matrix3::from_cols(mv.x.truncate(), mv.y.truncate(), mv.z.truncate());
            // A singular model-view keeps the previous normal matrix.
            if let Some(inverse) = linear.invert() {
                mesh.normal_matrix = inverse.transpose();
            }

            let mut program = mesh.program.borrow_mut();
            program.uniforms.set("modelMatrix", world);
            program.uniforms.set("viewMatrix", camera.view_matrix);
            program.uniforms.set("modelViewMatrix", mesh.model_view_matrix);
            program.uniforms.set("normalMatrix", mesh.normal_matrix);
            program.uniforms.set("projectionMatrix", camera.projection_matrix);
            program.uniforms.set("cameraPosition", camera.world_position);
        }

        // Negatively scaled meshes need their winding flipped to cull the
        // intended side.
        let flip_faces = {
            let program = mesh.program.borrow();
            program.cull_face.is_some() && world.determinant() < 0.0
        };

        Some((mesh.geometry.clone(), mesh.program.clone(), mesh.mode, flip_faces))
    }
}

#[derive(Clone, Copy)]
enum Hook {
    Before,
    After,
}

fn take_callbacks(scene: &mut Scene, id: NodeId, hook: Hook) -> Option<Vec<RenderCallback>> {
    let mesh = scene.node_mut(id).mesh.as_mut()?;
    Some(match hook {
        Hook::Before => std::mem::take(&mut mesh.before_render),
        Hook::After => std::mem::take(&mut mesh.after_render),
    })
}

fn restore_callbacks(scene: &mut Scene, id: NodeId, hook: Hook, mut callbacks: Vec<RenderCallback>) {
    if let Some(mesh) = scene.node_mut(id).mesh.as_mut() {
        // Keep hooks registered during the run, behind the existing ones.
        let added = match hook {
            Hook::Before => std::mem::take(&mut mesh.before_render),
            Hook::After => std::mem::take(&mut mesh.after_render),
        };
        callbacks.extend(added);
        match hook {
            Hook::Before => mesh.before_render = callbacks,
            Hook::After => mesh.after_render = callbacks,
        }
    }
}

/// Opaque: render order, then program grouping to minimise switches, then
/// depth, then creation id.
fn sort_opaque(a: &RenderItem, b: &RenderItem) -> Ordering {
    a.render_order
        .cmp(&b.render_order)
        .then(a.program_id.cmp(&b.program_id))
        .then(a.z_depth.partial_cmp(&b.z_depth).unwrap_or(Ordering::Equal))
        .then(a.mesh_id.cmp(&b.mesh_id))
}

/// Transparent: render order, then back-to-front depth so blending
/// composes correctly, then creation id.
fn sort_transparent(a: &RenderItem, b: &RenderItem) -> Ordering {
    a.render_order
        .cmp(&b.render_order)
        .then(b.z_depth.partial_cmp(&a.z_depth).unwrap_or(Ordering::Equal))
        .then(a.mesh_id.cmp(&b.mesh_id))
}

/// Overlay: render order and program grouping only; these nodes don't
/// depth-test, so depth ordering is meaningless.
fn sort_ui(a: &RenderItem, b: &RenderItem) -> Ordering {
    a.render_order
        .cmp(&b.render_order)
        .then(a.program_id.cmp(&b.program_id))
        .then(a.mesh_id.cmp(&b.mesh_id))
}
