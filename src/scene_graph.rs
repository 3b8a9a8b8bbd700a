//! Scene graph and hierarchical transforms.
//!
//! Nodes live in an arena owned by [`Scene`] and are addressed by opaque
//! [`NodeId`] handles: a node's child list is the owning side of the graph,
//! the parent back-reference is non-owning, and every attach/detach keeps
//! both sides consistent in one transactional edit. Destroying a node
//! detaches its children rather than freeing them.
//!
//! Each node carries local position/rotation/scale, a composed local
//! matrix and a world matrix that is recomputed lazily on the next
//! propagation pass after a dirtying mutation. Rotation is stored as both a
//! quaternion and Euler angles; whichever was written last is authoritative
//! and the other representation is recomputed on access.
//!
//! A node optionally carries a [`Mesh`]: the drawable composition of a
//! shared geometry, a shared program, a draw mode and sorting metadata.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use cgmath::{
    Euler, InnerSpace, Matrix3, Matrix4, One, Quaternion, Rad, SquareMatrix, Vector3, Zero,
};

use crate::camera::Camera;
use crate::context::DrawMode;
use crate::geometry::Geometry;
use crate::program::Program;

static MESH_ID: AtomicU64 = AtomicU64::new(1);

/// Shared, externally owned geometry.
pub type GeometryRef = Rc<RefCell<Geometry>>;
/// Shared, externally owned program.
pub type ProgramRef = Rc<RefCell<Program>>;
/// Hook run around a mesh's draw call.
pub type RenderCallback = Box<dyn FnMut(&mut Scene, NodeId, Option<&Camera>)>;

/// Drawable payload of a scene node.
pub struct Mesh {
    /// Creation id, used as the stable sort tiebreak.
    pub id: u64,
    pub geometry: GeometryRef,
    pub program: ProgramRef,
    pub mode: DrawMode,
    /// Opt-out for frustum culling.
    pub frustum_culled: bool,
    /// Explicit draw-order override; 0 means "use the computed sort".
    pub render_order: i32,
    /// Rewritten in place on every draw, never reallocated.
    pub model_view_matrix: Matrix4<f32>,
    pub normal_matrix: Matrix3<f32>,
    pub(crate) before_render: Vec<RenderCallback>,
    pub(crate) after_render: Vec<RenderCallback>,
}

impl Mesh {
    pub fn new(geometry: GeometryRef, program: ProgramRef) -> Self {
        Self {
            id: MESH_ID.fetch_add(1, Ordering::Relaxed),
            geometry,
            program,
            mode: DrawMode::Triangles,
            frustum_culled: true,
            render_order: 0,
            model_view_matrix: Matrix4::identity(),
            normal_matrix: Matrix3::identity(),
            before_render: Vec::new(),
            after_render: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: DrawMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_render_order(mut self, order: i32) -> Self {
        self.render_order = order;
        self
    }

    /// Skips frustum culling for this mesh.
    pub fn unculled(mut self) -> Self {
        self.frustum_culled = false;
        self
    }

    pub fn on_before_render(
        &mut self,
        callback: impl FnMut(&mut Scene, NodeId, Option<&Camera>) + 'static,
    ) {
        self.before_render.push(Box::new(callback));
    }

    pub fn on_after_render(
        &mut self,
        callback: impl FnMut(&mut Scene, NodeId, Option<&Camera>) + 'static,
    ) {
        self.after_render.push(Box::new(callback));
    }
}

/// Which rotation representation was written last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RotationSource {
    Quaternion,
    Euler,
}

/// One transform node.
pub struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    /// Invisible nodes and their whole subtree are skipped when building
    /// the render list.
    pub visible: bool,
    pub position: Vector3<f32>,
    pub scale: Vector3<f32>,
    pub up: Vector3<f32>,
    quaternion: Quaternion<f32>,
    euler: Euler<Rad<f32>>,
    rotation_source: RotationSource,
    pub matrix: Matrix4<f32>,
    pub world_matrix: Matrix4<f32>,
    /// When false, `matrix` is driven by the application and the
    /// position/rotation/scale fields are ignored by the propagation pass.
    pub matrix_auto_update: bool,
    world_matrix_needs_update: bool,
    pub mesh: Option<Mesh>,
}

impl Node {
    fn new() -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            visible: true,
            position: Vector3::zero(),
            scale: Vector3::new(1.0, 1.0, 1.0),
            up: Vector3::new(0.0, 1.0, 0.0),
            quaternion: Quaternion::one(),
            euler: Euler::new(Rad(0.0), Rad(0.0), Rad(0.0)),
            rotation_source: RotationSource::Quaternion,
            matrix: Matrix4::identity(),
            world_matrix: Matrix4::identity(),
            matrix_auto_update: true,
            world_matrix_needs_update: false,
            mesh: None,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Current rotation as a quaternion, recomputed from the Euler angles
    /// if those were written more recently.
    pub fn quaternion(&mut self) -> Quaternion<f32> {
        if self.rotation_source == RotationSource::Euler {
            self.quaternion = Quaternion::from(self.euler);
        }
        self.quaternion
    }

    pub fn set_quaternion(&mut self, quaternion: Quaternion<f32>) {
        self.quaternion = quaternion;
        self.rotation_source = RotationSource::Quaternion;
    }

    /// Current rotation as Euler angles, recomputed from the quaternion if
    /// that was written more recently.
    pub fn rotation(&mut self) -> Euler<Rad<f32>> {
        if self.rotation_source == RotationSource::Quaternion {
            self.euler = Euler::from(self.quaternion);
        }
        self.euler
    }

    pub fn set_rotation(&mut self, euler: Euler<Rad<f32>>) {
        self.euler = euler;
        self.rotation_source = RotationSource::Euler;
    }

    /// World-space translation.
    pub fn world_position(&self) -> Vector3<f32> {
        self.world_matrix.w.truncate()
    }

    /// Flags the world matrix for recomputation on the next propagation
    /// pass. Only needed when `matrix_auto_update` is off and the local
    /// matrix was edited directly.
    pub fn mark_world_matrix_dirty(&mut self) {
        self.world_matrix_needs_update = true;
    }

    /// Recomposes the local matrix from position, rotation and scale and
    /// marks the world matrix stale.
    pub fn update_matrix(&mut self) {
        let rotation = self.quaternion();
        self.matrix = Matrix4::from_translation(self.position)
            * Matrix4::from(rotation)
            * Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z);
        self.world_matrix_needs_update = true;
    }
}

/// Handle into a [`Scene`]'s node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Arena of transform nodes.
#[derive(Default)]
pub struct Scene {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_node(&mut self) -> NodeId {
        self.insert(Node::new())
    }

    pub fn create_mesh(&mut self, mesh: Mesh) -> NodeId {
        let id = self.create_node();
        self.node_mut(id).mesh = Some(mesh);
        id
    }

    fn insert(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Panics on a handle whose node was removed.
    pub fn node(&self, id: NodeId) -> &Node {
        match self.nodes.get(id.0).and_then(|slot| slot.as_ref()) {
            Some(node) => node,
            None => panic!("stale node handle {:?}", id),
        }
    }

    /// Panics on a handle whose node was removed.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(id.0).and_then(|slot| slot.as_mut()) {
            Some(node) => node,
            None => panic!("stale node handle {:?}", id),
        }
    }

    pub fn try_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(|slot| slot.as_ref())
    }

    /// Reparents `child`, detaching it from any current parent first.
    /// `None` detaches only. Both sides of the relation are updated in the
    /// same edit, so `child.parent == p` exactly when `p.children` contains
    /// `child`.
    pub fn set_parent(&mut self, child: NodeId, parent: Option<NodeId>) {
        let old = self.node(child).parent;
        if old == parent {
            return;
        }
        if let Some(old) = old {
            self.node_mut(old).children.retain(|c| *c != child);
        }
        self.node_mut(child).parent = parent;
        if let Some(parent) = parent {
            let children = &mut self.node_mut(parent).children;
            if !children.contains(&child) {
                children.push(child);
            }
        }
    }

    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.set_parent(child, Some(parent));
    }

    /// Detaches `child` if it currently belongs to `parent`.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) {
        if self.node(child).parent == Some(parent) {
            self.set_parent(child, None);
        }
    }

    /// Removes a node from the arena. Its children are detached and become
    /// roots; they are not freed.
    pub fn remove(&mut self, id: NodeId) {
        self.set_parent(id, None);
        let children = self.node(id).children.clone();
        for child in children {
            self.set_parent(child, None);
        }
        self.nodes[id.0] = None;
        self.free.push(id.0);
    }

    /// Pre-order depth-first traversal. Returning `true` from the visitor
    /// skips the node's entire subtree.
    pub fn traverse(&self, root: NodeId, visitor: &mut dyn FnMut(&Scene, NodeId) -> bool) {
        if visitor(self, root) {
            return;
        }
        for i in 0..self.node(root).children.len() {
            let child = self.node(root).children[i];
            self.traverse(child, visitor);
        }
    }

    /// Recomputes local matrices (where auto-update is on) and propagates
    /// world matrices through the subtree. A dirty or forced node forces
    /// recomputation of every descendant.
    pub fn update_matrix_world(&mut self, id: NodeId, force: bool) {
        let parent_world = self.node(id).parent.map(|p| self.node(p).world_matrix);
        let node = self.node_mut(id);
        if node.matrix_auto_update {
            node.update_matrix();
        }

        let mut force = force;
        if node.world_matrix_needs_update || force {
            node.world_matrix = match parent_world {
                Some(parent_world) => parent_world * node.matrix,
                None => node.matrix,
            };
            node.world_matrix_needs_update = false;
            force = true;
        }

        let children = node.children.clone();
        for child in children {
            self.update_matrix_world(child, force);
        }
    }

    /// Extracts position, rotation and scale back out of an externally
    /// mutated local matrix.
    pub fn decompose(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        let m = node.matrix;
        node.position = m.w.truncate();
        let scale = Vector3::new(
            m.x.truncate().magnitude(),
            m.y.truncate().magnitude(),
            m.z.truncate().magnitude(),
        );
        node.scale = scale;
        let rotation = Matrix3::from_cols(
            m.x.truncate() / scale.x,
            m.y.truncate() / scale.y,
            m.z.truncate() / scale.z,
        );
        node.set_quaternion(Quaternion::from(rotation));
    }

    /// Orients the node toward (`invert` = true) or away from a target
    /// point, re-deriving the rotation state from the resulting matrix.
    pub fn look_at(&mut self, id: NodeId, target: Vector3<f32>, invert: bool) {
        let node = self.node_mut(id);
        let m = if invert {
            target_to(node.position, target, node.up)
        } else {
            target_to(target, node.position, node.up)
        };
        node.matrix = m;
        let rotation =
            Matrix3::from_cols(m.x.truncate(), m.y.truncate(), m.z.truncate());
        node.set_quaternion(Quaternion::from(rotation));
    }
}

/// Orientation matrix placing `eye` looking toward `target`. Degenerate
/// axes (zero-length forward, up parallel to forward) fall back to zero
/// columns instead of producing NaN.
fn target_to(eye: Vector3<f32>, target: Vector3<f32>, up: Vector3<f32>) -> Matrix4<f32> {
    let mut z = eye - target;
    let z_len = z.magnitude2();
    if z_len > 0.0 {
        z /= z_len.sqrt();
    }
    let mut x = up.cross(z);
    let x_len = x.magnitude2();
    if x_len > 0.0 {
        x /= x_len.sqrt();
    }
    let y = z.cross(x);
    Matrix4::from_cols(x.extend(0.0), y.extend(0.0), z.extend(0.0), eye.extend(1.0))
}
