//! Camera: view/projection derivation and frustum culling support.
//!
//! A [`Camera`] sits on top of a scene node and derives its view matrix
//! (inverse world matrix), projection matrix, combined projection-view
//! matrix, world position and six frustum planes from it. The renderer
//! refreshes the camera once per frame and consults
//! [`Camera::frustum_intersects_node`] while building the render list.
//!
//! The camera's node may live inside the rendered graph or outside it; an
//! unparented camera updates its own world matrix during
//! [`Camera::update`].

use cgmath::{ortho, perspective, Deg, InnerSpace, Matrix4, SquareMatrix, Vector3, Vector4, Zero};

use crate::scene_graph::{NodeId, Scene};

/// Projection parameters.
#[derive(Debug, Clone, Copy)]
pub enum Projection {
    Perspective { fov: Deg<f32>, aspect: f32, near: f32, far: f32 },
    Orthographic { left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32 },
}

pub struct Camera {
    pub node: NodeId,
    pub projection: Projection,
    pub projection_matrix: Matrix4<f32>,
    pub view_matrix: Matrix4<f32>,
    pub projection_view_matrix: Matrix4<f32>,
    pub world_position: Vector3<f32>,
    /// Six half-space planes as (normal, constant), refreshed by
    /// [`Camera::update_frustum`].
    frustum: [Vector4<f32>; 6],
}

impl Camera {
    pub fn perspective(scene: &mut Scene, fov: Deg<f32>, aspect: f32, near: f32, far: f32) -> Self {
        Self::with_projection(scene, Projection::Perspective { fov, aspect, near, far })
    }

    pub fn orthographic(
        scene: &mut Scene,
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    ) -> Self {
        Self::with_projection(
            scene,
            Projection::Orthographic { left, right, bottom, top, near, far },
        )
    }

    fn with_projection(scene: &mut Scene, projection: Projection) -> Self {
        let mut camera = Self {
            node: scene.create_node(),
            projection,
            projection_matrix: Matrix4::identity(),
            view_matrix: Matrix4::identity(),
            projection_view_matrix: Matrix4::identity(),
            world_position: Vector3::zero(),
            frustum: [Vector4::zero(); 6],
        };
        camera.update_projection();
        camera
    }

    pub fn set_perspective(&mut self, fov: Deg<f32>, aspect: f32, near: f32, far: f32) {
        self.projection = Projection::Perspective { fov, aspect, near, far };
        self.update_projection();
    }

    pub fn set_orthographic(
        &mut self,
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    ) {
        self.projection = Projection::Orthographic { left, right, bottom, top, near, far };
        self.update_projection();
    }

    fn update_projection(&mut self) {
        self.projection_matrix = match self.projection {
            Projection::Perspective { fov, aspect, near, far } => {
                perspective(fov, aspect, near, far)
            }
            Projection::Orthographic { left, right, bottom, top, near, far } => {
                ortho(left, right, bottom, top, near, far)
            }
        };
    }

    /// Orients the camera's node toward a world-space point.
    pub fn look_at(&self, scene: &mut Scene, target: Vector3<f32>) {
        scene.look_at(self.node, target, true);
    }

    /// Refreshes view, projection-view and world position from the node's
    /// world matrix. A camera outside the rendered graph (no parent)
    /// propagates its own world matrix here; one inside the graph was
    /// already covered by the scene pass.
    pub fn update(&mut self, scene: &mut Scene) {
        if scene.node(self.node).parent().is_none() {
            scene.update_matrix_world(self.node, false);
        }
        let world = scene.node(self.node).world_matrix;
        self.world_position = world.w.truncate();
        // A singular world matrix keeps the previous view rather than
        // poisoning it with NaN.
        if let Some(view) = world.invert() {
            self.view_matrix = view;
        }
        self.projection_view_matrix = self.projection_matrix * self.view_matrix;
    }

    /// Recomputes the six frustum planes from the projection-view matrix.
    pub fn update_frustum(&mut self) {
        let m = self.projection_view_matrix;
        let row = |i: usize| Vector4::new(m.x[i], m.y[i], m.z[i], m.w[i]);
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        let planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r3 + r2, r3 - r2];
        self.frustum = planes.map(|plane| {
            let length = plane.truncate().magnitude();
            if length > 0.0 { plane / length } else { plane }
        });
    }

    /// A sphere entirely behind any plane is outside; one straddling a
    /// plane is in.
    pub fn frustum_intersects_sphere(&self, center: Vector3<f32>, radius: f32) -> bool {
        for plane in &self.frustum {
            let distance = plane.truncate().dot(center) + plane.w;
            if distance < -radius {
                return false;
            }
        }
        true
    }

    /// Tests a mesh node's bounding sphere (computed on demand) against the
    /// frustum, scaled and positioned by the node's world matrix. Nodes
    /// without position data cannot be culled and count as visible.
    pub fn frustum_intersects_node(&self, scene: &Scene, id: NodeId) -> bool {
        let node = scene.node(id);
        let Some(mesh) = node.mesh.as_ref() else {
            return true;
        };

        let mut geometry = mesh.geometry.borrow_mut();
        if geometry.bounds().map_or(true, |b| !b.radius.is_finite()) {
            geometry.compute_bounding_sphere();
        }
        let Some(bounds) = geometry.bounds() else {
            return true;
        };

        let center = (node.world_matrix * bounds.center.extend(1.0)).truncate();
        let radius = bounds.radius * max_scale_on_axis(&node.world_matrix);
        self.frustum_intersects_sphere(center, radius)
    }
}

fn max_scale_on_axis(m: &Matrix4<f32>) -> f32 {
    m.x.truncate()
        .magnitude2()
        .max(m.y.truncate().magnitude2())
        .max(m.z.truncate().magnitude2())
        .sqrt()
}
