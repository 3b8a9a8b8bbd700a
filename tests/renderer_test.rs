//! Renderer-level properties: state-cache elision, render-list filtering
//! (visibility, frustum culling), bucket sorting and the frame loop.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use cgmath::{Deg, Vector3};
use common::test_utils::{make_program_with, test_renderer, FakeProgram, FakeTarget, RecordingGl};
use luster::camera::Camera;
use luster::context::{
    AttributeType, BlendFactor, BlendFunc, Capability, FramebufferId, UniformType,
};
use luster::geometry::{Attribute, Geometry};
use luster::program::ProgramOptions;
use luster::render::{RenderOptions, Renderer};
use luster::scene_graph::{GeometryRef, Mesh, NodeId, ProgramRef, Scene};

fn quad_geometry(renderer: &mut Renderer) -> GeometryRef {
    let (ctx, state) = renderer.parts();
    let mut geometry = Geometry::new(ctx, state);
    geometry.add_attribute(
        ctx,
        state,
        "position",
        Attribute::new(3, vec![-1.0f32, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0, 1.0, 0.0, -1.0, 1.0, 0.0]),
    );
    geometry.set_index(ctx, state, Attribute::new(1, vec![0u16, 1, 2, 0, 2, 3]));
    Rc::new(RefCell::new(geometry))
}

fn program_with(renderer: &mut Renderer, gl: &RecordingGl, options: ProgramOptions) -> ProgramRef {
    let fake = FakeProgram::with_attributes(&[("position", AttributeType::FloatVec3)])
        .uniforms(&[("modelViewMatrix", UniformType::Mat4)]);
    Rc::new(RefCell::new(make_program_with(renderer, gl, fake, options)))
}

fn mesh_at(
    scene: &mut Scene,
    root: NodeId,
    geometry: &GeometryRef,
    program: &ProgramRef,
    position: Vector3<f32>,
) -> NodeId {
    let id = scene.create_mesh(Mesh::new(geometry.clone(), program.clone()));
    scene.node_mut(id).position = position;
    scene.add_child(root, id);
    id
}

fn looking_down_z(scene: &mut Scene) -> Camera {
    let mut camera = Camera::perspective(scene, Deg(90.0), 1.0, 0.1, 100.0);
    camera.update(scene);
    camera.update_frustum();
    camera
}

#[test]
fn repeated_state_changes_reach_the_gpu_once() {
    let (mut renderer, gl) = test_renderer();

    renderer.enable(Capability::Blend);
    renderer.enable(Capability::Blend);
    assert_eq!(gl.calls_containing("enable(Blend)").len(), 1);

    let func = BlendFunc::new(BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha);
    renderer.set_blend_func(func);
    renderer.set_blend_func(func);
    assert_eq!(gl.count("blend_func_separate"), 1);

    renderer.set_blend_func(BlendFunc::new(BlendFactor::One, BlendFactor::One));
    assert_eq!(gl.count("blend_func_separate"), 2);

    renderer.disable(Capability::Blend);
    renderer.disable(Capability::Blend);
    assert_eq!(gl.calls_containing("disable(Blend)").len(), 1);
}

#[test]
fn invisible_subtrees_never_enter_the_render_list() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let program = program_with(&mut renderer, &gl, ProgramOptions::default());

    let mut scene = Scene::new();
    let root = scene.create_node();
    let group = scene.create_node();
    scene.add_child(root, group);
    let hidden = mesh_at(&mut scene, group, &geometry, &program, Vector3::new(0.0, 0.0, -5.0));
    let shown = mesh_at(&mut scene, root, &geometry, &program, Vector3::new(0.0, 0.0, -5.0));

    // Invisibility is inherited: hiding the group hides its descendants
    // even though they are individually visible.
    scene.node_mut(group).visible = false;
    scene.update_matrix_world(root, false);

    let list = renderer.get_render_list(&scene, None, root, false, true);
    assert_eq!(list, vec![shown]);
    assert!(!list.contains(&hidden));
}

#[test]
fn frustum_culling_excludes_out_of_view_spheres() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let program = program_with(&mut renderer, &gl, ProgramOptions::default());

    let mut scene = Scene::new();
    let root = scene.create_node();
    let in_view = mesh_at(&mut scene, root, &geometry, &program, Vector3::new(0.0, 0.0, -5.0));
    let behind = mesh_at(&mut scene, root, &geometry, &program, Vector3::new(0.0, 0.0, 5.0));
    let straddling =
        mesh_at(&mut scene, root, &geometry, &program, Vector3::new(-6.0, 0.0, -5.0));
    let far_left = mesh_at(&mut scene, root, &geometry, &program, Vector3::new(-8.0, 0.0, -5.0));

    scene.update_matrix_world(root, false);
    let camera = looking_down_z(&mut scene);

    let list = renderer.get_render_list(&scene, Some(&camera), root, true, false);
    assert!(list.contains(&in_view));
    // A sphere straddling one plane is kept.
    assert!(list.contains(&straddling));
    assert!(!list.contains(&behind));
    assert!(!list.contains(&far_left));
}

#[test]
fn culling_opt_out_keeps_offscreen_meshes() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let program = program_with(&mut renderer, &gl, ProgramOptions::default());

    let mut scene = Scene::new();
    let root = scene.create_node();
    let id = scene
        .create_mesh(Mesh::new(geometry.clone(), program.clone()).unculled());
    scene.node_mut(id).position = Vector3::new(0.0, 0.0, 50.0);
    scene.add_child(root, id);

    scene.update_matrix_world(root, false);
    let camera = looking_down_z(&mut scene);

    let list = renderer.get_render_list(&scene, Some(&camera), root, true, false);
    assert_eq!(list, vec![id]);
}

#[test]
fn explicit_render_order_overrides_everything() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let program = program_with(&mut renderer, &gl, ProgramOptions::default());

    let mut scene = Scene::new();
    let root = scene.create_node();
    let mut make = |order: i32| {
        let id = scene.create_mesh(
            Mesh::new(geometry.clone(), program.clone()).with_render_order(order),
        );
        scene.add_child(root, id);
        id
    };
    let second = make(2);
    let zeroth = make(0);
    let first = make(1);

    scene.update_matrix_world(root, false);
    let list = renderer.get_render_list(&scene, None, root, false, true);
    assert_eq!(list, vec![zeroth, first, second]);
}

#[test]
fn transparent_meshes_draw_back_to_front() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let transparent = program_with(
        &mut renderer,
        &gl,
        ProgramOptions { transparent: true, ..ProgramOptions::default() },
    );

    let mut scene = Scene::new();
    let root = scene.create_node();
    let near = mesh_at(&mut scene, root, &geometry, &transparent, Vector3::new(0.0, 0.0, -2.0));
    let far = mesh_at(&mut scene, root, &geometry, &transparent, Vector3::new(0.0, 0.0, -5.0));

    scene.update_matrix_world(root, false);
    let mut camera = looking_down_z(&mut scene);
    camera.update(&mut scene);

    let list = renderer.get_render_list(&scene, Some(&camera), root, false, true);
    assert_eq!(list, vec![far, near]);
}

#[test]
fn buckets_concatenate_opaque_then_transparent_then_overlay() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let opaque = program_with(&mut renderer, &gl, ProgramOptions::default());
    let transparent = program_with(
        &mut renderer,
        &gl,
        ProgramOptions { transparent: true, ..ProgramOptions::default() },
    );
    let overlay = program_with(
        &mut renderer,
        &gl,
        ProgramOptions { transparent: true, depth_test: false, ..ProgramOptions::default() },
    );

    let mut scene = Scene::new();
    let root = scene.create_node();
    // Insert in reverse of the expected draw order.
    let ui = mesh_at(&mut scene, root, &geometry, &overlay, Vector3::new(0.0, 0.0, -3.0));
    let blended =
        mesh_at(&mut scene, root, &geometry, &transparent, Vector3::new(0.0, 0.0, -3.0));
    let solid = mesh_at(&mut scene, root, &geometry, &opaque, Vector3::new(0.0, 0.0, -3.0));

    scene.update_matrix_world(root, false);
    let camera = looking_down_z(&mut scene);

    let list = renderer.get_render_list(&scene, Some(&camera), root, false, true);
    assert_eq!(list, vec![solid, blended, ui]);
}

#[test]
fn opaque_meshes_group_by_program() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let program_a = program_with(&mut renderer, &gl, ProgramOptions::default());
    let program_b = program_with(&mut renderer, &gl, ProgramOptions::default());

    let mut scene = Scene::new();
    let root = scene.create_node();
    let a1 = mesh_at(&mut scene, root, &geometry, &program_a, Vector3::new(0.0, 0.0, -3.0));
    let b1 = mesh_at(&mut scene, root, &geometry, &program_b, Vector3::new(0.0, 0.0, -3.0));
    let a2 = mesh_at(&mut scene, root, &geometry, &program_a, Vector3::new(0.0, 0.0, -3.0));

    scene.update_matrix_world(root, false);
    let list = renderer.get_render_list(&scene, None, root, false, true);

    // Program A was created first, so its two meshes draw contiguously.
    assert_eq!(list, vec![a1, a2, b1]);
}

#[test]
fn render_clears_with_depth_writes_restored() {
    let (mut renderer, gl) = test_renderer();
    let mut scene = Scene::new();
    let root = scene.create_node();

    // A previous frame left depth writes off; the clear must force them
    // back on or the depth buffer would survive.
    renderer.set_depth_mask(false);
    renderer.render(&mut scene, root, None, None, &RenderOptions::default());

    assert_eq!(gl.count("clear"), 1);
    assert_eq!(gl.calls_containing("depth_mask(true)").len(), 1);
    assert!(gl.calls().contains(&"viewport(0, 0, 300, 150)".to_string()));
}

#[test]
fn render_targets_bind_their_framebuffer_and_size() {
    let (mut renderer, gl) = test_renderer();
    let mut scene = Scene::new();
    let root = scene.create_node();
    let target = FakeTarget { width: 64, height: 32, framebuffer: FramebufferId(99) };

    renderer.render(&mut scene, root, None, Some(&target), &RenderOptions::default());
    assert!(gl
        .calls()
        .contains(&"bind_framebuffer(Some(FramebufferId(99)))".to_string()));
    assert!(gl.calls().contains(&"viewport(0, 0, 64, 32)".to_string()));

    renderer.render(&mut scene, root, None, None, &RenderOptions::default());
    assert!(gl.calls().contains(&"bind_framebuffer(None)".to_string()));
}

#[test]
fn a_static_second_frame_elides_programs_uniforms_and_buffers() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let program = program_with(&mut renderer, &gl, ProgramOptions::default());

    let mut scene = Scene::new();
    let root = scene.create_node();
    mesh_at(&mut scene, root, &geometry, &program, Vector3::new(0.0, 0.0, -5.0));
    let mut camera = looking_down_z(&mut scene);

    renderer.render(&mut scene, root, Some(&mut camera), None, &RenderOptions::default());
    assert_eq!(gl.count("use_program"), 1);
    assert_eq!(gl.count("create_vertex_array"), 1);
    assert_eq!(gl.count("draw_elements"), 1);
    let uniform_uploads = gl.count("uniform_matrix4fv");
    assert_eq!(uniform_uploads, 1);

    renderer.render(&mut scene, root, Some(&mut camera), None, &RenderOptions::default());
    // Nothing moved: same program, same vertex state, same uniform values.
    assert_eq!(gl.count("use_program"), 1);
    assert_eq!(gl.count("create_vertex_array"), 1);
    assert_eq!(gl.count("uniform_matrix4fv"), uniform_uploads);
    assert_eq!(gl.count("draw_elements"), 2);
}

#[test]
fn moving_a_node_refreshes_its_world_matrix_and_uniforms() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let program = program_with(&mut renderer, &gl, ProgramOptions::default());

    let mut scene = Scene::new();
    let root = scene.create_node();
    let id = mesh_at(&mut scene, root, &geometry, &program, Vector3::new(0.0, 0.0, -5.0));
    let mut camera = looking_down_z(&mut scene);

    renderer.render(&mut scene, root, Some(&mut camera), None, &RenderOptions::default());
    let uploads = gl.count("uniform_matrix4fv");

    scene.node_mut(id).position = Vector3::new(1.0, 0.0, -5.0);
    renderer.render(&mut scene, root, Some(&mut camera), None, &RenderOptions::default());

    assert_eq!(scene.node(id).world_position(), Vector3::new(1.0, 0.0, -5.0));
    assert!(gl.count("uniform_matrix4fv") > uploads);
}

#[test]
fn before_and_after_render_hooks_fire_around_each_draw() {
    let (mut renderer, gl) = test_renderer();
    let geometry = quad_geometry(&mut renderer);
    let program = program_with(&mut renderer, &gl, ProgramOptions::default());

    let mut scene = Scene::new();
    let root = scene.create_node();
    let id = mesh_at(&mut scene, root, &geometry, &program, Vector3::new(0.0, 0.0, -5.0));

    let before = Rc::new(Cell::new(0));
    let after = Rc::new(Cell::new(0));
    {
        let mesh = scene.node_mut(id).mesh.as_mut().unwrap();
        let count = before.clone();
        mesh.on_before_render(move |_, _, _| count.set(count.get() + 1));
        let count = after.clone();
        mesh.on_after_render(move |_, _, _| count.set(count.get() + 1));
    }

    let mut camera = looking_down_z(&mut scene);
    renderer.render(&mut scene, root, Some(&mut camera), None, &RenderOptions::default());
    renderer.render(&mut scene, root, Some(&mut camera), None, &RenderOptions::default());

    assert_eq!(before.get(), 2);
    assert_eq!(after.get(), 2);
    assert_eq!(gl.count("draw_elements"), 2);
}
