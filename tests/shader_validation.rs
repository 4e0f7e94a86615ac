//! Every embedded WGSL module must parse and validate, expose the entry
//! points the pipelines ask for, and agree with the host uniform layouts.

use naga::valid::{Capabilities, ValidationFlags, Validator};
use tpe::gpu::RenderParams;
use tpe::shaders::{self, EmbeddedShaders, ShaderSource};
use tpe::simulation::SimParams;

fn module(name: &str) -> naga::Module {
    let source = EmbeddedShaders
        .resolve(name)
        .unwrap_or_else(|| panic!("no embedded source for {name}"));
    let module = naga::front::wgsl::parse_str(&source)
        .unwrap_or_else(|err| panic!("{name}: {}", err.emit_to_string(&source)));
    Validator::new(ValidationFlags::all(), Capabilities::empty())
        .validate(&module)
        .unwrap_or_else(|err| panic!("{name}: {err:?}"));
    module
}

fn entry_points(module: &naga::Module) -> Vec<(naga::ShaderStage, String)> {
    module
        .entry_points
        .iter()
        .map(|ep| (ep.stage, ep.name.clone()))
        .collect()
}

fn struct_size(module: &naga::Module, name: &str) -> u32 {
    let mut layouter = naga::proc::Layouter::default();
    layouter.update(module.to_ctx()).unwrap();
    let (handle, _) = module
        .types
        .iter()
        .find(|(_, ty)| ty.name.as_deref() == Some(name))
        .unwrap_or_else(|| panic!("struct {name} not declared"));
    layouter[handle].size
}

#[test]
fn all_modules_validate() {
    for name in shaders::ALL {
        module(name);
    }
}

#[test]
fn unknown_name_has_no_source() {
    assert!(EmbeddedShaders.resolve("render/missing").is_none());
}

#[test]
fn compute_entry_point() {
    use naga::ShaderStage::*;
    let module = module(shaders::COMPUTE_UPDATE);
    assert_eq!(entry_points(&module), vec![(Compute, "main".to_string())]);
    assert_eq!(module.entry_points[0].workgroup_size, [256, 1, 1]);
}

#[test]
fn render_entry_points() {
    use naga::ShaderStage::*;
    let eps = entry_points(&module(shaders::RENDER_PARTICLE));
    for expected in [(Vertex, "vs_main"), (Fragment, "fs_additive"), (Fragment, "fs_alpha")] {
        assert!(eps.contains(&(expected.0, expected.1.to_string())), "{expected:?} missing");
    }

    let eps = entry_points(&module(shaders::FEEDBACK_RENDER));
    assert!(eps.contains(&(Vertex, "vs_state".to_string())));
    assert!(eps.contains(&(Fragment, "fs_additive".to_string())));

    let eps = entry_points(&module(shaders::FEEDBACK_UPDATE));
    assert!(eps.contains(&(Vertex, "vs_fullscreen".to_string())));
    assert!(eps.contains(&(Fragment, "fs_update".to_string())));

    let eps = entry_points(&module(shaders::PRESENT_BLIT));
    assert!(eps.contains(&(Vertex, "vs_main".to_string())));
    assert!(eps.contains(&(Fragment, "fs_main".to_string())));
}

#[test]
fn uniform_layouts_match_host_structs() {
    let update = module(shaders::COMPUTE_UPDATE);
    assert_eq!(struct_size(&update, "SimParams") as usize, std::mem::size_of::<SimParams>());

    let feedback = module(shaders::FEEDBACK_UPDATE);
    assert_eq!(struct_size(&feedback, "SimParams") as usize, std::mem::size_of::<SimParams>());

    let sprite = module(shaders::RENDER_PARTICLE);
    assert_eq!(struct_size(&sprite, "RenderParams") as usize, std::mem::size_of::<RenderParams>());
}

#[test]
fn compute_particle_matches_aligned_layout() {
    let module = module(shaders::COMPUTE_UPDATE);
    assert_eq!(
        struct_size(&module, "Particle") as u64,
        tpe::ParticleLayout::ALIGNED.stride
    );
}
