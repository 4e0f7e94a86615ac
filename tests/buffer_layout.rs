//! Wire layouts shared between the host and the shaders.

use tpe::buffer::{check_capacity, state_columns, state_rows, DoubleBuffer, TEXELS_PER_PARTICLE};
use tpe::particle::{AlignedParticle, PackedParticle};
use tpe::{CapacityError, Particle, ParticleLayout, Tier, Vec3, Vec4};

fn sample() -> Particle {
    Particle {
        position: Vec3::new(1.0, 2.0, 3.0),
        velocity: Vec3::new(4.0, 5.0, 6.0),
        color: Vec4::new(0.1, 0.2, 0.3, 0.4),
        life: 0.75,
        size: 1.5,
    }
}

fn f32_at(bytes: &[u8], offset: u64) -> f32 {
    let offset = offset as usize;
    f32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

#[test]
fn record_sizes_match_strides() {
    assert_eq!(std::mem::size_of::<AlignedParticle>() as u64, ParticleLayout::ALIGNED.stride);
    assert_eq!(std::mem::size_of::<PackedParticle>() as u64, ParticleLayout::PACKED.stride);
}

#[test]
fn tiers_pick_their_layout() {
    assert_eq!(Tier::Compute.layout(), ParticleLayout::ALIGNED);
    assert_eq!(Tier::Render.layout(), ParticleLayout::PACKED);
    assert_eq!(Tier::Legacy.layout(), ParticleLayout::PACKED);
}

#[test]
fn fields_land_at_declared_offsets() {
    for layout in [ParticleLayout::ALIGNED, ParticleLayout::PACKED] {
        let bytes = layout.encode(&[sample()]);
        assert_eq!(bytes.len() as u64, layout.stride);
        assert_eq!(f32_at(&bytes, layout.position + 8), 3.0);
        assert_eq!(f32_at(&bytes, layout.velocity), 4.0);
        assert_eq!(f32_at(&bytes, layout.color + 12), 0.4);
        assert_eq!(f32_at(&bytes, layout.life), 0.75);
        assert_eq!(f32_at(&bytes, layout.size), 1.5);
    }
}

#[test]
fn vertex_attributes_follow_the_layout() {
    let attrs = ParticleLayout::PACKED.vertex_attributes();
    let offsets: Vec<_> = attrs.iter().map(|a| (a.shader_location, a.offset)).collect();
    assert_eq!(offsets, vec![(0, 0), (1, 24), (2, 40), (3, 44)]);
}

#[test]
fn decode_drops_a_trailing_partial_record() {
    let mut bytes = ParticleLayout::PACKED.encode(&[sample(), sample()]);
    bytes.extend_from_slice(&[0u8; 20]);
    let particles = ParticleLayout::PACKED.decode(&bytes);
    assert_eq!(particles, vec![sample(), sample()]);
}

#[test]
fn packed_record_spans_three_texels() {
    assert_eq!(TEXELS_PER_PARTICLE as u64 * 16, ParticleLayout::PACKED.stride);
}

#[test]
fn state_texture_holds_every_particle() {
    for capacity in [1, 2, 1000, 65_537, 1_000_000] {
        let columns = state_columns(capacity, 8192);
        let rows = state_rows(capacity, columns);
        assert!(columns as usize * rows as usize >= capacity);
        assert!(columns * TEXELS_PER_PARTICLE <= 8192);
        assert!((rows as usize - 1) * (columns as usize) < capacity);
    }
}

#[test]
fn narrow_devices_reject_what_they_cannot_hold() {
    let limits = wgpu::Limits {
        max_texture_dimension_2d: 64,
        ..wgpu::Limits::downlevel_webgl2_defaults()
    };
    assert!(check_capacity(Tier::Render, 21 * 64, &limits).is_ok());
    assert!(matches!(
        check_capacity(Tier::Render, 21 * 64 + 1, &limits),
        Err(CapacityError::TextureTooLarge { rows: 65, limit: 64 })
    ));
    assert!(check_capacity(Tier::Software, 1 << 24, &limits).is_ok());
}

#[test]
fn double_buffer_never_reads_the_slot_it_writes() {
    let mut slots = DoubleBuffer::new(Vec::<u32>::new(), Vec::new());
    for frame in 0..6u32 {
        assert_ne!(slots.front_index(), slots.back_index());
        slots.back_mut().push(frame);
        slots.flip();
        assert_eq!(slots.front().last(), Some(&frame));
    }
    assert_eq!(slots.frame(), 6);
}
