//! Particle record and its binary layouts.
//!
//! The host works with [`Particle`]. Devices see one of two wire forms:
//!
//! | layout | stride | used by |
//! |--------|--------|---------|
//! | [`ParticleLayout::ALIGNED`] | 64 B | compute tier storage buffer |
//! | [`ParticleLayout::PACKED`] | 48 B | feedback textures, instance buffers |
//!
//! Shaders and vertex descriptors read offsets from [`ParticleLayout`]
//! instead of repeating them.

use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

/// A single particle as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Particle {
    pub position: Vec3,
    pub velocity: Vec3,
    pub color: Vec4,
    /// Remaining life in `(0, 1]`. Zero or below means dead.
    pub life: f32,
    pub size: f32,
}

impl Particle {
    pub fn new(position: Vec3, velocity: Vec3) -> Self {
        Self {
            position,
            velocity,
            color: Vec4::ONE,
            life: 1.0,
            size: 1.0,
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.life > 0.0
    }
}

/// 64-byte form with 16-byte aligned vectors for storage buffers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AlignedParticle {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub velocity: [f32; 3],
    pub _pad1: f32,
    pub color: [f32; 4],
    pub life: f32,
    pub size: f32,
    pub _pad2: [f32; 2],
}

/// 48-byte tightly packed form.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedParticle {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    pub color: [f32; 4],
    pub life: f32,
    pub size: f32,
}

impl From<&Particle> for AlignedParticle {
    fn from(p: &Particle) -> Self {
        Self {
            position: p.position.to_array(),
            _pad0: 0.0,
            velocity: p.velocity.to_array(),
            _pad1: 0.0,
            color: p.color.to_array(),
            life: p.life,
            size: p.size,
            _pad2: [0.0; 2],
        }
    }
}

impl From<&AlignedParticle> for Particle {
    fn from(p: &AlignedParticle) -> Self {
        Self {
            position: Vec3::from_array(p.position),
            velocity: Vec3::from_array(p.velocity),
            color: Vec4::from_array(p.color),
            life: p.life,
            size: p.size,
        }
    }
}

impl From<&Particle> for PackedParticle {
    fn from(p: &Particle) -> Self {
        Self {
            position: p.position.to_array(),
            velocity: p.velocity.to_array(),
            color: p.color.to_array(),
            life: p.life,
            size: p.size,
        }
    }
}

impl From<&PackedParticle> for Particle {
    fn from(p: &PackedParticle) -> Self {
        Self {
            position: Vec3::from_array(p.position),
            velocity: Vec3::from_array(p.velocity),
            color: Vec4::from_array(p.color),
            life: p.life,
            size: p.size,
        }
    }
}

/// Byte stride and field offsets of a particle layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleLayout {
    pub stride: u64,
    pub position: u64,
    pub velocity: u64,
    pub color: u64,
    pub life: u64,
    pub size: u64,
}

impl ParticleLayout {
    pub const ALIGNED: ParticleLayout = ParticleLayout {
        stride: 64,
        position: 0,
        velocity: 16,
        color: 32,
        life: 48,
        size: 52,
    };

    pub const PACKED: ParticleLayout = ParticleLayout {
        stride: 48,
        position: 0,
        velocity: 12,
        color: 24,
        life: 40,
        size: 44,
    };

    /// Size in bytes of `count` particles.
    pub fn bytes_for(&self, count: usize) -> u64 {
        self.stride * count as u64
    }

    /// Serialize particles into this layout.
    pub fn encode(&self, particles: &[Particle]) -> Vec<u8> {
        if *self == Self::ALIGNED {
            let wire: Vec<AlignedParticle> = particles.iter().map(AlignedParticle::from).collect();
            bytemuck::cast_slice(&wire).to_vec()
        } else {
            let wire: Vec<PackedParticle> = particles.iter().map(PackedParticle::from).collect();
            bytemuck::cast_slice(&wire).to_vec()
        }
    }

    /// Deserialize whole records from `bytes`. Trailing partial records are ignored.
    pub fn decode(&self, bytes: &[u8]) -> Vec<Particle> {
        let stride = self.stride as usize;
        let whole = bytes.len() / stride * stride;
        let bytes = &bytes[..whole];
        if *self == Self::ALIGNED {
            bytes
                .chunks_exact(stride)
                .map(|chunk| Particle::from(&bytemuck::pod_read_unaligned::<AlignedParticle>(chunk)))
                .collect()
        } else {
            bytes
                .chunks_exact(stride)
                .map(|chunk| Particle::from(&bytemuck::pod_read_unaligned::<PackedParticle>(chunk)))
                .collect()
        }
    }

    /// Instance-rate vertex attributes for drawing: position, color, life, size
    /// at shader locations 0 to 3.
    pub fn vertex_attributes(&self) -> [wgpu::VertexAttribute; 4] {
        [
            wgpu::VertexAttribute {
                format: wgpu::VertexFormat::Float32x3,
                offset: self.position,
                shader_location: 0,
            },
            wgpu::VertexAttribute {
                format: wgpu::VertexFormat::Float32x4,
                offset: self.color,
                shader_location: 1,
            },
            wgpu::VertexAttribute {
                format: wgpu::VertexFormat::Float32,
                offset: self.life,
                shader_location: 2,
            },
            wgpu::VertexAttribute {
                format: wgpu::VertexFormat::Float32,
                offset: self.size,
                shader_location: 3,
            },
        ]
    }
}
