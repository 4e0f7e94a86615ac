//! Particle storage in the layout each tier expects.
//!
//! | tier     | storage                                   | layout |
//! |----------|-------------------------------------------|--------|
//! | compute  | one read-write storage buffer             | 64 B   |
//! | render   | two `Rgba32Float` state textures          | 48 B   |
//! | legacy   | host array mirrored to a vertex buffer    | 48 B   |
//! | software | host array                                | 48 B   |
//!
//! The capacity is fixed at construction. Uploads longer than the capacity
//! are rejected, never truncated.

use std::sync::Arc;

use tracing::debug;

use crate::capability::Tier;
use crate::error::{CapacityError, EngineError, SetupError};
use crate::gpu::{allocate_buffer, read_buffer, read_texture, scoped, GpuDevice, STATE_FORMAT};
use crate::particle::{Particle, ParticleLayout};

/// `Rgba32Float` texels per particle in the state textures.
pub const TEXELS_PER_PARTICLE: u32 = 3;
const TEXEL_BYTES: u32 = 16;

/// Two slots used with strict frame-parity alternation.
///
/// `front()` is `slots[frame % 2]` and holds the latest state. `back()` is
/// `slots[(frame + 1) % 2]` and is the only slot an update may write. An
/// update reads front, writes back, then calls [`flip`](Self::flip). Reading
/// and writing the same slot in one pass is never allowed.
#[derive(Debug)]
pub struct DoubleBuffer<T> {
    slots: [T; 2],
    frame: u64,
}

impl<T> DoubleBuffer<T> {
    pub fn new(first: T, second: T) -> Self {
        Self {
            slots: [first, second],
            frame: 0,
        }
    }

    /// Slot index currently holding the latest state.
    pub fn front_index(&self) -> usize {
        (self.frame % 2) as usize
    }

    pub fn back_index(&self) -> usize {
        ((self.frame + 1) % 2) as usize
    }

    pub fn front(&self) -> &T {
        &self.slots[self.front_index()]
    }

    pub fn back(&self) -> &T {
        &self.slots[self.back_index()]
    }

    pub fn front_mut(&mut self) -> &mut T {
        let index = self.front_index();
        &mut self.slots[index]
    }

    pub fn back_mut(&mut self) -> &mut T {
        let index = self.back_index();
        &mut self.slots[index]
    }

    /// Make the slot just written the new front.
    pub fn flip(&mut self) {
        self.frame += 1;
    }

    /// Number of flips so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn slots(&self) -> &[T; 2] {
        &self.slots
    }
}

/// Particles per state-texture row for `capacity` particles.
///
/// Rows are kept roughly square and never wider than the device allows.
pub fn state_columns(capacity: usize, max_texture_dimension: u32) -> u32 {
    let limit = (max_texture_dimension / TEXELS_PER_PARTICLE).max(1);
    ((capacity as f64).sqrt().ceil() as u32).clamp(1, limit)
}

/// Rows needed for `capacity` particles at `columns` per row.
pub fn state_rows(capacity: usize, columns: u32) -> u32 {
    (capacity.max(1) as u64).div_ceil(columns.max(1) as u64) as u32
}

/// Reject a capacity the device cannot hold before allocating anything.
pub fn check_capacity(tier: Tier, capacity: usize, limits: &wgpu::Limits) -> Result<(), CapacityError> {
    let bytes = tier.layout().bytes_for(capacity);
    match tier {
        Tier::Compute => {
            let limit = limits
                .max_buffer_size
                .min(limits.max_storage_buffer_binding_size as u64);
            if bytes > limit {
                return Err(CapacityError::BufferTooLarge { bytes, limit });
            }
        }
        Tier::Render => {
            let columns = state_columns(capacity, limits.max_texture_dimension_2d);
            let rows = state_rows(capacity, columns);
            if rows > limits.max_texture_dimension_2d {
                return Err(CapacityError::TextureTooLarge {
                    rows,
                    limit: limits.max_texture_dimension_2d,
                });
            }
        }
        Tier::Legacy => {
            if bytes > limits.max_buffer_size {
                return Err(CapacityError::BufferTooLarge {
                    bytes,
                    limit: limits.max_buffer_size,
                });
            }
        }
        Tier::Software => {}
    }
    Ok(())
}

/// One `Rgba32Float` state texture.
#[derive(Debug)]
pub struct StateTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

/// The ping-pong pair of the render tier.
#[derive(Debug)]
pub struct StateTextures {
    pub textures: DoubleBuffer<StateTexture>,
    /// Particles per row.
    pub columns: u32,
    pub rows: u32,
}

enum Storage {
    Device {
        gpu: Arc<GpuDevice>,
        buffer: wgpu::Buffer,
    },
    StateTextures {
        gpu: Arc<GpuDevice>,
        state: StateTextures,
    },
    Mirrored {
        gpu: Arc<GpuDevice>,
        host: Vec<Particle>,
        vertices: wgpu::Buffer,
    },
    Host(Vec<Particle>),
}

/// Owns the particle state of one engine.
pub struct ParticleBuffer {
    tier: Tier,
    capacity: usize,
    layout: ParticleLayout,
    storage: Storage,
}

impl ParticleBuffer {
    /// Host array for the software tier. Starts with dead particles.
    pub fn host(capacity: usize) -> Self {
        Self {
            tier: Tier::Software,
            capacity,
            layout: Tier::Software.layout(),
            storage: Storage::Host(vec![Particle::default(); capacity]),
        }
    }

    /// Storage buffer for the compute tier, also bindable as instance vertices.
    pub fn device(gpu: Arc<GpuDevice>, capacity: usize) -> Result<Self, SetupError> {
        let tier = Tier::Compute;
        check_capacity(tier, capacity, &gpu.device.limits())?;
        let layout = tier.layout();
        let zeroed = vec![0u8; layout.bytes_for(capacity) as usize];
        let buffer = allocate_buffer(
            &gpu.device,
            tier,
            "Particle Storage Buffer",
            &zeroed,
            wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        )?;
        debug!(target: "tpe::buffer", %tier, capacity, bytes = zeroed.len(), "particle storage buffer allocated");
        Ok(Self {
            tier,
            capacity,
            layout,
            storage: Storage::Device { gpu, buffer },
        })
    }

    /// Double-buffered state textures for the render tier.
    pub fn state_textures(gpu: Arc<GpuDevice>, capacity: usize) -> Result<Self, SetupError> {
        let tier = Tier::Render;
        let limits = gpu.device.limits();
        check_capacity(tier, capacity, &limits)?;
        let columns = state_columns(capacity, limits.max_texture_dimension_2d);
        let rows = state_rows(capacity, columns);

        let create = |label: &str| -> Result<StateTexture, SetupError> {
            let texture = scoped(&gpu.device, wgpu::ErrorFilter::OutOfMemory, || {
                gpu.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(label),
                    size: wgpu::Extent3d {
                        width: columns * TEXELS_PER_PARTICLE,
                        height: rows,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: STATE_FORMAT,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_DST
                        | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                })
            })
            .map_err(|message| SetupError::Allocation {
                tier,
                name: label.to_string(),
                message,
            })?;
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            Ok(StateTexture { texture, view })
        };

        let state = StateTextures {
            textures: DoubleBuffer::new(create("Particle State A")?, create("Particle State B")?),
            columns,
            rows,
        };
        debug!(target: "tpe::buffer", %tier, capacity, columns, rows, "particle state textures allocated");
        Ok(Self {
            tier,
            capacity,
            layout: tier.layout(),
            storage: Storage::StateTextures { gpu, state },
        })
    }

    /// Host array plus an instance vertex buffer for the legacy tier.
    pub fn mirrored(gpu: Arc<GpuDevice>, capacity: usize) -> Result<Self, SetupError> {
        let tier = Tier::Legacy;
        check_capacity(tier, capacity, &gpu.device.limits())?;
        let layout = tier.layout();
        let host = vec![Particle::default(); capacity];
        let vertices = allocate_buffer(
            &gpu.device,
            tier,
            "Particle Vertex Buffer",
            &layout.encode(&host),
            wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
        )?;
        debug!(target: "tpe::buffer", %tier, capacity, "particle vertex buffer allocated");
        Ok(Self {
            tier,
            capacity,
            layout,
            storage: Storage::Mirrored { gpu, host, vertices },
        })
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stride and field offsets of the stored records.
    pub fn read_layout(&self) -> ParticleLayout {
        self.layout
    }

    /// Overwrite the first `particles.len()` slots.
    pub fn upload(&mut self, particles: &[Particle]) -> Result<(), CapacityError> {
        if particles.len() > self.capacity {
            return Err(CapacityError::TooManyParticles {
                requested: particles.len(),
                capacity: self.capacity,
            });
        }
        match &mut self.storage {
            Storage::Device { gpu, buffer } => {
                gpu.queue.write_buffer(buffer, 0, &self.layout.encode(particles));
            }
            Storage::StateTextures { gpu, state } => {
                write_state(gpu, state, &self.layout.encode(particles), particles.len());
            }
            Storage::Mirrored { gpu, host, vertices } => {
                host[..particles.len()].copy_from_slice(particles);
                gpu.queue.write_buffer(vertices, 0, &self.layout.encode(particles));
            }
            Storage::Host(host) => host[..particles.len()].copy_from_slice(particles),
        }
        debug!(target: "tpe::buffer", tier = %self.tier, count = particles.len(), "particles uploaded");
        Ok(())
    }

    /// Blocking copy of every slot. Meant for tooling and tests.
    pub fn readback(&self) -> Result<Vec<Particle>, EngineError> {
        let mut particles = match &self.storage {
            Storage::Device { gpu, buffer } => {
                let bytes = read_buffer(gpu, buffer, self.layout.bytes_for(self.capacity))
                    .map_err(EngineError::Readback)?;
                self.layout.decode(&bytes)
            }
            Storage::StateTextures { gpu, state } => {
                let bytes = read_texture(gpu, &state.textures.front().texture, TEXEL_BYTES)
                    .map_err(EngineError::Readback)?;
                self.layout.decode(&bytes)
            }
            Storage::Mirrored { host, .. } | Storage::Host(host) => host.clone(),
        };
        particles.truncate(self.capacity);
        Ok(particles)
    }

    /// The host copy on the CPU-simulated tiers.
    pub fn host_particles(&self) -> Option<&[Particle]> {
        match &self.storage {
            Storage::Mirrored { host, .. } | Storage::Host(host) => Some(host),
            _ => None,
        }
    }

    pub fn host_particles_mut(&mut self) -> Option<&mut [Particle]> {
        match &mut self.storage {
            Storage::Mirrored { host, .. } | Storage::Host(host) => Some(host),
            _ => None,
        }
    }

    /// Push the host copy to the vertex buffer. No-op off the legacy tier.
    pub fn sync_vertices(&self) {
        if let Storage::Mirrored { gpu, host, vertices } = &self.storage {
            gpu.queue.write_buffer(vertices, 0, &self.layout.encode(host));
        }
    }

    /// The buffer drawn as instance vertices on the compute and legacy tiers.
    pub fn vertex_buffer(&self) -> Option<&wgpu::Buffer> {
        match &self.storage {
            Storage::Device { buffer, .. } => Some(buffer),
            Storage::Mirrored { vertices, .. } => Some(vertices),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<&StateTextures> {
        match &self.storage {
            Storage::StateTextures { state, .. } => Some(state),
            _ => None,
        }
    }

    pub fn state_mut(&mut self) -> Option<&mut StateTextures> {
        match &mut self.storage {
            Storage::StateTextures { state, .. } => Some(state),
            _ => None,
        }
    }

    /// Release device memory now instead of on drop.
    pub fn destroy(&mut self) {
        match &mut self.storage {
            Storage::Device { buffer, .. } => buffer.destroy(),
            Storage::StateTextures { state, .. } => {
                for slot in state.textures.slots() {
                    slot.texture.destroy();
                }
            }
            Storage::Mirrored { host, vertices, .. } => {
                vertices.destroy();
                host.clear();
            }
            Storage::Host(host) => host.clear(),
        }
        self.capacity = 0;
    }
}

/// Write packed records into the front state texture, full rows first and
/// then the partial last row.
fn write_state(gpu: &GpuDevice, state: &StateTextures, bytes: &[u8], count: usize) {
    let columns = state.columns as usize;
    let row_bytes = columns * (TEXELS_PER_PARTICLE * TEXEL_BYTES) as usize;
    let full_rows = count / columns;
    let remainder = count % columns;
    let texture = &state.textures.front().texture;

    let mut write = |row: usize, particles: usize, data: &[u8]| {
        gpu.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: row as u32,
                    z: 0,
                },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(row_bytes as u32),
                rows_per_image: None,
            },
            wgpu::Extent3d {
                width: particles as u32 * TEXELS_PER_PARTICLE,
                height: if particles == columns { (data.len() / row_bytes) as u32 } else { 1 },
                depth_or_array_layers: 1,
            },
        );
    };

    if full_rows > 0 {
        write(0, columns, &bytes[..full_rows * row_bytes]);
    }
    if remainder > 0 {
        write(full_rows, remainder, &bytes[full_rows * row_bytes..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_buffer_alternates_by_parity() {
        let mut pair = DoubleBuffer::new("a", "b");
        assert_eq!((*pair.front(), *pair.back()), ("a", "b"));
        pair.flip();
        assert_eq!((*pair.front(), *pair.back()), ("b", "a"));
        pair.flip();
        assert_eq!(pair.frame(), 2);
        assert_eq!(pair.front_index(), 0);
        assert_ne!(pair.front_index(), pair.back_index());
    }

    #[test]
    fn writes_to_back_become_front_after_flip() {
        let mut pair = DoubleBuffer::new(0, 0);
        for value in 1..=5 {
            let next = *pair.front() + 1;
            *pair.back_mut() = next;
            pair.flip();
            assert_eq!(*pair.front(), value);
        }
    }

    #[test]
    fn host_upload_rejects_overflow() {
        let mut buffer = ParticleBuffer::host(4);
        let particles = vec![Particle::default(); 5];
        assert_eq!(
            buffer.upload(&particles),
            Err(CapacityError::TooManyParticles {
                requested: 5,
                capacity: 4
            })
        );
    }

    #[test]
    fn host_round_trip_is_exact() {
        let mut buffer = ParticleBuffer::host(3);
        let mut p = Particle::new(glam::Vec3::new(1.5, -2.0, 0.25), glam::Vec3::X);
        p.size = 0.75;
        buffer.upload(&[p]).unwrap();
        let back = buffer.readback().unwrap();
        assert_eq!(back.len(), 3);
        assert_eq!(back[0], p);
        assert!(!back[1].is_alive());
        assert_eq!(buffer.read_layout(), ParticleLayout::PACKED);
    }

    #[test]
    fn state_texture_shape() {
        assert_eq!(state_columns(1_000_000, 8192), 1000);
        assert_eq!(state_rows(1_000_000, 1000), 1000);
        assert_eq!(state_columns(10, 8192), 4);
        assert_eq!(state_rows(10, 4), 3);
        assert_eq!(state_columns(100_000_000, 2048), 682);
    }

    #[test]
    fn capacity_checks_use_device_limits() {
        let limits = wgpu::Limits::downlevel_webgl2_defaults();
        assert!(check_capacity(Tier::Legacy, 10_000, &limits).is_ok());
        assert!(matches!(
            check_capacity(Tier::Render, 100_000_000, &limits),
            Err(CapacityError::TextureTooLarge { .. })
        ));
        assert!(matches!(
            check_capacity(Tier::Compute, 100_000_000, &wgpu::Limits::default()),
            Err(CapacityError::BufferTooLarge { .. })
        ));
        assert!(check_capacity(Tier::Software, usize::MAX / 64, &limits).is_ok());
    }
}
