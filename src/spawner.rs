//! Spawners: points that respawned particles are placed around.
//!
//! The simulation does not count emissions. A dead particle picks one
//! registered spawner uniformly and reappears around it, so `rate` is only
//! advisory. With no spawners registered, particles reappear around the
//! world origin.

use glam::Vec3;

use crate::error::CapacityError;

/// Maximum number of spawners. Fixes the size of the GPU-side table.
pub const MAX_SPAWNERS: usize = 256;

/// Opaque spawner handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpawnerId(u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spawner {
    pub id: SpawnerId,
    pub position: Vec3,
    /// Particles per second.
    pub rate: f32,
}

/// Registered spawners plus their packed `[x, y, z, rate]` rows.
#[derive(Debug, Default)]
pub struct SpawnerRegistry {
    spawners: Vec<Spawner>,
    packed: Vec<[f32; 4]>,
    next_id: u64,
    revision: u64,
}

impl SpawnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, position: Vec3, rate: f32) -> Result<SpawnerId, CapacityError> {
        if self.spawners.len() >= MAX_SPAWNERS {
            return Err(CapacityError::TooManySpawners {
                limit: MAX_SPAWNERS,
            });
        }
        let id = SpawnerId(self.next_id);
        self.next_id += 1;
        self.spawners.push(Spawner {
            id,
            position,
            rate: rate.max(0.0),
        });
        self.repack();
        Ok(id)
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove(&mut self, id: SpawnerId) -> bool {
        let before = self.spawners.len();
        self.spawners.retain(|s| s.id != id);
        let removed = self.spawners.len() != before;
        if removed {
            self.repack();
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.spawners.is_empty() {
            self.spawners.clear();
            self.repack();
        }
    }

    pub fn get(&self, id: SpawnerId) -> Option<&Spawner> {
        self.spawners.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Spawner> {
        self.spawners.iter()
    }

    pub fn len(&self) -> usize {
        self.spawners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spawners.is_empty()
    }

    /// Packed rows in registration order.
    pub fn packed(&self) -> &[[f32; 4]] {
        &self.packed
    }

    /// Bumped on every change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn repack(&mut self) {
        self.packed = self
            .spawners
            .iter()
            .map(|s| [s.position.x, s.position.y, s.position.z, s.rate])
            .collect();
        self.revision += 1;
    }
}

/// Spawn origin for a uniform sample `r` in `[0, 1]` over packed rows.
///
/// Every row is equally likely; `rate` does not weight the pick.
pub fn pick_origin(rows: &[[f32; 4]], r: f32) -> Option<Vec3> {
    let count = rows.len();
    if count == 0 {
        return None;
    }
    let index = ((r * count as f32) as usize).min(count - 1);
    let [x, y, z, _] = rows[index];
    Some(Vec3::new(x, y, z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_repack() {
        let mut registry = SpawnerRegistry::new();
        let a = registry.add(Vec3::new(1.0, 2.0, 3.0), 10.0).unwrap();
        let b = registry.add(Vec3::new(-1.0, 0.0, 0.0), 5.0).unwrap();
        assert_eq!(registry.packed(), &[[1.0, 2.0, 3.0, 10.0], [-1.0, 0.0, 0.0, 5.0]]);
        let rev = registry.revision();

        assert!(registry.remove(a));
        assert!(!registry.remove(a));
        assert_eq!(registry.packed(), &[[-1.0, 0.0, 0.0, 5.0]]);
        assert!(registry.revision() > rev);
        assert_eq!(registry.get(b).map(|s| s.rate), Some(5.0));
    }

    #[test]
    fn failed_remove_keeps_revision() {
        let mut registry = SpawnerRegistry::new();
        let id = registry.add(Vec3::ZERO, 1.0).unwrap();
        registry.remove(id);
        let rev = registry.revision();
        registry.remove(id);
        registry.clear();
        assert_eq!(registry.revision(), rev);
    }

    #[test]
    fn ids_are_not_reused() {
        let mut registry = SpawnerRegistry::new();
        let a = registry.add(Vec3::ZERO, 1.0).unwrap();
        registry.remove(a);
        let b = registry.add(Vec3::ZERO, 1.0).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn registry_is_capped() {
        let mut registry = SpawnerRegistry::new();
        for i in 0..MAX_SPAWNERS {
            registry.add(Vec3::splat(i as f32), 1.0).unwrap();
        }
        assert_eq!(
            registry.add(Vec3::ZERO, 1.0),
            Err(CapacityError::TooManySpawners { limit: MAX_SPAWNERS })
        );
    }

    #[test]
    fn pick_covers_every_spawner() {
        let mut registry = SpawnerRegistry::new();
        assert_eq!(pick_origin(registry.packed(), 0.5), None);
        registry.add(Vec3::X, 1.0).unwrap();
        registry.add(Vec3::Y, 50.0).unwrap();
        let rows = registry.packed();
        assert_eq!(pick_origin(rows, 0.0), Some(Vec3::X));
        assert_eq!(pick_origin(rows, 0.49), Some(Vec3::X));
        assert_eq!(pick_origin(rows, 0.5), Some(Vec3::Y));
        assert_eq!(pick_origin(rows, 1.0), Some(Vec3::Y));
    }
}
