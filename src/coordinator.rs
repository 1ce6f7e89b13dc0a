//! Platoon coordinator - shared vehicle registry, leader assignment and
//! obstacle fan-out
//!
//! The registry is the only state shared between agents. Every access goes
//! through one mutex, which is never held across an await point, so an
//! obstacle broadcast cannot interleave with a target agent's own update.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::contracts::{Vehicle, VehicleId};
use crate::errors::{PlatoonError, Result};

/// Vehicles keyed by id
#[derive(Debug, Default)]
pub struct VehicleRegistry {
    vehicles: BTreeMap<VehicleId, Vehicle>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, vehicle: Vehicle) -> Result<()> {
        if self.vehicles.contains_key(&vehicle.id) {
            return Err(PlatoonError::DuplicateVehicle(vehicle.id));
        }
        self.vehicles.insert(vehicle.id, vehicle);
        Ok(())
    }

    pub fn remove(&mut self, id: VehicleId) -> Option<Vehicle> {
        self.vehicles.remove(&id)
    }

    pub fn get(&self, id: VehicleId) -> Option<&Vehicle> {
        self.vehicles.get(&id)
    }

    pub fn get_mut(&mut self, id: VehicleId) -> Result<&mut Vehicle> {
        self.vehicles.get_mut(&id).ok_or(PlatoonError::UnknownVehicle(id))
    }

    /// Speed of the vehicle's leader, if it has one that is still registered
    pub fn leader_speed(&self, id: VehicleId) -> Option<f64> {
        let leader = self.get(id)?.leader?;
        self.get(leader).map(|vehicle| vehicle.speed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.values()
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}

/// Cross-agent coordination over a shared registry
///
/// Cloning yields another handle to the same registry.
#[derive(Debug, Clone)]
pub struct PlatoonCoordinator {
    registry: Arc<Mutex<VehicleRegistry>>,
    obstacle_deceleration: f64,
}

impl PlatoonCoordinator {
    pub fn new(obstacle_deceleration: f64) -> Self {
        Self {
            registry: Arc::new(Mutex::new(VehicleRegistry::new())),
            obstacle_deceleration,
        }
    }

    pub fn register(&self, vehicle: Vehicle) -> Result<()> {
        let id = vehicle.id;
        self.registry.lock().insert(vehicle)?;
        debug!(vehicle_id = %id, "vehicle registered");
        Ok(())
    }

    pub fn remove(&self, id: VehicleId) -> Option<Vehicle> {
        self.registry.lock().remove(id)
    }

    /// Copy of one vehicle's current record
    pub fn snapshot(&self, id: VehicleId) -> Result<Vehicle> {
        self.registry
            .lock()
            .get(id)
            .cloned()
            .ok_or(PlatoonError::UnknownVehicle(id))
    }

    /// Copies of all records, ordered by id
    pub fn vehicles(&self) -> Vec<Vehicle> {
        self.registry.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn obstacle_deceleration(&self) -> f64 {
        self.obstacle_deceleration
    }

    /// Run `update` with exclusive access to the registry
    ///
    /// Agents use this to change their own record together with reads of
    /// their leader's.
    pub fn with_registry<R>(&self, update: impl FnOnce(&mut VehicleRegistry) -> R) -> R {
        update(&mut self.registry.lock())
    }

    /// Pick the furthest vehicle ahead in the same direction as leader
    ///
    /// Ties on position go to the lowest id. The follower adopts the leader's
    /// speed once; later changes on either side are not propagated until the
    /// next assignment. With no candidate ahead the current leader is kept.
    ///
    /// # Returns
    /// The newly assigned leader, or `None` if no candidate was found
    pub fn assign_leader(&self, id: VehicleId) -> Result<Option<VehicleId>> {
        let mut registry = self.registry.lock();

        let (direction, position) = {
            let vehicle = registry.get(id).ok_or(PlatoonError::UnknownVehicle(id))?;
            (vehicle.direction, vehicle.position)
        };

        let leader = registry
            .iter()
            .filter(|other| other.id != id && other.direction == direction && other.position > position)
            .fold(None::<&Vehicle>, |best, candidate| match best {
                Some(current) if current.position >= candidate.position => Some(current),
                _ => Some(candidate),
            })
            .map(|leader| (leader.id, leader.speed));

        let Some((leader_id, leader_speed)) = leader else {
            debug!(vehicle_id = %id, direction = ?direction, "no leader ahead");
            return Ok(None);
        };

        let follower = registry.get_mut(id)?;
        follower.leader = Some(leader_id);
        follower.set_speed(leader_speed);

        info!(
            vehicle_id = %id,
            leader_id = %leader_id,
            direction = ?direction,
            speed = leader_speed,
            "leader assigned"
        );
        Ok(Some(leader_id))
    }

    /// Flag an obstacle on every other vehicle and slow it by one step
    ///
    /// Vehicles already avoiding an obstacle are left alone.
    ///
    /// # Returns
    /// Number of vehicles notified
    pub fn broadcast_obstacle(&self, source: VehicleId) -> Result<usize> {
        let mut registry = self.registry.lock();
        if registry.get(source).is_none() {
            return Err(PlatoonError::UnknownVehicle(source));
        }

        let mut notified = 0;
        for vehicle in registry.vehicles.values_mut() {
            if vehicle.id == source || vehicle.obstacle_detected {
                continue;
            }
            vehicle.enter_obstacle_avoidance();
            vehicle.set_speed(vehicle.speed - self.obstacle_deceleration);
            notified += 1;

            debug!(
                vehicle_id = %vehicle.id,
                source_id = %source,
                speed = vehicle.speed,
                "decelerating for obstacle ahead"
            );
        }

        info!(source_id = %source, notified, "obstacle broadcast");
        Ok(notified)
    }
}
