/*!
 * Driver registry.
 *
 * A fixed-capacity arena of driver instances. Slots carry a generation so a
 * [`SlotId`] taken before a removal never aliases the instance that later
 * reuses the slot. Scans take a snapshot of ids with [`Registry::ids`], which
 * lets the logic driver remove instances in the middle of a scan.
 */
use std::fmt;

use serde::Serialize;
use tracing::debug;

use dropbus_core::types::{Address, DriverClass, RollingCounter, SerialNumber};

use crate::device::{DeviceError, DeviceFlags, LinkRate, Result};
use crate::driver::{DriverHandler, DriverInstance, RoleKind};

/// Stable handle to a registry slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: u32,
    generation: u32,
}

impl SlotId {
    /// Slot index
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Event types for the driver registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A driver committed an address or bound to a remote device
    Connected {
        /// The slot
        slot: SlotId,
        /// The committed address
        address: Address,
        /// The driver class
        driver_class: DriverClass,
        /// Serial of the device
        serial_number: SerialNumber,
    },
    /// A driver lost its device
    Disconnected {
        /// The slot
        slot: SlotId,
        /// The address it held
        address: Address,
        /// The driver class
        driver_class: DriverClass,
    },
    /// A broadcast proxy was created for an unclaimed device
    ProxyCreated {
        /// The slot
        slot: SlotId,
        /// Address of the device
        address: Address,
        /// The driver class
        driver_class: DriverClass,
    },
    /// A broadcast proxy was destroyed
    ProxyRemoved {
        /// The slot it occupied
        slot: SlotId,
        /// Address of the device
        address: Address,
        /// The driver class
        driver_class: DriverClass,
    },
}

/// Serializable view of one registry entry
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    /// Slot handle
    pub slot: String,
    /// Role of the instance
    pub role: RoleKind,
    /// Bus address
    pub address: Address,
    /// Serial number
    pub serial_number: String,
    /// Driver class
    pub driver_class: DriverClass,
    /// Flag names
    pub flags: Vec<&'static str>,
    /// Tick stamp
    pub rolling_counter: RollingCounter,
    /// Link rate
    pub link_rate: LinkRate,
}

#[derive(Debug)]
struct Slot<H> {
    generation: u32,
    entry: Option<DriverInstance<H>>,
}

/// Fixed-capacity store of driver instances
#[derive(Debug)]
pub struct Registry<H> {
    slots: Vec<Slot<H>>,
    capacity: usize,
    len: usize,
}

impl<H: DriverHandler> Registry<H> {
    /// Create an empty registry holding at most `capacity` instances
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            len: 0,
        }
    }

    /// Maximum number of instances
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the registry holds no instance
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether every slot is taken
    pub fn is_full(&self) -> bool {
        self.len >= self.capacity
    }

    /// Insert an instance
    pub fn insert(&mut self, instance: DriverInstance<H>) -> Result<SlotId> {
        if self.is_full() {
            return Err(DeviceError::RegistryFull(self.capacity));
        }

        let index = match self.slots.iter().position(|slot| slot.entry.is_none()) {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        slot.entry = Some(instance);
        self.len += 1;

        let id = SlotId {
            index: index as u32,
            generation: slot.generation,
        };
        debug!(slot = %id, "registered driver instance");
        Ok(id)
    }

    /// Remove an instance, invalidating its id
    pub fn remove(&mut self, id: SlotId) -> Option<DriverInstance<H>> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation {
            return None;
        }
        let instance = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        debug!(slot = %id, "removed driver instance");
        Some(instance)
    }

    /// Look up an instance
    pub fn get(&self, id: SlotId) -> Option<&DriverInstance<H>> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    /// Look up an instance mutably
    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut DriverInstance<H>> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// Look up an instance or fail with [`DeviceError::UnknownSlot`]
    pub fn try_get_mut(&mut self, id: SlotId) -> Result<&mut DriverInstance<H>> {
        self.get_mut(id)
            .ok_or_else(|| DeviceError::UnknownSlot(id.to_string()))
    }

    /// Whether `id` refers to a live instance
    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    /// Ids of all live instances in slot order
    pub fn ids(&self) -> Vec<SlotId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Iterate over live instances in slot order
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &DriverInstance<H>)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|instance| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    instance,
                )
            })
        })
    }

    /// Whether any instance other than `except` claims `address`
    pub fn address_claimed(&self, address: Address, except: Option<SlotId>) -> bool {
        self.iter().any(|(id, instance)| {
            Some(id) != except
                && instance.record().flags.is_claiming()
                && instance.record().address == address
        })
    }

    /// Whether an instance of `driver_class` is bound to `address`
    pub fn represents(&self, address: Address, driver_class: DriverClass) -> bool {
        self.iter().any(|(_, instance)| {
            let record = instance.record();
            record.driver_class == driver_class && record.address == address
        })
    }

    /// Number of instances whose flags contain `flags`
    pub fn count_with(&self, flags: DeviceFlags) -> usize {
        self.iter()
            .filter(|(_, instance)| instance.record().flags.contains(flags))
            .count()
    }

    /// Serializable view of every instance
    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.iter()
            .map(|(id, instance)| {
                let record = instance.record();
                DeviceSnapshot {
                    slot: id.to_string(),
                    role: instance.role_kind(),
                    address: record.address,
                    serial_number: record.serial_number.to_string(),
                    driver_class: record.driver_class,
                    flags: record.flags.names(),
                    rolling_counter: record.rolling_counter,
                    link_rate: record.link_rate,
                }
            })
            .collect()
    }
}
