//! The exchange: extension table, registration, dialing, shutdown.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use pbx_core::Extension;

use super::error::RegistryError;
use super::gate::ShutdownGate;
use crate::unit::Unit;

/// Default number of extension slots.
pub const DEFAULT_MAX_EXTENSIONS: usize = 1024;

/// The private branch exchange.
///
/// Maps extensions to registered units and coordinates shutdown. Construct
/// one per server and share it as `Arc<Pbx>`.
///
/// # Locking
///
/// The slot table has its own lock, held only while a slot is read or
/// written. It is never held while waiting on a unit's lock, so the two
/// lock classes cannot form a cycle. `register` is the one place that holds
/// both, taking the unit's lock first.
pub struct Pbx {
    slots: Mutex<Slots>,
    gate: ShutdownGate,
    capacity: usize,
}

struct Slots {
    units: Vec<Option<Arc<Unit>>>,
    active: usize,

    /// Set by `shutdown`; rejects further registrations
    closing: bool,
}

impl Pbx {
    /// Creates an exchange with `capacity` extension slots (0..capacity).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                units: vec![None; capacity],
                active: 0,
                closing: false,
            }),
            gate: ShutdownGate::new(),
            capacity,
        }
    }

    /// Returns the number of extension slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of registered units.
    pub async fn active_count(&self) -> usize {
        self.slots.lock().await.active
    }

    /// Returns true once `shutdown` has been called.
    pub async fn is_closing(&self) -> bool {
        self.slots.lock().await.closing
    }

    /// Returns the unit registered at `extension`, if any.
    pub async fn lookup(&self, extension: Extension) -> Option<Arc<Unit>> {
        let slots = self.slots.lock().await;
        slots.units.get(extension.index()).cloned().flatten()
    }

    /// Plugs `unit` into the exchange at `extension`.
    ///
    /// Registration is all-or-nothing: on any error the table, the session
    /// count, and the unit are left untouched. On success the unit is sent
    /// `ON_HOOK <extension>` before any other unit can act on it; if that
    /// write fails the unit stays registered and the error is returned so
    /// the session can end and unregister.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ShuttingDown` once shutdown has begun
    /// - `RegistryError::AlreadyRegistered` if the unit has an extension
    /// - `RegistryError::ExtensionOutOfRange` if `extension >= capacity`
    /// - `RegistryError::ExtensionInUse` if the slot is taken
    /// - `RegistryError::Unit` if the initial notification fails
    pub async fn register(&self, unit: &Arc<Unit>, extension: Extension) -> Result<(), RegistryError> {
        // Held until the greeting is out: a dial that finds the new slot
        // waits for it. Unit before slot table; nothing locks the reverse.
        let line = unit.lock_line().await;

        {
            let mut slots = self.slots.lock().await;

            if slots.closing {
                return Err(RegistryError::ShuttingDown);
            }

            if let Some(existing) = unit.extension() {
                return Err(RegistryError::AlreadyRegistered(existing));
            }

            let slot = slots.units.get_mut(extension.index()).ok_or(
                RegistryError::ExtensionOutOfRange {
                    extension,
                    max: self.capacity,
                },
            )?;

            if slot.is_some() {
                return Err(RegistryError::ExtensionInUse(extension));
            }

            if let Err(existing) = unit.assign_extension(extension) {
                return Err(RegistryError::AlreadyRegistered(existing));
            }

            *slot = Some(Arc::clone(unit));
            slots.active += 1;
            self.gate.session_started();
        }

        info!(extension = %extension, unit = %unit.id(), "unit registered");

        line.notify_state().await?;
        Ok(())
    }

    /// Unplugs `unit` from the exchange.
    ///
    /// Frees the slot, hangs the unit up (moving any peer on), and drops
    /// the registry's reference. Unregistering a unit that is no longer in
    /// its slot is a no-op, so shutdown and a session ending on its own can
    /// race safely.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotRegistered` if the unit never had an extension
    /// - `RegistryError::Unit` if the forced hangup could not notify someone;
    ///   the unit is unregistered regardless
    pub async fn unregister(&self, unit: &Arc<Unit>) -> Result<(), RegistryError> {
        let extension = unit.extension().ok_or(RegistryError::NotRegistered)?;

        let removed = {
            let mut slots = self.slots.lock().await;
            let taken = slots
                .units
                .get_mut(extension.index())
                .filter(|slot| slot.as_ref().is_some_and(|held| Arc::ptr_eq(held, unit)))
                .and_then(Option::take);
            if taken.is_some() {
                slots.active = slots.active.saturating_sub(1);
            }
            taken
        };

        let Some(registry_ref) = removed else {
            debug!(extension = %extension, "unit already unregistered");
            return Ok(());
        };

        let result = unit.detach().await;
        drop(registry_ref);
        self.gate.session_ended();

        info!(extension = %extension, unit = %unit.id(), "unit unregistered");

        result.map_err(RegistryError::from)
    }

    /// Dials `extension` from `unit`.
    ///
    /// An unknown extension is passed on as "no target", which puts a unit
    /// in DIAL_TONE into ERROR. The lookup and the dial are separate steps;
    /// the unit's own locking decides whether the target can still be
    /// called at pairing time.
    pub async fn dial(&self, unit: &Arc<Unit>, extension: Extension) -> Result<(), RegistryError> {
        let target = self.lookup(extension).await;
        if target.is_none() {
            debug!(extension = %extension, unit = %unit.id(), "dialed unknown extension");
        }
        unit.dial(target.as_ref()).await?;
        Ok(())
    }

    /// Shuts the exchange down.
    ///
    /// Rejects further registrations, disconnects every registered unit,
    /// waits for all of their sessions to unregister, then releases the
    /// slot table. Calling it again only logs a warning.
    pub async fn shutdown(&self) {
        let units: Vec<Arc<Unit>> = {
            let mut slots = self.slots.lock().await;
            if slots.closing {
                warn!("shutdown already in progress");
                return;
            }
            slots.closing = true;
            slots.units.iter().flatten().cloned().collect()
        };

        info!(active = units.len(), "disconnecting registered units");
        for unit in &units {
            unit.disconnect();
        }
        drop(units);

        self.gate.wait_idle().await;

        let mut slots = self.slots.lock().await;
        slots.units.clear();
        slots.units.shrink_to_fit();
        info!("exchange shut down");
    }
}

impl Default for Pbx {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EXTENSIONS)
    }
}
