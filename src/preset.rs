// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Presets: the effect parameters of the running patch, saved to and
//! restored from slots.

use alloc::vec::Vec;
use crate::codec::{Codec, Persistable};
use crate::low_level::Flash;
use crate::slots::{SlotManager, NB_SLOTS};
use crate::{RecordId, StorageEngine, StorageError};

/// Ordered set of objects making up a preset.
///
/// Objects are written back to back in registration order, so the order must
/// be the same for the build that saves a preset and the one that restores it.
#[derive(Default)]
pub struct Registry<'a> {
    objects: Vec<&'a mut dyn Persistable>,
}

impl<'a> Registry<'a> {
    pub fn new() -> Self {
        Self { objects: Vec::new() }
    }

    pub fn register(&mut self, object: &'a mut dyn Persistable) {
        self.objects.push(object);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn save_all(&self, codec: &mut Codec) {
        for object in &self.objects {
            object.save(codec);
        }
    }

    pub fn restore_all(&mut self, codec: &mut Codec) {
        for object in self.objects.iter_mut() {
            object.restore(codec);
        }
    }
}

/// Bounded effect parameter, such as a delay time or a mix level.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Parameter {
    value: f32,
    min: f32,
    max: f32,
}

impl Parameter {
    /// Returns `None` unless `min <= max` and neither is NaN.
    pub fn new(value: f32, min: f32, max: f32) -> Option<Self> {
        if !(min <= max) {
            return None;
        }
        let mut p = Self { value: min, min, max };
        p.set(value);
        Some(p)
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    /// Sets the value, clamped to the parameter's range. NaN is ignored.
    /// Returns whether the value changed.
    ///
    /// A parameter doesn't know which bank it belongs to: on a user edit,
    /// go through `PresetBank::set_parameter` (or call `PresetBank::edited`
    /// when this returns `true`) so the bank knows the preset was changed.
    pub fn set(&mut self, value: f32) -> bool {
        if value.is_nan() {
            return false;
        }
        let value = value.clamp(self.min, self.max);
        let changed = value != self.value;
        self.value = value;
        changed
    }
}

impl Persistable for Parameter {
    fn save(&self, codec: &mut Codec) {
        codec.push(self.value);
    }

    fn restore(&mut self, codec: &mut Codec) {
        let mut value = self.value;
        if codec.pull_into(&mut value) {
            self.set(value);
        }
    }
}

/// Slot bank as driven from the memory menu and MIDI program changes.
pub struct PresetBank {
    slots: SlotManager,
}

impl PresetBank {
    pub fn init<F: Flash>(
        engine: &mut StorageEngine<'_, F>,
        table_id: RecordId,
    ) -> Result<Self, StorageError<F::Error>> {
        Ok(Self { slots: SlotManager::init(engine, table_id)? })
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    /// Parameter edit hook: the active preset no longer matches its slot.
    pub fn edited(&mut self) {
        self.slots.mark_dirty();
    }

    /// Applies a user edit to `param`, marking the bank dirty if the value
    /// actually changed. Returns whether it changed.
    pub fn set_parameter(&mut self, param: &mut Parameter, value: f32) -> bool {
        let changed = param.set(value);
        if changed {
            self.edited();
        }
        changed
    }

    pub fn is_loadable(&self, slot: u8) -> bool {
        self.slots.is_present(slot)
    }

    /// A slot can be erased if it holds a preset that isn't the active one.
    pub fn is_erasable(&self, slot: u8) -> bool {
        self.slots.is_present(slot) && slot != self.slots.active_slot()
    }

    /// Serializes every registered object into `slot`.
    pub fn save_slot<F: Flash>(
        &mut self,
        engine: &mut StorageEngine<'_, F>,
        slot: u8,
        registry: &Registry<'_>,
    ) -> Result<(), StorageError<F::Error>> {
        let mut codec = Codec::new();
        registry.save_all(&mut codec);
        self.slots.save(engine, slot, codec.as_bytes())
    }

    /// Restores every registered object from `slot`. Returns `false`, leaving
    /// the objects untouched, if the slot is empty.
    pub fn restore_slot<F: Flash>(
        &mut self,
        engine: &mut StorageEngine<'_, F>,
        slot: u8,
        registry: &mut Registry<'_>,
    ) -> Result<bool, StorageError<F::Error>> {
        match self.slots.restore(engine, slot)? {
            Some(bytes) => {
                let mut codec = Codec::from(bytes);
                registry.restore_all(&mut codec);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Moves to the next loadable slot in the direction of `increment`,
    /// wrapping around the bank. Returns the slot restored, or `None` if no
    /// other slot holds a preset.
    pub fn step<F: Flash>(
        &mut self,
        engine: &mut StorageEngine<'_, F>,
        increment: i8,
        registry: &mut Registry<'_>,
    ) -> Result<Option<u8>, StorageError<F::Error>> {
        if increment == 0 {
            return Ok(None);
        }
        let active = i32::from(self.slots.active_slot());
        let nb = NB_SLOTS as i32;
        let mut slot = active;
        loop {
            slot = (slot + i32::from(increment)).rem_euclid(nb);
            if slot == active {
                return Ok(None);
            }
            let slot = slot as u8;
            if self.is_loadable(slot) {
                self.restore_slot(engine, slot, registry)?;
                return Ok(Some(slot));
            }
        }
    }

    /// Handles a MIDI program change: restores `program` if it holds a
    /// preset.
    pub fn program_change<F: Flash>(
        &mut self,
        engine: &mut StorageEngine<'_, F>,
        program: u8,
        registry: &mut Registry<'_>,
    ) -> Result<bool, StorageError<F::Error>> {
        if !self.is_loadable(program) {
            debug!("program change to empty slot {=u8}", program);
            return Ok(false);
        }
        self.restore_slot(engine, program, registry)
    }

    pub fn erase_slot<F: Flash>(
        &mut self,
        engine: &mut StorageEngine<'_, F>,
        slot: u8,
    ) -> Result<(), StorageError<F::Error>> {
        self.slots.erase(engine, slot)
    }
}
