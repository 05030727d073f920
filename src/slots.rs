// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Numbered preset slots on top of the record store.
//!
//! A slot table record, kept at a caller-chosen id, remembers which slots hold
//! a preset and which one is active. Slot `n`'s preset lives in the record
//! `table_id + 1 + n`.

use core::mem::size_of;
use alloc::vec::Vec;
use zerocopy::{AsBytes, FromBytes, Unaligned};
use crate::low_level::Flash;
use crate::{RecordId, StorageEngine, StorageError};

/// Number of preset slots.
pub const NB_SLOTS: usize = 10;

/// Conventional id of the slot table record.
pub const SLOT_TABLE_ID: RecordId = RecordId::from_tag(*b"MeID");

/// At-rest form of the slot table.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct SlotTable {
    pub active_slot: u8,
    /// One byte per slot, 1 if the slot holds a preset, 0 otherwise.
    pub slot_present: [u8; NB_SLOTS],
}

impl SlotTable {
    pub const SIZE: usize = size_of::<Self>();

    pub fn empty() -> Self {
        Self {
            active_slot: 0,
            slot_present: [0; NB_SLOTS],
        }
    }

    /// Checks that every field holds a value we would have written.
    pub fn check(&self) -> bool {
        usize::from(self.active_slot) < NB_SLOTS
            && self.slot_present.iter().all(|&p| p <= 1)
    }
}

pub struct SlotManager {
    table_id: RecordId,
    table: SlotTable,
    dirty: bool,
}

impl SlotManager {
    /// Loads the slot table kept in record `table_id`.
    ///
    /// If the table is missing or doesn't have the expected shape (first boot,
    /// or a build with a different slot count), every slot is emptied, any
    /// per-slot records are deleted, and the empty table is written back.
    pub fn init<F: Flash>(
        engine: &mut StorageEngine<'_, F>,
        table_id: RecordId,
    ) -> Result<Self, StorageError<F::Error>> {
        let table = match engine.load(table_id, SlotTable::SIZE as u32) {
            Ok(bytes) => SlotTable::read_from(&bytes[..]).filter(SlotTable::check),
            Err(StorageError::NotFound)
                | Err(StorageError::BufferTooSmall { .. })
                | Err(StorageError::Corrupt(_)) => None,
            Err(e) => return Err(e),
        };

        let manager = Self {
            table_id,
            table: table.unwrap_or_else(SlotTable::empty),
            dirty: false,
        };

        if table.is_none() {
            warn!("slot table {=u32} missing or stale, resetting", table_id.0);
            for slot in 0..NB_SLOTS as u8 {
                engine.delete(manager.slot_record(slot))?;
            }
            manager.persist(engine)?;
        }

        Ok(manager)
    }

    /// Record holding slot `slot`'s preset.
    pub fn slot_record(&self, slot: u8) -> RecordId {
        self.table_id.offset(1 + u32::from(slot))
    }

    pub fn table_id(&self) -> RecordId {
        self.table_id
    }

    pub fn table(&self) -> &SlotTable {
        &self.table
    }

    /// Notes that the active preset has been edited since it was saved or
    /// restored.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn active_slot(&self) -> u8 {
        self.table.active_slot
    }

    pub fn is_present(&self, slot: u8) -> bool {
        self.table.slot_present
            .get(usize::from(slot))
            .map_or(false, |&p| p == 1)
    }

    /// Length of the preset in `slot`, or 0 if there is none.
    pub fn size_of<F: Flash>(
        &self,
        engine: &StorageEngine<'_, F>,
        slot: u8,
    ) -> Result<u32, F::Error> {
        if usize::from(slot) >= NB_SLOTS {
            return Ok(0);
        }
        Ok(engine.size_of(self.slot_record(slot))?.unwrap_or(0))
    }

    /// Stores `bytes` as the preset in `slot` and makes it the active slot.
    /// Empty presets are ignored.
    pub fn save<F: Flash>(
        &mut self,
        engine: &mut StorageEngine<'_, F>,
        slot: u8,
        bytes: &[u8],
    ) -> Result<(), StorageError<F::Error>> {
        let index = Self::index(slot)?;
        if bytes.is_empty() {
            return Ok(());
        }

        engine.save(self.slot_record(slot), bytes)?;

        self.table.slot_present[index] = 1;
        self.table.active_slot = slot;
        self.dirty = false;
        self.persist(engine)
    }

    /// Reads the preset in `slot` and makes it the active slot. Returns `None`
    /// without touching anything if the slot is empty.
    pub fn restore<F: Flash>(
        &mut self,
        engine: &mut StorageEngine<'_, F>,
        slot: u8,
    ) -> Result<Option<Vec<u8>>, StorageError<F::Error>> {
        Self::index(slot)?;
        if !self.is_present(slot) {
            return Ok(None);
        }

        let record = self.slot_record(slot);
        let len = engine.size_of(record)?.ok_or(StorageError::NotFound)?;
        let bytes = engine.load(record, len)?;

        self.table.active_slot = slot;
        self.dirty = false;
        self.persist(engine)?;
        Ok(Some(bytes))
    }

    /// Deletes the preset in `slot`. The active slot can't be erased; asking
    /// to do so does nothing.
    pub fn erase<F: Flash>(
        &mut self,
        engine: &mut StorageEngine<'_, F>,
        slot: u8,
    ) -> Result<(), StorageError<F::Error>> {
        let index = Self::index(slot)?;
        if slot == self.table.active_slot {
            return Ok(());
        }

        engine.delete(self.slot_record(slot))?;
        self.table.slot_present[index] = 0;
        self.persist(engine)
    }

    fn index<E>(slot: u8) -> Result<usize, StorageError<E>> {
        let index = usize::from(slot);
        if index < NB_SLOTS {
            Ok(index)
        } else {
            Err(StorageError::InvalidSlot(slot))
        }
    }

    fn persist<F: Flash>(
        &self,
        engine: &mut StorageEngine<'_, F>,
    ) -> Result<(), StorageError<F::Error>> {
        engine.save(self.table_id, self.table.as_bytes())
    }
}
