// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod low_level;
pub mod codec;
pub mod slots;
pub mod preset;

use core::mem::size_of;
use alloc::vec::Vec;
use zerocopy::{AsBytes, FromBytes};
use crate::low_level::{BuildMarker, Constants, Flash};

pub use crate::low_level::{BlockAddress, RecordId, Region, StorageError};

/// Total size of the pedal's flash device.
pub const DEVICE_SIZE: u32 = 7 * 1024 * 1024;
/// Bytes at the start of the device holding read-only assets.
pub const ASSET_SIZE: u32 = 5 * 1024 * 1024;
/// Erase-sector size, and so the block size.
pub const SECTOR_SIZE: u32 = 4096;

/// Record holding the build marker.
pub const BUILD_MARKER_ID: RecordId = RecordId::from_tag(*b"PSMa");

pub struct StoreBuffers<F: Flash> {
    pub b0: F::Sector,
}

/// Key-to-bytes store over a region of raw NOR flash.
///
/// Nothing is cached in RAM: every operation works from what is on the flash,
/// scanning the region as needed. Operations block for as long as the device
/// takes to erase and program, which can run to milliseconds per block and
/// seconds for `init_region`, so this must only be driven from the main loop.
pub struct StorageEngine<'b, F: Flash> {
    flash: F,
    region: Region,
    buffers: &'b mut StoreBuffers<F>,
}

impl<'b, F: Flash> StorageEngine<'b, F> {
    /// Takes ownership of `flash` and manages `region` of it. The region is
    /// not inspected; see `mount` for the usual boot sequence.
    pub fn new(
        flash: F,
        region: Region,
        buffers: &'b mut StoreBuffers<F>,
    ) -> Result<Self, MountError<F>> {
        if region.block_size() != Constants::<F>::BLOCK_SIZE
            || region.end() > flash.size()
        {
            return Err(MountError { flash, cause: MountErrorCause::BadRegion });
        }
        Ok(Self { flash, region, buffers })
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Erases the whole region, destroying every record.
    pub fn init_region(&mut self) -> Result<(), F::Error> {
        info!("erasing region of {=u32} blocks", self.region.block_count());
        low_level::erase_region(&mut self.flash, &self.region)
    }

    pub fn find_first_block(&self, id: RecordId) -> Result<Option<BlockAddress>, F::Error> {
        low_level::find_first_block(&self.flash, &self.region, id)
    }

    pub fn find_free_block(&self, from: BlockAddress) -> Result<Option<BlockAddress>, F::Error> {
        low_level::find_free_block(&self.flash, &self.region, from)
    }

    /// Number of free blocks left in the region.
    pub fn free_blocks(&self) -> Result<u32, F::Error> {
        low_level::free_blocks(&self.flash, &self.region)
    }

    /// Blocks making up record `id`, head first.
    pub fn chain(&self, id: RecordId) -> Result<Vec<BlockAddress>, StorageError<F::Error>> {
        low_level::chain(&self.flash, &self.region, id)
    }

    /// Stores `data` as record `id`, replacing any previous contents.
    ///
    /// The previous record is erased before the new one is written, so if this
    /// fails (or power is lost) part way through, the record is gone.
    pub fn save(&mut self, id: RecordId, data: &[u8]) -> Result<(), StorageError<F::Error>> {
        debug!("saving record {=u32} ({=usize} bytes)", id.0, data.len());
        low_level::write_record(
            &mut self.flash,
            &mut self.buffers.b0,
            &self.region,
            id,
            data,
        )
    }

    /// Reads record `id`, provided it is no longer than `max_len`.
    pub fn load(&self, id: RecordId, max_len: u32) -> Result<Vec<u8>, StorageError<F::Error>> {
        low_level::read_record(&self.flash, &self.region, id, max_len)
    }

    /// Erases record `id`. Absent records are not an error.
    pub fn delete(&mut self, id: RecordId) -> Result<(), F::Error> {
        debug!("deleting record {=u32}", id.0);
        low_level::erase_record(&mut self.flash, &self.region, id)
    }

    /// Length of record `id`, if it exists.
    pub fn size_of(&self, id: RecordId) -> Result<Option<u32>, F::Error> {
        match self.find_first_block(id)? {
            Some(head) => Ok(Some(low_level::read_header(&self.flash, head)?.total_size.get())),
            None => Ok(None),
        }
    }

    /// Checks the build marker: the region needs formatting unless it carries
    /// an intact marker for `version` and this block size.
    pub fn needs_format(&self, version: u32) -> Result<bool, StorageError<F::Error>> {
        let bytes = match self.load(BUILD_MARKER_ID, size_of::<BuildMarker>() as u32) {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound)
                | Err(StorageError::BufferTooSmall { .. })
                | Err(StorageError::Corrupt(_)) => return Ok(true),
            Err(e) => return Err(e),
        };
        let intact = match BuildMarker::read_from(&bytes[..]) {
            Some(marker) => {
                marker.check()
                    && marker.version.get() == version
                    && marker.block_size.get() == Constants::<F>::BLOCK_SIZE
            }
            None => false,
        };
        Ok(!intact)
    }

    /// Erases the region and stamps it with a build marker for `version`.
    pub fn format(&mut self, version: u32) -> Result<(), StorageError<F::Error>> {
        self.init_region()?;
        let marker = BuildMarker::new(version, Constants::<F>::BLOCK_SIZE);
        self.save(BUILD_MARKER_ID, marker.as_bytes())
    }
}

/// What `mount` had to do.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MountOutcome {
    /// The region already held data from a compatible build.
    Mounted,
    /// The region was erased and re-stamped; all previous records are gone.
    Formatted,
}

/// Brings up the store at boot: checks the build marker in `region` and, if it
/// is missing or names a different `version`, erases the region and writes a
/// fresh marker.
pub fn mount<F: Flash>(
    flash: F,
    region: Region,
    buffers: &mut StoreBuffers<F>,
    version: u32,
) -> Result<(StorageEngine<'_, F>, MountOutcome), MountError<F>> {
    let mut engine = StorageEngine::new(flash, region, buffers)?;
    match mount_inner(&mut engine, version) {
        Ok(outcome) => {
            info!("store mounted: {}", outcome);
            Ok((engine, outcome))
        }
        Err(e) => Err(MountError {
            flash: engine.into_inner(),
            cause: MountErrorCause::Storage(e),
        }),
    }
}

fn mount_inner<F: Flash>(
    engine: &mut StorageEngine<'_, F>,
    version: u32,
) -> Result<MountOutcome, StorageError<F::Error>> {
    if engine.needs_format(version)? {
        warn!("build marker missing or stale, formatting");
        engine.format(version)?;
        Ok(MountOutcome::Formatted)
    } else {
        Ok(MountOutcome::Mounted)
    }
}

pub struct MountError<F: Flash> {
    flash: F,
    cause: MountErrorCause<F::Error>,
}

impl<F: Flash> MountError<F> {
    pub fn into_inner(self) -> F {
        self.flash
    }

    pub fn cause(&self) -> &MountErrorCause<F::Error> {
        &self.cause
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MountErrorCause<E> {
    /// The region doesn't fit the device or uses a different block size.
    BadRegion,
    Storage(StorageError<E>),
}

impl<E> From<StorageError<E>> for MountErrorCause<E> {
    fn from(e: StorageError<E>) -> Self {
        Self::Storage(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::low_level::tests::{small_region, FakeFlashError, SmallFlash};
    use proptest::prelude::*;

    fn buffers() -> StoreBuffers<SmallFlash> {
        StoreBuffers { b0: [0; 116] }
    }

    #[test]
    fn new_rejects_region_past_device() {
        let flash = SmallFlash::with_blocks(4);
        let region = Region::new::<SmallFlash>(0, 5).unwrap();
        let mut b = buffers();
        let err = StorageEngine::new(flash, region, &mut b).err().unwrap();
        assert_eq!(err.cause(), &MountErrorCause::BadRegion);
        assert_eq!(err.into_inner().size(), 4 * 116);
    }

    #[test]
    fn mount_blank_formats_then_mounts() {
        let (flash, region) = small_region(8);
        let mut b = buffers();

        let (engine, outcome) = mount(flash, region, &mut b, 1)
            .map_err(|e| *e.cause()).unwrap();
        assert_eq!(outcome, MountOutcome::Formatted);
        assert_eq!(engine.size_of(BUILD_MARKER_ID).unwrap(), Some(16));
        let flash = engine.into_inner();

        let (_, outcome) = mount(flash, region, &mut b, 1)
            .map_err(|e| *e.cause()).unwrap();
        assert_eq!(outcome, MountOutcome::Mounted);
    }

    #[test]
    fn version_change_wipes_records() {
        let (flash, region) = small_region(8);
        let mut b = buffers();

        let (mut engine, _) = mount(flash, region, &mut b, 1)
            .map_err(|e| *e.cause()).unwrap();
        engine.save(RecordId(7), b"keep me").unwrap();
        let flash = engine.into_inner();

        let (engine, outcome) = mount(flash, region, &mut b, 2)
            .map_err(|e| *e.cause()).unwrap();
        assert_eq!(outcome, MountOutcome::Formatted);
        assert_eq!(engine.size_of(RecordId(7)).unwrap(), None);
        assert_eq!(engine.free_blocks().unwrap(), 7);
    }

    #[test]
    fn garbage_marker_needs_format() {
        let (flash, region) = small_region(4);
        let mut b = buffers();
        let mut engine = StorageEngine::new(flash, region, &mut b)
            .map_err(|e| *e.cause()).unwrap();

        engine.save(BUILD_MARKER_ID, &[0; 16]).unwrap();
        assert!(engine.needs_format(0).unwrap());
        engine.save(BUILD_MARKER_ID, &[0; 40]).unwrap();
        assert!(engine.needs_format(0).unwrap());
    }

    #[test]
    fn mount_reports_device_error() {
        let (mut flash, region) = small_region(4);
        flash.fail_after = Some(0);
        let mut b = buffers();

        let err = mount(flash, region, &mut b, 1).err().unwrap();
        assert_eq!(
            err.cause(),
            &MountErrorCause::Storage(StorageError::Flash(FakeFlashError::Injected)),
        );
    }

    #[test]
    fn delete_absent_never_errors() {
        let (flash, region) = small_region(4);
        let mut b = buffers();
        let mut engine = StorageEngine::new(flash, region, &mut b)
            .map_err(|e| *e.cause()).unwrap();

        engine.delete(RecordId(1)).unwrap();
        engine.delete(RecordId(1)).unwrap();
        assert_eq!(engine.size_of(RecordId(1)).unwrap(), None);
        assert_eq!(engine.load(RecordId(1), 10), Err(StorageError::NotFound));
    }

    #[test]
    fn many_named_records_coexist() {
        let (flash, region) = small_region(16);
        let mut b = buffers();
        let mut engine = StorageEngine::new(flash, region, &mut b)
            .map_err(|e| *e.cause()).unwrap();

        let names: [&[u8]; 4] = [b"delay", b"tremolo", b"chorus", b"ui"];
        for (i, name) in names.iter().enumerate() {
            let value = vec![i as u8; 40 + 70 * i];
            engine.save(RecordId::from_name(name), &value).unwrap();
        }
        for (i, name) in names.iter().enumerate() {
            let value = engine.load(RecordId::from_name(name), 1000).unwrap();
            assert_eq!(value, vec![i as u8; 40 + 70 * i]);
        }
    }

    proptest! {
        #[test]
        fn save_load_round_trip(
            id in any::<u32>(),
            data in proptest::collection::vec(any::<u8>(), 0..=800),
        ) {
            let (flash, region) = small_region(8);
            let mut b = buffers();
            let mut engine = StorageEngine::new(flash, region, &mut b)
                .map_err(|e| *e.cause()).unwrap();

            engine.save(RecordId(id), &data).unwrap();
            prop_assert_eq!(engine.size_of(RecordId(id)).unwrap(), Some(data.len() as u32));
            prop_assert_eq!(engine.load(RecordId(id), data.len() as u32).unwrap(), data);
        }

        #[test]
        fn overwrite_leaves_no_orphans(
            a in proptest::collection::vec(any::<u8>(), 0..=400),
            b in proptest::collection::vec(any::<u8>(), 0..=400),
        ) {
            let (flash, region) = small_region(10);
            let mut bufs = buffers();
            let mut engine = StorageEngine::new(flash, region, &mut bufs)
                .map_err(|e| *e.cause()).unwrap();

            engine.save(RecordId(1), &a).unwrap();
            engine.save(RecordId(1), &b).unwrap();

            let used = 10 - engine.free_blocks().unwrap();
            prop_assert_eq!(used, low_level::bytes_to_blocks::<SmallFlash>(b.len() as u32));
            prop_assert_eq!(engine.chain(RecordId(1)).unwrap().len() as u32, used);
            prop_assert_eq!(engine.load(RecordId(1), 400).unwrap(), b);
        }
    }
}
