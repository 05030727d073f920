// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use core::mem::size_of;
use core::marker::PhantomData;
use core::borrow::{Borrow, BorrowMut};
use alloc::vec::Vec;
use zerocopy::{AsBytes, FromBytes, Unaligned};
use num_traits::FromPrimitive;

//////////////////////////////////////////////////////////////////////////////
// Convenience wrapper for zerocopy.

fn cast_prefix_mut<T>(bytes: &mut [u8]) -> (&mut T, &mut [u8])
    where T: AsBytes + FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in sector");
    (lv.into_mut(), rest)
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u32` in little-endian representation.
type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// Header written to the start of every block in the region.
///
/// A block holds one piece of a record. The record's pieces are chained
/// front-to-back through `next_block`, always in ascending address order, so
/// the lowest-addressed live block carrying a given `record_id` is the head of
/// its chain.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct BlockHeader {
    /// Record this block belongs to.
    pub record_id: U32LE,
    /// Length of the _entire_ record in bytes, repeated in every block of the
    /// chain. The length of this block's piece is implied: `DATA_SIZE` for all
    /// but the last block.
    pub total_size: U32LE,
    /// Absolute device address of the next block in the chain, or
    /// `BlockHeader::NO_NEXT` on the last block.
    pub next_block: U32LE,
    /// Block state marker; see `BlockMarker`.
    pub valid: U32LE,
}

impl BlockHeader {
    /// Value of `next_block` terminating a chain. This is the erased state, so
    /// a freshly erased header reads as "no successor".
    pub const NO_NEXT: u32 = 0xFFFF_FFFF;

    /// Decodes the state marker. `None` means the marker is neither of the two
    /// states we write -- a torn program or foreign data -- and the block must
    /// be treated as neither free nor live.
    pub fn marker(&self) -> Option<BlockMarker> {
        BlockMarker::from_u32(self.valid.get())
    }

    pub fn is_free(&self) -> bool {
        self.marker() == Some(BlockMarker::Erased)
    }

    pub fn is_live(&self) -> bool {
        self.marker() == Some(BlockMarker::Valid)
    }

    /// Checks whether this is a live block of record `id`.
    pub fn belongs_to(&self, id: RecordId) -> bool {
        self.is_live() && self.record_id.get() == id.0
    }
}

/// Defined values for the `BlockHeader::valid` field.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum BlockMarker {
    /// Written and live. (This is a distinctive bit pattern, not a checksum.)
    Valid = 0xAA55_AA55,
    /// The natural erased state of NOR flash: the block is free.
    Erased = 0xFFFF_FFFF,
}

/// Contents of the build marker record, used at boot to decide whether the
/// region holds data written by a compatible build.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct BuildMarker {
    /// Magic number (`EXPECTED_MAGIC`) distinguishing this from arbitrary data.
    pub magic: U32LE,
    /// Format version of the build that initialized the region.
    pub version: U32LE,
    /// Block size the region was laid out with.
    pub block_size: U32LE,
    /// CRC32 of the above data, in order.
    pub crc: U32LE,
}

impl BuildMarker {
    /// Bits we expect to find in the `magic` field: the tag `MaBU`.
    pub const EXPECTED_MAGIC: u32 = u32::from_be_bytes(*b"MaBU");

    pub fn new(version: u32, block_size: u32) -> Self {
        let mut marker = Self {
            magic: Self::EXPECTED_MAGIC.into(),
            version: version.into(),
            block_size: block_size.into(),
            crc: 0.into(),
        };
        marker.crc = marker.expected_crc().into();
        marker
    }

    /// Checks magic and CRC. This doesn't know the version or block size
    /// you're expecting, so you'll need to check those separately.
    pub fn check(&self) -> bool {
        self.magic.get() == Self::EXPECTED_MAGIC && self.crc_valid()
    }

    /// Compute the _expected_ CRC given all the other contents of `self`.
    pub fn expected_crc(&self) -> u32 {
        let algo = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let mut digest = algo.digest();
        digest.update(self.magic.as_bytes());
        digest.update(self.version.as_bytes());
        digest.update(self.block_size.as_bytes());

        digest.finalize()
    }

    pub fn crc_valid(&self) -> bool {
        self.crc.get() == self.expected_crc()
    }
}

//////////////////////////////////////////////////////////////////////////////
// Record identifiers.

/// Numeric identifier of a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordId(pub u32);

impl RecordId {
    /// Packs a four-character tag such as `b"MeID"`, first character in the
    /// most significant byte.
    pub const fn from_tag(tag: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(tag))
    }

    /// Derives an identifier from an arbitrary name using FNV-1a.
    ///
    /// Distinct names can collide; callers with a fixed set of names should
    /// check them against each other once.
    pub fn from_name(name: &[u8]) -> Self {
        const NAME_HASH_KEY: u64 = 0;

        use core::hash::{Hash, Hasher};

        let mut hasher = fnv::FnvHasher::with_key(NAME_HASH_KEY);
        name.hash(&mut hasher);
        let h = hasher.finish();
        Self(h as u32 ^ (h >> 32) as u32)
    }

    /// The identifier `n` places after this one, wrapping.
    pub const fn offset(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }
}

//////////////////////////////////////////////////////////////////////////////
// Flash device interface.

/// Size of the mid-sized erase unit offered by typical serial NOR parts.
pub const BLOCK32K: u32 = 32 * 1024;
/// Size of the large erase unit offered by typical serial NOR parts.
pub const BLOCK64K: u32 = 64 * 1024;

/// Trait describing a NOR flash device for the purposes of our store.
///
/// All operations block until the device has finished. Addresses are absolute
/// byte offsets into the device.
pub trait Flash {
    /// Type of sector, which is typically a `[u8; N]` for the erase-sector size
    /// `N`. The store uses one sector per block, so this also fixes the block
    /// size. It's a type rather than a `const` because of restrictions on the
    /// use of associated constants on type parameters in array sizes; see
    /// `rust-lang/rust#43408`.
    type Sector: Sized + BorrowMut<[u8]> + Borrow<[u8]>;

    /// Error type that can be produced during flash accesses.
    type Error;

    /// Returns the size of the device in bytes. This operation cannot fail and
    /// must always return the same result.
    fn size(&self) -> u32;

    /// Reads `dest.len()` bytes starting at `addr`.
    fn read(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` starting at `addr`. Bits can only go from 1 to 0; the
    /// target range is expected to be erased. The driver is responsible for
    /// splitting the write at physical page boundaries.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Erases the sector containing `addr`.
    fn erase_sector(&mut self, addr: u32) -> Result<(), Self::Error>;

    /// Erases the 32 KiB block starting at `addr`.
    fn erase_block32k(&mut self, addr: u32) -> Result<(), Self::Error>;

    /// Erases the 64 KiB block starting at `addr`.
    fn erase_block64k(&mut self, addr: u32) -> Result<(), Self::Error>;

    /// Erases the entire device.
    fn erase_chip(&mut self) -> Result<(), Self::Error>;

    /// Discards any CPU-side cached copy of `len` bytes at `addr`, so that the
    /// next read observes an erase. Only relevant for memory-mapped parts
    /// behind a data cache; the default does nothing.
    fn invalidate_cache(&mut self, addr: u32, len: u32) {
        let _ = (addr, len);
    }
}

/// Provides a way to hang constants off an implementation of the Flash trait
/// without them being overrideable to incorrect values by an implementation.
pub struct Constants<F>(PhantomData<F>);

impl<F: Flash> Constants<F> {
    /// Size of one block (one erase sector).
    pub const BLOCK_SIZE: u32 = size_of::<F::Sector>() as u32;
    /// Size of the header at the start of each block.
    pub const HEADER_SIZE: u32 = size_of::<BlockHeader>() as u32;
    /// Payload bytes carried by each block.
    pub const DATA_SIZE: u32 = Self::BLOCK_SIZE.saturating_sub(Self::HEADER_SIZE);
}

/// Handy routine for converting a record length to the number of blocks its
/// chain occupies. Empty records still take one block for the header.
pub fn bytes_to_blocks<F: Flash>(x: u32) -> u32 {
    let data_size = Constants::<F>::DATA_SIZE;
    let whole = x / data_size;
    u32::max(1, if x % data_size == 0 { whole } else { whole + 1 })
}

//////////////////////////////////////////////////////////////////////////////
// Region geometry.

/// Absolute device address of a block inside a `Region`.
///
/// These can only be obtained from a `Region`, which checks bounds and
/// alignment, so holding one means the address is safe to access.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockAddress(u32);

impl BlockAddress {
    pub fn get(self) -> u32 {
        self.0
    }
}

/// Contiguous run of blocks reserved for the store.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Region {
    base: u32,
    block_size: u32,
    block_count: u32,
}

impl Region {
    /// Describes `block_count` blocks starting at `base` on devices of type
    /// `F`.
    ///
    /// Returns `None` if `base` isn't sector-aligned, the region is empty or
    /// overflows the address space, or the device's sectors are too small to
    /// hold a block header and at least one byte of payload.
    pub fn new<F: Flash>(base: u32, block_count: u32) -> Option<Self> {
        let block_size = Constants::<F>::BLOCK_SIZE;
        if block_size <= Constants::<F>::HEADER_SIZE
            || block_count == 0
            || base % block_size != 0
        {
            return None;
        }
        // The end address must be representable, and must not collide with
        // the end-of-chain marker.
        let len = block_count.checked_mul(block_size)?;
        let end = base.checked_add(len)?;
        if end == BlockHeader::NO_NEXT {
            return None;
        }

        Some(Self { base, block_size, block_count })
    }

    /// Lays out the store on a device whose first `asset_size` bytes are
    /// reserved for the read-only asset area, using every whole block that
    /// remains up to `device_size`.
    pub fn split_device<F: Flash>(device_size: u32, asset_size: u32) -> Option<Self> {
        let block_count = device_size.checked_sub(asset_size)?
            / Constants::<F>::BLOCK_SIZE;
        Self::new::<F>(asset_size, block_count)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> u32 {
        self.block_size * self.block_count
    }

    /// Address just past the last block.
    pub fn end(&self) -> u32 {
        self.base + self.len()
    }

    /// Address of the first block.
    pub fn first(&self) -> BlockAddress {
        BlockAddress(self.base)
    }

    /// Address of block number `index`, if it exists.
    pub fn block(&self, index: u32) -> Option<BlockAddress> {
        if index < self.block_count {
            Some(BlockAddress(self.base + index * self.block_size))
        } else {
            None
        }
    }

    /// Block number of `addr` within the region, or `None` if `addr` belongs
    /// to some other region.
    pub fn index_of(&self, addr: BlockAddress) -> Option<u32> {
        self.check(addr.0).map(|a| (a.0 - self.base) / self.block_size)
    }

    /// Validates a raw address (e.g. a link read back from flash).
    pub fn check(&self, addr: u32) -> Option<BlockAddress> {
        if addr >= self.base
            && addr < self.end()
            && (addr - self.base) % self.block_size == 0
        {
            Some(BlockAddress(addr))
        } else {
            None
        }
    }

    /// The block just past `addr`, or `None` if `addr` is the last one.
    pub fn after(&self, addr: BlockAddress) -> Option<BlockAddress> {
        self.check(addr.0 + self.block_size)
    }

    /// Iterates over the blocks from `start` (inclusive) to the end of the
    /// region, in ascending order.
    pub fn blocks_from(&self, start: BlockAddress) -> impl Iterator<Item = BlockAddress> {
        let step = self.block_size as usize;
        (start.0..self.end()).step_by(step).map(BlockAddress)
    }

    /// Iterates over every block in the region.
    pub fn blocks(&self) -> impl Iterator<Item = BlockAddress> {
        self.blocks_from(self.first())
    }
}

//////////////////////////////////////////////////////////////////////////////
// Errors.

/// Things that can go wrong with store operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError<E> {
    /// No record with the requested id exists.
    NotFound,
    /// Not enough free blocks to hold the record. Nothing is left allocated
    /// under the record's id.
    OutOfSpace,
    /// The stored record is longer than the caller allowed for; `needed`
    /// gives its length.
    BufferTooSmall { needed: u32 },
    /// A chain could not be followed: the block at the given address has a
    /// link outside the region, belongs to another record, or the chain does
    /// not match its recorded length.
    Corrupt(u32),
    /// A slot number outside `0..NB_SLOTS` was given. Only returned by the
    /// `slots` layer; record operations never produce it.
    InvalidSlot(u8),
    /// An underlying flash access error occurred.
    Flash(E),
}

impl<E> From<E> for StorageError<E> {
    fn from(e: E) -> Self {
        Self::Flash(e)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Block scanning.

/// Reads the header of the block at `addr`.
pub fn read_header<F: Flash>(
    flash: &F,
    addr: BlockAddress,
) -> Result<BlockHeader, F::Error> {
    let mut header = BlockHeader::new_zeroed();
    flash.read(addr.get(), header.as_bytes_mut())?;
    Ok(header)
}

/// Scans the region from its start for the first live block of record `id`,
/// which is the head of that record's chain.
pub fn find_first_block<F: Flash>(
    flash: &F,
    region: &Region,
    id: RecordId,
) -> Result<Option<BlockAddress>, F::Error> {
    for addr in region.blocks() {
        if read_header(flash, addr)?.belongs_to(id) {
            return Ok(Some(addr));
        }
    }
    Ok(None)
}

/// Scans the region from `from` (inclusive) towards its end for the first free
/// block. The scan does not wrap around: chains are allocated strictly upwards,
/// which is what keeps a chain's head at its lowest address.
pub fn find_free_block<F: Flash>(
    flash: &F,
    region: &Region,
    from: BlockAddress,
) -> Result<Option<BlockAddress>, F::Error> {
    for addr in region.blocks_from(from) {
        if read_header(flash, addr)?.is_free() {
            return Ok(Some(addr));
        }
    }
    Ok(None)
}

/// Counts the free blocks in the region.
pub fn free_blocks<F: Flash>(
    flash: &F,
    region: &Region,
) -> Result<u32, F::Error> {
    let mut n = 0;
    for addr in region.blocks() {
        if read_header(flash, addr)?.is_free() {
            n += 1;
        }
    }
    Ok(n)
}

/// Decodes the link out of `header` (read from `addr`).
fn next_link<E>(
    region: &Region,
    addr: BlockAddress,
    header: &BlockHeader,
) -> Result<Option<BlockAddress>, StorageError<E>> {
    match header.next_block.get() {
        BlockHeader::NO_NEXT => Ok(None),
        raw => match region.check(raw) {
            // Links only ever point forward; anything else could loop.
            Some(next) if next > addr => Ok(Some(next)),
            _ => Err(StorageError::Corrupt(addr.get())),
        },
    }
}

/// Follows the chain of record `id` starting at `head`, presenting each block
/// to `visit` in order. Returns the number of blocks visited.
///
/// Every block on the way must be a live block of `id` with a forward link
/// inside the region, or the walk stops with `Corrupt`.
pub fn walk_chain<F: Flash>(
    flash: &F,
    region: &Region,
    id: RecordId,
    head: BlockAddress,
    mut visit: impl FnMut(BlockAddress, &BlockHeader) -> Result<(), StorageError<F::Error>>,
) -> Result<u32, StorageError<F::Error>> {
    let mut current = Some(head);
    let mut count = 0;

    while let Some(addr) = current {
        let header = read_header(flash, addr)?;
        if !header.belongs_to(id) {
            return Err(StorageError::Corrupt(addr.get()));
        }
        visit(addr, &header)?;
        count += 1;
        current = next_link(region, addr, &header)?;
    }

    Ok(count)
}

/// Lists the blocks of record `id`, head first. An absent record gives an
/// empty list.
pub fn chain<F: Flash>(
    flash: &F,
    region: &Region,
    id: RecordId,
) -> Result<Vec<BlockAddress>, StorageError<F::Error>> {
    let mut blocks = Vec::new();
    if let Some(head) = find_first_block(flash, region, id)? {
        walk_chain(flash, region, id, head, |addr, _| {
            blocks.push(addr);
            Ok(())
        })?;
    }
    Ok(blocks)
}

//////////////////////////////////////////////////////////////////////////////
// Record operations.

/// Reads record `id` into a new buffer, refusing records longer than `max_len`.
///
/// The record's length comes from the head block; each block then contributes
/// `DATA_SIZE` bytes, except the last, which contributes whatever remains.
pub fn read_record<F: Flash>(
    flash: &F,
    region: &Region,
    id: RecordId,
    max_len: u32,
) -> Result<Vec<u8>, StorageError<F::Error>> {
    let head = find_first_block(flash, region, id)?
        .ok_or(StorageError::NotFound)?;
    let total_size = read_header(flash, head)?.total_size.get();
    if total_size > max_len {
        return Err(StorageError::BufferTooSmall { needed: total_size });
    }
    // A length the region couldn't hold means a damaged head; don't allocate
    // for it.
    if bytes_to_blocks::<F>(total_size) > region.block_count() {
        warn!("record {=u32} claims {=u32} bytes", id.0, total_size);
        return Err(StorageError::Corrupt(head.get()));
    }

    let data_size = Constants::<F>::DATA_SIZE as usize;
    let header_size = Constants::<F>::HEADER_SIZE;
    let mut out = alloc::vec![0; total_size as usize];
    let mut filled = 0;

    let blocks = walk_chain(flash, region, id, head, |addr, header| {
        // Every block repeats the record length; a block disagreeing with the
        // head can't be part of the same write.
        if header.total_size.get() != total_size {
            return Err(StorageError::Corrupt(addr.get()));
        }
        let n = usize::min(out.len() - filled, data_size);
        flash.read(addr.get() + header_size, &mut out[filled..filled + n])?;
        filled += n;
        Ok(())
    })?;

    if filled != out.len() || blocks != bytes_to_blocks::<F>(total_size) {
        warn!("record {=u32} chain does not match its length", id.0);
        return Err(StorageError::Corrupt(head.get()));
    }

    Ok(out)
}

/// Erases every block of record `id`. Does nothing if the record does not
/// exist.
///
/// Chains are erased front to back. A chain whose link is damaged is erased up
/// to the damage; any blocks of `id` left behind (by that, or by an earlier
/// interrupted erase) are then found by rescanning and erased too, so only
/// device errors are reported.
pub fn erase_record<F: Flash>(
    flash: &mut F,
    region: &Region,
    id: RecordId,
) -> Result<(), F::Error> {
    let block_size = region.block_size();

    // Each pass erases at least the block it starts from, so this bounds the
    // number of passes.
    for pass in 0..region.block_count() {
        let head = match find_first_block(flash, region, id)? {
            Some(head) => head,
            None => return Ok(()),
        };
        if pass > 0 {
            warn!("record {=u32} had stray blocks, erasing", id.0);
        }

        let mut current = Some(head);
        while let Some(addr) = current {
            let header = read_header(flash, addr)?;
            if !header.belongs_to(id) {
                break;
            }
            // Pick up the link before the erase destroys it.
            current = next_link::<F::Error>(region, addr, &header).unwrap_or(None);

            flash.erase_sector(addr.get())?;
            flash.invalidate_cache(addr.get(), block_size);
            trace!("erased block {=u32} of record {=u32}", addr.get(), id.0);
        }
    }
    Ok(())
}

/// Writes record `id` holding `data`, replacing any previous record with that
/// id.
///
/// The old record is erased _first_, so an interruption part way through loses
/// it. The new chain is then written block by block: each block is allocated
/// first-fit, scanning upwards from just past the previous one, and is
/// programmed in a single write holding its header, its link to the next block,
/// and its piece of `data`.
///
/// If the region runs out of free blocks, whatever was written is erased again
/// and `OutOfSpace` is returned. On a device error the partial chain is erased
/// on a best-effort basis and the error is returned.
pub fn write_record<F: Flash>(
    flash: &mut F,
    buffer: &mut F::Sector,
    region: &Region,
    id: RecordId,
    data: &[u8],
) -> Result<(), StorageError<F::Error>> {
    erase_record(flash, region, id)?;

    match write_chain(flash, buffer, region, id, data) {
        Ok(()) => Ok(()),
        Err(StorageError::OutOfSpace) => {
            warn!("out of space writing record {=u32}, rolling back", id.0);
            erase_record(flash, region, id)?;
            Err(StorageError::OutOfSpace)
        }
        Err(e) => {
            let _ = erase_record(flash, region, id);
            Err(e)
        }
    }
}

fn write_chain<F: Flash>(
    flash: &mut F,
    buffer: &mut F::Sector,
    region: &Region,
    id: RecordId,
    data: &[u8],
) -> Result<(), StorageError<F::Error>> {
    let total_size = u32::try_from(data.len())
        .map_err(|_| StorageError::OutOfSpace)?;
    let data_size = Constants::<F>::DATA_SIZE as usize;

    let mut current = find_free_block(flash, region, region.first())?;
    let mut remaining = data;

    loop {
        let addr = current.ok_or(StorageError::OutOfSpace)?;

        let (piece, rest) = remaining.split_at(usize::min(remaining.len(), data_size));
        // The link has to be known before this block is programmed.
        let next = if rest.is_empty() {
            None
        } else {
            match region.after(addr) {
                Some(from) => find_free_block(flash, region, from)?,
                None => None,
            }
        };

        let (header, payload) = cast_prefix_mut::<BlockHeader>((*buffer).borrow_mut());
        *header = BlockHeader {
            record_id: id.0.into(),
            total_size: total_size.into(),
            next_block: next.map_or(BlockHeader::NO_NEXT, BlockAddress::get).into(),
            valid: (BlockMarker::Valid as u32).into(),
        };
        let (used, unused) = payload.split_at_mut(piece.len());
        used.copy_from_slice(piece);
        // Leave the slack erased.
        unused.fill(0xFF);

        flash.program(addr.get(), (*buffer).borrow())?;
        trace!("wrote block {=u32} of record {=u32}", addr.get(), id.0);

        remaining = rest;
        if remaining.is_empty() {
            return Ok(());
        }
        current = next;
    }
}

/// Erases every block in the region, using the largest erase command that fits
/// at each step (64 KiB, then 32 KiB, then single sectors) to keep the command
/// count down.
pub fn erase_region<F: Flash>(
    flash: &mut F,
    region: &Region,
) -> Result<(), F::Error> {
    let block_size = region.block_size();
    let end = region.end();
    let mut addr = region.base();

    // A large erase may only be used where it covers whole blocks.
    let fits = |unit: u32, addr: u32| {
        unit % block_size == 0 && addr % unit == 0 && end - addr >= unit
    };

    while addr < end {
        if fits(BLOCK64K, addr) {
            flash.erase_block64k(addr)?;
            addr += BLOCK64K;
        } else if fits(BLOCK32K, addr) {
            flash.erase_block32k(addr)?;
            addr += BLOCK32K;
        } else {
            flash.erase_sector(addr)?;
            addr += block_size;
        }
    }

    flash.invalidate_cache(region.base(), region.len());
    Ok(())
}
