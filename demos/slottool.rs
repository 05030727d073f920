// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Inspects and edits a store held in a flash image file.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use anyhow::{anyhow, bail, Context};
use clap::Parser;
use pedal_store::low_level::{self, BlockMarker, Flash, BLOCK32K, BLOCK64K};
use pedal_store::slots::{SlotManager, NB_SLOTS, SLOT_TABLE_ID};
use pedal_store::{RecordId, Region, StorageEngine, StorageError, StoreBuffers};

#[derive(Parser)]
struct Slottool {
    /// Erase-sector size of the imaged device.
    #[clap(short, long, default_value_t = 4096)]
    sector_size: u32,

    /// Byte offset of the store region within the image. The region runs to
    /// the end of the file.
    #[clap(short, long, default_value_t = 0)]
    base: u32,

    image_file: std::path::PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Creates a blank (fully erased) image file.
    Create {
        #[clap(default_value_t = pedal_store::DEVICE_SIZE)]
        size: u32,
    },
    /// Erases the region and writes a build marker.
    Format {
        #[clap(default_value_t = 1)]
        version: u32,
    },
    /// Reports the build marker state and the integrity of every record.
    Check {
        #[clap(default_value_t = 1)]
        version: u32,
    },
    Save {
        key: String,
        value: String,
    },
    Load {
        key: String,
        #[clap(long, default_value_t = 65536)]
        max: u32,
    },
    Delete {
        key: String,
    },
    Size {
        key: String,
    },
    /// Prints the header of every block in the region.
    Dump,
    /// Prints the slot table. Slot commands take `--table` to use a table
    /// other than the conventional one.
    Slots {
        #[clap(long)]
        table: Option<String>,
    },
    SlotSave {
        slot: u8,
        value: String,
        #[clap(long)]
        table: Option<String>,
    },
    SlotRestore {
        slot: u8,
        #[clap(long)]
        table: Option<String>,
    },
    SlotErase {
        slot: u8,
        #[clap(long)]
        table: Option<String>,
    },
    /// Runs commands interactively against the image.
    Shell,
}

#[derive(Parser)]
#[clap(no_binary_name = true)]
struct ShellLine {
    #[clap(subcommand)]
    cmd: Cmd,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Slottool::parse();

    if let Cmd::Create { size } = args.cmd {
        return create_image(&args.image_file, size, args.sector_size);
    }

    match args.sector_size {
        128 => specialized_main::<128>(args)?,
        4096 => specialized_main::<4096>(args)?,
        x => bail!("unsupported sector size {x}"),
    }

    Ok(())
}

fn create_image(path: &std::path::Path, size: u32, sector_size: u32) -> anyhow::Result<()> {
    if size % sector_size != 0 {
        bail!("image size must be a whole number of sectors");
    }
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("creating image file {}", path.display()))?;
    let erased = vec![0xFF; sector_size as usize];
    for _ in 0..size / sector_size {
        f.write_all(&erased)?;
    }
    println!("created {} byte image", size);
    Ok(())
}

fn specialized_main<const S: usize>(args: Slottool) -> Result<(), anyhow::Error> {
    let img = FlashImage::<S>::open(&args.image_file)
        .with_context(|| {
            format!("opening image file {}", args.image_file.display())
        })?;

    let block_count = img.size().checked_sub(args.base)
        .map(|len| len / S as u32)
        .ok_or_else(|| anyhow!("base is past the end of the image"))?;
    let region = Region::new::<FlashImage<S>>(args.base, block_count)
        .ok_or_else(|| anyhow!("no usable region at base {:#x}", args.base))?;

    let mut buffers = StoreBuffers { b0: [0; S] };
    let mut engine = StorageEngine::new(img, region, &mut buffers)
        .map_err(|e| anyhow!("could not open store: {:?}", e.cause()))?;

    match args.cmd {
        Cmd::Shell => shell(&mut engine),
        cmd => run(&mut engine, cmd),
    }
}

fn shell<const S: usize>(engine: &mut StorageEngine<'_, FlashImage<S>>) -> anyhow::Result<()> {
    let mut rl = rustyline::Editor::<()>::new()?;
    loop {
        let line = match rl.readline("store> ") {
            Ok(line) => line,
            Err(rustyline::error::ReadlineError::Interrupted)
                | Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        rl.add_history_entry(line.as_str());
        if words == ["quit"] || words == ["exit"] {
            break;
        }

        match ShellLine::try_parse_from(words) {
            Ok(ShellLine { cmd: Cmd::Create { .. } | Cmd::Shell }) => {
                println!("not available from the shell");
            }
            Ok(ShellLine { cmd }) => {
                if let Err(e) = run(engine, cmd) {
                    println!("error: {e:#}");
                }
            }
            Err(e) => println!("{e}"),
        }
    }
    Ok(())
}

fn run<const S: usize>(
    engine: &mut StorageEngine<'_, FlashImage<S>>,
    cmd: Cmd,
) -> anyhow::Result<()> {
    match cmd {
        Cmd::Create { .. } | Cmd::Shell => unreachable!(),
        Cmd::Format { version } => {
            println!("formatting {} blocks", engine.region().block_count());
            storage(engine.format(version))?;
            println!("done");
        }
        Cmd::Check { version } => check(engine, version)?,
        Cmd::Save { key, value } => {
            let id = parse_key(&key)?;
            match engine.save(id, value.as_bytes()) {
                Ok(()) => println!("ok"),
                Err(StorageError::OutOfSpace) => println!("no space"),
                Err(e) => println!("error: {e:?}"),
            }
        }
        Cmd::Load { key, max } => {
            let id = parse_key(&key)?;
            match engine.load(id, max) {
                Ok(value) => println!("{}", pretty_hex::pretty_hex(&value)),
                Err(StorageError::NotFound) => println!("not found"),
                Err(e) => println!("error: {e:?}"),
            }
        }
        Cmd::Delete { key } => {
            engine.delete(parse_key(&key)?)?;
            println!("ok");
        }
        Cmd::Size { key } => {
            match engine.size_of(parse_key(&key)?)? {
                Some(n) => println!("{n} bytes"),
                None => println!("not found"),
            }
        }
        Cmd::Dump => dump(engine)?,
        Cmd::Slots { table } => {
            let slots = storage(SlotManager::init(engine, table_id(table)?))?;
            println!("active slot {}", slots.active_slot());
            for slot in 0..NB_SLOTS as u8 {
                if slots.is_present(slot) {
                    println!("- slot {slot}: {} bytes", slots.size_of(engine, slot)?);
                }
            }
        }
        Cmd::SlotSave { slot, value, table } => {
            let mut slots = storage(SlotManager::init(engine, table_id(table)?))?;
            storage(slots.save(engine, slot, value.as_bytes()))?;
            println!("ok");
        }
        Cmd::SlotRestore { slot, table } => {
            let mut slots = storage(SlotManager::init(engine, table_id(table)?))?;
            match storage(slots.restore(engine, slot))? {
                Some(value) => println!("{}", pretty_hex::pretty_hex(&value)),
                None => println!("slot {slot} is empty"),
            }
        }
        Cmd::SlotErase { slot, table } => {
            let mut slots = storage(SlotManager::init(engine, table_id(table)?))?;
            if slot == slots.active_slot() {
                println!("slot {slot} is active and won't be erased");
            } else {
                storage(slots.erase(engine, slot))?;
                println!("ok");
            }
        }
    }
    Ok(())
}

fn check<const S: usize>(
    engine: &StorageEngine<'_, FlashImage<S>>,
    version: u32,
) -> anyhow::Result<()> {
    let region = *engine.region();
    println!("region at {:#x}, {} blocks of {} bytes",
        region.base(), region.block_count(), region.block_size());

    if storage(engine.needs_format(version))? {
        println!("- build marker for version {version} is MISSING or stale");
    } else {
        println!("- build marker for version {version} ok");
    }
    println!("- {} blocks free", engine.free_blocks()?);

    let mut ids = BTreeSet::new();
    let mut stray = 0;
    for addr in region.blocks() {
        let header = low_level::read_header(engine.flash(), addr)?;
        match header.marker() {
            Some(BlockMarker::Valid) => {
                ids.insert(header.record_id.get());
            }
            Some(BlockMarker::Erased) => (),
            None => stray += 1,
        }
    }
    if stray != 0 {
        println!("- {stray} blocks with an unrecognized marker");
    }

    for id in ids {
        let id = RecordId(id);
        match engine.chain(id) {
            Ok(blocks) => {
                let size = engine.size_of(id)?.unwrap_or(0);
                let needed = low_level::bytes_to_blocks::<FlashImage<S>>(size);
                if blocks.len() as u32 == needed {
                    println!("- record {:#010x}: {size} bytes in {needed} blocks", id.0);
                } else {
                    println!("- record {:#010x}: {size} bytes but {} blocks (expected {needed})",
                        id.0, blocks.len());
                }
            }
            Err(e) => println!("- record {:#010x}: BAD ({e:?})", id.0),
        }
    }
    Ok(())
}

fn dump<const S: usize>(engine: &StorageEngine<'_, FlashImage<S>>) -> anyhow::Result<()> {
    let region = *engine.region();
    for (index, addr) in region.blocks().enumerate() {
        let header = low_level::read_header(engine.flash(), addr)?;
        match header.marker() {
            Some(BlockMarker::Erased) => continue,
            Some(BlockMarker::Valid) => {
                println!("block {} at {:#x}", index, addr.get());
                println!("- record {:#010x}", header.record_id.get());
                println!("- total size {}", header.total_size.get());
                match header.next_block.get() {
                    low_level::BlockHeader::NO_NEXT => println!("- last in chain"),
                    next => println!("- next block at {next:#x}"),
                }
            }
            None => {
                println!("block {} at {:#x}", index, addr.get());
                println!("- unrecognized marker {:#010x}", header.valid.get());
            }
        }
    }
    Ok(())
}

/// Accepts `0x`-prefixed hex or decimal ids, `tag:XXXX` four-character tags,
/// and hashes anything else as a name.
fn parse_key(key: &str) -> anyhow::Result<RecordId> {
    if let Some(hex) = key.strip_prefix("0x") {
        return Ok(RecordId(u32::from_str_radix(hex, 16).context("bad hex id")?));
    }
    if let Some(tag) = key.strip_prefix("tag:") {
        let tag: [u8; 4] = tag.as_bytes().try_into()
            .map_err(|_| anyhow!("tags are four bytes"))?;
        return Ok(RecordId::from_tag(tag));
    }
    if !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(RecordId(key.parse().context("bad id")?));
    }
    Ok(RecordId::from_name(key.as_bytes()))
}

/// Slot table record: the given key, or the conventional one.
fn table_id(table: Option<String>) -> anyhow::Result<RecordId> {
    table.map_or(Ok(SLOT_TABLE_ID), |t| parse_key(&t))
}

fn storage<T>(r: Result<T, StorageError<std::io::Error>>) -> anyhow::Result<T> {
    r.map_err(|e| anyhow!("store error: {e:?}"))
}

/// Flash device backed by an image file, with NOR program semantics.
struct FlashImage<const S: usize> {
    file: RefCell<std::fs::File>,
    size: u32,
}

impl<const S: usize> FlashImage<S> {
    fn open(path: impl AsRef<std::path::Path>) -> Result<Self, anyhow::Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        if file_len % S as u64 != 0 {
            bail!("file is not a whole number of sectors in length");
        }
        let size = u32::try_from(file_len).context("file too large")?;

        Ok(Self {
            file: file.into(),
            size,
        })
    }

    fn fill_erased(&self, addr: u32, len: u32) -> Result<(), std::io::Error> {
        let len = len.min(self.size.saturating_sub(addr));
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.write_all(&vec![0xFF; len as usize])
    }
}

impl<const S: usize> Flash for FlashImage<S> {
    type Sector = [u8; S];
    type Error = std::io::Error;

    fn size(&self) -> u32 {
        self.size
    }

    fn read(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.read_exact(dest)
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        // Programming can only clear bits.
        let mut current = vec![0; data.len()];
        self.read(addr, &mut current)?;
        for (c, d) in current.iter_mut().zip(data) {
            *c &= d;
        }

        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(u64::from(addr)))?;
        file.write_all(&current)
    }

    fn erase_sector(&mut self, addr: u32) -> Result<(), Self::Error> {
        let sector = S as u32;
        self.fill_erased(addr - addr % sector, sector)
    }

    fn erase_block32k(&mut self, addr: u32) -> Result<(), Self::Error> {
        self.fill_erased(addr, BLOCK32K)
    }

    fn erase_block64k(&mut self, addr: u32) -> Result<(), Self::Error> {
        self.fill_erased(addr, BLOCK64K)
    }

    fn erase_chip(&mut self) -> Result<(), Self::Error> {
        self.fill_erased(0, self.size)
    }
}
