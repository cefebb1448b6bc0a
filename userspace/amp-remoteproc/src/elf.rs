// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ELF32/ELF64 firmware loader (either byte order).
//!
//! Headers are streamed out of an `ImageStore` rather than parsed from a full
//! in-memory image. Forward-only stores get their section headers after the
//! segments, which is where they sit in a linked image.

use goblin::container::{Container, Ctx};
use goblin::elf::header::{Header, ELFMAG, SELFMAG};
use goblin::elf::program_header::{ProgramHeader, PT_LOAD};
use goblin::elf::section_header::SectionHeader;
use goblin::elf::Elf;
use log::{debug, error};
use scroll::Pread;

use crate::mem::Mapping;
use crate::store::{load_data, load_exact, wait_finish, ImageStore, LoadMode, StoreFeatures};
use crate::{Error, Result};

/// Section holding the resource table.
pub const RSC_TABLE_SECTION: &str = ".resource_table";
/// Bytes sniffed to pick a loader.
pub const IMAGE_HEAD_SIZE: usize = 64;

const SEGMENT_CHUNK: usize = 4096;
const MAX_SECTION_NAMES: usize = 64 * 1024;

/// Resolves device addresses to target memory while segments are placed.
pub trait Mapper {
    /// Returns where `size` bytes at device address `da` live locally.
    fn map(&mut self, da: u64, size: usize) -> Result<Mapping>;
}

/// A parsed firmware image.
pub trait ImageLoader {
    /// Entry point.
    fn entry(&self) -> u64;
    /// Device address and size of the resource table, once section headers are known.
    fn rsc_table(&self) -> Option<(u64, usize)>;
    /// Reads the resource table out of the image.
    fn copy_rsc_table(&self, store: &mut dyn ImageStore) -> Result<Vec<u8>>;
    /// Places every loadable segment. Section headers are known afterwards.
    fn load(&mut self, store: &mut dyn ImageStore, mapper: &mut dyn Mapper) -> Result<()>;
}

/// Headers of an ELF image.
pub struct ElfLoader {
    header: Header,
    ctx: Ctx,
    phdrs: Vec<ProgramHeader>,
    shdrs: Vec<SectionHeader>,
    shstrtab: Vec<u8>,
}

impl ElfLoader {
    /// True if `head` starts with the ELF magic.
    pub fn identify(head: &[u8]) -> bool {
        head.len() >= SELFMAG && &head[..SELFMAG] == ELFMAG
    }

    /// Reads the ELF header and program headers, plus the section headers when
    /// the store can seek.
    pub fn parse(store: &mut dyn ImageStore) -> Result<Self> {
        let mut head = [0u8; IMAGE_HEAD_SIZE];
        let n = load_data(store, 0, &mut head, LoadMode::Sync)?;
        if !Self::identify(&head[..n]) {
            return Err(Error::Invalid("not an ELF image"));
        }
        let header = Elf::parse_header(&head[..n]).map_err(|e| {
            debug!("elf: header rejected: {e}");
            Error::Invalid("bad ELF header")
        })?;
        let container = header.container().map_err(|_| Error::Invalid("bad ELF class"))?;
        let endian = header.endianness().map_err(|_| Error::Invalid("bad ELF byte order"))?;
        let ctx = Ctx::new(container, endian);
        let (ph_size, _) = entry_sizes(container);

        let phdrs = read_entries(
            store,
            header.e_phoff,
            header.e_phentsize,
            header.e_phnum,
            ph_size,
            "program headers",
            |buf, off| buf.pread_with::<ProgramHeader>(off, ctx),
        )?;
        if phdrs.iter().any(|ph| ph.p_type == PT_LOAD && ph.p_filesz > ph.p_memsz) {
            return Err(Error::Invalid("segment filesz exceeds memsz"));
        }
        debug!(
            "elf: {} image, {} program headers, entry {:#x}",
            if container == Container::Big { "ELF64" } else { "ELF32" },
            phdrs.len(),
            header.e_entry
        );

        let mut elf = Self { header, ctx, phdrs, shdrs: Vec::new(), shstrtab: Vec::new() };
        if store.features().contains(StoreFeatures::SUPPORT_SEEK) {
            elf.load_section_headers(store)?;
        }
        Ok(elf)
    }

    /// True for ELF64.
    pub fn is_64(&self) -> bool {
        self.ctx.container == Container::Big
    }

    /// True once section headers have been read.
    pub fn has_section_headers(&self) -> bool {
        !self.shdrs.is_empty()
    }

    /// Number of `PT_LOAD` segments.
    pub fn load_segments(&self) -> usize {
        self.phdrs.iter().filter(|ph| ph.p_type == PT_LOAD).count()
    }

    /// Finds a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionHeader> {
        self.shdrs
            .iter()
            .find(|sh| section_name(&self.shstrtab, sh.sh_name) == Some(name))
    }

    fn load_section_headers(&mut self, store: &mut dyn ImageStore) -> Result<()> {
        if self.header.e_shoff == 0 || self.header.e_shnum == 0 {
            return Ok(());
        }
        let ctx = self.ctx;
        let (_, sh_size) = entry_sizes(ctx.container);
        let shdrs = read_entries(
            store,
            self.header.e_shoff,
            self.header.e_shentsize,
            self.header.e_shnum,
            sh_size,
            "section headers",
            |buf, off| buf.pread_with::<SectionHeader>(off, ctx),
        )?;
        let names = shdrs
            .get(self.header.e_shstrndx as usize)
            .ok_or(Error::Invalid("bad section name index"))?;
        let len = usize::try_from(names.sh_size)
            .ok()
            .filter(|len| *len <= MAX_SECTION_NAMES)
            .ok_or(Error::Invalid("section name table too large"))?;
        let mut shstrtab = vec![0u8; len];
        load_exact(store, names.sh_offset, &mut shstrtab, LoadMode::Sync, "section names")?;
        self.shdrs = shdrs;
        self.shstrtab = shstrtab;
        Ok(())
    }
}

impl ImageLoader for ElfLoader {
    fn entry(&self) -> u64 {
        self.header.e_entry
    }

    fn rsc_table(&self) -> Option<(u64, usize)> {
        let sh = self.section(RSC_TABLE_SECTION)?;
        let len = usize::try_from(sh.sh_size).ok().filter(|len| *len > 0)?;
        Some((sh.sh_addr, len))
    }

    fn copy_rsc_table(&self, store: &mut dyn ImageStore) -> Result<Vec<u8>> {
        let sh = self.section(RSC_TABLE_SECTION).ok_or(Error::RscMissing)?;
        let len = usize::try_from(sh.sh_size).map_err(|_| Error::RscTruncated)?;
        let mut table = vec![0u8; len];
        load_exact(store, sh.sh_offset, &mut table, LoadMode::Sync, "resource table")?;
        Ok(table)
    }

    fn load(&mut self, store: &mut dyn ImageStore, mapper: &mut dyn Mapper) -> Result<()> {
        for (i, ph) in self.phdrs.iter().enumerate() {
            if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
                continue;
            }
            let memsz = usize::try_from(ph.p_memsz).map_err(|_| Error::Invalid("segment size"))?;
            let filesz = usize::try_from(ph.p_filesz).map_err(|_| Error::Invalid("segment size"))?;
            let m = mapper.map(ph.p_paddr, memsz).map_err(|e| {
                error!("elf: mapping segment {i} at da {:#x} failed: {e}", ph.p_paddr);
                e
            })?;
            debug!("elf: segment {i}: offset {:#x} -> da {:#x} ({filesz:#x}/{memsz:#x})", ph.p_offset, m.da);
            copy_segment(store, ph.p_offset, &m, filesz)?;
            if memsz > filesz {
                m.io.block_set(m.offset + filesz, 0, memsz - filesz)?;
            }
            m.io.flush(m.offset, memsz);
        }
        wait_finish(store);
        if !store.features().contains(StoreFeatures::SUPPORT_SEEK) {
            self.load_section_headers(store)?;
        }
        Ok(())
    }
}

fn entry_sizes(container: Container) -> (usize, usize) {
    if container == Container::Big {
        (56, 64)
    } else {
        (32, 40)
    }
}

fn read_entries<T>(
    store: &mut dyn ImageStore,
    offset: u64,
    entsize: u16,
    count: u16,
    min_entsize: usize,
    what: &'static str,
    decode: impl Fn(&[u8], usize) -> core::result::Result<T, goblin::error::Error>,
) -> Result<Vec<T>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let entsize = entsize as usize;
    if entsize < min_entsize {
        return Err(Error::Invalid(what));
    }
    let mut buf = vec![0u8; entsize * count as usize];
    load_exact(store, offset, &mut buf, LoadMode::Sync, what)?;
    (0..count as usize)
        .map(|i| {
            decode(&buf, i * entsize).map_err(|e| {
                debug!("elf: decoding {what} {i}: {e}");
                Error::Invalid(what)
            })
        })
        .collect()
}

fn copy_segment(store: &mut dyn ImageStore, offset: u64, m: &Mapping, filesz: usize) -> Result<()> {
    let mut chunk = vec![0u8; SEGMENT_CHUNK.min(filesz)];
    let mut done = 0;
    while done < filesz {
        let n = chunk.len().min(filesz - done);
        load_exact(store, offset + done as u64, &mut chunk[..n], LoadMode::Async, "segment data")?;
        m.io.block_write(m.offset + done, &chunk[..n])?;
        done += n;
    }
    Ok(())
}

fn section_name(table: &[u8], offset: usize) -> Option<&str> {
    let rest = table.get(offset..)?;
    let end = rest.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&rest[..end]).ok()
}
