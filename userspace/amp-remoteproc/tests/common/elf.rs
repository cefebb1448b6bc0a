// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Minimal firmware image writer: ELF header, program headers, segment data,
//! section headers (null, `.resource_table`, `.shstrtab`) and the name table
//! last, so a forward-only reader meets everything in order.

#![allow(dead_code)]

use byteorder::{BigEndian, ByteOrder, LittleEndian};

const PT_LOAD: u32 = 1;
const SHT_PROGBITS: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHF_ALLOC: u64 = 0x2;
const EM_ARM: u16 = 0x28;
const EM_RISCV: u16 = 0xf3;

struct Segment {
    paddr: u64,
    data: Vec<u8>,
    memsz: usize,
}

pub struct ElfImage {
    is64: bool,
    big_endian: bool,
    entry: u64,
    segments: Vec<Segment>,
    rsc_segment: Option<usize>,
    section_headers: bool,
}

struct Out {
    buf: Vec<u8>,
    is64: bool,
    big_endian: bool,
}

impl Out {
    fn u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        if self.big_endian {
            BigEndian::write_u16(&mut b, v);
        } else {
            LittleEndian::write_u16(&mut b, v);
        }
        self.buf.extend_from_slice(&b);
    }

    fn u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        if self.big_endian {
            BigEndian::write_u32(&mut b, v);
        } else {
            LittleEndian::write_u32(&mut b, v);
        }
        self.buf.extend_from_slice(&b);
    }

    fn u64(&mut self, v: u64) {
        let mut b = [0u8; 8];
        if self.big_endian {
            BigEndian::write_u64(&mut b, v);
        } else {
            LittleEndian::write_u64(&mut b, v);
        }
        self.buf.extend_from_slice(&b);
    }

    /// Address-sized field.
    fn word(&mut self, v: u64) {
        if self.is64 {
            self.u64(v);
        } else {
            self.u32(v as u32);
        }
    }

    fn pad_to(&mut self, align: usize) {
        while self.buf.len() % align != 0 {
            self.buf.push(0);
        }
    }
}

impl ElfImage {
    pub fn elf32_le() -> Self {
        Self::new(false, false)
    }

    pub fn elf32_be() -> Self {
        Self::new(false, true)
    }

    pub fn elf64_le() -> Self {
        Self::new(true, false)
    }

    fn new(is64: bool, big_endian: bool) -> Self {
        Self {
            is64,
            big_endian,
            entry: 0,
            segments: Vec::new(),
            rsc_segment: None,
            section_headers: true,
        }
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    /// A loadable segment; bytes past `data` up to `memsz` are bss.
    pub fn segment(mut self, paddr: u64, data: &[u8], memsz: usize) -> Self {
        assert!(memsz >= data.len());
        self.segments.push(Segment { paddr, data: data.to_vec(), memsz });
        self
    }

    /// A segment holding the resource table, with its `.resource_table` section.
    pub fn rsc_table(mut self, paddr: u64, table: &[u8]) -> Self {
        self.rsc_segment = Some(self.segments.len());
        self.segment(paddr, table, table.len())
    }

    /// Drops the section header table entirely.
    pub fn without_sections(mut self) -> Self {
        self.section_headers = false;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let (ehsize, phentsize, shentsize) = if self.is64 { (64, 56, 64) } else { (52, 32, 40) };
        let phoff = ehsize;
        let mut data_off = phoff + phentsize * self.segments.len();
        let mut offsets = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            data_off = (data_off + 7) & !7;
            offsets.push(data_off);
            data_off += seg.data.len();
        }
        let shoff = (data_off + 7) & !7;
        let shnum = if self.rsc_segment.is_some() { 3 } else { 2 };
        let shstrtab: &[u8] = b"\0.resource_table\0.shstrtab\0";
        let names_off = shoff + shentsize * shnum;

        let mut out = Out { buf: Vec::new(), is64: self.is64, big_endian: self.big_endian };
        out.buf.extend_from_slice(b"\x7fELF");
        out.buf.push(if self.is64 { 2 } else { 1 });
        out.buf.push(if self.big_endian { 2 } else { 1 });
        out.buf.push(1);
        out.buf.resize(16, 0);
        out.u16(2);
        out.u16(if self.is64 { EM_RISCV } else { EM_ARM });
        out.u32(1);
        out.word(self.entry);
        out.word(phoff as u64);
        out.word(if self.section_headers { shoff as u64 } else { 0 });
        out.u32(0);
        out.u16(ehsize as u16);
        out.u16(phentsize as u16);
        out.u16(self.segments.len() as u16);
        out.u16(shentsize as u16);
        out.u16(if self.section_headers { shnum as u16 } else { 0 });
        out.u16(if self.section_headers { shnum as u16 - 1 } else { 0 });
        assert_eq!(out.buf.len(), ehsize);

        for (seg, off) in self.segments.iter().zip(&offsets) {
            if self.is64 {
                out.u32(PT_LOAD);
                out.u32(0x7);
                out.u64(*off as u64);
                out.u64(seg.paddr);
                out.u64(seg.paddr);
                out.u64(seg.data.len() as u64);
                out.u64(seg.memsz as u64);
                out.u64(8);
            } else {
                out.u32(PT_LOAD);
                out.u32(*off as u32);
                out.u32(seg.paddr as u32);
                out.u32(seg.paddr as u32);
                out.u32(seg.data.len() as u32);
                out.u32(seg.memsz as u32);
                out.u32(0x7);
                out.u32(8);
            }
        }
        for (seg, off) in self.segments.iter().zip(&offsets) {
            out.buf.resize(*off, 0);
            out.buf.extend_from_slice(&seg.data);
        }
        if !self.section_headers {
            return out.buf;
        }

        out.pad_to(8);
        assert_eq!(out.buf.len(), shoff);
        out.buf.resize(shoff + shentsize, 0);
        if let Some(i) = self.rsc_segment {
            let seg = &self.segments[i];
            self.section(&mut out, 1, SHT_PROGBITS, SHF_ALLOC, seg.paddr, offsets[i], seg.data.len());
        }
        self.section(&mut out, 17, SHT_STRTAB, 0, 0, names_off, shstrtab.len());
        assert_eq!(out.buf.len(), names_off);
        out.buf.extend_from_slice(shstrtab);
        out.buf
    }

    #[allow(clippy::too_many_arguments)]
    fn section(&self, out: &mut Out, name: u32, ty: u32, flags: u64, addr: u64, offset: usize, size: usize) {
        out.u32(name);
        out.u32(ty);
        out.word(flags);
        out.word(addr);
        out.word(offset as u64);
        out.word(size as u64);
        out.u32(0);
        out.u32(0);
        out.word(4);
        out.word(0);
    }
}
