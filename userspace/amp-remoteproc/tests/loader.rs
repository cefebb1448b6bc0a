// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Firmware loading through seekable and forward-only stores
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 9 integration tests + 1 property test
//!
//! TEST_SCENARIOS:
//!   - segments_land_with_zeroed_bss(): ELF32 LE bytes and bss in target memory
//!   - big_endian_and_elf64_images(): ELF32 BE and ELF64 LE
//!   - stream_store_loads_same_image(): forward-only store, table adopted from target memory
//!   - resolved_table_is_copied_back(): allocated notify ids visible in target memory
//!   - bad_table_maps_nothing(): version/reserved errors before any mapping
//!   - streamed_bad_table_rolls_back(): forward-only store drops regions mapped for segments
//!   - image_without_table(): no resource table is not an error
//!   - foreign_image_rejected(): non-ELF content
//!   - truncated_image_rejected(): segment data cut short
//!   - any_segment_payload_round_trips(): property test over segment contents

mod common;

use amp_remoteproc::rsc::{find_rsc, ResourceTableBuilder, VdevRsc, RSC_VDEV};
use amp_remoteproc::{Error, MemoryStore, Remoteproc, State, StreamStore};
use common::elf::ElfImage;
use common::{TestOps, RSC_DA, TEXT_DA};
use proptest::prelude::*;

fn read_da(rp: &Remoteproc, da: u64, len: usize) -> Vec<u8> {
    let m = rp.da_to_va(da).expect("da is mapped");
    let mut out = vec![0u8; len];
    m.io.block_read(m.offset, &mut out).unwrap();
    out
}

fn check_loaded(rp: &Remoteproc) {
    assert_eq!(rp.state(), State::Ready);
    assert_eq!(rp.bootaddr(), TEXT_DA + 0x100);
    assert_eq!(read_da(rp, TEXT_DA, 0x300), vec![0xaa; 0x300]);
    assert_eq!(read_da(rp, TEXT_DA + 0x300, 0x500), vec![0; 0x500]);
    let buffers = rp.mem_with_name("vdev0buffer").expect("carveout mapped");
    assert_eq!(buffers.da(), common::BUFFER_DA as u64);
}

#[test]
fn segments_land_with_zeroed_bss() {
    let ops = TestOps::new();
    // Stale bytes where bss will go.
    ops.shm.block_set(0x300, 0x55, 0x500).unwrap();
    let rp = Remoteproc::new(ops.clone()).unwrap();
    let image = common::firmware(ElfImage::elf32_le(), &common::default_table());
    rp.load(&mut MemoryStore::new(image)).unwrap();
    check_loaded(&rp);
    assert_eq!(rp.mem_count(), 2);
}

#[test]
fn big_endian_and_elf64_images() {
    for image in [ElfImage::elf32_be(), ElfImage::elf64_le()] {
        let ops = TestOps::new();
        let rp = Remoteproc::new(ops).unwrap();
        let image = common::firmware(image, &common::default_table());
        rp.load(&mut MemoryStore::new(image)).unwrap();
        check_loaded(&rp);
    }
}

#[test]
fn stream_store_loads_same_image() {
    let ops = TestOps::new();
    let rp = Remoteproc::new(ops).unwrap();
    let image = common::firmware(ElfImage::elf64_le(), &common::default_table());
    rp.load(&mut StreamStore::new(&image[..])).unwrap();
    check_loaded(&rp);
    let table = rp.rsc_table().unwrap();
    let vdev = VdevRsc::read(&table, find_rsc(&table, RSC_VDEV, 0).unwrap()).unwrap();
    assert_eq!(vdev.notifyid, 0);
}

#[test]
fn resolved_table_is_copied_back() {
    let (rp, _) = common::loaded();
    let table = rp.rsc_table().unwrap();
    assert_eq!(read_da(&rp, RSC_DA, table.len()), table);
    let vdev = VdevRsc::read(&table, find_rsc(&table, RSC_VDEV, 0).unwrap()).unwrap();
    assert_eq!(vdev.notifyid, 0);
    let ids: Vec<_> = vdev.vrings.iter().map(|r| r.notifyid).collect();
    assert_eq!(ids, [1, 2]);
    // Fixed ids are claimed from the same bitmap.
    assert_eq!(rp.allocate_id(0, 3), None);
    assert_eq!(rp.allocate_id(0, 4), Some(3));
}

#[test]
fn bad_table_maps_nothing() {
    for (table, err) in bad_tables() {
        let ops = TestOps::new();
        let rp = Remoteproc::new(ops.clone()).unwrap();
        let image = common::firmware(ElfImage::elf32_le(), &table);
        assert_eq!(rp.load(&mut MemoryStore::new(image)), Err(err));
        assert_eq!(rp.mem_count(), 0);
        assert!(!ops.calls().iter().any(|c| c.starts_with("mmap")));
        assert_eq!(rp.state(), State::Offline);
    }
}

fn bad_tables() -> [(Vec<u8>, Error); 2] {
    let bad_version = ResourceTableBuilder::new().version(2).vdev(&common::rpmsg_vdev(0, 0)).build();
    let mut bad_reserved = common::default_table();
    bad_reserved[8] = 1;
    [(bad_version, Error::RscVersion(2)), (bad_reserved, Error::RscReserved)]
}

#[test]
fn streamed_bad_table_rolls_back() {
    for (table, err) in bad_tables() {
        let ops = TestOps::new();
        let rp = Remoteproc::new(ops.clone()).unwrap();
        let image = common::firmware(ElfImage::elf32_le(), &table);
        assert_eq!(rp.load(&mut StreamStore::new(&image[..])), Err(err));
        assert_eq!(rp.mem_count(), 0);
        assert!(rp.da_to_va(TEXT_DA).is_none());
        assert_eq!(rp.rsc_table(), Err(Error::RscMissing));
        assert_eq!(rp.state(), State::Offline);
        assert_eq!(ops.calls().last().map(String::as_str), Some("shutdown"));

        // The instance is reusable afterwards.
        let image = common::firmware(ElfImage::elf32_le(), &common::default_table());
        rp.load(&mut StreamStore::new(&image[..])).unwrap();
        check_loaded(&rp);
    }
}

#[test]
fn image_without_table() {
    let ops = TestOps::new();
    let rp = Remoteproc::new(ops).unwrap();
    let image = ElfImage::elf32_le()
        .entry(TEXT_DA)
        .segment(TEXT_DA, &[1, 2, 3, 4], 4)
        .without_sections()
        .build();
    rp.load(&mut MemoryStore::new(image)).unwrap();
    assert_eq!(rp.state(), State::Ready);
    assert_eq!(rp.rsc_table(), Err(Error::RscMissing));
    assert_eq!(read_da(&rp, TEXT_DA, 4), [1, 2, 3, 4]);
}

#[test]
fn foreign_image_rejected() {
    let rp = Remoteproc::new(TestOps::new()).unwrap();
    let mut store = MemoryStore::new(b"MZ\x90\x00 not firmware".to_vec());
    assert_eq!(rp.load(&mut store), Err(Error::Invalid("unknown image format")));
    assert_eq!(rp.load(&mut MemoryStore::new(Vec::new())), Err(Error::Invalid("empty image")));
}

#[test]
fn truncated_image_rejected() {
    let rp = Remoteproc::new(TestOps::new()).unwrap();
    let mut image = ElfImage::elf32_le()
        .entry(TEXT_DA)
        .segment(TEXT_DA, &[7; 0x200], 0x200)
        .without_sections()
        .build();
    image.truncate(image.len() - 0x80);
    assert_eq!(
        rp.load(&mut MemoryStore::new(image)),
        Err(Error::Invalid("segment data"))
    );
    assert_eq!(rp.state(), State::Offline);
}

proptest! {
    #[test]
    fn any_segment_payload_round_trips(
        data in proptest::collection::vec(any::<u8>(), 1..0x1800),
        bss in 0usize..0x400,
    ) {
        let rp = Remoteproc::new(TestOps::new()).unwrap();
        let image = ElfImage::elf64_le()
            .entry(TEXT_DA)
            .segment(TEXT_DA, &data, data.len() + bss)
            .build();
        rp.load(&mut StreamStore::new(&image[..])).unwrap();
        prop_assert_eq!(read_da(&rp, TEXT_DA, data.len()), data.clone());
        prop_assert_eq!(read_da(&rp, TEXT_DA + data.len() as u64, bss), vec![0u8; bss]);
    }
}
