// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host/remote rpmsg echo over a remoteproc-managed vdev
//! INTENT: Firmware load, table handoff, NS announce/bind, echo, teardown
//! DEPS: amp-remoteproc, amp-rpmsg, amp-virtio, amp-hal
//! TESTS: echo_round_trip, status_and_doorbells_cross_cores, shutdown_releases_host_state

use std::sync::Arc;

use amp_e2e::{AmpPair, BUFFER_DA, ENTRY};
use amp_remoteproc::State;
use amp_rpmsg::{Endpoint, EndpointConfig, RPMSG_ADDR_ANY};
use amp_virtio::{DeviceStatus, VirtioDevice};
use parking_lot::Mutex;

type Inbox = Arc<Mutex<Vec<(u32, Vec<u8>)>>>;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn echo_round_trip() {
    init_logging();
    let pair = AmpPair::new().unwrap();
    pair.load().unwrap();
    assert_eq!(pair.host.state(), State::Ready);

    let inbox: Inbox = Arc::default();
    let bound: Arc<Mutex<Option<Endpoint>>> = Arc::default();
    let host = {
        let inbox = Arc::clone(&inbox);
        let bound = Arc::clone(&bound);
        pair.host_channel(move |b| {
            b.on_ns_bind(move |dev, name, dest| {
                let inbox = Arc::clone(&inbox);
                let ept = dev
                    .create_endpoint(EndpointConfig::new(name, RPMSG_ADDR_ANY, dest, move |_, msg| {
                        inbox.lock().push((msg.src(), msg.data().to_vec()));
                        Ok(())
                    }))
                    .expect("bind announced service");
                *bound.lock() = Some(ept);
            })
        })
        .unwrap()
    };
    pair.host.start().unwrap();
    assert_eq!(pair.host_ops.started_at(), ENTRY);

    let remote = pair.remote_channel().unwrap();
    let service = remote
        .create_endpoint(EndpointConfig::new("rpmsg-echo", RPMSG_ADDR_ANY, RPMSG_ADDR_ANY, |ept, msg| {
            ept.send(msg.data()).map(|_| ())
        }))
        .unwrap();

    let ept = bound.lock().clone().expect("announcement reached the host");
    assert_eq!(ept.name(), "rpmsg-echo");
    assert_eq!(ept.dest_addr(), service.local_addr());

    for len in 1..=10u8 {
        let data: Vec<u8> = (0..len).collect();
        assert_eq!(ept.send(&data), Ok(len as usize));
    }
    let got = inbox.lock().clone();
    assert_eq!(got.len(), 10);
    for (i, (src, data)) in got.iter().enumerate() {
        assert_eq!(*src, service.local_addr());
        assert_eq!(*data, (0..=i as u8).collect::<Vec<_>>());
    }
    assert_eq!(host.held_rx_buffers(), 0);
    assert_eq!(remote.held_rx_buffers(), 0);

    service.destroy();
    remote.deinit();
    host.deinit();
    pair.host.stop().unwrap();
    pair.host.shutdown().unwrap();
    assert_eq!(pair.host.state(), State::Offline);
    assert_eq!(pair.host.mem_count(), 0);
}

#[test]
fn status_and_doorbells_cross_cores() {
    init_logging();
    let pair = AmpPair::new().unwrap();
    pair.load().unwrap();

    // The remote sees the table the host resolved.
    let host_table = pair.host.rsc_table().unwrap();
    let remote_dev = {
        let len = host_table.len();
        let table = pair
            .remote
            .mmap(Some(amp_e2e::RSC_DA), None, len, amp_remoteproc::MemAttr::SHARED)
            .unwrap();
        pair.remote.set_rsc_table(&table.io, table.offset, len).unwrap();
        assert_eq!(pair.remote.rsc_table().unwrap(), host_table);
        pair.remote.create_virtio(0, amp_virtio::Role::Device).unwrap()
    };
    assert_eq!(remote_dev.status(), DeviceStatus::RESET);
    assert_eq!(remote_dev.vring_notify_ids(), [1, 2]);
    assert_eq!(
        pair.remote.mem_with_name("vdev0buffer").map(|m| m.pa()),
        Some(BUFFER_DA as u64)
    );

    let host = pair.host_channel(|b| b).unwrap();
    assert!(remote_dev.status().is_ready());
    assert_eq!(remote_dev.features(), host.features());
    // Bring-up only touches status and features, which ring the vdev's own id.
    let rung = pair.host_ops.doorbells();
    assert!(!rung.is_empty());
    assert!(rung.iter().all(|id| *id == remote_dev.notify_id()));
    host.deinit();
}

#[test]
fn shutdown_releases_host_state() {
    init_logging();
    let pair = AmpPair::new().unwrap();
    pair.load().unwrap();
    let host = pair.host_channel(|b| b).unwrap();
    pair.host.start().unwrap();
    host.deinit();
    pair.host.shutdown().unwrap();
    assert_eq!(pair.host.state(), State::Offline);
    assert!(pair.host.mem_with_name("vdev0buffer").is_none());
    assert!(pair.host.create_virtio(0, amp_virtio::Role::Driver).is_err());

    // The same image boots again.
    pair.load().unwrap();
    assert_eq!(pair.host.state(), State::Ready);
}
