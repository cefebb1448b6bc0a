// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Name service: announcements of remote services arriving at `RPMSG_NS_EPT_ADDR`.

use log::{debug, warn};

use crate::buffer::RxMessage;
use crate::device::DeviceShared;
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::wire::NsMessage;
use crate::{Error, Result, RPMSG_ADDR_ANY, RPMSG_NS_EPT_ADDR};

pub(crate) fn endpoint_config() -> EndpointConfig {
    EndpointConfig::new("NS", RPMSG_NS_EPT_ADDR, RPMSG_NS_EPT_ADDR, on_message)
}

fn on_message(_ept: &Endpoint, msg: &RxMessage<'_>) -> Result<()> {
    handle(msg.device, msg.data())
}

pub(crate) fn handle(dev: &DeviceShared, data: &[u8]) -> Result<()> {
    let ns = NsMessage::decode(data).map_err(|e| {
        warn!("rpmsg: malformed name-service message: {e:?}");
        Error::Param
    })?;
    let name = ns.name();
    let found = dev.find_by_name(&name, ns.addr);
    if ns.is_destroy() {
        debug!("rpmsg: remote withdrew '{name}' at {:#x}", ns.addr);
        if let Some(r) = &found {
            r.endpoint().set_dest(RPMSG_ADDR_ANY);
            r.endpoint().fire_unbind();
        }
        // The reference is dropped only after both callbacks: either may destroy the endpoint.
        dev.fire_ns_unbind(&name, ns.addr);
        drop(found);
    } else {
        debug!("rpmsg: remote announced '{name}' at {:#x}", ns.addr);
        match found {
            Some(r) => r.endpoint().set_dest(ns.addr),
            None => dev.fire_ns_bind(&name, ns.addr),
        }
    }
    Ok(())
}
