// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Flow control: pause/resume requests arriving at `RPMSG_FC_EPT_ADDR`.

use log::{trace, warn};

use crate::buffer::RxMessage;
use crate::device::DeviceShared;
use crate::endpoint::{Endpoint, EndpointConfig};
use crate::wire::FcMessage;
use crate::{Error, Result, RPMSG_FC_EPT_ADDR};

pub(crate) fn endpoint_config() -> EndpointConfig {
    EndpointConfig::new("FC", RPMSG_FC_EPT_ADDR, RPMSG_FC_EPT_ADDR, on_message)
}

fn on_message(_ept: &Endpoint, msg: &RxMessage<'_>) -> Result<()> {
    handle(msg.device, msg.data())
}

pub(crate) fn handle(dev: &DeviceShared, data: &[u8]) -> Result<()> {
    let fc = FcMessage::decode(data).map_err(|e| {
        warn!("rpmsg: malformed flow-control message: {e:?}");
        Error::Param
    })?;
    let Some(target) = dev.endpoint_ref(fc.dst) else {
        warn!("rpmsg: flow control for unknown endpoint {:#x}", fc.dst);
        return Err(Error::Param);
    };
    let ept = target.endpoint();
    ept.bind_if_unbound(fc.src);
    trace!("rpmsg: flow {:#x} from {:#x} to {:#x}", fc.flags, fc.src, fc.dst);
    ept.fire_flow(fc.flags, fc.src);
    Ok(())
}
