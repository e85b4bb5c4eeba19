use std::time::Duration;

use anyhow::Result;

use bluer::{Adapter, Address, Device, Session};
use bluer::rfcomm::{Profile, ProfileHandle, ReqError, Role, Stream};

use futures::StreamExt;


const CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);


pub async fn find_receiver(adapter: &Adapter, name: &str) -> Result<Device> {
    for addr in adapter.device_addresses().await? {
        let dev = adapter.device(addr)?;

        if dev.name().await?.as_deref() != Some(name) {
            continue;
        }

        let uuids = dev.uuids().await?.unwrap_or_default();
        if !uuids.contains(&ntrip::SPP_UUID) {
            tracing::debug!(address=%addr, "device does not offer serial port profile");
            continue;
        }

        tracing::debug!(address=%addr, "found receiver");
        return Ok(dev);
    }

    tracing::debug!(name, "no receiver found");
    anyhow::bail!("no receiver named '{name}' found")
}

pub async fn connect_spp_rfcomm(session: &Session, dev: &Device) -> Result<Stream> {
    let spp_profile = Profile {
        uuid: ntrip::SPP_UUID,
        role: Some(Role::Client),
        require_authentication: Some(false),
        require_authorization: Some(false),
        auto_connect: Some(false),
        ..Default::default()
    };

    tracing::debug!("registering serial port profile");
    let mut handle = session.register_profile(spp_profile).await?;

    tracing::debug!(address=%dev.address(), "connecting to serial port profile");
    let (_, stream) = tokio::try_join!(
        try_connect_profile(dev),
        accept_profile_request(&mut handle, dev.address()),
    )?;

    Ok(stream)
}

async fn try_connect_profile(dev: &Device) -> Result<()> {
    for attempt in 1.. {
        match dev.connect_profile(&ntrip::SPP_UUID).await {
            Ok(()) => break,
            Err(err) if attempt > CONNECT_RETRIES => return Err(err.into()),
            Err(err) => {
                tracing::debug!(error=?err, attempt, "connecting serial port profile failed, retrying");
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
        }
    }

    tracing::debug!(address=%dev.address(), "serial port profile connected");
    Ok(())
}

/// Accept the connection request of the receiver, rejecting all others.
async fn accept_profile_request(handle: &mut ProfileHandle, address: Address) -> Result<Stream> {
    while let Some(req) = handle.next().await {
        if req.device() != address {
            tracing::debug!(address=%req.device(), "rejecting connection request of unrelated device");
            req.reject(ReqError::Rejected);
            continue;
        }

        tracing::debug!(address=%address, "accepting connection request of receiver");
        return Ok(req.accept()?);
    }

    anyhow::bail!("serial port profile closed before the receiver connected")
}
