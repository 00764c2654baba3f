//! Device Enumerator and Hotplug Monitor: a one-shot scan of the `input`
//! subsystem for pre-existing devices, plus a udev hotplug socket for
//! devices that show up later.

use std::convert::TryInto;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc::Sender;
use tokio_udev::{AsyncMonitorSocket, EventType, MonitorBuilder};

use crate::probe::{self, ProbedJoystick};

/// A hotplug notification. `Removed` carries no payload and triggers no
/// action: removal is handled lazily by the reader task noticing its own
/// read fail, since the add/remove ordering relative to the node's
/// disappearance isn't guaranteed. It's surfaced only so the caller can
/// log it.
#[derive(Debug)]
pub enum HotplugEvent {
    Added(ProbedJoystick),
    Removed,
}

/// Counts from a single enumeration pass, for the "Found N inputs, M
/// joysticks, K tracked" startup line.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnumerationCounts {
    pub inputs_seen: usize,
    pub joysticks_matched: usize,
}

/// Walks the `input` subsystem once and returns every accepted joystick.
pub fn enumerate() -> Result<(Vec<ProbedJoystick>, EnumerationCounts)> {
    let mut enumerator = tokio_udev::Enumerator::new().context("creating udev enumerator")?;
    enumerator
        .match_subsystem("input")
        .context("matching input subsystem")?;

    let mut counts = EnumerationCounts::default();
    let mut found = Vec::new();
    for device in enumerator.scan_devices().context("scanning devices")? {
        counts.inputs_seen += 1;
        if let Some(joystick) = probe::probe(&device) {
            counts.joysticks_matched += 1;
            found.push(joystick);
        }
    }
    Ok((found, counts))
}

async fn monitor_internal(tx: Sender<HotplugEvent>) -> Result<()> {
    debug!("starting udev hotplug monitor");
    let builder = MonitorBuilder::new().context("creating udev monitor")?;
    let mut monitor: AsyncMonitorSocket = builder
        .match_subsystem("input")
        .context("matching input subsystem on monitor")?
        .listen()
        .context("listening on udev monitor socket")?
        .try_into()
        .context("converting udev monitor to async socket")?;

    while let Some(event) = monitor.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!("udev monitor error: {e}");
                continue;
            }
        };
        match event.event_type() {
            EventType::Add => match probe::probe(&event) {
                Some(joystick) => {
                    if tx.send(HotplugEvent::Added(joystick)).await.is_err() {
                        break;
                    }
                }
                None => debug!("ignoring non-joystick add: {:?}", event.syspath()),
            },
            EventType::Remove => {
                // No action here; the per-device reader notices removal
                // on its own next read.
                if tx.send(HotplugEvent::Removed).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Spawns the hotplug monitor as a local task, since `tokio_udev`'s
/// types are `!Send`. Must be called from within a `LocalSet` context
/// (established once, in `main`, for the whole process). Best-effort:
/// a failure to set up monitoring is logged by the caller and does not
/// abort startup, because initial enumeration already covers
/// pre-existing devices. The returned handle lets the engine cancel
/// monitoring when the saver disappears.
pub fn monitor_hotplug(tx: Sender<HotplugEvent>) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_local(async move {
        if let Err(e) = monitor_internal(tx).await {
            warn!("hotplug monitor exited: {e:#}");
        }
    })
}
