//! Per-device input reader: open the node, read fixed-size event records
//! in a loop, stop on request or on removal.

use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};

use crate::joystick_set::{new_slot_handle, HasSlot, SlotHandle};

/// Linux `EV_KEY` from `linux/input-event-codes.h`: the event carries a
/// button/key state change, as opposed to axis motion (`EV_ABS`) or a
/// sync marker (`EV_SYN`).
const EV_KEY: u16 = 0x01;

/// The transport's button-release value. Releases debounce better than
/// presses for "the user just did something".
const KEY_RELEASED: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    /// A key/button event with value 0: treat as activity.
    ButtonPress,
    /// Anything else the kernel sent (axis motion, sync, auto-repeat).
    Other,
    /// The read failed in a way that means the device is gone.
    Gone,
}

#[derive(Debug)]
pub struct DeviceEvent {
    pub slot: usize,
    pub kind: DeviceEventKind,
}

/// A tracked joystick. The reader task owns the open file; dropping the
/// task (stop signal or the read loop exiting) closes the descriptor.
pub struct JoystickRecord {
    pub node: PathBuf,
    pub name: String,
    pub event_count: Arc<AtomicU64>,
    slot: SlotHandle,
    stop: Option<oneshot::Sender<()>>,
}

impl HasSlot for JoystickRecord {
    fn slot(&self) -> &SlotHandle {
        &self.slot
    }
}

impl JoystickRecord {
    /// Stops the reader task, if it's still running. No-op if the task
    /// already exited on its own (e.g. after a read error).
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for JoystickRecord {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Opens `node` read-only, non-blocking, close-on-exec, spawns the
/// reader task, and returns a record ready for the Joystick Set.
///
/// The returned record's slot back-pointer starts at 0; `JoystickSet::add`
/// overwrites it with wherever the record actually lands.
pub fn open_and_watch(
    node: &Path,
    name: String,
    tx: mpsc::Sender<DeviceEvent>,
) -> Result<JoystickRecord, crate::error::DeviceOpenError> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(node)
        .map_err(|source| crate::error::DeviceOpenError {
            path: node.to_owned(),
            source,
        })?;
    let file = tokio::fs::File::from_std(file);

    let slot = new_slot_handle(0);
    let (stop_tx, stop_rx) = oneshot::channel();
    let event_count = Arc::new(AtomicU64::new(0));

    tokio::task::spawn(read_loop(
        file,
        node.to_owned(),
        slot.clone(),
        event_count.clone(),
        tx,
        stop_rx,
    ));

    Ok(JoystickRecord {
        node: node.to_owned(),
        name,
        event_count,
        slot,
        stop: Some(stop_tx),
    })
}

async fn read_loop(
    mut file: tokio::fs::File,
    node: PathBuf,
    slot: SlotHandle,
    event_count: Arc<AtomicU64>,
    tx: mpsc::Sender<DeviceEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut buf = [0u8; mem::size_of::<libc::input_event>()];
    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                trace!("stopping reader for {node:?}");
                break;
            }
            result = file.read_exact(&mut buf) => {
                let kind = match result {
                    Ok(_) => {
                        event_count.fetch_add(1, Ordering::Relaxed);
                        classify(&buf)
                    }
                    Err(e) => {
                        // A short read (EOF) also means the device went away;
                        // fold it into the same error type as a real ENODEV.
                        let err = crate::error::DeviceReadError(e);
                        if err.is_gone() {
                            debug!("{node:?} went away");
                        } else {
                            warn!("read error on {node:?}: {err}, treating as removed");
                        }
                        DeviceEventKind::Gone
                    }
                };
                let gone = kind == DeviceEventKind::Gone;
                let event = DeviceEvent {
                    slot: slot.load(std::sync::atomic::Ordering::SeqCst),
                    kind,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
                if gone {
                    break;
                }
            }
        }
    }
}

/// One event-record-sized read maps to exactly one classification.
fn classify(buf: &[u8]) -> DeviceEventKind {
    // SAFETY: `buf` is exactly `size_of::<input_event>()` bytes, filled
    // by a successful `read_exact` from the device node; `input_event`
    // has no padding-sensitive invariants beyond its own layout.
    let event: libc::input_event = unsafe { std::ptr::read(buf.as_ptr() as *const _) };
    if event.type_ == EV_KEY && event.value == KEY_RELEASED {
        DeviceEventKind::ButtonPress
    } else {
        DeviceEventKind::Other
    }
}
