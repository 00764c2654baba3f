//! Lifecycle: startup sequence, signal handling, and ordered shutdown.

use anyhow::{Context, Result};
use env_logger::Builder;
use log::{error, warn, LevelFilter};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;

mod config;
mod device;
mod engine;
mod enumerate;
mod error;
mod joystick_set;
mod probe;
mod saver;

use engine::Engine;
use error::JoyNoSleepError;
use saver::SaverClient;

/// Resolves when SIGINT or SIGTERM is delivered. Both are blocked from
/// their default disposition (by virtue of being handled through
/// `tokio::signal` at all) and routed here instead, so a signal causes
/// the event loop to exit cleanly rather than killing the process.
async fn shutdown_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => println!("received SIGINT"),
        _ = sigterm.recv() => println!("received SIGTERM"),
    }
    Ok(())
}

fn check_cli_args() {
    // This daemon takes no arguments; any are a usage error.
    if std::env::args().count() > 1 {
        eprintln!("joynosleep takes no arguments");
        std::process::exit(1);
    }
}

fn main() {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    check_cli_args();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the event loop: {e}");
            std::process::exit(1);
        }
    };

    println!("starting");

    let local = LocalSet::new();
    let result = runtime.block_on(local.run_until(run()));

    if let Err(e) = &result {
        error!("fatal startup failure: {e}");
        std::process::exit(exit_code_for(e));
    }
}

/// Maps a fatal startup failure onto an exit code, logging the
/// underlying errno when the failure bottoms out in an OS error (bus
/// socket connect, fd exhaustion, ...). Always exits 1; Unix exit codes
/// can't carry a negative errno, so the errno is logged instead of
/// encoded in the exit status.
fn exit_code_for(err: &JoyNoSleepError) -> i32 {
    if let JoyNoSleepError::FatalStartup(inner) = err {
        if let Some(io_err) = inner
            .chain()
            .find_map(|cause| cause.downcast_ref::<std::io::Error>())
        {
            if let Some(raw) = io_err.raw_os_error() {
                error!("underlying errno: {}", nix::errno::Errno::from_i32(raw));
            }
        }
    }
    1
}

async fn run() -> Result<(), JoyNoSleepError> {
    let shutdown = shutdown_signal();

    let conn = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    let saver = SaverClient::new(&conn)
        .await
        .context("building screen saver client")?;
    let name_events = saver
        .watch_name_owner()
        .await
        .context("subscribing to NameOwnerChanged")?;

    let quiet_interval = config::inhibit_timeout();
    let mut engine = Engine::new(saver, quiet_interval);

    engine
        .run(name_events, async {
            if let Err(e) = shutdown.await {
                warn!("signal handling failed: {e}; shutting down anyway");
            }
        })
        .await?;

    // The Joystick Set is already drained inside `Engine::run`'s own
    // teardown; dropping the connection here releases the bus last,
    // after devices and before the event loop itself winds down.
    drop(conn);
    println!("shut down");
    Ok(())
}
