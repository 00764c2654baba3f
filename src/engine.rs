//! Activity Engine: the central state machine. Owns the inhibit cookie,
//! the quiet-timeout, and the wiring between input activity and saver
//! calls.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use futures_util::{Stream, StreamExt};
use log::warn;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant, Sleep};

use crate::device::{self, DeviceEvent, DeviceEventKind, JoystickRecord};
use crate::enumerate::{self, EnumerationCounts, HotplugEvent};
use crate::joystick_set::JoystickSet;
use crate::probe::ProbedJoystick;
use crate::saver::{Cookie, NameEvent, ScreenSaverBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disarmed,
    ArmedIdle,
    ArmedActive,
}

pub struct Engine<S: ScreenSaverBackend> {
    saver: S,
    state: State,
    cookie: Option<Cookie>,
    joysticks: JoystickSet<JoystickRecord>,
    device_tx: mpsc::Sender<DeviceEvent>,
    device_rx: mpsc::Receiver<DeviceEvent>,
    hotplug_tx: mpsc::Sender<HotplugEvent>,
    hotplug_rx: mpsc::Receiver<HotplugEvent>,
    hotplug_handle: Option<tokio::task::JoinHandle<()>>,
    quiet_interval: Duration,
}

/// Far enough out that the timer never fires while disarmed, without
/// needing an `Option<Sleep>` (which can't be `reset` in place).
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(365 * 24 * 3600)
}

impl<S: ScreenSaverBackend> Engine<S> {
    pub fn new(saver: S, quiet_interval: Duration) -> Self {
        let (device_tx, device_rx) = mpsc::channel(32);
        let (hotplug_tx, hotplug_rx) = mpsc::channel(8);
        Self {
            saver,
            state: State::Disarmed,
            cookie: None,
            joysticks: JoystickSet::new(),
            device_tx,
            device_rx,
            hotplug_tx,
            hotplug_rx,
            hotplug_handle: None,
            quiet_interval,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn cookie(&self) -> Option<Cookie> {
        self.cookie
    }

    pub fn tracked_count(&self) -> usize {
        self.joysticks.len()
    }

    /// Runs the state machine until `shutdown` resolves. Must be called
    /// from within a `LocalSet` context, since it may start the (`!Send`)
    /// hotplug monitor.
    pub async fn run<N>(&mut self, name_events: N, shutdown: impl Future<Output = ()>) -> Result<()>
    where
        N: Stream<Item = NameEvent>,
    {
        tokio::pin!(shutdown);
        tokio::pin!(name_events);

        let sleep_fut = sleep_until(far_future());
        tokio::pin!(sleep_fut);
        let mut timeout_armed = false;

        match self.saver.saver_present().await {
            Ok(true) => self.on_saver_appeared().await,
            Ok(false) => println!("waiting for screen saver to appear..."),
            Err(e) => warn!("NameHasOwner probe failed: {e}; waiting for screen saver to appear..."),
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    println!("received shutdown signal");
                    break;
                }
                maybe_event = name_events.next() => {
                    match maybe_event {
                        Some(event) => self.on_name_event(event, sleep_fut.as_mut(), &mut timeout_armed).await,
                        None => {
                            warn!("name-ownership watcher stream ended");
                            break;
                        }
                    }
                }
                Some(event) = self.hotplug_rx.recv() => {
                    self.on_hotplug_event(event);
                }
                Some(event) = self.device_rx.recv() => {
                    self.on_device_event(event, sleep_fut.as_mut(), &mut timeout_armed).await;
                }
                _ = &mut sleep_fut, if timeout_armed => {
                    timeout_armed = false;
                    self.on_timeout(sleep_fut.as_mut(), &mut timeout_armed).await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn on_saver_appeared(&mut self) {
        let (found, counts) = match enumerate::enumerate() {
            Ok(result) => result,
            Err(e) => {
                warn!("device enumeration failed: {e:#}");
                (Vec::new(), EnumerationCounts::default())
            }
        };
        for joystick in found {
            self.track(joystick);
        }
        self.hotplug_handle = Some(enumerate::monitor_hotplug(self.hotplug_tx.clone()));
        self.state = State::ArmedIdle;
        println!(
            "Found {} inputs, {} joysticks, {} tracked",
            counts.inputs_seen,
            counts.joysticks_matched,
            self.joysticks.len()
        );
    }

    async fn on_saver_disappeared(&mut self, mut sleep_fut: std::pin::Pin<&mut Sleep>, timeout_armed: &mut bool) {
        if self.state == State::Disarmed {
            return;
        }
        if self.cookie.take().is_some() {
            // The remote is gone; there is nothing to call UnInhibit on.
            println!("screen saver disappeared with a live cookie; discarding it without a remote call");
        }
        *timeout_armed = false;
        sleep_fut.as_mut().reset(far_future());
        if let Some(handle) = self.hotplug_handle.take() {
            handle.abort();
        }
        for mut record in self.joysticks.drain() {
            record.stop();
        }
        self.state = State::Disarmed;
    }

    async fn on_name_event(&mut self, event: NameEvent, sleep_fut: std::pin::Pin<&mut Sleep>, timeout_armed: &mut bool) {
        match event {
            NameEvent::Appeared => {
                if self.state == State::Disarmed {
                    self.on_saver_appeared().await;
                }
            }
            NameEvent::Disappeared => self.on_saver_disappeared(sleep_fut, timeout_armed).await,
        }
    }

    fn on_hotplug_event(&mut self, event: HotplugEvent) {
        match event {
            HotplugEvent::Added(joystick) => self.track(joystick),
            HotplugEvent::Removed => {
                // No action: removal is handled lazily by the reader
                // that notices its own read failing.
            }
        }
    }

    async fn on_device_event(&mut self, event: DeviceEvent, sleep_fut: std::pin::Pin<&mut Sleep>, timeout_armed: &mut bool) {
        if event.kind == DeviceEventKind::Gone {
            if let Some(mut record) = self.joysticks.remove(event.slot) {
                println!("{:?} removed", record.node);
                record.stop();
            }
            return;
        }

        if event.kind != DeviceEventKind::ButtonPress {
            return;
        }

        match self.state {
            State::ArmedIdle => self.inhibit_on_press(sleep_fut, timeout_armed).await,
            State::ArmedActive => self.extend_timeout(sleep_fut, timeout_armed),
            State::Disarmed => {
                // Devices are only tracked while armed; a stray event
                // here would mean a race during teardown. Ignore it.
            }
        }
    }

    async fn inhibit_on_press(&mut self, mut sleep_fut: std::pin::Pin<&mut Sleep>, timeout_armed: &mut bool) {
        match self.saver.inhibit("joystick in use").await {
            Ok(cookie) => {
                self.cookie = Some(cookie);
                self.state = State::ArmedActive;
                sleep_fut.as_mut().reset(Instant::now() + self.quiet_interval);
                *timeout_armed = true;
            }
            Err(e) => warn!("Inhibit call failed: {e}"),
        }
    }

    fn extend_timeout(&mut self, mut sleep_fut: std::pin::Pin<&mut Sleep>, timeout_armed: &mut bool) {
        sleep_fut.as_mut().reset(Instant::now() + self.quiet_interval);
        *timeout_armed = true;
    }

    async fn on_timeout(&mut self, sleep_fut: std::pin::Pin<&mut Sleep>, timeout_armed: &mut bool) {
        let Some(cookie) = self.cookie else {
            return;
        };
        match self.saver.uninhibit(cookie).await {
            Ok(()) => {
                self.cookie = None;
                self.state = State::ArmedIdle;
            }
            Err(e) => {
                warn!("UnInhibit call failed: {e}; will retry at the next quiet period");
                self.extend_timeout(sleep_fut, timeout_armed);
            }
        }
    }

    fn track(&mut self, joystick: ProbedJoystick) {
        if self.joysticks.is_full() {
            warn!("joystick set at capacity, dropping {:?}", joystick.node);
            return;
        }
        match device::open_and_watch(&joystick.node, joystick.name.clone(), self.device_tx.clone()) {
            Ok(record) => {
                if let Err(e) = self.joysticks.add(record) {
                    warn!("failed to track {:?}: {e}", joystick.node);
                }
            }
            Err(e) => warn!("failed to open {:?}: {e}", joystick.node),
        }
    }

    /// Drains the Joystick Set (closing every device fd) and stops the
    /// hotplug monitor. Called once, at the end of `run`; releasing the
    /// bus connection itself is the caller's job, so devices are always
    /// torn down before the bus goes away.
    async fn shutdown(&mut self) {
        if let Some(handle) = self.hotplug_handle.take() {
            handle.abort();
        }
        for mut record in self.joysticks.drain() {
            record.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// A saver backend with no bus underneath it: `inhibit`/`uninhibit`
    /// just hand out and check off cookies, so the state machine can be
    /// driven without a running `org.freedesktop.ScreenSaver`.
    #[derive(Default)]
    struct FakeSaver {
        next_cookie: RefCell<u32>,
        inhibit_calls: RefCell<u32>,
        uninhibit_calls: RefCell<Vec<u32>>,
        fail_uninhibit_once: RefCell<bool>,
    }

    #[async_trait::async_trait(?Send)]
    impl ScreenSaverBackend for FakeSaver {
        async fn inhibit(&self, _reason: &str) -> zbus::Result<Cookie> {
            *self.inhibit_calls.borrow_mut() += 1;
            let mut next = self.next_cookie.borrow_mut();
            *next += 1;
            Ok(Cookie::new(*next).unwrap())
        }

        async fn uninhibit(&self, cookie: Cookie) -> zbus::Result<()> {
            if self.fail_uninhibit_once.replace(false) {
                return Err(zbus::Error::Failure("simulated bus failure".into()));
            }
            self.uninhibit_calls.borrow_mut().push(cookie.get());
            Ok(())
        }

        async fn saver_present(&self) -> zbus::Result<bool> {
            Ok(true)
        }
    }

    fn new_engine(quiet: Duration) -> Engine<FakeSaver> {
        Engine::new(FakeSaver::default(), quiet)
    }

    #[tokio::test(start_paused = true)]
    async fn button_press_while_idle_arms_inhibit_and_timer() {
        let mut engine = new_engine(Duration::from_millis(100));
        engine.state = State::ArmedIdle;
        let sleep_fut = sleep_until(far_future());
        tokio::pin!(sleep_fut);
        let mut armed = false;

        engine.inhibit_on_press(sleep_fut.as_mut(), &mut armed).await;

        assert_eq!(engine.state(), State::ArmedActive);
        assert!(engine.cookie().is_some(), "cookie must be set once armed-active");
        assert!(armed);
        assert_eq!(*engine.saver.inhibit_calls.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_presses_extend_the_timeout_without_a_second_inhibit() {
        let mut engine = new_engine(Duration::from_millis(100));
        engine.state = State::ArmedIdle;
        let sleep_fut = sleep_until(far_future());
        tokio::pin!(sleep_fut);
        let mut armed = false;

        engine.inhibit_on_press(sleep_fut.as_mut(), &mut armed).await;
        let cookie_after_first = engine.cookie();

        engine.extend_timeout(sleep_fut.as_mut(), &mut armed);
        engine.extend_timeout(sleep_fut.as_mut(), &mut armed);

        assert_eq!(engine.cookie(), cookie_after_first, "repeated activity must not re-Inhibit");
        assert_eq!(*engine.saver.inhibit_calls.borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_uninhibits_and_returns_to_armed_idle() {
        let mut engine = new_engine(Duration::from_millis(100));
        engine.state = State::ArmedIdle;
        let sleep_fut = sleep_until(far_future());
        tokio::pin!(sleep_fut);
        let mut armed = false;

        engine.inhibit_on_press(sleep_fut.as_mut(), &mut armed).await;
        let cookie = engine.cookie().unwrap();

        engine.on_timeout(sleep_fut.as_mut(), &mut armed).await;

        assert_eq!(engine.state(), State::ArmedIdle);
        assert!(engine.cookie().is_none(), "cookie must be cleared once back to armed-idle");
        assert_eq!(*engine.saver.uninhibit_calls.borrow(), vec![cookie.get()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_uninhibit_keeps_the_cookie_and_retries_later() {
        let mut engine = new_engine(Duration::from_millis(100));
        engine.state = State::ArmedIdle;
        let sleep_fut = sleep_until(far_future());
        tokio::pin!(sleep_fut);
        let mut armed = false;

        engine.inhibit_on_press(sleep_fut.as_mut(), &mut armed).await;
        engine.saver.fail_uninhibit_once.replace(true);

        engine.on_timeout(sleep_fut.as_mut(), &mut armed).await;

        assert_eq!(engine.state(), State::ArmedActive, "a failed UnInhibit must not drop armed-active");
        assert!(engine.cookie().is_some(), "the cookie must survive a failed UnInhibit");
        assert!(armed, "the timer must be re-armed to retry");
    }

    #[tokio::test(start_paused = true)]
    async fn non_button_events_never_change_state() {
        let mut engine = new_engine(Duration::from_millis(100));
        engine.state = State::ArmedIdle;
        let sleep_fut = sleep_until(far_future());
        tokio::pin!(sleep_fut);
        let mut armed = false;

        engine
            .on_device_event(
                DeviceEvent {
                    slot: 0,
                    kind: DeviceEventKind::Other,
                },
                sleep_fut.as_mut(),
                &mut armed,
            )
            .await;

        assert_eq!(engine.state(), State::ArmedIdle);
        assert!(engine.cookie().is_none());
        assert_eq!(*engine.saver.inhibit_calls.borrow(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn saver_disappearing_with_a_live_cookie_never_calls_uninhibit() {
        let mut engine = new_engine(Duration::from_millis(100));
        engine.state = State::ArmedIdle;
        let sleep_fut = sleep_until(far_future());
        tokio::pin!(sleep_fut);
        let mut armed = false;

        engine.inhibit_on_press(sleep_fut.as_mut(), &mut armed).await;
        assert!(engine.cookie().is_some());

        engine.on_saver_disappeared(sleep_fut.as_mut(), &mut armed).await;

        assert_eq!(engine.state(), State::Disarmed);
        assert!(engine.cookie().is_none());
        assert!(!armed, "the timer must be disarmed once disarmed");
        assert!(
            engine.saver.uninhibit_calls.borrow().is_empty(),
            "no UnInhibit may be sent once the saver is already gone"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn device_gone_event_against_an_empty_set_is_a_harmless_no_op() {
        let mut engine = new_engine(Duration::from_millis(100));
        engine.state = State::ArmedIdle;
        let sleep_fut = sleep_until(far_future());
        tokio::pin!(sleep_fut);
        let mut armed = false;

        engine
            .on_device_event(
                DeviceEvent {
                    slot: 0,
                    kind: DeviceEventKind::Gone,
                },
                sleep_fut.as_mut(),
                &mut armed,
            )
            .await;

        assert_eq!(engine.tracked_count(), 0);
    }
}
