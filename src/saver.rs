//! Saver Client and Name Watcher: typed wrappers over a zbus proxy for
//! `Inhibit`/`UnInhibit`/`NameHasOwner`, plus a stream of name-ownership
//! changes for `org.freedesktop.ScreenSaver`.

use async_trait::async_trait;
use futures_util::StreamExt;
use log::trace;
use zbus::fdo;
use zbus::proxy;
use zbus::Connection;

pub const SAVER_NAME: &str = "org.freedesktop.ScreenSaver";
const APP_NAME: &str = "joynosleep";

#[proxy(
    interface = "org.freedesktop.ScreenSaver",
    default_service = "org.freedesktop.ScreenSaver",
    default_path = "/org/freedesktop/ScreenSaver"
)]
trait ScreenSaver {
    fn inhibit(&self, application_name: &str, reason_for_inhibit: &str) -> zbus::Result<u32>;
    fn un_inhibit(&self, cookie: u32) -> zbus::Result<()>;
}

/// An opaque cookie returned by `Inhibit`. Zero is reserved to mean "no
/// active inhibition"; wrapping it in `NonZeroU32` makes that state
/// unrepresentable as a live `Cookie`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie(std::num::NonZeroU32);

impl Cookie {
    /// `None` for the reserved value 0, matching what a real `Inhibit`
    /// reply would reject.
    pub fn new(raw: u32) -> Option<Self> {
        std::num::NonZeroU32::new(raw).map(Cookie)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

/// The three remote operations the Activity Engine drives the saver
/// through. Pulled out as a trait (rather than calling `SaverClient`
/// directly) so `engine.rs` can be exercised against a fake in tests
/// without a live bus connection.
#[async_trait(?Send)]
pub trait ScreenSaverBackend {
    async fn inhibit(&self, reason: &str) -> zbus::Result<Cookie>;
    async fn uninhibit(&self, cookie: Cookie) -> zbus::Result<()>;
    async fn saver_present(&self) -> zbus::Result<bool>;
}

pub struct SaverClient {
    proxy: ScreenSaverProxy<'static>,
    dbus: fdo::DBusProxy<'static>,
}

impl SaverClient {
    pub async fn new(conn: &Connection) -> zbus::Result<Self> {
        let proxy = ScreenSaverProxy::new(conn).await?;
        let dbus = fdo::DBusProxy::new(conn).await?;
        Ok(Self { proxy, dbus })
    }

    /// A stream of appeared/disappeared transitions for the saver's
    /// well-known name, filtered server-side to just that name.
    pub async fn watch_name_owner(
        &self,
    ) -> zbus::Result<impl futures_util::Stream<Item = NameEvent>> {
        let stream = self
            .dbus
            .receive_name_owner_changed_with_args(&[(0, SAVER_NAME)])
            .await?;
        Ok(stream.filter_map(|signal| async move {
            let args = signal.args().ok()?;
            Some(if args.new_owner().as_ref().is_none() {
                NameEvent::Disappeared
            } else {
                NameEvent::Appeared
            })
        }))
    }
}

#[async_trait(?Send)]
impl ScreenSaverBackend for SaverClient {
    /// `Inhibit(app_name, reason) -> cookie`. Records this process as
    /// the caller.
    async fn inhibit(&self, reason: &str) -> zbus::Result<Cookie> {
        let raw = self.proxy.inhibit(APP_NAME, reason).await?;
        let cookie = Cookie::new(raw)
            .ok_or_else(|| zbus::Error::Failure("saver returned cookie 0".into()))?;
        trace!("screen saver inhibited; cookie={}", cookie.get());
        Ok(cookie)
    }

    /// No-op if called with no cookie; callers are expected to only
    /// invoke this when a cookie is live (enforced by `Option<Cookie>`
    /// at the call site in `engine.rs`).
    async fn uninhibit(&self, cookie: Cookie) -> zbus::Result<()> {
        self.proxy.un_inhibit(cookie.get()).await?;
        trace!("screen saver uninhibited; cookie={}", cookie.get());
        Ok(())
    }

    /// Probes whether anyone currently owns the saver's well-known name.
    async fn saver_present(&self) -> zbus::Result<bool> {
        self.dbus.name_has_owner(SAVER_NAME.try_into()?).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameEvent {
    Appeared,
    Disappeared,
}
