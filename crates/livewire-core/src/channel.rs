//! Channel lifecycle management.
//!
//! A [`ChannelManager`] owns at most one live [`ChannelHandle`] at a time. It
//! subscribes, translates transport status into [`ChannelStatus`], and makes
//! sure a handle is fully released before the next one is exposed.
//!
//! Every handle gets its own [`Liveness`] flag. Teardown revokes the flag
//! before asking the transport to release the handle, and every deferred
//! callback checks it first, so callbacks from a superseded handle never touch
//! the manager's observable state.

use livewire_transport::{ChannelConfig, ChannelHandle, HandleId, Transport, TransportStatus};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Connection status of a managed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    /// Subscribe issued, waiting for the transport.
    Connecting,
    /// Joined and usable.
    Connected,
    /// Not attached, closed, or timed out.
    Disconnected,
    /// The transport reported a channel error.
    Errored,
}

impl ChannelStatus {
    /// Status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Connected => "connected",
            ChannelStatus::Disconnected => "disconnected",
            ChannelStatus::Errored => "errored",
        }
    }

    /// Whether the channel is usable.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, ChannelStatus::Connected)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&TransportStatus> for ChannelStatus {
    fn from(status: &TransportStatus) -> Self {
        match status {
            TransportStatus::Subscribed => ChannelStatus::Connected,
            TransportStatus::ChannelError(_) => ChannelStatus::Errored,
            TransportStatus::TimedOut | TransportStatus::Closed => ChannelStatus::Disconnected,
        }
    }
}

/// Called with every status change.
pub type StatusHook = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// Called each time the channel becomes connected.
pub type ConnectedHook = Arc<dyn Fn() + Send + Sync>;

/// Options for a [`ChannelManager`].
#[derive(Clone, Default)]
pub struct ChannelOptions {
    /// Invoked synchronously with every status update.
    pub on_status_change: Option<StatusHook>,
    /// Invoked synchronously whenever status becomes `Connected`.
    pub on_connected: Option<ConnectedHook>,
    /// Enables verbose lifecycle logging tagged with this label.
    pub debug_label: Option<String>,
    /// Transport options for every handle this manager opens.
    pub config: ChannelConfig,
}

impl ChannelOptions {
    /// Set the status hook.
    #[must_use]
    pub fn on_status_change(mut self, hook: impl Fn(ChannelStatus) + Send + Sync + 'static) -> Self {
        self.on_status_change = Some(Arc::new(hook));
        self
    }

    /// Set the connected hook.
    #[must_use]
    pub fn on_connected(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connected = Some(Arc::new(hook));
        self
    }

    /// Set the debug label.
    #[must_use]
    pub fn debug_label(mut self, label: impl Into<String>) -> Self {
        self.debug_label = Some(label.into());
        self
    }

    /// Set the transport channel config.
    #[must_use]
    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("on_status_change", &self.on_status_change.is_some())
            .field("on_connected", &self.on_connected.is_some())
            .field("debug_label", &self.debug_label)
            .field("config", &self.config)
            .finish()
    }
}

/// Liveness of one handle generation.
#[derive(Debug)]
pub struct Liveness {
    live: Mutex<bool>,
}

impl Liveness {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(true),
        })
    }

    /// Whether the generation is still current.
    #[must_use]
    pub fn is_live(&self) -> bool {
        *self.live.lock()
    }

    /// Run `f` only while the generation is live.
    ///
    /// Revocation waits for a running `f` to finish, so once [`revoke`]
    /// returns no further `f` can run.
    ///
    /// [`revoke`]: Liveness::revoke
    pub fn run_if_live<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let live = self.live.lock();
        if !*live {
            return None;
        }
        Some(f())
    }

    fn revoke(&self) {
        *self.live.lock() = false;
    }
}

/// A handle together with its liveness flag.
#[derive(Clone)]
pub struct Generation {
    handle: Arc<dyn ChannelHandle>,
    liveness: Arc<Liveness>,
}

impl Generation {
    /// The handle.
    #[must_use]
    pub fn handle(&self) -> &Arc<dyn ChannelHandle> {
        &self.handle
    }

    /// The handle's identity.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.handle.id()
    }

    /// The liveness flag.
    #[must_use]
    pub fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    /// Whether the generation is still current.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.liveness.is_live()
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("handle", &self.handle.id())
            .field("topic", &self.handle.topic())
            .field("live", &self.liveness.is_live())
            .finish()
    }
}

#[derive(Clone, Default)]
struct Hooks {
    on_status_change: Option<StatusHook>,
    on_connected: Option<ConnectedHook>,
    debug_label: Option<String>,
}

struct Shared {
    hooks: RwLock<Hooks>,
    status: watch::Sender<ChannelStatus>,
}

impl Shared {
    fn update_status(&self, liveness: &Liveness, status: ChannelStatus) {
        if liveness
            .run_if_live(|| self.status.send_replace(status))
            .is_none()
        {
            return;
        }

        let hooks = self.hooks.read().clone();
        if let Some(hook) = &hooks.on_status_change {
            hook(status);
        }
        if status.is_connected() {
            if let Some(hook) = &hooks.on_connected {
                hook();
            }
        }
        if let Some(label) = &hooks.debug_label {
            debug!(label = %label, status = %status, "Status changed");
        }
    }
}

/// Reads the manager's current debug label from other components' callbacks.
#[derive(Clone)]
pub struct DebugLabel {
    shared: Arc<Shared>,
}

impl DebugLabel {
    /// The label, if verbose logging is enabled.
    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.shared.hooks.read().debug_label.clone()
    }
}

/// Owns the lifecycle of one logical subscription.
pub struct ChannelManager {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    config: ChannelConfig,
    name: String,
    current: Option<Generation>,
}

impl ChannelManager {
    /// Create a detached manager.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, options: ChannelOptions) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Disconnected);
        Self {
            transport,
            shared: Arc::new(Shared {
                hooks: RwLock::new(Hooks {
                    on_status_change: options.on_status_change,
                    on_connected: options.on_connected,
                    debug_label: options.debug_label,
                }),
                status,
            }),
            config: options.config,
            name: String::new(),
            current: None,
        }
    }

    /// Attach to `name`, releasing any current handle first.
    ///
    /// An empty name leaves the manager detached with status `Disconnected`.
    pub async fn attach(&mut self, name: impl AsRef<str>) {
        self.attach_with(name, |_| {}).await;
    }

    /// Like [`attach`](Self::attach), but runs `prepare` on the new generation
    /// after the previous one is released and before the handle subscribes.
    ///
    /// Handlers registered in `prepare` see every event the transport emits
    /// on join, including the first presence sync.
    pub async fn attach_with(&mut self, name: impl AsRef<str>, prepare: impl FnOnce(&Generation)) {
        let name = name.as_ref();
        self.detach().await;
        self.name = name.to_string();

        if name.is_empty() {
            self.shared.status.send_replace(ChannelStatus::Disconnected);
            return;
        }

        let handle = self.transport.channel(name, self.config.clone());
        let generation = Generation {
            handle: Arc::clone(&handle),
            liveness: Liveness::new(),
        };
        self.current = Some(generation.clone());
        self.shared
            .update_status(&generation.liveness, ChannelStatus::Connecting);

        prepare(&generation);

        if let Some(label) = self.debug_label() {
            debug!(label = %label, channel = %name, "Subscribing to channel");
        }

        let shared = Arc::clone(&self.shared);
        let liveness = Arc::clone(&generation.liveness);
        let topic = name.to_string();
        handle.subscribe(Arc::new(move |status: TransportStatus| {
            if !liveness.is_live() {
                return;
            }
            if let TransportStatus::ChannelError(reason) = &status {
                error!(channel = %topic, reason = ?reason, "Channel error");
            }
            shared.update_status(&liveness, ChannelStatus::from(&status));
        }));
    }

    /// Release the current handle, if any.
    ///
    /// Liveness is revoked before the transport is asked to release the
    /// handle; no hook fires for this generation afterwards.
    pub async fn detach(&mut self) {
        let Some(generation) = self.current.take() else {
            return;
        };

        generation.liveness.revoke();
        self.shared.status.send_replace(ChannelStatus::Disconnected);

        if let Some(label) = self.debug_label() {
            debug!(label = %label, channel = %generation.handle.topic(), "Cleaning up channel");
        }

        if let Err(e) = self.transport.remove_channel(&generation.handle).await {
            warn!(channel = %generation.handle.topic(), error = %e, "Failed to release channel");
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        *self.shared.status.borrow()
    }

    /// Stream of status values.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.shared.status.subscribe()
    }

    /// The live handle, if attached.
    #[must_use]
    pub fn handle(&self) -> Option<Arc<dyn ChannelHandle>> {
        self.current.as_ref().map(|g| Arc::clone(&g.handle))
    }

    /// The current generation, if attached.
    #[must_use]
    pub fn generation(&self) -> Option<Generation> {
        self.current.clone()
    }

    /// The name last passed to [`attach`](Self::attach).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a handle is currently held.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.current.is_some()
    }

    /// Replace the status hook. Takes effect for the next update.
    pub fn set_on_status_change(&self, hook: Option<StatusHook>) {
        self.shared.hooks.write().on_status_change = hook;
    }

    /// Replace the connected hook. Takes effect for the next update.
    pub fn set_on_connected(&self, hook: Option<ConnectedHook>) {
        self.shared.hooks.write().on_connected = hook;
    }

    /// Replace the debug label.
    pub fn set_debug_label(&self, label: Option<String>) {
        self.shared.hooks.write().debug_label = label;
    }

    /// Current debug label.
    #[must_use]
    pub fn debug_label(&self) -> Option<String> {
        self.shared.hooks.read().debug_label.clone()
    }

    /// A reader for the debug label that can be moved into callbacks.
    #[must_use]
    pub fn debug_label_ref(&self) -> DebugLabel {
        DebugLabel {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        let Some(generation) = self.current.take() else {
            return;
        };
        generation.liveness.revoke();

        // Release needs the runtime; without one the transport reclaims the
        // handle when it is dropped.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            runtime.spawn(async move {
                if let Err(e) = transport.remove_channel(&generation.handle).await {
                    warn!(channel = %generation.handle.topic(), error = %e, "Failed to release channel");
                }
            });
        }
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("transport", &self.transport.name())
            .field("name", &self.name)
            .field("status", &self.status())
            .field("current", &self.current)
            .finish()
    }
}
