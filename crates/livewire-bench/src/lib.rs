//! Fixtures shared by the Livewire benchmarks.
//!
//! Everything runs over an in-process [`MemoryHub`], so the numbers measure
//! Livewire's own bookkeeping rather than network I/O.

use livewire_core::{
    Broadcast, ChannelOptions, ChannelStatus, PresenceOptions, PresenceReconciler, RpcEngine,
    RpcOptions, RpcResponder,
};
use livewire_transport::{MemoryHub, Principal};
use std::time::Duration;
use tokio::sync::watch;

/// Control channel used by the RPC fixtures.
pub const CTRL_CHANNEL: &str = "ctrl:bench:1";

/// Live channel used by the broadcast fixtures.
pub const LIVE_CHANNEL: &str = "live:bench:1";

/// Presence channel used by the presence fixtures.
pub const PRESENCE_CHANNEL: &str = "presence:bench:1";

/// A multi-threaded runtime for driving async fixtures from criterion.
///
/// # Panics
///
/// Panics if the runtime cannot be built.
#[must_use]
pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}

/// Wait until a status stream reports `Connected`.
///
/// # Panics
///
/// Panics if the channel does not connect within five seconds.
pub async fn wait_connected(mut status: watch::Receiver<ChannelStatus>) {
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_connected()))
        .await
        .expect("channel did not connect")
        .expect("status sender dropped");
}

/// An RPC engine wired to a responder serving `echo`.
pub async fn rpc_pair(hub: &MemoryHub, options: RpcOptions) -> (RpcEngine, RpcResponder) {
    let mut responder =
        RpcResponder::new(hub.transport(Principal::Anonymous), ChannelOptions::default());
    responder.handle("echo", |request| async move { Ok(request.params) });
    responder.attach(CTRL_CHANNEL).await;
    wait_connected(responder.watch_status()).await;

    let mut engine = RpcEngine::new(hub.transport(Principal::Anonymous), options);
    engine.attach(CTRL_CHANNEL).await;
    wait_connected(engine.watch_status()).await;

    (engine, responder)
}

/// A connected broadcast facade on [`LIVE_CHANNEL`].
pub async fn live_broadcast(hub: &MemoryHub) -> Broadcast {
    let mut broadcast =
        Broadcast::new(hub.transport(Principal::Anonymous), ChannelOptions::default());
    broadcast.attach(LIVE_CHANNEL).await;
    wait_connected(broadcast.watch_status()).await;
    broadcast
}

/// A connected presence reconciler on [`PRESENCE_CHANNEL`] keyed by `key`.
pub async fn presence_peer(hub: &MemoryHub, key: &str) -> PresenceReconciler {
    let options = PresenceOptions::default().key(key).auto_track(false);
    let mut reconciler = PresenceReconciler::new(hub.transport(Principal::Anonymous), options);
    reconciler.attach(PRESENCE_CHANNEL).await;
    wait_connected(reconciler.watch_status()).await;
    reconciler
}
