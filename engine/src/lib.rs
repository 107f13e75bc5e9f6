pub mod asset;
pub mod channels;
pub mod client;
pub mod decoder;
mod engine;
pub mod error;
pub mod hw;
pub mod job;
pub mod mapper;
pub mod message;
pub mod progress;
pub mod pump;
pub mod registry;
pub mod transport;

use crate::hw::traits::DaqBackend;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;

/// Start an engine over the default backend for this build.
pub fn init() -> (UnboundedSender<message::Message>, JoinHandle<()>) {
    init_with_backend(hw::default_backend())
}

/// Start an engine over an explicit backend. Tests hand in a simulator and
/// keep its probe handle.
pub fn init_with_backend(
    backend: Arc<dyn DaqBackend>,
) -> (UnboundedSender<message::Message>, JoinHandle<()>) {
    let (tx, rx) = unbounded_channel::<message::Message>();
    let mut engine = engine::Engine::new(rx, backend);
    let handle = tokio::spawn(async move {
        engine.work().await;
    });
    (tx, handle)
}
