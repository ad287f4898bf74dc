//! In-process `Endpoint` over `tokio::sync::mpsc`, used by the bundled demo
//! worker and integration tests so the full crank loop is exercisable
//! without spawning a subprocess (§4.6 ambient stack).

use tokio::sync::{mpsc, oneshot};

use crate::endpoint::{DeliveryReply, Endpoint, EndpointError};
use crate::wire::Delivery;

/// One request the channel worker loop receives: a delivery plus a
/// one-shot reply channel, mirroring a single synchronous RPC call.
pub struct ChannelRequest {
    pub delivery: Delivery,
    pub reply: oneshot::Sender<Result<DeliveryReply, EndpointError>>,
}

/// The kernel-facing half: implements `Endpoint` by forwarding deliveries
/// down an mpsc channel and awaiting the worker's reply.
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    sender: mpsc::Sender<ChannelRequest>,
}

impl ChannelEndpoint {
    pub fn new(sender: mpsc::Sender<ChannelRequest>) -> Self {
        ChannelEndpoint { sender }
    }

    /// Creates a connected pair: the `Endpoint` handle and the worker-side
    /// receiver to drive with a `deliver` loop of the caller's choosing.
    pub fn pair(buffer: usize) -> (ChannelEndpoint, mpsc::Receiver<ChannelRequest>) {
        let (tx, rx) = mpsc::channel(buffer);
        (ChannelEndpoint::new(tx), rx)
    }
}

#[async_trait::async_trait]
impl Endpoint for ChannelEndpoint {
    async fn deliver(&self, delivery: Delivery) -> Result<DeliveryReply, EndpointError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(ChannelRequest {
                delivery,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EndpointError::Closed)?;
        reply_rx.await.map_err(|_| EndpointError::Closed)?
    }
}
