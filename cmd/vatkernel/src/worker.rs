//! The bundled `VatWorkerFactory`: an in-process echo worker, in the same
//! spirit as `ethrex`'s `VmEngine` being pluggable behind a trait while the
//! binary wires up a concrete implementation. Every delivered `message` with
//! a `result` promise is answered with the plain value `42`; every other
//! delivery gets an empty, non-aborting reply. Good enough to drive the
//! crank loop end to end without a real vat worker process.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use vatkern_common::{EndpointId, VCapData};
use vatkern_kernel::error::LifecycleError;
use vatkern_kernel::{VatConfig, VatWorkerFactory};
use vatkern_protocol::{ChannelEndpoint, CrankOutcome, Delivery, DeliveryReply, Endpoint, ResolveEntry, SyscallRequest};

pub struct EchoVatWorkerFactory;

#[async_trait]
impl VatWorkerFactory for EchoVatWorkerFactory {
    async fn spawn(&self, vat_id: EndpointId, config: &VatConfig) -> Result<Arc<dyn Endpoint>, LifecycleError> {
        let (endpoint, mut worker_rx) = ChannelEndpoint::pair(32);
        let name = config.name.clone();
        tokio::spawn(async move {
            while let Some(request) = worker_rx.recv().await {
                let reply = echo(request.delivery);
                let _ = request.reply.send(Ok(reply));
            }
            info!(%vat_id, name = %name, "echo worker stream closed");
        });
        Ok(Arc::new(endpoint))
    }

    async fn stop(&self, _vat_id: EndpointId) {}
}

fn echo(delivery: Delivery) -> DeliveryReply {
    match delivery {
        Delivery::Message { result: Some(result), .. } => {
            let data = VCapData::plain(&42i64).unwrap_or_else(|_| VCapData::new("null", vec![]));
            DeliveryReply {
                syscalls: vec![SyscallRequest::Resolve {
                    resolutions: vec![ResolveEntry {
                        kpid: result,
                        rejected: false,
                        data,
                    }],
                }],
                outcome: CrankOutcome::normal(),
            }
        }
        _ => DeliveryReply::default(),
    }
}
