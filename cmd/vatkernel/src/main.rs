mod cli;
mod initializers;
mod worker;

use std::sync::Arc;

use clap::Parser as ClapParser;
use tracing::info;
use vatkern_common::{CapData, EndpointId};
use vatkern_kernel::{Kernel, VatConfig};
use vatkern_storage::backend::in_memory::InMemoryBackend;
use vatkern_storage::Store;

use cli::Options;
use initializers::init_tracing;
use worker::EchoVatWorkerFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Options::parse();
    init_tracing(&opts);

    let store = Store::new(Arc::new(InMemoryBackend::new()));
    let kernel = Kernel::new(store, Arc::new(EchoVatWorkerFactory));

    if opts.demo {
        run_demo(&kernel).await?;
    } else {
        info!("no --demo flag given; nothing to do. Try `vatkernel --demo`.");
    }

    Ok(())
}

/// Launches two vats, sends one message from the kernel to the second
/// vat's root, drives the crank loop to quiescence, and reports what
/// happened — exercising the same path as the "basic send/resolve"
/// scenario, just against the bundled echo worker instead of a script.
async fn run_demo(kernel: &Kernel) -> anyhow::Result<()> {
    let alice_root = kernel
        .launch_vat(VatConfig {
            name: "alice".to_owned(),
            params: serde_json::json!({}),
        })
        .await?;
    let bob_root = kernel
        .launch_vat(VatConfig {
            name: "bob".to_owned(),
            params: serde_json::json!({}),
        })
        .await?;
    info!(%alice_root, %bob_root, "launched demo vats");

    let result = kernel.promises.allocate(Some(EndpointId::Kernel))?;
    kernel.send_from_kernel(bob_root, CapData::plain(&"ping")?, Some(result))?;

    let cranks = kernel.run_to_quiescence().await?;
    let record = kernel.promises.get(result)?;
    info!(cranks, state = ?record.state, "demo settled");

    Ok(())
}
