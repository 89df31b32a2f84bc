#[tokio::main]
async fn main() {
    gpudeck_lib::init_logging();

    if let Err(e) = gpudeck_lib::run().await {
        tracing::error!("GpuDeck failed: {}", e);
        std::process::exit(1);
    }
}
