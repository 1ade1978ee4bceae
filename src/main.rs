#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use netmirror::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    netmirror::logger::init(&config)?;

    if config.publish.is_empty() {
        log::warn!("netmirror: no names configured under `publish`; the peer will still accept connections, but has nothing to resolve");
    }

    netmirror::startup(config).await
}
