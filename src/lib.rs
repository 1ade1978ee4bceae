pub mod config;
pub mod logger;
pub mod observer;
pub mod statistics;

use std::sync::Arc;

use sdk::{Service, ServiceOptions};
use service::{Error, HostValue, RemoteObject, Value};

use self::config::Config;
use self::observer::Observer;
use self::statistics::Statistics;

/// A nameless placeholder export registered for every name in
/// `config.publish` that isn't one of the built-in demo objects below, so a
/// freshly started peer always has *something* resolvable to test against.
struct Echo;

impl RemoteObject for Echo {
    fn call(&self, args: Vec<HostValue>, _kwargs: Vec<(String, HostValue)>) -> Result<HostValue, Error> {
        Ok(args.into_iter().next().unwrap_or(HostValue::Value(Value::Nil)))
    }
}

/// Binds the socket, registers every name listed under `publish`, and runs
/// until interrupted. Exposed as a library function, not inlined into
/// `main`, so integration tests can start a real peer in-process.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let statistics = Statistics::default();
    let observer = Observer::new(config.clone(), statistics);

    let service = Service::bind(ServiceOptions {
        bind_addr: config.network.listen,
        authenticator: observer,
        worker_threads: config.network.worker_threads,
        retry: service::RetryPolicy {
            retries: config.transaction.retries,
            base_interval: config.transaction.base_interval(),
        },
        reply_cache_ttl: config.transaction.reply_cache_ttl(),
    })
    .await?;

    for name in &config.publish {
        service.register(Some(name), Arc::new(Echo));
        log::info!("netmirror: published {name:?}");
    }

    log::info!("netmirror: listening on {}", service.local_addr());

    tokio::signal::ctrl_c().await?;
    log::info!("netmirror: shutting down");

    Ok(())
}
