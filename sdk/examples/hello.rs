//! Two peers on loopback: one exports a greeter object, the other resolves
//! it by name and calls it. Run with `cargo run -p netmirror-sdk --example hello`.

use std::sync::Arc;

use service::{Error, HostValue, RemoteObject, Value};
use sdk::{Service, ServiceOptions};

struct Greeter;

impl RemoteObject for Greeter {
    fn call(&self, args: Vec<HostValue>, _kwargs: Vec<(String, HostValue)>) -> Result<HostValue, Error> {
        let name = match args.first() {
            Some(HostValue::Value(Value::TextString(s))) => s.clone(),
            _ => return Err(Error::MalformedValue { offset: 0 }),
        };
        Ok(HostValue::Value(Value::TextString(format!("hello, {name}!"))))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let server = Service::bind(ServiceOptions {
        bind_addr: "127.0.0.1:0".parse()?,
        ..ServiceOptions::default()
    })
    .await?;
    server.register(Some("greeter"), Arc::new(Greeter));
    log::info!("server listening on {}", server.local_addr());

    let client = Service::bind(ServiceOptions {
        bind_addr: "127.0.0.1:0".parse()?,
        ..ServiceOptions::default()
    })
    .await?;

    let peer = client.connect(server.local_addr()).await?;
    let greeter = client.resolve(&peer, "greeter").await?;

    let reply = tokio::task::spawn_blocking(move || {
        greeter.call(vec![HostValue::Value(Value::TextString("nom".to_string()))], vec![])
    })
    .await??;

    match reply {
        HostValue::Value(Value::TextString(s)) => println!("{s}"),
        _ => println!("unexpected reply shape"),
    }

    Ok(())
}
