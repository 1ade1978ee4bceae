//! Full-stack smoke test: two real peers bound to loopback UDP sockets,
//! talking through `netmirror-sdk`'s receiver task and worker pool rather
//! than calling the dispatcher or transaction layer directly.

use std::sync::Arc;
use std::time::Duration;

use sdk::{Service, ServiceOptions};
use service::{DefaultAuthenticator, Error, HostValue, RemoteObject, Value};

struct Mailbox {
    messages: parking_lot::Mutex<Vec<String>>,
}

impl RemoteObject for Mailbox {
    fn call(&self, args: Vec<HostValue>, _kwargs: Vec<(String, HostValue)>) -> Result<HostValue, Error> {
        let text = match args.first() {
            Some(HostValue::Value(Value::TextString(s))) => s.clone(),
            _ => return Err(Error::MalformedValue { offset: 0 }),
        };
        self.messages.lock().push(text);
        Ok(HostValue::Value(Value::SignedInt(self.messages.lock().len() as i64)))
    }

    fn len(&self) -> Result<i64, Error> {
        Ok(self.messages.lock().len() as i64)
    }
}

async fn bind_loopback() -> Arc<Service<DefaultAuthenticator>> {
    Service::bind(ServiceOptions {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServiceOptions::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn two_peers_exchange_calls_over_real_udp_sockets() {
    let receiver = bind_loopback().await;
    receiver.register(
        Some("mailbox"),
        Arc::new(Mailbox { messages: parking_lot::Mutex::new(Vec::new()) }),
    );

    let sender = bind_loopback().await;
    let peer = sender.connect(receiver.local_addr()).await.unwrap();
    let mailbox = sender.resolve(&peer, "mailbox").await.unwrap();

    for text in ["hello", "from", "nom"] {
        let mailbox = mailbox.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            mailbox.call(vec![HostValue::Value(Value::TextString(text))], vec![])
        })
        .await
        .unwrap()
        .unwrap();
    }

    let len = tokio::task::spawn_blocking({
        let mailbox = mailbox.clone();
        move || mailbox.len()
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(len, 3);
}

#[tokio::test]
async fn connecting_to_a_dead_address_times_out() {
    let sender = bind_loopback().await;
    // Nothing is listening on this port; the transaction layer should retry
    // and then fail with `Timeout` rather than hang.
    let dead_addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), sender.connect(dead_addr)).await;
    match result {
        Ok(Err(Error::Timeout)) => {}
        Ok(Err(Error::PeerUnreachable(_))) => {}
        other => panic!("expected a timeout or unreachable error, got {other:?}"),
    }
}
