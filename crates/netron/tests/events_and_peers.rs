mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Counter, Echo, config, eventually, link};
use netron::{
    ContextAuthorizer, Definition, Netron, NetronConfig, NetronError, Peer, Value, handler, names,
    remote_handler,
};
use parking_lot::Mutex;
use serde_json::{Value as Json, json};

fn super_config() -> NetronConfig {
    NetronConfig {
        is_super: true,
        ..config()
    }
}

#[tokio::test]
async fn test_context_events_keep_order_per_context() {
    let hub = Netron::new(config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    for event in [names::CONTEXT_ATTACH, names::CONTEXT_DETACH] {
        let seen = Arc::clone(&seen);
        hub.on(
            event,
            handler(move |args: Vec<Json>| {
                let seen = Arc::clone(&seen);
                async move {
                    // The first notification is the slow one.
                    if event == names::CONTEXT_ATTACH {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    seen.lock().push((event, args[0]["id"].clone()));
                }
            }),
        );
    }

    hub.attach_context(Arc::new(Echo), Some("a")).unwrap();
    hub.detach_context("a", true).unwrap();

    eventually(|| seen.lock().len() == 2).await;
    assert_eq!(
        *seen.lock(),
        vec![
            (names::CONTEXT_ATTACH, json!("a")),
            (names::CONTEXT_DETACH, json!("a")),
        ]
    );
}

#[tokio::test]
async fn test_emit_waits_for_handlers() {
    let hub = Netron::new(config());
    let hits = Arc::new(Mutex::new(0));
    for _ in 0..2 {
        let hits = Arc::clone(&hits);
        hub.on(
            "tick",
            handler(move |_| {
                let hits = Arc::clone(&hits);
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    *hits.lock() += 1;
                }
            }),
        );
    }
    hub.emit("tick", vec![]).await;
    assert_eq!(*hits.lock(), 2);
}

#[tokio::test]
async fn test_peer_lifecycle_events() {
    let server = Netron::new(config());
    let client = Netron::new(config());
    let events = Arc::new(Mutex::new(Vec::new()));
    for event in [names::PEER_CREATE, names::PEER_CONNECT, names::PEER_ONLINE, names::PEER_OFFLINE] {
        let events = Arc::clone(&events);
        client.on(
            event,
            handler(move |args: Vec<Json>| {
                let events = Arc::clone(&events);
                async move { events.lock().push((event, args[0]["peerId"].clone())) }
            }),
        );
    }

    let sid = link(&server, &client).await;
    eventually(|| events.lock().len() == 3).await;
    assert_eq!(events.lock()[0].0, names::PEER_CREATE);
    assert_eq!(events.lock()[1].0, names::PEER_CONNECT);
    assert_eq!(events.lock()[2], (names::PEER_ONLINE, json!(sid.as_str())));

    client.disconnect(&sid).await.unwrap();
    eventually(|| events.lock().len() == 4).await;
    assert_eq!(events.lock()[3], (names::PEER_OFFLINE, json!(sid.as_str())));
    eventually(|| server.peers().is_empty()).await;
}

#[tokio::test]
async fn test_remote_event_subscription() {
    let server = Netron::new(config());
    let client = Netron::new(config());
    let sid = link(&server, &client).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sub = {
        let seen = Arc::clone(&seen);
        client
            .on_remote(
                Some(&sid),
                "tick",
                remote_handler(move |from, args| {
                    let seen = Arc::clone(&seen);
                    async move { seen.lock().push((from, args)) }
                }),
            )
            .await
            .unwrap()
    };

    server.emit("tick", vec![json!(1)]).await;
    assert_eq!(*seen.lock(), vec![(sid.clone(), vec![json!(1)])]);

    client.off_remote(sub).await;
    server.emit("tick", vec![json!(2)]).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_remote_events_from_all_peers() {
    let a = Netron::new(config());
    let b = Netron::new(config());
    let client = Netron::new(config());
    let aid = link(&a, &client).await;
    let bid = link(&b, &client).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        client
            .on_remote(
                None,
                "news",
                remote_handler(move |from, _| {
                    let seen = Arc::clone(&seen);
                    async move { seen.lock().push(from) }
                }),
            )
            .await
            .unwrap();
    }

    a.emit("news", vec![]).await;
    b.emit("news", vec![]).await;
    assert_eq!(*seen.lock(), vec![aid, bid]);
}

#[tokio::test]
async fn test_remote_attach_needs_super_peer() {
    let server = Netron::new(config());
    let client = Netron::new(config());
    let sid = link(&server, &client).await;

    let err = client
        .attach_context_remote(&sid, Arc::new(Echo), "proxied")
        .await
        .unwrap_err();
    assert!(matches!(err, NetronError::NotSuperPeer(_)));
}

struct DenyAll;

impl ContextAuthorizer for DenyAll {
    fn authorize_attach(&self, _hub: &Netron, _peer: &Peer, _id: &str, _def: &Definition) -> bool {
        false
    }

    fn authorize_detach(&self, _hub: &Netron, _peer: &Peer, _id: &str) -> bool {
        false
    }
}

#[tokio::test]
async fn test_declined_attach_is_not_implemented() {
    let server = Netron::new(super_config());
    server.set_context_authorizer(Arc::new(DenyAll));
    let client = Netron::new(config());
    let sid = link(&server, &client).await;

    let err = client
        .attach_context_remote(&sid, Arc::new(Echo), "proxied")
        .await
        .unwrap_err();
    assert!(matches!(err, NetronError::NotImplemented(_)));
    assert!(!server.has_context("proxied"));
    assert!(client.get_peer(&sid).unwrap().is_online());
}

#[tokio::test]
async fn test_super_peer_proxies_attached_context() {
    let server = Netron::new(super_config());
    let client = Netron::new(config());
    let other = Netron::new(config());
    let sid = link(&server, &client).await;
    let oid = link(&server, &other).await;

    client
        .attach_context_remote(&sid, Arc::new(Counter::default()), "shared")
        .await
        .unwrap();
    assert!(server.has_context("shared"));
    assert!(matches!(
        client
            .attach_context_remote(&sid, Arc::new(Echo), "shared")
            .await,
        Err(NetronError::AlreadyExists(_))
    ));

    // A third peer learns about it and calls through the super peer.
    let via = other.get_peer(&oid).unwrap();
    eventually(|| via.has_context("shared")).await;
    let shared = other.get_interface_by_name("shared", Some(&oid)).unwrap();
    shared.set("counter", json!(41).into()).await.unwrap();
    assert_eq!(shared.call("increment", vec![]).await.unwrap(), Value::from(json!(42)));

    client.detach_context_remote(&sid, "shared").await.unwrap();
    assert!(!server.has_context("shared"));
    assert!(matches!(
        client.detach_context_remote(&sid, "shared").await,
        Err(NetronError::UnknownContext(_))
    ));
    eventually(|| !via.has_context("shared")).await;

    // Contexts attached by a peer go away with it.
    client
        .attach_context_remote(&sid, Arc::new(Echo), "echo")
        .await
        .unwrap();
    assert!(server.has_context("echo"));
    client.disconnect(&sid).await.unwrap();
    eventually(|| !server.has_context("echo")).await;
}

#[tokio::test]
async fn test_one_instance_attached_remotely_under_two_names() {
    let server = Netron::new(super_config());
    let client = Netron::new(config());
    let sid = link(&server, &client).await;

    let counter = Arc::new(Counter::default());
    let a = client
        .attach_context_remote(&sid, counter.clone(), "a")
        .await
        .unwrap();
    let b = client
        .attach_context_remote(&sid, counter, "b")
        .await
        .unwrap();
    assert_ne!(a, b);

    client.detach_context_remote(&sid, "a").await.unwrap();
    assert!(client.get_stub_by_id(a).is_err());
    assert!(!server.has_context("a"));

    let shared = server.get_interface_by_name("b", None).unwrap();
    assert_eq!(shared.call("increment", vec![]).await.unwrap(), Value::from(json!(1)));

    client.disconnect(&sid).await.unwrap();
    assert!(client.get_stub_by_id(b).is_err());
    eventually(|| !server.has_context("b")).await;
}

#[tokio::test]
async fn test_stream_delivers_chunks_in_order() {
    let server = Netron::new(config());
    let client = Netron::new(config());
    let mut incoming = server.incoming_streams().unwrap();
    assert!(server.incoming_streams().is_none());
    let sid = link(&server, &client).await;

    let peer = client.get_peer(&sid).unwrap();
    let mut out = peer.open_stream().await.unwrap();
    for n in 0..3 {
        out.write(json!(n)).await.unwrap();
    }
    out.end().await.unwrap();

    let mut stream = incoming.recv().await.unwrap();
    assert_eq!(stream.peer_id().as_ref(), Some(client.id()));
    for n in 0..3 {
        assert_eq!(stream.recv().await, Some(json!(n)));
    }
    assert_eq!(stream.recv().await, None);
}

#[tokio::test]
async fn test_websocket_bind_and_connect() {
    let server = Netron::new(config());
    server.attach_context(Arc::new(Echo), Some("echo")).unwrap();
    let addr = server.bind(Some("127.0.0.1:0")).await.unwrap();

    let client = Netron::new(config());
    let peer = client.connect(&addr.to_string()).await.unwrap();
    let sid = peer.id().unwrap();
    assert_eq!(&sid, server.id());

    let again = client.connect(&addr.to_string()).await.unwrap();
    assert!(Peer::ptr_eq(&peer, &again));

    let echo = client.get_interface_by_name("echo", Some(&sid)).unwrap();
    assert_eq!(
        echo.call("method", vec![json!("hi").into()]).await.unwrap(),
        Value::from(json!(["hi"]))
    );

    server.shutdown().await;
    eventually(|| client.peers().is_empty()).await;
    assert!(server.context_names().is_empty());
}

#[tokio::test]
async fn test_connect_refused_after_retries() {
    let client = Netron::new(NetronConfig {
        connect: netron::ConnectConfig {
            retries: 1,
            min_timeout: Duration::from_millis(10),
            max_timeout: Duration::from_millis(20),
        },
        ..config()
    });
    let err = client.connect("127.0.0.1:1").await.unwrap_err();
    assert!(matches!(err, NetronError::ConnectRefused(_)));
}
