mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use hive_mesh::{Context, EmitOptions, MeshError, Payload, Peer};
use serde_json::json;

use common::{WAIT, connect_once, eventually, listen, peer};

async fn echo_server(name: &str) -> (Peer, String) {
    let server = peer(name);
    let role = server.role("echo");
    role.on_request("echo", |ctx: Context| async move { ctx.reply(ctx.data()) });
    role.on_request("whoami", |ctx: Context| async move {
        let me = ctx.unit().name().to_string();
        ctx.reply(format!("{me} asked"))
    });
    let address = listen(&server).await;
    (server, address)
}

#[tokio::test]
async fn request_echoes_every_payload_kind() {
    let (_server, address) = echo_server("server").await;
    let client = peer("client");
    let echo = client.destination("echo");
    connect_once(&client, &address).await;
    echo.wait_ready(WAIT).await.unwrap();

    let payloads = vec![
        Payload::Null,
        Payload::from(true),
        Payload::from(false),
        Payload::from(42.5),
        Payload::from(-7),
        Payload::from("hello"),
        Payload::from(""),
        Payload::from(vec![0u8, 1, 2, 255]),
        Payload::from(json!({ "a": [1, 2], "b": "c" })),
        Payload::from(json!([true, null])),
    ];
    for payload in payloads {
        let response = echo.request("echo", payload.clone()).await.unwrap();
        assert_eq!(response.data, payload);
        assert_eq!(response.unit.name(), "server");
    }
}

#[tokio::test]
async fn none_arrives_as_null() {
    let (_server, address) = echo_server("server").await;
    let client = peer("client");
    let echo = client.destination("echo");
    connect_once(&client, &address).await;
    echo.wait_ready(WAIT).await.unwrap();

    let response = echo.request("echo", Option::<String>::None).await.unwrap();
    assert!(response.data.is_null());
}

#[tokio::test]
async fn echo_scenario_reports_round_trip_time() {
    let (_server, address) = echo_server("server").await;
    let client = peer("client");
    let echo = client.destination("echo");
    connect_once(&client, &address).await;
    echo.wait_ready(WAIT).await.unwrap();

    let response = echo.request("echo", "hello").await.unwrap();
    assert_eq!(response.data.as_str(), Some("hello"));
    assert!(response.rtt < WAIT);
}

#[tokio::test]
async fn send_rotates_and_broadcast_reaches_all() {
    let counts: Vec<Arc<AtomicUsize>> = (0..2).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let mut servers = Vec::new();
    let client = peer("client");
    let counter = client.destination("counter");

    for (i, count) in counts.iter().enumerate() {
        let server = peer(&format!("server-{i}"));
        let count = Arc::clone(count);
        server.role("counter").on_message("hit", move |_ctx: Context| {
            let count = Arc::clone(&count);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let address = listen(&server).await;
        connect_once(&client, &address).await;
        servers.push(server);
    }
    eventually("two counter units", || counter.units().len() == 2).await;

    assert!(counter.send("hit", ()).is_some());
    assert!(counter.send("hit", ()).is_some());
    eventually("one hit each", || {
        counts.iter().all(|c| c.load(Ordering::SeqCst) == 1)
    })
    .await;

    assert_eq!(counter.broadcast("hit", ()), 2);
    eventually("two hits each", || {
        counts.iter().all(|c| c.load(Ordering::SeqCst) == 2)
    })
    .await;
}

#[tokio::test]
async fn survey_collects_one_reply_per_unit() {
    let client = peer("client");
    let echo = client.destination("echo");
    let mut servers = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let (server, address) = echo_server(name).await;
        connect_once(&client, &address).await;
        servers.push(server);
    }
    eventually("three echo units", || echo.units().len() == 3).await;

    let replies: Vec<_> = tokio::time::timeout(WAIT, echo.survey("echo", 7).collect::<Vec<_>>())
        .await
        .unwrap();
    assert_eq!(replies.len(), 3);
    let mut names: Vec<_> = replies
        .into_iter()
        .map(|r| {
            let r = r.unwrap();
            assert_eq!(r.data, Payload::from(7));
            r.unit.name().to_string()
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn targeted_requests_resolve_independently() {
    let client = peer("client");
    let echo = client.destination("echo");
    let (_a, address_a) = echo_server("alpha").await;
    let (_b, address_b) = echo_server("beta").await;
    let unit_a = connect_once(&client, &address_a).await;
    let unit_b = connect_once(&client, &address_b).await;
    eventually("two echo units", || echo.units().len() == 2).await;

    let (ra, rb) = tokio::join!(
        echo.request(EmitOptions::new("echo").to_unit(Arc::clone(&unit_a)), "for alpha"),
        echo.request(EmitOptions::new("echo").to_unit(Arc::clone(&unit_b)), "for beta"),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert!(Arc::ptr_eq(&ra.unit, &unit_a));
    assert!(Arc::ptr_eq(&rb.unit, &unit_b));
    assert_eq!(ra.data.as_str(), Some("for alpha"));
    assert_eq!(rb.data.as_str(), Some("for beta"));
}

#[tokio::test]
async fn routing_failures_are_answered_as_errors() {
    let server = peer("server");
    server
        .role("svc")
        .on_request("known", |ctx: Context| async move { ctx.reply("ok") });
    server
        .role_with_status("off", false)
        .on_request("known", |ctx: Context| async move { ctx.reply("ok") });
    let address = listen(&server).await;

    let client = peer("client");
    let svc = client.destination("svc");
    let unit = connect_once(&client, &address).await;
    svc.wait_ready(WAIT).await.unwrap();
    assert_eq!(unit.roles(), vec!["svc".to_string()]);

    let err = svc.request("unknown", ()).await.unwrap_err();
    assert!(
        matches!(&err, MeshError::Remote(m) if m == r#"The event "unknown" is not handled"#),
        "{err}"
    );

    let ghost = client.destination("ghost");
    assert!(matches!(
        ghost.request("known", ()).await,
        Err(MeshError::NoUnits(_))
    ));
    let err = ghost
        .request(EmitOptions::new("known").to_unit(Arc::clone(&unit)), ())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, MeshError::Remote(m) if m == r#"The role "ghost" is not registered"#),
        "{err}"
    );

    let off = client.destination("off");
    let err = off
        .request(EmitOptions::new("known").to_unit(Arc::clone(&unit)), ())
        .await
        .unwrap_err();
    assert!(
        matches!(&err, MeshError::Remote(m) if m == r#"The role "off" is disabled"#),
        "{err}"
    );

    // The connection survives routing failures.
    assert_eq!(svc.request("known", ()).await.unwrap().data.as_str(), Some("ok"));
}

#[tokio::test]
async fn handler_rejections_reach_the_caller() {
    let server = peer("server");
    let role = server.role("svc");
    role.on_request("refuse", |ctx: Context| async move { ctx.reject("nope") });
    role.on_request("fail", |_ctx: Context| async move {
        Err(MeshError::Remote("handler failed".into()))
    });
    let address = listen(&server).await;

    let client = peer("client");
    let svc = client.destination("svc");
    connect_once(&client, &address).await;
    svc.wait_ready(WAIT).await.unwrap();

    assert!(matches!(
        svc.request("refuse", ()).await,
        Err(MeshError::Remote(m)) if m == "nope"
    ));
    assert!(matches!(
        svc.request("fail", ()).await,
        Err(MeshError::Remote(m)) if m == "handler failed"
    ));
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let server = peer("server");
    server
        .role("svc")
        .on_request("silent", |_ctx: Context| async move { Ok(()) });
    let address = listen(&server).await;

    let client = peer("client");
    let svc = client.destination("svc");
    connect_once(&client, &address).await;
    svc.wait_ready(WAIT).await.unwrap();

    let result = svc
        .request(
            EmitOptions::new("silent").with_timeout(Duration::from_millis(200)),
            (),
        )
        .await;
    assert!(matches!(result, Err(MeshError::Timeout(_))));
}

#[tokio::test]
async fn unhandled_message_is_dropped_quietly() {
    let (_server, address) = echo_server("server").await;
    let client = peer("client");
    let echo = client.destination("echo");
    connect_once(&client, &address).await;
    echo.wait_ready(WAIT).await.unwrap();

    echo.send_confirmed("nobody-listens", "x").await.unwrap();
    assert_eq!(echo.request("echo", 1).await.unwrap().data, Payload::from(1));
}

#[tokio::test]
async fn requests_flow_in_both_directions() {
    let (server, address) = echo_server("server").await;
    let back = server.destination("echo");

    let client = peer("client");
    client
        .role("echo")
        .on_request("echo", |ctx: Context| async move { ctx.reply(ctx.data()) });
    let forth = client.destination("echo");
    connect_once(&client, &address).await;

    forth.wait_ready(WAIT).await.unwrap();
    back.wait_ready(WAIT).await.unwrap();
    let response = back.request("echo", "from server").await.unwrap();
    assert_eq!(response.unit.name(), "client");
    assert_eq!(response.data.as_str(), Some("from server"));
}

#[tokio::test]
async fn targeted_sends_reach_any_connected_unit() {
    let (_server, address) = echo_server("server").await;
    let client = peer("client");
    let unit = connect_once(&client, &address).await;

    // The unit does not serve "ghost", but targeting bypasses the rotation.
    let ghost = client.destination("ghost");
    assert!(ghost.units().is_empty());
    let target = || EmitOptions::new("anything").to_unit(Arc::clone(&unit));
    let sent = ghost.send_confirmed(target(), ()).await.unwrap();
    assert!(Arc::ptr_eq(&sent, &unit));
    assert!(ghost.send(target(), ()).is_some_and(|u| Arc::ptr_eq(&u, &unit)));

    unit.close();
    eventually("unit evicted", || client.units().is_empty()).await;
    assert!(ghost.send(target(), ()).is_none());
    assert!(matches!(
        ghost.send_confirmed(target(), ()).await,
        Err(MeshError::NoUnits(_))
    ));
}
