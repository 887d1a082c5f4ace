mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hive_mesh::{Context, MeshError, Next, Payload};

use common::{WAIT, connect_once, eventually, listen, peer};

fn append(ctx: &Context, digit: &str) {
    let current = ctx.response().as_str().unwrap_or_default().to_string();
    ctx.set_response(format!("{current}{digit}"));
}

#[tokio::test]
async fn layers_unwind_in_onion_order() {
    let server = peer("server");
    server.on_data(|ctx: Context, next: Next| async move {
        append(&ctx, "1");
        next.run().await;
        append(&ctx, "1");
    });
    server.on_request(|ctx: Context, next: Next| async move {
        append(&ctx, "2");
        next.run().await;
        append(&ctx, "2");
    });
    let role = server.role("calc");
    role.on_data(|ctx: Context, next: Next| async move {
        append(&ctx, "3");
        next.run().await;
        append(&ctx, "3");
    });
    role.on_any_request(|ctx: Context, next: Next| async move {
        append(&ctx, "4");
        next.run().await;
        append(&ctx, "4");
    });
    role.on_request("digits", |ctx: Context| async move {
        let current = ctx.response().as_str().unwrap_or_default().to_string();
        ctx.reply(format!("{current}5"))
    });
    let address = listen(&server).await;

    let client = peer("client");
    let calc = client.destination("calc");
    connect_once(&client, &address).await;
    calc.wait_ready(WAIT).await.unwrap();

    let response = calc.request("digits", ()).await.unwrap();
    assert_eq!(response.data.as_str(), Some("123454321"));
}

#[tokio::test]
async fn layer_can_answer_without_reaching_the_handler() {
    let server = peer("server");
    server.on_request(|ctx: Context, next: Next| async move {
        if ctx.data().as_str() == Some("token") {
            next.run().await;
        } else {
            let _ = ctx.reject("forbidden");
        }
    });
    let reached = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&reached);
    server.role("vault").on_request("open", move |ctx: Context| {
        let seen = Arc::clone(&seen);
        async move {
            seen.store(true, Ordering::SeqCst);
            ctx.reply("opened")
        }
    });
    let address = listen(&server).await;

    let client = peer("client");
    let vault = client.destination("vault");
    connect_once(&client, &address).await;
    vault.wait_ready(WAIT).await.unwrap();

    let err = vault.request("open", "guess").await.unwrap_err();
    assert!(matches!(&err, MeshError::Remote(m) if m == "forbidden"), "{err}");
    assert!(!reached.load(Ordering::SeqCst));

    let ok = vault.request("open", "token").await.unwrap();
    assert_eq!(ok.data.as_str(), Some("opened"));
    assert!(reached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn layers_can_rewrite_incoming_data() {
    let server = peer("server");
    let role = server.role("calc");
    role.on_data(|ctx: Context, next: Next| async move {
        let n = ctx.data().as_f64().unwrap_or_default();
        ctx.set_data(n * 10.0);
        next.run().await;
    });
    role.on_request("echo", |ctx: Context| async move { ctx.reply(ctx.data()) });
    let address = listen(&server).await;

    let client = peer("client");
    let calc = client.destination("calc");
    connect_once(&client, &address).await;
    calc.wait_ready(WAIT).await.unwrap();

    let response = calc.request("echo", 4).await.unwrap();
    assert_eq!(response.data, Payload::from(40));
}

#[tokio::test]
async fn message_layers_run_around_the_handler() {
    let server = peer("server");
    let layered = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));
    {
        let layered = Arc::clone(&layered);
        server.on_message(move |_ctx: Context, next: Next| {
            let layered = Arc::clone(&layered);
            async move {
                layered.fetch_add(1, Ordering::SeqCst);
                next.run().await;
            }
        });
    }
    {
        let handled = Arc::clone(&handled);
        server.role("log").on_message("line", move |_ctx: Context| {
            let handled = Arc::clone(&handled);
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
    }
    let address = listen(&server).await;

    let client = peer("client");
    let log = client.destination("log");
    connect_once(&client, &address).await;
    log.wait_ready(WAIT).await.unwrap();

    for _ in 0..3 {
        log.send_confirmed("line", "hello").await.unwrap();
    }
    eventually("three handled lines", || handled.load(Ordering::SeqCst) == 3).await;
    assert_eq!(layered.load(Ordering::SeqCst), 3);
}
