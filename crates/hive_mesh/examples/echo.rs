//! Two peers in one process: a server offering an "echo" role and a client
//! calling it with a request, a broadcast and a streamed upload.
//!
//! Run with `RUST_LOG=hive_mesh=debug cargo run --example echo`.

use std::time::Duration;

use hive_mesh::logging::init_logging;
use hive_mesh::{ConnectOptions, Context, ListenOptions, MeshConfig, Peer};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("info")?;

    let server = Peer::new(MeshConfig::named("echo-server"))?;
    let role = server.role("echo");
    role.on_request("echo", |ctx: Context| async move { ctx.reply(ctx.data()) });
    role.on_message("note", |ctx: Context| async move {
        info!("Note from {}: {}", ctx.unit().name(), ctx.data().to_text());
        Ok(())
    });
    role.on_readable("upload", |ctx: Context| async move {
        if let Some(mut reader) = ctx.take_reader() {
            tokio::spawn(async move {
                let mut total = 0;
                while let Some(Ok(chunk)) = reader.next_chunk().await {
                    total += chunk.len();
                }
                info!("Upload finished: {total} bytes");
            });
        }
        ctx.reply("ready")
    });
    let addr = server.listen(ListenOptions::new("127.0.0.1", 0)).await?;

    let client = Peer::new(MeshConfig::named("echo-client"))?;
    let echo = client.destination("echo");
    client
        .connect(&format!("ws://{addr}"), ConnectOptions::default())
        .await?;
    echo.wait_ready(Duration::from_secs(5)).await?;

    let response = echo.request("echo", "hello mesh").await?;
    info!(
        "Echo answered {:?} in {:?}",
        response.data.to_text(),
        response.rtt
    );

    echo.broadcast("note", "broadcast to every echo unit");

    let mut writer = echo.writable("upload", "demo.bin").await?;
    for _ in 0..64 {
        writer.write(vec![0xAB; 4096]).await?;
    }
    writer.finish().await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    client.close();
    server.close();
    Ok(())
}
