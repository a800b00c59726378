//! 长轮询同步演示
//!
//! 用法：
//! ROOMSYNC_HOMESERVER=https://matrix.example.org \
//! ROOMSYNC_ACCESS_TOKEN=syt_xxx ROOMSYNC_USER_ID=@alice:example.org \
//! cargo run --example sync_demo

use std::sync::Arc;

use roomsync_sdk::{RoomListStore, SyncConfig, SyncEngine, SyncEvent};
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("========================================");
    println!("RoomSync 长轮询同步演示");
    println!("========================================\n");

    let homeserver = std::env::var("ROOMSYNC_HOMESERVER")?;
    let access_token = std::env::var("ROOMSYNC_ACCESS_TOKEN")?;
    let user_id = std::env::var("ROOMSYNC_USER_ID").ok();

    let mut builder = SyncConfig::builder()
        .homeserver(homeserver)
        .access_token(access_token)
        .data_dir("/tmp/data/roomsync_demo");
    if let Some(user_id) = &user_id {
        builder = builder.user_id(user_id);
    }
    let config = builder.build();

    let rooms = Arc::new(RoomListStore::new(user_id));
    let engine = SyncEngine::with_http(config, rooms.clone())?
        .with_sled_token_store()
        .await?;

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::OfflineChanged { offline, .. } => {
                    println!("📡 离线状态: {}", offline);
                }
                SyncEvent::CredentialInvalidChanged { invalid: true, .. } => {
                    println!("🔐 访问令牌已失效，请重新登录");
                }
                SyncEvent::DeltaApplied { initial, room_count, .. } => {
                    println!("📥 Delta 已应用 (initial={}, rooms={})", initial, room_count);
                }
                _ => {}
            }
        }
    });

    // === 1. 启动同步（有保存的游标则跳过 bootstrap） ===
    engine.resume_from_store().await?;
    println!("✅ 同步已启动\n");

    // === 2. 观察 30 秒 ===
    for _ in 0..6 {
        sleep(Duration::from_secs(5)).await;
        println!("{}", engine.status().summary());
        for room in rooms.sorted_rooms().iter().take(10) {
            println!(
                "  {:?} {:<40} unread={} type={:?}",
                room.phase,
                room.name.as_deref().unwrap_or(&room.id),
                room.unread_count,
                room.room_type
            );
        }
    }

    // === 3. 关闭 ===
    engine.shutdown().await;
    println!("\n✅ 演示结束");
    Ok(())
}
