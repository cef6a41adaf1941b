//! 离线同步示例
//!
//! 离线时记录变更，网络恢复后自动按顺序同步到内存后端。

use std::sync::Arc;
use std::time::Duration;

use marketsync_sdk::{
    init_logging, CacheRequest, CacheResponse, ChannelNetworkListener, MemoryBackend, MutationKind, OfflineSync,
    StaticFetcher, SyncConfig, SyncEvent,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(true);
    println!("=== MarketSync 离线同步示例 ===\n");

    let data_dir = std::env::temp_dir().join("marketsync-demo");
    let config = SyncConfig::builder()
        .data_dir(&data_dir)
        .reconnect_debounce_ms(200)
        .app_origin("https://app.example.com")
        .build();

    let backend = Arc::new(MemoryBackend::new());
    let network = Arc::new(ChannelNetworkListener::new(false));
    let fetcher = Arc::new(StaticFetcher::new());
    for asset in ["/", "/index.html", "/manifest.json", "/favicon.ico"] {
        fetcher.route(
            format!("https://app.example.com{}", asset),
            CacheResponse::new(200, "<html>MarketSync</html>"),
        );
    }

    let sdk = OfflineSync::initialize(config, backend.clone(), network.clone(), fetcher.clone()).await?;

    let mut events = sdk.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::MutationStatusChanged { id, old_status, new_status, .. } => {
                    println!("   📌 {} : {} -> {}", id, old_status, new_status);
                }
                SyncEvent::ConnectivityChanged { online, .. } => {
                    println!("   🌐 在线: {}", online);
                }
                _ => {}
            }
        }
    });

    // 1. 外壳资源预缓存
    println!("1️⃣ 安装请求缓存层");
    let cached = sdk.cache().install().await?;
    sdk.cache().activate().await?;
    println!("   已缓存 {} 个外壳资源\n", cached);

    // 2. 离线记录变更
    println!("2️⃣ 离线记录变更");
    sdk.enqueue(
        MutationKind::Create,
        "opportunities",
        json!({"title": "Fix fence", "budget": 50}),
    )
    .await?;
    sdk.enqueue(
        MutationKind::Create,
        "chat",
        json!({"conversation_id": "c1", "body": "On my way", "created_at": "2024-03-01T08:00:00Z"}),
    )
    .await?;
    println!("   待同步: {}\n", sdk.pending_count().await?);

    // 3. 离线时页面导航仍返回外壳
    fetcher.set_reachable(false);
    let page = sdk.cache().handle(CacheRequest::navigate("/jobs/42")).await;
    println!("3️⃣ 离线导航: {} ({:?})\n", page.status, page.source);

    // 4. 网络恢复
    println!("4️⃣ 网络恢复，等待同步");
    fetcher.set_reachable(true);
    network.became_online();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let counts = sdk.queue_counts().await?;
    println!("   完成: {} 待同步: {} 失败: {}", counts.completed, counts.pending, counts.failed);
    println!("   后端 opportunities: {}", backend.rows("opportunities").len());

    sdk.shutdown().await?;
    let _ = std::fs::remove_dir_all(&data_dir);
    println!("\n✅ 示例结束");
    Ok(())
}
