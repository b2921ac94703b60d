//! 两个路由器节点之间的端到端去重测试
//!
//! a 经内存传输向 b 发送消息，传输层对 b 的每条消息都重复投递，
//! b 把消息转发到 sink。sink 应当每条消息恰好收到一次。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use clawrouter::channels::memory::{MemoryHub, MemoryHubConfig};
use clawrouter::core::dedup::control;
use clawrouter::core::dedup::ReceiveOutcome;
use clawrouter::core::message::types::{InboundMessage, RouterMessage};
use clawrouter::infra::config::{Config, ConfigLoader, RouteSection};
use clawrouter::infra::error::Error;
use clawrouter::service::RouterService;

fn node_config(dir: &tempfile::TempDir, name: &str) -> Config {
    let mut config = ConfigLoader::new().parse("").unwrap();
    config.router.name = name.to_string();
    config.router.db_path = dir
        .path()
        .join(format!("{}.db", name))
        .to_string_lossy()
        .to_string();
    config.deduplication.epoch_size = 3;
    config.deduplication.cleaner_interval_ms = 50;
    config
}

async fn send_with_retry(node: &RouterService, destination: &str, message: RouterMessage) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match node.send(destination, message.clone()).await {
            Ok(()) => return,
            Err(Error::RetryLater(_)) | Err(Error::Database(_)) => {
                assert!(tokio::time::Instant::now() < deadline, "发送一直无法完成");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("发送失败: {}", e),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exactly_once_across_link_with_duplicated_transport() {
    let dir = tempfile::tempdir().unwrap();
    let hub = MemoryHub::new(MemoryHubConfig {
        redelivery_delay: Duration::from_millis(10),
    });

    let mut a_config = node_config(&dir, "a");
    a_config.deduplication.outbound = vec!["b".to_string()];

    let mut b_config = node_config(&dir, "b");
    b_config.deduplication.inbound_interfaces = vec!["memory".to_string()];
    b_config.routes = vec![RouteSection {
        interface: "memory".to_string(),
        destinations: vec!["sink".to_string()],
    }];

    let b_endpoint = hub.register("b");
    let mut sink = hub.register("sink");
    hub.duplicate_deliveries_to("b");

    let b = Arc::new(RouterService::new(b_config, hub.clone()).await.unwrap());
    b.start().await.unwrap();
    let b_receiver = b_endpoint.serve(b.clone(), b.subscribe_shutdown());

    let a = RouterService::new(a_config, hub.clone()).await.unwrap();
    a.start().await.unwrap();

    for i in 0..10 {
        let message = RouterMessage::with_id(&format!("m{}", i), format!("payload {}", i).into_bytes());
        send_with_retry(&a, "b", message).await;
    }

    let mut received = Vec::new();
    while received.len() < 10 {
        let message = tokio::time::timeout(Duration::from_secs(10), sink.recv())
            .await
            .expect("sink 等待超时")
            .unwrap();
        assert!(!message.has_header(control::SEQUENCE_NUMBER));
        assert!(!message.has_header(control::SEQUENCE_KEY));
        received.push(message.id);
    }

    // 重复投递都已被吸收，不会再有多余消息
    let extra = tokio::time::timeout(Duration::from_millis(300), sink.recv()).await;
    assert!(extra.is_err(), "sink 收到了重复消息");

    let unique: BTreeSet<_> = received.iter().cloned().collect();
    let expected: BTreeSet<_> = (0..10).map(|i| format!("m{}", i)).collect();
    assert_eq!(unique, expected);

    // 发送侧已经推进过 epoch，早期序号在接收侧视为重复
    let report = a.link_report().await.unwrap();
    assert_eq!(report.len(), 1);
    assert!(report[0].epoch > 1);

    let replay = RouterMessage::with_id("m1", Vec::new())
        .with_header(control::SEQUENCE_KEY, "a")
        .with_header(control::SEQUENCE_NUMBER, 1);
    let outcome = b.receive(InboundMessage::new("memory", replay)).await.unwrap();
    assert_eq!(outcome, ReceiveOutcome::Duplicate);

    assert!(hub.dead_letters().await.is_empty());

    a.stop().await;
    b.stop().await;
    b_receiver.await.unwrap();
}
