use serve_core::{Connection, ExecutionTarget, HostIdentity, PoolConfig, TimeoutConfig};
use serve_dev::CountingConnector;
use serve_exec::{ConnectionPool, PooledTarget, TimeoutExecutor};
use std::sync::Arc;
use std::time::Duration;

fn gpu_host(n: u16) -> HostIdentity {
    HostIdentity::remote(format!("gpu-{}", n), 22, "root")
}

fn pool_with(config: PoolConfig) -> (ConnectionPool, Arc<CountingConnector>) {
    let connector = Arc::new(CountingConnector::new());
    (ConnectionPool::new(connector.clone(), config), connector)
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let (pool, connector) = pool_with(PoolConfig::default());
    let host = gpu_host(1);

    let first = pool.acquire(&host).await.unwrap();
    pool.release(&host).await;
    let second = pool.acquire(&host).await.unwrap();
    pool.release(&host).await;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(connector.dial_count(), 1);

    let stats = pool.stats().snapshot();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.pool_hits, 1);
    assert_eq!(stats.pool_misses, 1);
}

#[tokio::test]
async fn test_concurrent_acquires_share_one_dial() {
    let connector = Arc::new(CountingConnector::new().with_dial_delay(Duration::from_millis(20)));
    let pool = ConnectionPool::new(connector.clone(), PoolConfig::default());
    let host = gpu_host(1);

    let acquires = (0..5).map(|_| pool.acquire(&host));
    let connections = futures::future::join_all(acquires).await;

    assert_eq!(connector.dial_count(), 1);
    assert!(connections.iter().all(|c| c.is_ok()));

    let snapshot = pool.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].leases, 5);
    assert_eq!(snapshot[0].key, "gpu-1:22@root");
}

#[tokio::test]
async fn test_identities_get_distinct_connections() {
    let (pool, connector) = pool_with(PoolConfig::default());

    let a = pool.acquire(&gpu_host(1)).await.unwrap();
    let b = pool.acquire(&gpu_host(2)).await.unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(connector.dial_count(), 2);
    assert_eq!(pool.live_connections().await, 2);
}

#[tokio::test]
async fn test_idle_connection_is_evicted() {
    let (pool, connector) = pool_with(PoolConfig {
        idle_timeout_ms: 30,
        ..PoolConfig::default()
    });
    let host = gpu_host(1);

    pool.acquire(&host).await.unwrap();
    pool.release(&host).await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(pool.live_connections().await, 0);
    assert_eq!(connector.disconnect_count(), 1);

    pool.acquire(&host).await.unwrap();
    assert_eq!(connector.dial_count(), 2);
}

#[tokio::test]
async fn test_leased_connection_survives_idle_timeout() {
    let (pool, connector) = pool_with(PoolConfig {
        idle_timeout_ms: 20,
        ..PoolConfig::default()
    });
    let host = gpu_host(1);

    pool.acquire(&host).await.unwrap();
    pool.acquire(&host).await.unwrap();
    pool.release(&host).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(pool.live_connections().await, 1);
    assert_eq!(connector.disconnect_count(), 0);
    assert_eq!(pool.evict_expired().await, 0);
}

#[tokio::test]
async fn test_aged_connection_is_replaced() {
    let (pool, connector) = pool_with(PoolConfig {
        idle_timeout_ms: 10_000,
        max_age_ms: 30,
        ..PoolConfig::default()
    });
    let host = gpu_host(1);

    let first = pool.acquire(&host).await.unwrap();
    pool.release(&host).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    let second = pool.acquire(&host).await.unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(connector.dial_count(), 2);
    assert_eq!(connector.disconnect_count(), 1);
}

#[tokio::test]
async fn test_dead_connection_is_replaced() {
    let (pool, connector) = pool_with(PoolConfig::default());
    let host = gpu_host(1);

    pool.acquire(&host).await.unwrap();
    pool.release(&host).await;
    connector.connections()[0].drop_session();

    let connection = pool.acquire(&host).await.unwrap();
    assert!(connection.is_connected());
    assert_eq!(connector.dial_count(), 2);
}

#[tokio::test]
async fn test_evict_expired_sweeps_idle_entries() {
    let (pool, connector) = pool_with(PoolConfig {
        idle_timeout_ms: 20,
        ..PoolConfig::default()
    });

    pool.acquire(&gpu_host(1)).await.unwrap();
    pool.acquire(&gpu_host(2)).await.unwrap();
    pool.release(&gpu_host(1)).await;
    tokio::time::sleep(Duration::from_millis(40)).await;

    // gpu-1 may already be gone through its scheduled eviction
    pool.evict_expired().await;
    assert_eq!(pool.live_connections().await, 1);
    assert_eq!(connector.disconnect_count(), 1);
}

#[tokio::test]
async fn test_capacity_evicts_least_recently_used_idle() {
    let (pool, connector) = pool_with(PoolConfig {
        max_size: 2,
        ..PoolConfig::default()
    });

    for n in 1..=2 {
        pool.acquire(&gpu_host(n)).await.unwrap();
        pool.release(&gpu_host(n)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    pool.acquire(&gpu_host(3)).await.unwrap();

    let keys: Vec<String> = pool.snapshot().await.into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec!["gpu-2:22@root".to_string(), "gpu-3:22@root".to_string()]);
    assert_eq!(connector.disconnect_count(), 1);
}

#[tokio::test]
async fn test_capacity_is_soft_when_all_busy() {
    let (pool, _connector) = pool_with(PoolConfig {
        max_size: 1,
        ..PoolConfig::default()
    });

    pool.acquire(&gpu_host(1)).await.unwrap();
    pool.acquire(&gpu_host(2)).await.unwrap();

    assert_eq!(pool.live_connections().await, 2);
}

#[tokio::test]
async fn test_disconnect_and_shutdown() {
    let (pool, connector) = pool_with(PoolConfig::default());

    pool.acquire(&gpu_host(1)).await.unwrap();
    pool.acquire(&gpu_host(2)).await.unwrap();

    assert!(pool.disconnect(&gpu_host(1)).await);
    assert!(!pool.disconnect(&gpu_host(1)).await);
    assert_eq!(pool.live_connections().await, 1);

    pool.shutdown().await;
    assert_eq!(pool.live_connections().await, 0);
    assert_eq!(connector.disconnect_count(), 2);
    assert_eq!(pool.stats().snapshot().connections_closed, 2);
}

#[tokio::test]
async fn test_pooled_target_runs_and_releases() {
    let (pool, connector) = pool_with(PoolConfig::default());
    let target = PooledTarget::new(pool.clone(), gpu_host(1));

    let first = target.run("hostname").await;
    let second = target.run("hostname").await;

    assert!(first.success);
    assert_eq!(first.stdout, "connection-1");
    assert_eq!(second.stdout, "connection-1");
    assert_eq!(connector.dial_count(), 1);
    assert_eq!(pool.snapshot().await[0].leases, 0);
}

#[tokio::test]
async fn test_timed_out_command_returns_its_lease() {
    let connector = Arc::new(CountingConnector::new().with_exec_delay(Duration::from_millis(500)));
    let pool = ConnectionPool::new(
        connector.clone(),
        PoolConfig {
            idle_timeout_ms: 20,
            max_age_ms: 40,
            ..PoolConfig::default()
        },
    );
    let target = TimeoutExecutor::new(
        Arc::new(PooledTarget::new(pool.clone(), gpu_host(1))),
        TimeoutConfig { timeout_ms: 50 },
    );

    let result = target.run("sleep 1").await;
    assert!(result.timed_out);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let snapshot = pool.snapshot().await;
    assert!(snapshot.iter().all(|entry| entry.leases == 0));

    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.evict_expired().await;
    assert_eq!(pool.live_connections().await, 0);
    assert_eq!(connector.disconnect_count(), 1);
}

#[tokio::test]
async fn test_pooled_target_reports_dial_failure() {
    let (pool, connector) = pool_with(PoolConfig::default());
    connector.fail_with(Some("ssh: connect to host gpu-1 port 22: Connection refused"));
    let target = PooledTarget::new(pool, gpu_host(1));

    let result = target.run("hostname").await;

    assert!(!result.success);
    assert_eq!(result.exit_code, -1);
    assert!(result.error_text().contains("Connection refused"));
}

#[tokio::test]
async fn test_cleanup_task_evicts_in_background() {
    let (pool, connector) = pool_with(PoolConfig {
        idle_timeout_ms: 10,
        ..PoolConfig::default()
    });
    let handle = pool.start_cleanup_task(Duration::from_millis(15));

    pool.acquire(&gpu_host(1)).await.unwrap();
    pool.release(&gpu_host(1)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(pool.live_connections().await, 0);
    assert_eq!(connector.disconnect_count(), 1);
    handle.abort();
}
