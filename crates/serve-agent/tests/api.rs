//! API calls end to end against simulated hosts

use serve_agent::{AppContext, ServeApi};
use serve_core::{ChannelSubscriber, ErrorKind, ExecOptions, ExecutionResult, ServeConfig};
use serve_dev::{ScriptedTarget, SimProcess, SimulatedHost, StaticResolver};
use serve_lifecycle::{ServiceDescriptor, ServiceState};
use std::sync::Arc;

fn fast_config() -> ServeConfig {
    let mut config = ServeConfig::default();
    config.lifecycle.settle_delay_ms = 0;
    config.lifecycle.confirm_interval_ms = 0;
    config.lifecycle.kill_grace_ms = 0;
    config
}

fn api_for(resolver: StaticResolver) -> ServeApi {
    let context = AppContext::with_resolver(fast_config(), Arc::new(resolver)).unwrap();
    ServeApi::new(Arc::new(context))
}

#[tokio::test]
async fn test_service_round_trip() {
    serve_dev::setup_test_logging();
    let host = Arc::new(SimulatedHost::new());
    let api = api_for(StaticResolver::new().with_target("gpu1", host.clone()));
    let service = ServiceDescriptor::new("llm", "gpu1", "python server.py --port 9000");

    let started = api.start_service(&service).await;
    assert!(started.success, "{:?}", started.error);
    let pid = started.data.unwrap().pid.unwrap();

    let status = api.service_status(&service).await.data.unwrap();
    assert_eq!(status.state, Some(ServiceState::Running));
    assert_eq!(status.pid, Some(pid));

    let logs = api.service_logs(&service, None).await;
    assert!(logs.data.unwrap().contains("Uvicorn running"));
    assert_eq!(api.list_services().data.unwrap().len(), 1);

    let stopped = api.stop_service(&service).await;
    assert!(stopped.success);
    assert_eq!(stopped.data.unwrap().killed, vec![pid]);
    assert!(!host.is_running(pid));
}

#[tokio::test]
async fn test_failed_start_is_reported_not_raised() {
    let host = Arc::new(SimulatedHost::new());
    host.insert(SimProcess::new(3000, "nginx: master process").listening_on(9000));
    let api = api_for(StaticResolver::new().with_target("gpu1", host));

    let response = api
        .start_service(&ServiceDescriptor::new("llm", "gpu1", "python server.py --port 9000"))
        .await;

    assert!(!response.success);
    assert!(response.error.unwrap().contains("already in use"));
    assert_eq!(response.data.unwrap().state, ServiceState::Error);
}

#[tokio::test]
async fn test_unknown_server_is_an_error_response() {
    let api = api_for(StaticResolver::new());

    let response = api.execute("gpu9", "uptime", &ExecOptions::default()).await;
    assert!(!response.success);
    assert!(response.error.unwrap().contains("Unknown server: gpu9"));

    let response = api.disconnect("gpu9").await;
    assert!(!response.success);

    let response = api.start_service(&ServiceDescriptor::new("llm", "gpu9", "python server.py")).await;
    assert!(!response.success);
    assert!(response.data.is_none());
}

#[tokio::test]
async fn test_execute_keeps_failed_result() {
    let scripted = Arc::new(ScriptedTarget::new().on("false", ExecutionResult::from_exit(1, "", "nope")));
    let api = api_for(StaticResolver::new().with_target("box", scripted));

    let response = api.execute("box", "false", &ExecOptions::default()).await;

    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("nope"));
    assert_eq!(response.data.unwrap().exit_code, 1);
}

#[tokio::test]
async fn test_connection_check_publishes_failures() {
    let healthy = Arc::new(SimulatedHost::new());
    let down = Arc::new(ScriptedTarget::new().otherwise(ExecutionResult::failure("connect ECONNREFUSED 10.0.0.9:22")));
    let api = api_for(StaticResolver::new().with_target("gpu1", healthy).with_target("down", down));
    let (subscriber, mut records) = ChannelSubscriber::channel();
    let _subscription = api.context().error_bus().subscribe(subscriber);

    let ok = api.test_connection("gpu1").await;
    assert!(ok.success);
    assert!(ok.data.unwrap().connected);

    let failed = api.test_connection("down").await;
    assert!(!failed.success);
    assert!(failed.error.unwrap().starts_with("connection-refused"));
    assert!(!failed.data.unwrap().connected);

    let record = records.recv().await.unwrap();
    assert_eq!(record.kind, ErrorKind::ConnectionRefused);
    assert_eq!(record.source.as_deref(), Some("server:down"));
}

#[tokio::test]
async fn test_accelerator_inventory_and_kill() {
    let host = Arc::new(SimulatedHost::new().with_gpu("NVIDIA A100-SXM4-80GB", 81920));
    host.insert(SimProcess::new(5000, "python train.py").on_gpu(0, 40000));
    let api = api_for(StaticResolver::new().with_target("gpu1", host.clone()));

    let inventory = api.list_accelerators("gpu1").await.data.unwrap();
    assert_eq!(inventory.devices.len(), 1);
    assert_eq!(inventory.summary.unwrap().device_count, 1);

    let processes = api.list_accelerator_processes("gpu1").await.data.unwrap();
    assert_eq!(processes.iter().map(|p| p.pid).collect::<Vec<_>>(), vec![5000]);

    let killed = api.kill_accelerator_processes("gpu1", &[5000]).await;
    assert!(killed.success);
    assert_eq!(killed.data.unwrap().killed, vec![5000]);
    assert!(!host.is_running(5000));

    let missing = api.kill_accelerator_process("gpu1", 5000).await;
    assert!(!missing.success);
    assert_eq!(missing.data, Some(false));
}

#[tokio::test]
async fn test_system_info_from_shell_output() {
    let host = Arc::new(SimulatedHost::new().with_gpu("NVIDIA L4", 23034));
    let api = api_for(StaticResolver::new().with_target("gpu1", host));

    let info = api.system_info("gpu1").await.data.unwrap();

    assert_eq!(info.memory.unwrap().total_bytes, 67_430_559_744);
    assert_eq!(info.disks.len(), 2);
    assert_eq!(info.disks[1].mount_point, "/dev/shm");
    assert_eq!(info.accelerators.unwrap().memory_total_mb, 23034);
}
