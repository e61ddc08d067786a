//! Building the application from a configuration file

use serve_agent::{AppContext, ServeApi};
use serve_core::ServeConfig;
use std::io::Write;
use std::sync::Arc;

const CONFIG: &str = r#"
retry:
  max_retries: 2
  initial_delay_ms: 250
  backoff_multiplier: 2.0
lifecycle:
  log_dir: /var/log/serving
  kill_batch_size: 3
servers:
  - id: gpu1
    name: Training box
    host: 10.0.0.1
    username: ml
    auth:
      type: password
      password: hunter2
  - id: gpu2
    host: 10.0.0.2
    port: 2222
    username: ml
    auth:
      type: key
      path: /home/ops/.ssh/id_ed25519
"#;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_context_from_config_file() {
    let file = write_config(CONFIG);
    let config = ServeConfig::load(Some(file.path())).unwrap();
    let context = Arc::new(AppContext::new(config).unwrap());

    assert_eq!(context.servers().ids(), vec!["gpu1", "gpu2"]);
    assert_eq!(context.servers().identity("gpu2").unwrap().key(), "10.0.0.2:2222@ml");
    assert_eq!(context.accelerators().kill_policy().batch_size, 3);
    assert_eq!(context.lifecycle().config().log_dir, "/var/log/serving");

    let api = ServeApi::new(context);
    let listing = serde_json::to_string(&api.list_servers()).unwrap();
    assert!(listing.contains("Training box"));
    assert!(!listing.contains("hunter2"));
}

#[tokio::test]
async fn test_disconnect_without_connection() {
    let file = write_config(CONFIG);
    let context = Arc::new(AppContext::new(ServeConfig::load(Some(file.path())).unwrap()).unwrap());
    let api = ServeApi::new(context);

    let response = api.disconnect("gpu1").await;

    assert!(response.success);
    assert_eq!(response.data, Some(false));
    assert!(api.connections().await.data.unwrap().is_empty());
}
