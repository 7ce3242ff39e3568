mod common;

use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use roost::environment::state::ProcessState;
use roost::node::{Node, NodeError};
use roost::platform::{HostKind, Platform};
use roost::runtime::RuntimeApi;

use common::{MockRuntime, settings, test_store};

fn node(runtime: &Arc<MockRuntime>, dir: &TempDir) -> Node {
    let api: Arc<dyn RuntimeApi> = runtime.clone();
    Node::new(test_store(dir), api, Platform::for_kind(HostKind::Linux))
}

#[tokio::test]
async fn test_register_creates_data_directory() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let node = node(&runtime, &dir);

    let env = node.register("w1", settings()).await.unwrap();

    assert_eq!(env.id(), "w1");
    assert!(dir.path().join("volumes/w1").is_dir());
    assert_eq!(node.ids(), vec!["w1"]);

    // Registering again keeps the same environment.
    let mut updated = settings();
    updated.image = "ghcr.io/roost/java:21".to_string();
    let again = node.register("w1", updated).await.unwrap();
    assert!(Arc::ptr_eq(&env, &again));
    assert_eq!(again.settings().image, "ghcr.io/roost/java:21");
}

#[tokio::test]
async fn test_register_rejects_unsafe_ids() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let node = node(&runtime, &dir);

    let err = node.register("../w1", settings()).await.unwrap_err();
    assert!(matches!(err, NodeError::InvalidId(_)));
    assert!(node.ids().is_empty());
}

#[tokio::test]
async fn test_remove_destroys_container() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let node = node(&runtime, &dir);
    let ctx = CancellationToken::new();

    let env = node.register("w1", settings()).await.unwrap();
    env.start(&ctx).await.unwrap();
    node.remove("w1", &ctx).await.unwrap();

    assert!(node.get("w1").is_none());
    assert!(!runtime.has_container("w1"));
    assert!(matches!(
        node.remove("w1", &ctx).await,
        Err(NodeError::UnknownWorkload(_))
    ));
}

#[tokio::test]
async fn test_load_definitions() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let node = node(&runtime, &dir);

    assert_eq!(node.load_definitions().await.unwrap(), 0);

    let definitions = dir.path().join("root/workloads");
    std::fs::create_dir_all(&definitions).unwrap();
    std::fs::write(
        definitions.join("alpha.json"),
        serde_json::to_vec(&settings()).unwrap(),
    )
    .unwrap();
    std::fs::write(definitions.join("notes.txt"), "ignored").unwrap();

    assert_eq!(node.load_definitions().await.unwrap(), 1);
    assert_eq!(node.environment("alpha").unwrap().settings(), settings());

    std::fs::write(definitions.join("broken.json"), "{").unwrap();
    assert!(matches!(
        node.load_definitions().await,
        Err(NodeError::Definition { .. })
    ));
}

#[tokio::test]
async fn test_restore_after_restart() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let ctx = CancellationToken::new();

    // First run: two workloads up, one down.
    {
        let node = node(&runtime, &dir);
        for id in ["running", "crashed", "idle"] {
            node.register(id, settings()).await.unwrap();
        }
        node.environment("running").unwrap().start(&ctx).await.unwrap();
        node.environment("crashed").unwrap().start(&ctx).await.unwrap();
        node.persist_states().await.unwrap();
        for id in node.ids() {
            node.environment(&id).unwrap().destroy(&ctx).await.ok();
        }
    }

    // Only one container survived the restart.
    runtime.add_container("running", true);

    let node = node(&runtime, &dir);
    for id in ["running", "crashed", "idle"] {
        node.register(id, settings()).await.unwrap();
    }
    let running = node.restore(&ctx).await.unwrap();

    assert_eq!(running, 2);
    let states = node.current_states();
    assert_eq!(states["running"], ProcessState::Running);
    assert_eq!(states["crashed"], ProcessState::Running);
    assert_eq!(states["idle"], ProcessState::Offline);
    assert!(runtime.is_running("crashed"));
    assert!(!runtime.has_container("idle"));
}

#[tokio::test]
async fn test_persist_states() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let node = node(&runtime, &dir);
    node.register("w1", settings()).await.unwrap();
    node.register("w2", settings()).await.unwrap();
    node.environment("w2")
        .unwrap()
        .start(&CancellationToken::new())
        .await
        .unwrap();

    node.persist_states().await.unwrap();

    let saved = node.states().load().await.unwrap();
    assert_eq!(
        saved,
        HashMap::from([
            ("w1".to_string(), ProcessState::Offline),
            ("w2".to_string(), ProcessState::Running),
        ])
    );
    assert_eq!(node.states().path(), dir.path().join("root/states.json"));
}

#[tokio::test]
async fn test_disk_usage_and_jail() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let node = node(&runtime, &dir);
    node.register("w1", settings()).await.unwrap();

    let data = dir.path().join("volumes/w1");
    std::fs::create_dir_all(data.join("world")).unwrap();
    std::fs::write(data.join("world/level.dat"), vec![0u8; 4096]).unwrap();
    std::fs::write(data.join("server.properties"), vec![0u8; 100]).unwrap();

    assert_eq!(node.disk_usage("w1").await.unwrap(), 4196);

    let jail = node.jail("w1").unwrap();
    assert!(jail.resolve_safe("../../etc/passwd").is_err());
    assert!(matches!(node.jail("../w1"), Err(NodeError::InvalidId(_))));

    #[cfg(unix)]
    node.chown("w1").await.unwrap();
}

#[tokio::test]
async fn test_ensure_network_through_node() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let node = node(&runtime, &dir);
    let ctx = CancellationToken::new();

    node.ensure_network(&ctx).await.unwrap();
    node.ensure_network(&ctx).await.unwrap();

    assert_eq!(runtime.count("create_network"), 1);
}

#[tokio::test]
async fn test_installer_for_unknown_workload() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let node = node(&runtime, &dir);

    assert!(matches!(
        node.installer("missing", Default::default()),
        Err(NodeError::UnknownWorkload(_))
    ));
}
