mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use roost::events::Event;
use roost::install::{InstallError, InstallScript, InstallationProcess};
use roost::runtime::{LABEL_CONTAINER_TYPE, LABEL_SERVICE};

use common::{MockRuntime, drain, environment, test_store};

fn script() -> InstallScript {
    InstallScript {
        container_image: "ghcr.io/roost/installers:debian".to_string(),
        entrypoint: "bash".to_string(),
        script: "#!/bin/bash\r\necho installing\r\n".to_string(),
    }
}

#[tokio::test]
async fn test_successful_install() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let store = test_store(&dir);
    let data = store.snapshot().system.workload_data("w1");
    std::fs::create_dir_all(data.join("plugins")).unwrap();
    let env = environment("w1", &runtime, &store);
    let mut events = env.events().subscribe();
    runtime.set_logs(&["installing", "done"]);

    InstallationProcess::new(env.clone(), script())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        drain(&mut events),
        vec![
            Event::InstallStarted,
            Event::InstallOutput("installing".to_string()),
            Event::InstallOutput("done".to_string()),
            Event::InstallCompleted { successful: true },
        ]
    );
    assert!(!runtime.has_container("w1_installer"));
    assert!(!store.snapshot().system.tmp_directory.join("w1").exists());
    assert!(!env.is_installing());

    let (name, spec) = &runtime.specs()[0];
    assert_eq!(name, "w1_installer");
    assert_eq!(spec.hostname, "installer");
    assert_eq!(spec.labels[LABEL_CONTAINER_TYPE], "server_installer");
    assert_eq!(spec.labels[LABEL_SERVICE], "Roost");
    assert_eq!(spec.cmd, vec!["bash", "/mnt/install/install.sh"]);
    assert!(spec.tty && spec.attach_stdout && spec.open_stdin);
    assert!(spec.host_config.privileged);
    assert_eq!(spec.host_config.resources.memory, Some(1_024_000_000));

    let targets: Vec<_> = spec
        .host_config
        .mounts
        .iter()
        .map(|m| m.target.as_str())
        .collect();
    assert_eq!(targets, vec!["/mnt/server", "/mnt/install"]);
    assert_eq!(spec.host_config.mounts[0].source, data.display().to_string());
}

#[tokio::test]
async fn test_failed_install_cleans_up() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let store = test_store(&dir);
    let env = environment("w1", &runtime, &store);
    let mut events = env.events().subscribe();
    runtime.set_exit_code(1);

    let err = InstallationProcess::new(env.clone(), script())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, InstallError::ScriptFailed { code: 1, .. }));
    assert!(!runtime.has_container("w1_installer"));
    assert!(!store.snapshot().system.tmp_directory.join("w1").exists());
    assert_eq!(
        drain(&mut events).last(),
        Some(&Event::InstallCompleted { successful: false })
    );
}

#[tokio::test]
async fn test_stale_installer_removed_first() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    runtime.add_container("w1_installer", false);
    let env = environment("w1", &runtime, &test_store(&dir));

    InstallationProcess::new(env, script())
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let calls = runtime.calls();
    let removed = calls
        .iter()
        .position(|c| c == "remove:w1_installer")
        .unwrap();
    let created = calls
        .iter()
        .position(|c| c == "create:w1_installer")
        .unwrap();
    assert!(removed < created);
}

#[tokio::test]
async fn test_one_install_at_a_time() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    runtime.hang_wait.store(true, Ordering::SeqCst);
    let store = test_store(&dir);
    let env = environment("w1", &runtime, &store);

    let ctx = CancellationToken::new();
    let first = {
        let env = env.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { InstallationProcess::new(env, script()).run(&ctx).await })
    };

    tokio::time::timeout(Duration::from_secs(2), async {
        while runtime.count("wait") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(env.is_installing());

    let err = InstallationProcess::new(env.clone(), script())
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, InstallError::AlreadyInstalling(ref id) if id == "w1"));

    ctx.cancel();
    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(err, InstallError::Cancelled));
    assert!(!runtime.has_container("w1_installer"));
    assert!(!store.snapshot().system.tmp_directory.join("w1").exists());
    assert!(!env.is_installing());
}
