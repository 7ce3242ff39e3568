mod common;

use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use roost::environment::state::ProcessState;
use roost::environment::stats::{self, PollError};
use roost::events::Event;
use roost::runtime::RuntimeError;

use common::{MockRuntime, environment, frame, next_event, test_store};

async fn next_sample(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> stats::StatsSample {
    loop {
        if let Event::Resource(sample) = next_event(rx).await {
            return sample;
        }
    }
}

#[tokio::test]
async fn test_poll_requires_running_workload() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let env = environment("w1", &runtime, &test_store(&dir));

    let err = stats::poll(&env, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PollError::NotRunning));
    assert_eq!(runtime.count("stats"), 0);
}

#[tokio::test]
async fn test_samples_published_in_order() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let env = environment("w1", &runtime, &test_store(&dir));
    let mut events = env.events().subscribe();
    env.start(&CancellationToken::new()).await.unwrap();

    for memory in [100, 200, 300] {
        runtime.push_stats(frame(memory));
    }

    let mut seen = Vec::new();
    let mut last_uptime = 0;
    for _ in 0..3 {
        let sample = next_sample(&mut events).await;
        assert!(sample.uptime > last_uptime);
        last_uptime = sample.uptime;
        assert_eq!(sample.cpu_absolute, 20.0);
        assert_eq!(sample.memory_limit_bytes, 1_000_000_000);
        seen.push(sample.memory_bytes);
    }
    assert_eq!(seen, vec![100, 200, 300]);
}

#[tokio::test]
async fn test_stop_mid_stream_ends_polling() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let env = environment("w1", &runtime, &test_store(&dir));
    let mut events = env.events().subscribe();
    let ctx = CancellationToken::new();
    env.start(&ctx).await.unwrap();

    runtime.push_stats(frame(100));
    next_sample(&mut events).await;

    env.stop(&ctx).await.unwrap();
    assert!(!env.is_polling());
    runtime.push_stats(frame(200));

    let late = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            if let Ok(Event::Resource(sample)) = events.recv().await {
                return sample;
            }
        }
    })
    .await;
    assert!(late.is_err(), "sample published after stop");
    assert_eq!(env.state(), ProcessState::Offline);
}

#[tokio::test]
async fn test_stream_end_with_dead_container_marks_offline() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let env = environment("w1", &runtime, &test_store(&dir));
    env.start(&CancellationToken::new()).await.unwrap();
    let mut state = env.subscribe_state();

    runtime.set_running("w1", false);
    runtime.close_stats();

    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.is_offline()))
        .await
        .expect("crash not detected")
        .unwrap();
}

#[tokio::test]
async fn test_stream_end_with_live_container_keeps_state() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let env = environment("w1", &runtime, &test_store(&dir));
    env.start(&CancellationToken::new()).await.unwrap();

    runtime.close_stats();
    tokio::time::timeout(Duration::from_secs(2), async {
        while env.is_polling() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("poller did not finish");

    assert_eq!(env.state(), ProcessState::Running);
}

#[tokio::test]
async fn test_decode_error_ends_polling() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let env = environment("w1", &runtime, &test_store(&dir));
    env.start(&CancellationToken::new()).await.unwrap();

    let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    runtime.push_stats_error(RuntimeError::Decode(err));

    tokio::time::timeout(Duration::from_secs(2), async {
        while env.is_polling() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("poller did not finish");
}

#[tokio::test]
async fn test_cancelled_poll() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let env = environment("w1", &runtime, &test_store(&dir));
    env.start(&CancellationToken::new()).await.unwrap();

    let ctx = CancellationToken::new();
    ctx.cancel();
    let err = stats::poll(&env, &ctx).await.unwrap_err();
    assert!(matches!(err, PollError::Cancelled));
}

#[tokio::test]
async fn test_second_stream_attach_failure() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new();
    let env = environment("w1", &runtime, &test_store(&dir));
    env.start(&CancellationToken::new()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while runtime.count("stats") == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let err = stats::poll(&env, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PollError::Attach(_)));
}
