//! Watchdog and self-preservation scenarios against real child
//! processes.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use edgevisor::{
    Bus, HealthMonitor, HealthSample, MetricsRegistry, MonitorSettings, OrchestratorSettings,
    ProcessOrchestrator, SampleError, Sampler, ThermalHooks, WorkerSpec, WorkerState,
};

fn orchestrator(max_restarts: u32) -> Arc<ProcessOrchestrator> {
    ProcessOrchestrator::new(
        OrchestratorSettings {
            watchdog_interval: Duration::from_millis(100),
            max_restarts,
            stability_window: Duration::from_secs(60),
        },
        Bus::new(256),
        MetricsRegistry::new(),
    )
}

fn sleeper(name: &str) -> WorkerSpec {
    WorkerSpec::new(name, vec!["sleep".into(), "3600".into()], false)
}

fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[tokio::test]
async fn watchdog_revives_a_killed_worker() {
    let orch = orchestrator(3);
    orch.register(sleeper("w")).await.unwrap();
    orch.start("w").await.unwrap();
    orch.spawn_watchdog().await;

    let pid1 = orch.pid_of("w").await.unwrap();
    unsafe {
        libc::kill(pid1 as libc::pid_t, libc::SIGKILL);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let revived = orch.state_of("w").await == Some(WorkerState::Running)
            && orch.pid_of("w").await.is_some_and(|pid| pid != pid1);
        if revived {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker was not revived"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(orch.restart_count_of("w").await, Some(1));

    orch.stop_all(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn restart_ceiling_ends_in_gave_up() {
    let orch = orchestrator(3);
    orch.register(WorkerSpec::new("f", vec!["false".into()], false))
        .await
        .unwrap();
    orch.start("f").await.unwrap();
    orch.spawn_watchdog().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orch.state_of("f").await != Some(WorkerState::GaveUp) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker never gave up"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(orch.restart_count_of("f").await, Some(3));

    // Gave-up workers are never retried automatically.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(orch.state_of("f").await, Some(WorkerState::GaveUp));
    assert!(orch.pid_of("f").await.is_none());

    orch.stop_all(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn zero_ceiling_gives_up_on_first_crash() {
    let orch = orchestrator(0);
    orch.register(WorkerSpec::new("f", vec!["false".into()], false))
        .await
        .unwrap();
    orch.start("f").await.unwrap();
    orch.spawn_watchdog().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orch.state_of("f").await != Some(WorkerState::GaveUp) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker never gave up"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(orch.restart_count_of("f").await, Some(0));

    orch.stop_all(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn stop_all_leaves_no_live_children() {
    let orch = orchestrator(3);
    for name in ["a", "b", "c"] {
        orch.register(sleeper(name)).await.unwrap();
    }
    orch.start_all().await;
    orch.spawn_watchdog().await;

    let mut pids = Vec::new();
    for name in ["a", "b", "c"] {
        pids.push(orch.pid_of(name).await.unwrap());
    }
    // One worker is suspended: stop_all must still take it down.
    orch.pause("b").await.unwrap();

    orch.stop_all(Duration::from_secs(2)).await;

    for pid in pids {
        assert!(!process_exists(pid), "pid {pid} survived stop_all");
    }
    for name in ["a", "b", "c"] {
        assert_eq!(orch.state_of(name).await, Some(WorkerState::Stopped));
    }
}

#[tokio::test]
async fn stale_heartbeat_marks_worker_zombie() {
    let orch = orchestrator(5);
    // `sleep` never refreshes its beat file, so it reads as a zombie once
    // the file goes stale.
    orch.register(
        WorkerSpec::new("z", vec!["sleep".into(), "3600".into()], false)
            .with_heartbeat(Duration::from_millis(200)),
    )
    .await
    .unwrap();
    orch.start("z").await.unwrap();
    orch.spawn_watchdog().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while orch.restart_count_of("z").await == Some(0) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "zombie was never recycled"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    orch.stop_all(Duration::from_secs(2)).await;
}

/// Sampler that replays a scripted temperature sequence.
struct ScriptedSampler {
    temps: Vec<f64>,
    next: usize,
}

impl Sampler for ScriptedSampler {
    fn sample(&mut self) -> Result<HealthSample, SampleError> {
        let temp = self.temps[self.next.min(self.temps.len() - 1)];
        self.next += 1;
        Ok(HealthSample {
            cpu_pct: 10.0,
            mem_pct: 10.0,
            disk_pct: 10.0,
            temp_c: Some(temp),
            at: time::OffsetDateTime::now_utc(),
        })
    }
}

#[tokio::test]
async fn thermal_episode_pauses_and_resumes_real_workers() {
    let orch = orchestrator(3);
    orch.register(sleeper("w1")).await.unwrap();
    orch.register(WorkerSpec::new(
        "w2",
        vec!["sleep".into(), "3600".into()],
        true,
    ))
    .await
    .unwrap();
    orch.start("w1").await.unwrap();
    orch.start("w2").await.unwrap();

    let hooks = ThermalHooks {
        on_overheat: {
            let orch = Arc::clone(&orch);
            Arc::new(move || {
                let orch = Arc::clone(&orch);
                async move {
                    orch.pause_non_essential().await;
                }
                .boxed()
            })
        },
        on_recover: {
            let orch = Arc::clone(&orch);
            Arc::new(move || {
                let orch = Arc::clone(&orch);
                async move {
                    orch.resume_thermal().await;
                }
                .boxed()
            })
        },
    };

    let monitor = HealthMonitor::new(
        MonitorSettings {
            interval: Duration::from_millis(50),
            temp_threshold: 20.0,
            hysteresis_margin: 5.0,
            cpu_threshold: 95.0,
            memory_threshold: 90.0,
            warn_debounce: Duration::from_secs(60),
        },
        Box::new(ScriptedSampler {
            // Hold the hot reading long enough that the polling assertions
            // below reliably observe the paused window.
            temps: vec![25.0, 25.0, 25.0, 25.0, 25.0, 25.0, 10.0, 10.0],
            next: 0,
        }),
        hooks,
        Bus::new(256),
        MetricsRegistry::new(),
    );
    monitor.start().await;

    // The first hot sample pauses w1; the essential w2 is untouched; the
    // cool sample resumes w1.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut saw_pause = false;
    loop {
        let w1 = orch.state_of("w1").await.unwrap();
        let w2 = orch.state_of("w2").await.unwrap();
        assert_eq!(w2, WorkerState::Running, "essential worker was paused");
        if w1 == WorkerState::Paused {
            saw_pause = true;
        }
        if saw_pause && w1 == WorkerState::Running {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "thermal episode did not complete (saw_pause={saw_pause})"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    monitor.stop().await;
    orch.stop_all(Duration::from_secs(2)).await;
}
