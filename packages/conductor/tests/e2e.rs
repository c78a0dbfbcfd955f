use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use opentelemetry::global;
use tokio::sync::mpsc;

use conductor::config::Config;
use conductor::control_plane::ControlPlane;
use conductor::init_tracing_tests;
use conductor_types::{
    AdmissionRequest, AgentId, ClientEnvelope, ClientFrame, Event, ExecutionKind, ResultId, Run,
    RunCounters, RunId, RunStatus, ServerFrame, ServiceId, ShardId, ShardStatus, TestResult,
    TestStatus, Topic, TriggerKind,
};
use utils::clock::{Clock, ManualClock};
use utils::context::AppContext;
use utils::store::memory::MemoryRunStore;
use utils::store::RunStore;
use utils::telemetry::Metrics;

const RECV_TIMEOUT: StdDuration = StdDuration::from_secs(10);

struct TestApp {
    ctx: AppContext,
    control: Arc<ControlPlane>,
    store: Arc<MemoryRunStore>,
    clock: ManualClock,
}

impl TestApp {
    fn new() -> Self {
        init_tracing_tests();
        let config = Config::default();
        let store = Arc::new(MemoryRunStore::new());
        let clock = ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        let metrics = Metrics::new(&global::meter("e2e"));
        let control = Arc::new(ControlPlane::new(
            config,
            metrics.core,
            store.clone(),
            Arc::new(clock.clone()),
        ));
        let ctx = AppContext::new();
        ctx.rt.block_on({
            let control = control.clone();
            let ctx = ctx.clone();
            async move { control.start(ctx).await }
        })
        .unwrap();

        let app = Self {
            ctx,
            control,
            store,
            clock,
        };
        app.block_on(async {
            app.store
                .upsert_service(service(1, &["z1"]))
                .await
                .unwrap();
        });
        app
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.ctx.rt.block_on(fut)
    }

    async fn admit(&self, priority: u32, shard_count: u32) -> Run {
        self.control
            .admission
            .admit(AdmissionRequest {
                service_id: ServiceId::from_u128(1),
                git_ref: "main".into(),
                git_sha: "abc123".into(),
                priority,
                trigger: TriggerKind::Manual,
                triggered_by: Some("e2e".into()),
                shard_count_hint: shard_count,
                test_filter: None,
            })
            .await
            .unwrap()
    }

    async fn wait_run_status(&self, run_id: RunId, status: RunStatus) -> Run {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let run = self.store.get_run(run_id).await.unwrap();
            if run.status == status {
                return run;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} stuck in {:?}, wanted {status:?}",
                run.status
            );
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
    }

    async fn wait_shard_status(&self, shard_id: ShardId, status: ShardStatus) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let shard = self.store.get_shard(shard_id).await.unwrap();
            if shard.status == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "shard {shard_id} stuck in {:?}, wanted {status:?}",
                shard.status
            );
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
    }
}

fn service(id: u128, zones: &[&str]) -> conductor_types::Service {
    conductor_types::Service {
        id: ServiceId::from_u128(id),
        name: format!("svc-{id}"),
        git_url: "https://git.example.com/svc.git".into(),
        git_provider: Some("github".into()),
        default_branch: "main".into(),
        allowed_zones: zones.iter().map(|z| z.to_string()).collect(),
        execution: ExecutionKind::Process,
        owner: None,
        contacts: vec![],
    }
}

struct TestAgent {
    agent_id: AgentId,
    tx: mpsc::Sender<ClientEnvelope>,
    rx: mpsc::Receiver<ServerFrame>,
    next_frame_id: u64,
    next_result: u128,
}

impl TestAgent {
    async fn connect(app: &TestApp, id: u128, max_parallel: u32) -> Self {
        let (client_tx, inbound) = mpsc::channel(64);
        let (outbound, server_rx) = mpsc::channel(64);
        let sessions = app.control.sessions.clone();
        app.ctx
            .rt
            .spawn(async move { sessions.run_session(inbound, outbound).await });

        let mut agent = Self {
            agent_id: AgentId::from_u128(id),
            tx: client_tx,
            rx: server_rx,
            next_frame_id: 1,
            next_result: id << 32,
        };
        agent
            .send(ClientFrame::Register {
                agent_id: agent.agent_id,
                name: format!("agent-{id}"),
                zones: BTreeSet::from(["z1".to_string()]),
                max_parallel,
                container_capable: false,
                version: "1.0.0".into(),
            })
            .await;
        agent
    }

    async fn send(&mut self, frame: ClientFrame) {
        let envelope = ClientEnvelope {
            frame_id: self.next_frame_id,
            frame,
        };
        self.next_frame_id += 1;
        self.tx.send(envelope).await.expect("session gone");
    }

    /// Next non-ack server frame.
    async fn recv(&mut self) -> ServerFrame {
        loop {
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
                .await
                .expect("timed out waiting for server frame")
                .expect("server closed the stream");
            if !matches!(frame, ServerFrame::Ack { .. }) {
                return frame;
            }
        }
    }

    async fn recv_offer(&mut self) -> (ShardId, RunId) {
        match self.recv().await {
            ServerFrame::WorkOffer {
                shard_id, run_id, ..
            } => (shard_id, run_id),
            other => panic!("expected WorkOffer, got {other:?}"),
        }
    }

    fn result(&mut self, run_id: RunId, shard_id: ShardId, status: TestStatus) -> TestResult {
        self.next_result += 1;
        TestResult {
            id: ResultId::from_u128(self.next_result),
            run_id,
            shard_id,
            name: format!("test_{}", self.next_result & 0xffff),
            suite: Some("suite".into()),
            status,
            duration_ms: 5,
            stdout: None,
            stderr: None,
            error: None,
            retry_count: 0,
            allow_failure: false,
            quarantined: false,
        }
    }

    /// Ack the offer, start, stream `passing` pass results, finish passed.
    async fn complete_shard(
        &mut self,
        app: &TestApp,
        run_id: RunId,
        shard_id: ShardId,
        passing: u64,
    ) {
        self.send(ClientFrame::WorkAck { shard_id }).await;
        self.send(ClientFrame::ShardStarted {
            shard_id,
            ts: app.clock.now(),
        })
        .await;
        for _ in 0..passing {
            let result = self.result(run_id, shard_id, TestStatus::Pass);
            self.send(ClientFrame::Result { shard_id, result }).await;
        }
        self.send(ClientFrame::ShardFinished {
            shard_id,
            status: ShardStatus::Passed,
            counters: RunCounters {
                total: passing,
                passed: passing,
                ..Default::default()
            },
            error: None,
        })
        .await;
    }
}

#[test]
fn happy_path_two_shards_two_agents() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;
        let mut b = TestAgent::connect(&app, 2, 1).await;

        let run = app.admit(10, 2).await;

        let (shard_a, run_a) = a.recv_offer().await;
        let (shard_b, run_b) = b.recv_offer().await;
        assert_eq!(run_a, run.id);
        assert_eq!(run_b, run.id);
        assert_ne!(shard_a, shard_b);

        a.complete_shard(&app, run.id, shard_a, 3).await;
        b.complete_shard(&app, run.id, shard_b, 3).await;

        let finished = app.wait_run_status(run.id, RunStatus::Passed).await;
        assert_eq!(finished.counters.total, 6);
        assert_eq!(finished.counters.passed, 6);
        assert!(finished.started_at.is_some());
        assert!(finished.finished_at.is_some());
    });
}

#[test]
fn agent_loss_mid_run_errors_the_shard() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;
        let run = app.admit(10, 1).await;

        let (shard_id, run_id) = a.recv_offer().await;
        a.send(ClientFrame::WorkAck { shard_id }).await;
        a.send(ClientFrame::ShardStarted {
            shard_id,
            ts: app.clock.now(),
        })
        .await;
        app.wait_run_status(run_id, RunStatus::Running).await;

        // heartbeats stop; past the timeout the sweep declares the agent lost
        app.clock.advance(Duration::seconds(91));
        let expired = app
            .control
            .registry
            .expired_agents(Duration::seconds(90));
        assert_eq!(expired, vec![a.agent_id]);
        for agent_id in expired {
            app.control.sessions.expire_agent(agent_id).await;
        }

        app.wait_shard_status(shard_id, ShardStatus::Error).await;
        let finished = app.wait_run_status(run.id, RunStatus::Error).await;
        assert!(finished.error.is_some());

        let shard = app.store.get_shard(shard_id).await.unwrap();
        assert_eq!(shard.error.as_deref(), Some("agent_lost"));
    });
}

#[test]
fn requeue_when_agent_never_starts() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;
        let run = app.admit(10, 1).await;

        let (shard_id, _) = a.recv_offer().await;
        a.send(ClientFrame::WorkAck { shard_id }).await;

        // the operator drains the hung agent so the shard cannot bounce back
        // to it once released
        app.control.registry.drain(a.agent_id).await.unwrap();

        // never sends ShardStarted; push past start_timeout and let the
        // scheduler tick release the assignment
        app.clock.advance(Duration::seconds(121));
        app.wait_shard_status(shard_id, ShardStatus::Pending).await;

        // a healthy agent picks the shard up and completes it
        let mut b = TestAgent::connect(&app, 2, 1).await;
        let (reoffered, run_id) = b.recv_offer().await;
        assert_eq!(reoffered, shard_id);
        b.complete_shard(&app, run_id, reoffered, 2).await;

        let finished = app.wait_run_status(run.id, RunStatus::Passed).await;
        assert_eq!(finished.counters.total, 2);
    });
}

#[test]
fn higher_priority_is_offered_first() {
    let app = TestApp::new();
    app.block_on(async {
        let low = app.admit(5, 1).await;
        let high = app.admit(10, 1).await;

        let mut a = TestAgent::connect(&app, 1, 1).await;
        let (_, first_run) = a.recv_offer().await;
        assert_eq!(first_run, high.id);

        // completing the high-priority shard frees the agent for the other
        let shards = app.store.list_shards(high.id).await.unwrap();
        a.complete_shard(&app, high.id, shards[0].id, 1).await;

        let (_, second_run) = a.recv_offer().await;
        assert_eq!(second_run, low.id);
    });
}

#[test]
fn graceful_shutdown_lets_shards_finish() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;
        let mut b = TestAgent::connect(&app, 2, 1).await;
        let run = app.admit(10, 2).await;

        let (shard_a, _) = a.recv_offer().await;
        let (shard_b, _) = b.recv_offer().await;
        for (agent, shard_id) in [(&mut a, shard_a), (&mut b, shard_b)] {
            agent.send(ClientFrame::WorkAck { shard_id }).await;
            agent
                .send(ClientFrame::ShardStarted {
                    shard_id,
                    ts: app.clock.now(),
                })
                .await;
        }
        app.wait_run_status(run.id, RunStatus::Running).await;

        let shutdown = tokio::spawn({
            let control = app.control.clone();
            async move { control.shutdown().await }
        });

        // both agents are told to drain, then allowed to finish
        assert!(matches!(a.recv().await, ServerFrame::Drain {}));
        assert!(matches!(b.recv().await, ServerFrame::Drain {}));

        for (agent, shard_id) in [(&mut a, shard_a), (&mut b, shard_b)] {
            let result = agent.result(run.id, shard_id, TestStatus::Pass);
            agent
                .send(ClientFrame::Result { shard_id, result })
                .await;
            agent
                .send(ClientFrame::ShardFinished {
                    shard_id,
                    status: ShardStatus::Passed,
                    counters: RunCounters {
                        total: 1,
                        passed: 1,
                        ..Default::default()
                    },
                    error: None,
                })
                .await;
        }

        let clean = shutdown.await.unwrap();
        assert!(clean, "shutdown should be clean when shards finish in time");
        let finished = app.wait_run_status(run.id, RunStatus::Passed).await;
        assert_eq!(finished.counters.total, 2);
    });
}

#[test]
fn cancel_run_with_unresponsive_agent() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;
        let run = app.admit(10, 1).await;

        let (shard_id, _) = a.recv_offer().await;
        a.send(ClientFrame::WorkAck { shard_id }).await;
        a.send(ClientFrame::ShardStarted {
            shard_id,
            ts: app.clock.now(),
        })
        .await;
        app.wait_run_status(run.id, RunStatus::Running).await;

        app.control.cancel_run(run.id).await.unwrap();
        app.wait_run_status(run.id, RunStatus::Cancelled).await;

        // agent is asked to stop, but never responds
        assert!(matches!(a.recv().await, ServerFrame::Cancel { .. }));

        // after cancel_grace the scheduler closes the shard unilaterally
        app.clock.advance(Duration::seconds(61));
        app.wait_shard_status(shard_id, ShardStatus::Cancelled).await;
    });
}

#[test]
fn replayed_frames_are_idempotent() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;
        let run = app.admit(10, 1).await;

        let (shard_id, run_id) = a.recv_offer().await;
        a.send(ClientFrame::WorkAck { shard_id }).await;
        a.send(ClientFrame::ShardStarted {
            shard_id,
            ts: app.clock.now(),
        })
        .await;

        let result = a.result(run_id, shard_id, TestStatus::Pass);
        a.send(ClientFrame::Result {
            shard_id,
            result: result.clone(),
        })
        .await;
        // simulated reconnect replay: same result and log chunk twice
        a.send(ClientFrame::Result {
            shard_id,
            result: result.clone(),
        })
        .await;
        for _ in 0..2 {
            a.send(ClientFrame::LogChunk {
                shard_id,
                seq: 1,
                stream: conductor_types::LogStream::Stdout,
                data: "hello".into(),
            })
            .await;
        }
        let finished = ClientFrame::ShardFinished {
            shard_id,
            status: ShardStatus::Passed,
            counters: RunCounters {
                total: 1,
                passed: 1,
                ..Default::default()
            },
            error: None,
        };
        a.send(finished.clone()).await;
        a.send(finished).await;

        let run = app.wait_run_status(run.id, RunStatus::Passed).await;
        assert_eq!(run.counters.total, 1);
        assert_eq!(run.counters.passed, 1);

        let results = app.store.list_results(run_id).await.unwrap();
        assert_eq!(results.len(), 1);
    });
}

#[test]
fn quarantined_failure_counts_as_skipped() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;
        let run = app.admit(10, 1).await;

        let (shard_id, run_id) = a.recv_offer().await;
        a.send(ClientFrame::WorkAck { shard_id }).await;
        a.send(ClientFrame::ShardStarted {
            shard_id,
            ts: app.clock.now(),
        })
        .await;

        let mut quarantined = a.result(run_id, shard_id, TestStatus::Fail);
        quarantined.quarantined = true;
        a.send(ClientFrame::Result {
            shard_id,
            result: quarantined,
        })
        .await;
        let passing = a.result(run_id, shard_id, TestStatus::Pass);
        a.send(ClientFrame::Result {
            shard_id,
            result: passing,
        })
        .await;
        a.send(ClientFrame::ShardFinished {
            shard_id,
            status: ShardStatus::Passed,
            counters: RunCounters {
                total: 2,
                passed: 1,
                skipped: 1,
                ..Default::default()
            },
            error: None,
        })
        .await;

        let finished = app.wait_run_status(run.id, RunStatus::Passed).await;
        assert_eq!(finished.counters.total, 2);
        assert_eq!(finished.counters.passed, 1);
        assert_eq!(finished.counters.skipped, 1);
        assert_eq!(finished.counters.failed, 0);
    });
}

#[test]
fn failing_test_fails_the_run() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;
        let run = app.admit(10, 1).await;

        let (shard_id, run_id) = a.recv_offer().await;
        a.send(ClientFrame::WorkAck { shard_id }).await;
        a.send(ClientFrame::ShardStarted {
            shard_id,
            ts: app.clock.now(),
        })
        .await;
        let failing = a.result(run_id, shard_id, TestStatus::Fail);
        a.send(ClientFrame::Result {
            shard_id,
            result: failing,
        })
        .await;
        a.send(ClientFrame::ShardFinished {
            shard_id,
            status: ShardStatus::Failed,
            counters: RunCounters {
                total: 1,
                failed: 1,
                ..Default::default()
            },
            error: None,
        })
        .await;

        let finished = app.wait_run_status(run.id, RunStatus::Failed).await;
        assert_eq!(finished.counters.failed, 1);
    });
}

#[test]
fn subscribers_observe_commit_order() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;

        // subscribing to global catches the RunUpdate sequence
        let mut subscription = app.control.bus.subscribe(vec![Topic::Global]);

        let run = app.admit(10, 1).await;
        let shards = app.store.list_shards(run.id).await.unwrap();
        let (shard_id, _) = a.recv_offer().await;
        assert_eq!(shard_id, shards[0].id);
        a.complete_shard(&app, run.id, shard_id, 1).await;
        app.wait_run_status(run.id, RunStatus::Passed).await;

        let mut statuses = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(StdDuration::from_millis(500), subscription.rx.recv()).await
        {
            if let Event::RunUpdate { run: update } = event {
                if update.id == run.id {
                    statuses.push(update.status);
                }
            }
        }

        // pending at admission, running at first start, passed at the end;
        // no regressions anywhere in between
        assert_eq!(statuses.first(), Some(&RunStatus::Pending));
        assert_eq!(statuses.last(), Some(&RunStatus::Passed));
        let running_at = statuses
            .iter()
            .position(|s| *s == RunStatus::Running)
            .expect("saw running");
        assert!(statuses[..running_at]
            .iter()
            .all(|s| *s == RunStatus::Pending));
    });
}

#[test]
fn run_timeout_cancels_in_flight_shards() {
    let app = TestApp::new();
    app.block_on(async {
        let mut a = TestAgent::connect(&app, 1, 1).await;
        let run = app.admit(10, 1).await;

        let (shard_id, _) = a.recv_offer().await;
        a.send(ClientFrame::WorkAck { shard_id }).await;
        a.send(ClientFrame::ShardStarted {
            shard_id,
            ts: app.clock.now(),
        })
        .await;
        app.wait_run_status(run.id, RunStatus::Running).await;

        // blow through the run's wall clock (4h default)
        app.clock.advance(Duration::hours(5));
        let timed_out = app.wait_run_status(run.id, RunStatus::Timeout).await;
        assert!(timed_out.error.is_some());

        // the shard is cancelled through the normal cancel path
        assert!(matches!(a.recv().await, ServerFrame::Cancel { .. }));
        app.clock.advance(Duration::seconds(61));
        app.wait_shard_status(shard_id, ShardStatus::Cancelled).await;
    });
}
