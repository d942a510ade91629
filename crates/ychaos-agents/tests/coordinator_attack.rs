//! End-to-end attack runs through the coordinator, with real wall-clock
//! scheduling. Durations are kept to a second or two so the suite stays
//! quick.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use ychaos_agents::agent::{Agent, AgentLifecycle, AgentState, BaseAgentFields};
use ychaos_agents::coordinator::{Coordinator, CoordinatorEvent};
use ychaos_core::testplan::TestPlan;

fn plan(mode: &str, agents_yaml: &str) -> TestPlan {
    TestPlan::from_yaml(&format!(
        r#"
description: coordinator end-to-end
attack:
  target_type: self
  target_config: {{}}
  mode: {mode}
  agents:
{agents_yaml}
"#
    ))
    .expect("plan")
}

struct ScriptedAgent {
    base: BaseAgentFields,
    duration: Option<u64>,
    lifecycle: AgentLifecycle,
    fail_setup: bool,
}

impl ScriptedAgent {
    fn ok(name: &str, start_delay: u64, duration: Option<u64>) -> Arc<dyn Agent> {
        Self::build(name, start_delay, duration, false)
    }

    fn failing_setup(name: &str) -> Arc<dyn Agent> {
        Self::build(name, 0, Some(1), true)
    }

    fn build(
        name: &str,
        start_delay: u64,
        duration: Option<u64>,
        fail_setup: bool,
    ) -> Arc<dyn Agent> {
        let mut base = BaseAgentFields::named(name);
        base.start_delay = start_delay;
        Arc::new(Self {
            base,
            duration,
            lifecycle: AgentLifecycle::new(),
            fail_setup,
        })
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn base(&self) -> &BaseAgentFields {
        &self.base
    }

    fn duration(&self) -> Option<u64> {
        self.duration
    }

    fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    async fn setup(&self) -> anyhow::Result<()> {
        if self.fail_setup {
            anyhow::bail!("rigged setup failure");
        }
        Ok(())
    }

    async fn run(&self) -> anyhow::Result<()> {
        if let Some(duration) = self.duration {
            let cancel = self.lifecycle.cancel_token();
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(duration)) => {}
                _ = cancel.cancelled() => {}
            }
        }
        Ok(())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One timed no-op for a second, sequential: clean exit, agent DONE, window
/// exactly the configured duration.
#[tokio::test(flavor = "multi_thread")]
async fn timed_noop_attack_completes_cleanly() {
    let plan = plan(
        "sequential",
        r#"    - type: no_op_timed
      config:
        start_delay: 0
        duration: 1
"#,
    );
    let mut coordinator = Coordinator::new(plan);
    coordinator.configure_agents_in_plan().expect("configure");

    {
        let agents = coordinator.configured_agents();
        assert_eq!(agents.len(), 1);
        assert_eq!(
            agents[0].end_time - agents[0].start_time,
            chrono::Duration::seconds(1)
        );
    }

    let exit_code = coordinator.start_attack().await.expect("attack");
    assert_eq!(exit_code, 0);
    assert_eq!(
        coordinator.configured_agents()[0]
            .agent
            .lifecycle()
            .current_state(),
        AgentState::Done
    );

    let report = coordinator.generate_attack_report();
    assert_eq!(report.agents.len(), 1);
    assert_eq!(report.agents[0].status, "DONE");
    assert_eq!(report.mode, "sequential");
    assert_eq!(coordinator.get_exit_status(), 0);
}

/// A setup failure fails the run: the rigged agent ends ERROR, the scheduler
/// loop breaks, and the second agent never leaves INIT before being SKIPPED.
#[tokio::test(flavor = "multi_thread")]
async fn setup_failure_aborts_the_run() {
    let plan = plan(
        "sequential",
        r#"    - type: no_op
      config: {start_delay: 0}
    - type: no_op
      config: {start_delay: 0}
"#,
    );
    let mut coordinator = Coordinator::new(plan);
    coordinator.configure_prepared_agents(vec![
        ScriptedAgent::failing_setup("rigged"),
        ScriptedAgent::ok("innocent", 0, Some(1)),
    ]);

    let exit_code = coordinator.start_attack().await.expect("attack");
    assert_eq!(exit_code, 1);

    let report = coordinator.generate_attack_report();
    assert_eq!(report.agents[0].status, "ERROR");
    assert_eq!(report.agents[1].status, "SKIPPED");
    assert!(!coordinator.get_all_exceptions().is_empty());
}

/// Concurrent mode: the attack window spans the earliest start to the latest
/// end, while the report preserves the declared agent order.
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_window_and_report_order() {
    let plan = plan(
        "concurrent",
        r#"    - type: no_op
      config: {start_delay: 0}
"#,
    );
    let mut coordinator = Coordinator::new(plan);
    coordinator.configure_prepared_agents(vec![
        ScriptedAgent::ok("one-second", 0, Some(1)),
        ScriptedAgent::ok("two-seconds", 0, Some(2)),
    ]);

    let (first_start, second_end) = {
        let agents = coordinator.configured_agents();
        assert_eq!(coordinator.attack_start_time(), Some(agents[0].start_time));
        assert_eq!(coordinator.attack_end_time(), Some(agents[1].end_time));
        (agents[0].start_time, agents[1].end_time)
    };
    assert!(second_end > first_start);

    let exit_code = coordinator.start_attack().await.expect("attack");
    assert_eq!(exit_code, 0);

    let report = coordinator.generate_attack_report();
    let names: Vec<&str> = report
        .agents
        .iter()
        .map(|agent| agent.agent_name.as_str())
        .collect();
    assert_eq!(names, vec!["one-second", "two-seconds"]);
    assert!(report.agents.iter().all(|agent| agent.status == "DONE"));
}

/// Hooks fire for attack start/end and for each agent start/stop.
#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_hooks_fire_in_order() {
    let plan = plan(
        "sequential",
        r#"    - type: no_op_timed
      config:
        start_delay: 0
        duration: 1
"#,
    );
    let mut coordinator = Coordinator::new(plan);
    coordinator.configure_agents_in_plan().expect("configure");

    let starts = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    {
        let starts = Arc::clone(&starts);
        coordinator
            .register_fn("on_each_agent_start", move |event| {
                if let CoordinatorEvent::AgentStart { agent } = event {
                    assert_eq!(agent, "no_op_timed");
                    starts.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            })
            .expect("register");
    }
    {
        let stops = Arc::clone(&stops);
        coordinator
            .register_fn("on_each_agent_stop", move |_event| {
                stops.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("register");
    }
    {
        let completed = Arc::clone(&completed);
        coordinator
            .register_fn("on_attack_completed", move |_event| {
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("register");
    }

    coordinator.start_attack().await.expect("attack");
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
    assert_eq!(completed.load(Ordering::SeqCst), 1);
}

/// Registering for an unknown coordinator event is rejected immediately.
#[tokio::test]
async fn unknown_hook_event_is_rejected() {
    let plan = plan(
        "sequential",
        r#"    - type: no_op
"#,
    );
    let mut coordinator = Coordinator::new(plan);
    assert!(coordinator.register_fn("on_teleport", |_event| Ok(())).is_err());
}
