use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep, timeout};

use toolgate::engine::protocol::{Envelope, codes, methods};
use toolgate::{
    Action, ApprovalPrompt, Connection, Decision, DispatchError, Frame, Gateway, GatewayConfig,
    Messenger, PendingRecord, Policy, PolicyRule, ResolveOutcome, Resolution, ServiceConfig,
    ServiceHandler, SqliteStore, Store, memory_pair,
};

const TOOLS_YAML: &str = r#"
tools:
  - name: ha_get_state
    description: Read the state of an entity
    signature: "ha_get_state({entity_id})"
    args:
      entity_id:
        required: true
    request:
      method: GET
      path: "/api/states/{entity_id}"
  - name: ha_call_service
    description: Call a service on an entity
    signature: "ha_call_service({domain}.{service}, {entity_id})"
    args:
      domain: { required: true }
      service: { required: true }
      entity_id: { required: true }
    request:
      method: POST
      path: "/api/services/{domain}/{service}"
"#;

struct TestMessenger {
    prompts: mpsc::Sender<ApprovalPrompt>,
}

#[async_trait::async_trait]
impl Messenger for TestMessenger {
    async fn request_approval(&self, prompt: ApprovalPrompt) -> anyhow::Result<()> {
        self.prompts
            .send(prompt)
            .await
            .map_err(|_| anyhow::anyhow!("prompt receiver dropped"))
    }

    async fn notify_expired(&self, _request_id: &str) {}

    async fn health_check(&self) -> bool {
        true
    }
}

struct TestHandler {
    calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl ServiceHandler for TestHandler {
    async fn execute(
        &self,
        tool_name: &str,
        args: &serde_json::Map<String, Value>,
    ) -> Result<Value, DispatchError> {
        self.calls.lock().expect("calls lock").push(tool_name.to_string());
        Ok(json!({"ok": true, "tool": tool_name, "args": args}))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn rule(pattern: &str, action: Action) -> PolicyRule {
    PolicyRule {
        pattern: pattern.to_string(),
        action,
        description: None,
    }
}

fn base_config(tmp: &TempDir) -> GatewayConfig {
    let tools_path = tmp.path().join("homeassistant.yaml");
    std::fs::write(&tools_path, TOOLS_YAML).expect("write tools file");

    let mut config = GatewayConfig::default();
    config.gateway.allow_insecure = true;
    config.agent.token = "secret".to_string();
    config.storage.path = tmp.path().join("gateway.db");
    config.approval_timeout_secs = 60;
    config.policy = Policy {
        rules: vec![],
        defaults: vec![rule("ha_get_*", Action::Allow), rule("*", Action::Ask)],
    };
    config.services.insert(
        "homeassistant".to_string(),
        ServiceConfig {
            url: "http://127.0.0.1:9".to_string(),
            tools: tools_path,
            auth: None,
            health: None,
            errors: Default::default(),
            handler: "test".to_string(),
            timeout_secs: 30,
        },
    );
    config
}

struct Harness {
    gateway: Gateway,
    prompts: mpsc::Receiver<ApprovalPrompt>,
    calls: Arc<Mutex<Vec<String>>>,
    db_path: PathBuf,
    _tmp: TempDir,
}

impl Harness {
    /// Separate read handle onto the gateway's database.
    fn reader(&self) -> SqliteStore {
        SqliteStore::new(&self.db_path).expect("open store reader")
    }

    fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

async fn harness_from(tmp: TempDir, config: GatewayConfig) -> Harness {
    let db_path = config.storage.path.clone();

    let (prompt_tx, prompts) = mpsc::channel(16);
    let calls: Arc<Mutex<Vec<String>>> = Arc::default();
    let factory_calls = Arc::clone(&calls);

    let gateway = Gateway::builder()
        .config(config)
        .messenger(TestMessenger { prompts: prompt_tx })
        .register_handler(
            "test",
            Box::new(move |_service, _config, _tools| {
                Ok(Arc::new(TestHandler {
                    calls: Arc::clone(&factory_calls),
                }) as Arc<dyn ServiceHandler>)
            }),
        )
        .build()
        .expect("build gateway");
    gateway.start().await.expect("start gateway");

    Harness {
        gateway,
        prompts,
        calls,
        db_path,
        _tmp: tmp,
    }
}

async fn harness_with(mutate: impl FnOnce(&mut GatewayConfig)) -> Harness {
    let tmp = TempDir::new().expect("temp dir");
    let mut config = base_config(&tmp);
    mutate(&mut config);
    harness_from(tmp, config).await
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

struct Agent {
    conn: Connection,
}

impl Agent {
    async fn connect(gateway: &Gateway) -> Self {
        let (agent, server) = memory_pair();
        gateway.attach(server);
        Self { conn: agent }
    }

    async fn connect_authed(gateway: &Gateway) -> Self {
        let mut agent = Self::connect(gateway).await;
        agent
            .send(methods::AUTH, json!({"token": "secret"}), json!("auth"))
            .await;
        let reply = agent.recv().await;
        assert!(
            reply.result.is_some(),
            "auth should succeed, got {:?}",
            reply.error
        );
        agent
    }

    async fn send(&self, method: &str, params: Value, id: Value) {
        self.conn
            .outbound
            .send(Envelope::request(method, params, id))
            .await
            .expect("send");
    }

    async fn tool_request(&self, id: &str, tool: &str, args: Value) {
        self.send(
            methods::TOOL_REQUEST,
            json!({"tool": tool, "args": args}),
            json!(id),
        )
        .await;
    }

    async fn recv(&mut self) -> Envelope {
        match timeout(Duration::from_secs(10), self.conn.inbound.recv()).await {
            Ok(Some(Frame::Message(envelope))) => envelope,
            Ok(other) => panic!("connection closed while awaiting reply: {:?}", other),
            Err(_) => panic!("timed out waiting for reply"),
        }
    }

    async fn assert_closed(&mut self) {
        match timeout(Duration::from_secs(5), self.conn.inbound.recv()).await {
            Ok(None) => {}
            Ok(Some(frame)) => panic!("expected closed connection, got {:?}", frame),
            Err(_) => panic!("connection not closed"),
        }
    }
}

fn error_code(envelope: &Envelope) -> i64 {
    envelope
        .error
        .as_ref()
        .unwrap_or_else(|| panic!("expected error, got {:?}", envelope.result))
        .code
}

#[tokio::test]
async fn auto_allow_request_executes_and_audits() {
    let harness = harness().await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request("r1", "ha_get_state", json!({"entity_id": "sensor.t"}))
        .await;
    let reply = agent.recv().await;

    let result = reply.result.expect("result");
    assert_eq!(result["tool"], json!("ha_get_state"));
    assert_eq!(harness.call_count(), 1);

    let entries = harness.reader().audit_for("r1").await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, Decision::Allow);
    assert_eq!(entries[0].resolution, Resolution::Executed);
    assert_eq!(entries[0].signature, "ha_get_state(sensor.t)");
}

#[tokio::test]
async fn broad_deny_overrides_narrow_allow() {
    let harness = harness_with(|config| {
        config.policy.rules = vec![
            rule("ha_call_service(lock.front)", Action::Allow),
            rule("ha_call_service(lock.*)", Action::Deny),
        ];
    })
    .await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request(
            "r2",
            "ha_call_service",
            json!({"domain": "lock", "service": "unlock", "entity_id": "lock.front"}),
        )
        .await;
    let reply = agent.recv().await;

    assert_eq!(error_code(&reply), codes::DENIED_BY_POLICY);
    assert_eq!(harness.call_count(), 0, "service must never be called");

    let entries = harness.reader().audit_for("r2").await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, Decision::Deny);
    assert_eq!(entries[0].resolution, Resolution::DeniedByPolicy);
    assert_eq!(
        entries[0].signature,
        "ha_call_service(lock.unlock, lock.front)"
    );
}

#[tokio::test]
async fn human_approval_leads_to_execution() {
    let mut harness = harness().await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request(
            "r3",
            "ha_call_service",
            json!({"domain": "light", "service": "turn_on", "entity_id": "light.desk"}),
        )
        .await;

    let prompt = harness.prompts.recv().await.expect("prompt");
    assert_eq!(prompt.request_id, "r3");
    assert_eq!(prompt.signature, "ha_call_service(light.turn_on, light.desk)");

    let outcome = harness
        .gateway
        .resolve_approval("r3", Resolution::Approved)
        .await
        .expect("resolve");
    assert!(matches!(outcome, ResolveOutcome::Resolved(_)));

    let reply = agent.recv().await;
    assert!(reply.result.is_some());
    assert_eq!(harness.call_count(), 1);

    let entries = harness.reader().audit_for("r3").await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, Decision::Ask);
    assert_eq!(entries[0].resolution, Resolution::Executed);
}

#[tokio::test]
async fn guardian_denial_is_terminal() {
    let mut harness = harness().await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request(
            "r4",
            "ha_call_service",
            json!({"domain": "lock", "service": "unlock", "entity_id": "lock.back"}),
        )
        .await;
    harness.prompts.recv().await.expect("prompt");

    harness
        .gateway
        .resolve_approval("r4", Resolution::DeniedByUser)
        .await
        .expect("resolve");

    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::DENIED_BY_USER);
    assert_eq!(harness.call_count(), 0);

    let entries = harness.reader().audit_for("r4").await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].resolution, Resolution::DeniedByUser);
}

#[tokio::test]
async fn approval_and_timeout_race_has_one_winner() {
    let mut harness = harness().await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request(
            "race",
            "ha_call_service",
            json!({"domain": "light", "service": "toggle", "entity_id": "light.hall"}),
        )
        .await;
    harness.prompts.recv().await.expect("prompt");

    let (approve, time_out) = tokio::join!(
        harness.gateway.resolve_approval("race", Resolution::Approved),
        harness.gateway.resolve_approval("race", Resolution::TimedOut),
    );
    let outcomes = [approve.expect("resolve"), time_out.expect("resolve")];
    let winners = outcomes
        .iter()
        .filter(|o| matches!(o, ResolveOutcome::Resolved(_)))
        .count();
    assert_eq!(winners, 1, "exactly one resolution must win");

    let approved_won = matches!(outcomes[0], ResolveOutcome::Resolved(_));
    let reply = agent.recv().await;
    if approved_won {
        assert!(reply.result.is_some(), "reply must match the winner");
    } else {
        assert_eq!(error_code(&reply), codes::APPROVAL_TIMED_OUT);
    }

    // No double delivery, single audit row consistent with the reply
    let entries = harness.reader().audit_for("race").await.expect("audit");
    assert_eq!(entries.len(), 1);
    if approved_won {
        assert_eq!(entries[0].resolution, Resolution::Executed);
    } else {
        assert_eq!(entries[0].resolution, Resolution::TimedOut);
    }
}

#[tokio::test]
async fn unanswered_approval_times_out() {
    let mut harness = harness_with(|config| {
        config.approval_timeout_secs = 1;
    })
    .await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request(
            "slow",
            "ha_call_service",
            json!({"domain": "light", "service": "toggle", "entity_id": "light.hall"}),
        )
        .await;
    harness.prompts.recv().await.expect("prompt");

    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::APPROVAL_TIMED_OUT);

    let entries = harness.reader().audit_for("slow").await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, Decision::Ask);
    assert_eq!(entries[0].resolution, Resolution::TimedOut);
}

#[tokio::test]
async fn approval_after_disconnect_queues_result_offline() {
    let mut harness = harness().await;
    let agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request(
            "r5",
            "ha_call_service",
            json!({"domain": "light", "service": "turn_on", "entity_id": "light.desk"}),
        )
        .await;
    harness.prompts.recv().await.expect("prompt");

    // Agent goes away before the guardian decides
    drop(agent);
    sleep(Duration::from_millis(200)).await;

    harness
        .gateway
        .resolve_approval("r5", Resolution::Approved)
        .await
        .expect("resolve");
    sleep(Duration::from_millis(200)).await;

    // Dispatch completed even though nobody was listening
    assert_eq!(harness.call_count(), 1);

    // Reconnect and drain exactly once
    let mut agent = Agent::connect_authed(&harness.gateway).await;
    agent.send(methods::GET_PENDING_RESULTS, json!({}), json!("p1")).await;
    let reply = agent.recv().await;
    let results = reply.result.expect("result")["results"]
        .as_array()
        .expect("results array")
        .clone();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["request_id"], json!("r5"));
    assert!(results[0].get("result").is_some());

    agent.send(methods::GET_PENDING_RESULTS, json!({}), json!("p2")).await;
    let reply = agent.recv().await;
    assert_eq!(
        reply.result.expect("result")["results"],
        json!([]),
        "second drain must be empty"
    );
}

#[tokio::test]
async fn metacharacters_are_rejected_before_policy() {
    let harness = harness_with(|config| {
        // Even a catch-all deny must never be consulted for bad input
        config.policy.rules = vec![rule("*", Action::Allow)];
    })
    .await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request("r6", "ha_get_state", json!({"entity_id": "sensor.*"}))
        .await;
    let reply = agent.recv().await;

    assert_eq!(error_code(&reply), codes::INVALID_REQUEST);
    assert_eq!(harness.call_count(), 0);

    let entries = harness.reader().audit_for("r6").await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision, Decision::Deny);
    assert_eq!(entries[0].resolution, Resolution::DeniedByPolicy);
    assert_eq!(entries[0].error_kind.as_deref(), Some("invalid_request"));
}

#[tokio::test]
async fn auto_allow_rate_limit_is_a_hard_ceiling() {
    let harness = harness_with(|config| {
        config.rate_limit.max_requests_per_minute = 2;
    })
    .await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    for id in ["a1", "a2"] {
        agent
            .tool_request(id, "ha_get_state", json!({"entity_id": "sensor.t"}))
            .await;
        let reply = agent.recv().await;
        assert!(reply.result.is_some(), "request {} should pass", id);
    }

    agent
        .tool_request("a3", "ha_get_state", json!({"entity_id": "sensor.t"}))
        .await;
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::RATE_LIMIT_EXCEEDED);

    // Rejected without side effects
    assert_eq!(harness.call_count(), 2);
    let entries = harness.reader().audit_for("a3").await.expect("audit");
    assert!(entries.is_empty());
}

#[tokio::test]
async fn pending_quota_is_a_hard_ceiling() {
    let mut harness = harness_with(|config| {
        config.rate_limit.max_pending_approvals = 1;
    })
    .await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request(
            "q1",
            "ha_call_service",
            json!({"domain": "light", "service": "toggle", "entity_id": "light.a"}),
        )
        .await;
    harness.prompts.recv().await.expect("prompt");

    agent
        .tool_request(
            "q2",
            "ha_call_service",
            json!({"domain": "light", "service": "toggle", "entity_id": "light.b"}),
        )
        .await;
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::RATE_LIMIT_EXCEEDED);
}

#[tokio::test]
async fn duplicate_request_ids_are_rejected() {
    let mut harness = harness().await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent
        .tool_request(
            "dup",
            "ha_call_service",
            json!({"domain": "light", "service": "toggle", "entity_id": "light.a"}),
        )
        .await;
    harness.prompts.recv().await.expect("prompt");

    agent
        .tool_request(
            "dup",
            "ha_call_service",
            json!({"domain": "light", "service": "toggle", "entity_id": "light.a"}),
        )
        .await;
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::INVALID_REQUEST);

    // The replay is also rejected after the original settles
    harness
        .gateway
        .resolve_approval("dup", Resolution::DeniedByUser)
        .await
        .expect("resolve");
    let _ = agent.recv().await;

    agent
        .tool_request(
            "dup",
            "ha_call_service",
            json!({"domain": "light", "service": "toggle", "entity_id": "light.a"}),
        )
        .await;
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::INVALID_REQUEST);
}

#[tokio::test]
async fn unknown_tool_is_an_invalid_request_with_method_not_found_kind() {
    let harness = harness().await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent.tool_request("u1", "no_such_tool", json!({})).await;
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::INVALID_REQUEST);

    let entries = harness.reader().audit_for("u1").await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].error_kind.as_deref(), Some("method_not_found"));
}

#[tokio::test]
async fn unknown_envelope_method_is_method_not_found() {
    let harness = harness().await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent.send("not_a_method", json!({}), json!("m1")).await;
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn list_tools_reports_registry_contents() {
    let harness = harness().await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    agent.send(methods::LIST_TOOLS, json!({}), json!("lt")).await;
    let reply = agent.recv().await;

    let tools = reply.result.expect("result")["tools"]
        .as_array()
        .expect("tools array")
        .clone();
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0]["name"], json!("ha_call_service"));
    assert_eq!(tools[1]["name"], json!("ha_get_state"));
    assert_eq!(tools[1]["service"], json!("homeassistant"));
    assert_eq!(tools[1]["args"]["entity_id"]["required"], json!(true));
}

#[tokio::test]
async fn bad_token_closes_the_connection() {
    let harness = harness().await;
    let mut agent = Agent::connect(&harness.gateway).await;

    agent
        .send(methods::AUTH, json!({"token": "wrong"}), json!("auth"))
        .await;
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::NOT_AUTHENTICATED);
    agent.assert_closed().await;
}

#[tokio::test]
async fn methods_before_auth_are_rejected() {
    let harness = harness().await;
    let mut agent = Agent::connect(&harness.gateway).await;

    agent.send(methods::LIST_TOOLS, json!({}), json!(1)).await;
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::NOT_AUTHENTICATED);
    agent.assert_closed().await;
}

#[tokio::test]
async fn silent_connection_hits_the_auth_deadline() {
    let harness = harness_with(|config| {
        config.gateway.auth_deadline_secs = 1;
    })
    .await;
    let mut agent = Agent::connect(&harness.gateway).await;

    // Say nothing; the gateway must hang up on its own
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::NOT_AUTHENTICATED);
    agent.assert_closed().await;
}

#[tokio::test]
async fn startup_sweep_times_out_stale_pendings() {
    let tmp = TempDir::new().expect("temp dir");
    let config = base_config(&tmp);
    let db_path = config.storage.path.clone();

    {
        let setup = SqliteStore::new(&db_path).expect("store");
        setup
            .insert_pending(
                PendingRecord::new(
                    "stale",
                    "ha_call_service",
                    "ha_call_service(lock.unlock, lock.front)",
                    json!({"domain": "lock", "service": "unlock", "entity_id": "lock.front"}),
                    chrono::Duration::seconds(-10),
                ),
                10,
            )
            .await
            .expect("insert");
    }

    // Boot settles the stale record before accepting anything
    let harness = harness_from(tmp, config).await;

    let entries = harness.reader().audit_for("stale").await.expect("audit");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].resolution, Resolution::TimedOut);

    let offline = harness
        .reader()
        .drain_offline("default")
        .await
        .expect("drain");
    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0].request_id, "stale");

    // And its id stays spent
    let mut agent = Agent::connect_authed(&harness.gateway).await;
    agent
        .tool_request(
            "stale",
            "ha_call_service",
            json!({"domain": "light", "service": "toggle", "entity_id": "light.a"}),
        )
        .await;
    let reply = agent.recv().await;
    assert_eq!(error_code(&reply), codes::INVALID_REQUEST);
}

#[tokio::test]
async fn health_reports_all_components() {
    let harness = harness().await;
    let report = harness.gateway.health().await;

    assert_eq!(report.status, "healthy");
    assert!(report.checks.store);
    assert!(report.checks.messenger);
    assert_eq!(report.checks.services.get("homeassistant"), Some(&true));
}

#[tokio::test]
async fn concurrent_requests_reply_independently() {
    let mut harness = harness().await;
    let mut agent = Agent::connect_authed(&harness.gateway).await;

    // First request waits on a human; second auto-allows and replies first
    agent
        .tool_request(
            "slow",
            "ha_call_service",
            json!({"domain": "light", "service": "toggle", "entity_id": "light.a"}),
        )
        .await;
    harness.prompts.recv().await.expect("prompt");

    agent
        .tool_request("fast", "ha_get_state", json!({"entity_id": "sensor.t"}))
        .await;
    let first = agent.recv().await;
    assert_eq!(first.id_string().as_deref(), Some("fast"));

    harness
        .gateway
        .resolve_approval("slow", Resolution::Approved)
        .await
        .expect("resolve");
    let second = agent.recv().await;
    assert_eq!(second.id_string().as_deref(), Some("slow"));
    assert!(second.result.is_some());
}
