//! Integration tests for the isolated execution host, with the outside of the
//! boundary played by a bare registry on the far end of a duplex transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;

use sandrpc::ChannelKey;
use sandrpc::ChannelRegistry;
use sandrpc::DuplexTransport;
use sandrpc::INVOKE_EVENT;
use sandrpc::Invoke;
use sandrpc::InvokeError;
use sandrpc::InvokeReply;
use sandrpc::Link;
use sandrpc::Manager;
use sandrpc::RESET_EVENT;
use sandrpc::reply_event;

use sandrun::API_KEY;
use sandrun::Budget;
use sandrun::EVENT_KEY;
use sandrun::FRAME_KEY;
use sandrun::IsolatedExecutionHost;
use sandrun::LoadError;
use sandrun::LoadState;
use sandrun::RENDER_EVENT;
use sandrun::RenderPayload;
use sandrun::Runtime;
use sandrun::SandboxConfig;
use sandrun::interaction_event;

/// Helper to load guest sources shared by the workspace.
fn guest(name: &str) -> String {
    let path = format!("{}/../../guests/{}.wat", env!("CARGO_MANIFEST_DIR"), name);
    std::fs::read_to_string(&path).unwrap_or_else(|_| panic!("Could not read guest: {}", path))
}

fn config(call_timeout: Duration) -> SandboxConfig {
    SandboxConfig {
        budget: Budget::standard(),
        call_timeout,
    }
}

/// The far side of the boundary.
struct Outside {
    registry: ChannelRegistry,
    invokes: mpsc::UnboundedReceiver<Invoke>,
    renders: mpsc::UnboundedReceiver<RenderPayload>,
    _link: Link,
}

impl Outside {
    /// Answers every invoke whose first argument is a url listed in `routes`.
    /// Every invoke, answered or not, is also reported on `invokes`.
    fn new(transport: DuplexTransport, routes: Vec<(&'static str, Value)>) -> Self {
        let registry = ChannelRegistry::new();
        let api = registry.get_or_create(API_KEY);
        let frame = registry.get_or_create(FRAME_KEY);
        registry.get_or_create(EVENT_KEY);

        let (invoke_tx, invokes) = mpsc::unbounded_channel();
        let reply_channel = api.clone();
        api.subscribe(INVOKE_EVENT, move |payload| {
            let invoke: Invoke = serde_json::from_value(payload.clone()).unwrap();
            let url = invoke.arguments.first().and_then(Value::as_str).unwrap_or_default();
            if let Some((_, value)) = routes.iter().find(|(route, _)| *route == url) {
                let reply = InvokeReply::ok(invoke.id, value.clone());
                reply_channel.publish(&reply_event(invoke.id), serde_json::to_value(reply).unwrap());
            }
            let _ = invoke_tx.send(invoke);
        });

        let (render_tx, renders) = mpsc::unbounded_channel();
        frame.subscribe(RENDER_EVENT, move |payload| {
            let _ = render_tx.send(serde_json::from_value(payload.clone()).unwrap());
        });

        let link = Link::spawn("outside", Arc::new(transport), registry.clone());
        Self {
            registry,
            invokes,
            renders,
            _link: link,
        }
    }

    async fn next_render(&mut self) -> RenderPayload {
        tokio::time::timeout(Duration::from_secs(5), self.renders.recv())
            .await
            .expect("render timed out")
            .expect("render stream closed")
    }

    async fn next_invoke(&mut self) -> Invoke {
        tokio::time::timeout(Duration::from_secs(5), self.invokes.recv())
            .await
            .expect("invoke timed out")
            .expect("invoke stream closed")
    }

    fn click(&self, payload: &RenderPayload, element: &str) {
        self.registry.get_or_create(EVENT_KEY).publish(
            &interaction_event(&payload.frame_id),
            json!({"elementId": element, "eventName": "click"}),
        );
    }
}

fn linked(config: SandboxConfig, routes: Vec<(&'static str, Value)>) -> (IsolatedExecutionHost, Outside) {
    let (inner, outer) = DuplexTransport::pair();
    let runtime = Runtime::with_config(config).expect("Failed to create runtime");
    let host = IsolatedExecutionHost::spawn(runtime, Arc::new(inner));
    (host, Outside::new(outer, routes))
}

fn unlinked(config: SandboxConfig) -> IsolatedExecutionHost {
    IsolatedExecutionHost::new(Runtime::with_config(config).expect("Failed to create runtime"))
}

// --- Round trips ---

#[tokio::test]
async fn test_load_renders_fetched_body() {
    let messages = json!({"messages": ["hi"]});
    let (host, mut outside) = linked(SandboxConfig::default(), vec![("/messages", messages.clone())]);

    assert_eq!(host.state(), LoadState::Unloaded);
    host.load(guest("inbox")).await.expect("load failed");
    assert_eq!(host.state(), LoadState::Ready);

    let invoke = outside.next_invoke().await;
    assert_eq!(invoke.action, "get");
    assert_eq!(invoke.arguments, vec![json!("/messages")]);

    let render = outside.next_render().await;
    assert_eq!(render.title, "Inbox");
    assert_eq!(render.body, messages);
}

#[tokio::test]
async fn test_interaction_runs_guest_callback() {
    let (host, mut outside) = linked(
        SandboxConfig::default(),
        vec![("/messages", json!([])), ("/messages/read", json!({}))],
    );
    host.load(guest("inbox")).await.expect("load failed");
    let first = outside.next_render().await;

    outside.click(&first, "save");

    let saved = outside.next_render().await;
    assert_eq!(saved.frame_id, first.frame_id);
    assert_eq!(saved.body, json!("saved"));

    // the handler re-arms after every delivery
    outside.click(&first, "save");
    assert_eq!(outside.next_render().await.body, json!("saved"));
}

// --- Reload ---

#[tokio::test]
async fn test_reload_abandons_pending_host_calls() {
    let (host, mut outside) = linked(SandboxConfig::default(), vec![("/messages", json!([]))]);
    host.load(guest("inbox")).await.expect("load failed");
    outside.next_render().await;

    let old = host.injector().expect("no injector after load");
    let pending = old.api().get("/never-answered");

    host.load(guest("inbox")).await.expect("reload failed");

    assert_eq!(pending.await.unwrap_err(), InvokeError::Abandoned);
    assert!(old.frames().channel().is_closed());
    assert_eq!(host.generation(), 2);
    assert_eq!(host.registry().len(), 3);
}

#[tokio::test]
async fn test_reload_broadcasts_reset_across_the_boundary() {
    let (host, mut outside) = linked(SandboxConfig::default(), vec![("/messages", json!([]))]);
    let (reset_tx, mut resets) = mpsc::unbounded_channel();
    outside
        .registry
        .get(&ChannelKey::new(FRAME_KEY))
        .unwrap()
        .subscribe(RESET_EVENT, move |_| {
            let _ = reset_tx.send(());
        });

    host.load(guest("inbox")).await.expect("load failed");
    outside.next_render().await;
    host.load(guest("inbox")).await.expect("reload failed");

    tokio::time::timeout(Duration::from_secs(5), resets.recv())
        .await
        .expect("reset timed out");
    let second = outside.next_render().await;
    assert_eq!(second.title, "Inbox");
}

#[tokio::test]
async fn test_reload_while_callback_waits_on_host() {
    // /messages/read is never answered, so on_save blocks in its post
    let (host, mut outside) = linked(SandboxConfig::default(), vec![("/messages", json!([]))]);
    host.load(guest("inbox")).await.expect("load failed");
    let first = outside.next_render().await;
    outside.next_invoke().await;

    outside.click(&first, "save");
    let post = outside.next_invoke().await;
    assert_eq!(post.action, "post");

    tokio::time::timeout(Duration::from_secs(5), host.load(guest("inbox")))
        .await
        .expect("reload deadlocked")
        .expect("reload failed");
    assert_eq!(host.state(), LoadState::Ready);
}

#[tokio::test]
async fn test_concurrent_load_rejected() {
    let (host, mut outside) = linked(config(Duration::from_millis(300)), vec![]);
    let host = Arc::new(host);

    let first = tokio::spawn({
        let host = host.clone();
        let source = guest("inbox");
        async move { host.load(source).await }
    });
    // main is now blocked on an unanswered get
    outside.next_invoke().await;
    assert_eq!(host.state(), LoadState::Loading);

    let second = host.load(guest("inbox")).await;
    assert!(matches!(second, Err(LoadError::ConcurrentLoad)));

    // the get times out, main traps
    let first = first.await.unwrap();
    assert!(matches!(first, Err(LoadError::EntryPoint(_))));
    assert_eq!(host.state(), LoadState::Unloaded);
}

// --- Guest ABI and sandboxing ---

#[tokio::test]
async fn test_abi_status_codes() {
    let host = unlinked(SandboxConfig::default());
    host.load(guest("abi")).await.expect("probe trapped");

    let injector = host.injector().unwrap();
    assert_eq!(injector.frames().len(), 2);
}

#[tokio::test]
async fn test_trap_in_main_fails_load() {
    let host = unlinked(SandboxConfig::default());
    let source = r#"(module (func (export "main") (param i32) unreachable))"#;

    let err = host.load(source).await.unwrap_err();

    assert!(matches!(err, LoadError::EntryPoint(_)));
    assert_eq!(host.state(), LoadState::Unloaded);
}

#[tokio::test]
async fn test_ambient_imports_denied() {
    let host = unlinked(SandboxConfig::default());
    let source = r#"(module
        (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
        (func (export "main") (param i32)))"#;

    match host.load(source).await {
        Err(LoadError::DeniedImport { module, name }) => {
            assert_eq!(module, "wasi_snapshot_preview1");
            assert_eq!(name, "fd_write");
        }
        other => panic!("Expected denied import, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_sandbox_import_rejected() {
    let host = unlinked(SandboxConfig::default());
    let source = r#"(module
        (import "sandbox" "exec" (func))
        (func (export "main") (param i32)))"#;

    let err = host.load(source).await.unwrap_err();
    assert!(matches!(err, LoadError::UnknownImport { .. }));
}

#[tokio::test]
async fn test_failed_reload_drops_previous_guest() {
    let (host, mut outside) = linked(SandboxConfig::default(), vec![("/messages", json!([]))]);
    host.load(guest("inbox")).await.expect("load failed");
    outside.next_render().await;
    assert_eq!(host.live_generation().await, Some(1));

    let err = host.load("(module").await.unwrap_err();
    assert!(matches!(err, LoadError::Compile(_)));
    assert_eq!(host.state(), LoadState::Unloaded);
    assert_eq!(host.live_generation().await, None);

    let denied = r#"(module
        (import "env" "abort" (func))
        (func (export "main") (param i32)))"#;
    host.load(guest("inbox")).await.expect("reload failed");
    outside.next_render().await;
    assert_eq!(host.live_generation().await, Some(3));

    assert!(matches!(host.load(denied).await, Err(LoadError::DeniedImport { .. })));
    assert_eq!(host.live_generation().await, None);
}

#[tokio::test]
async fn test_oversized_guest_read_traps() {
    let host = unlinked(SandboxConfig::default());
    let source = r#"(module
        (import "sandbox" "log" (func $log (param i32 i32)))
        (memory (export "memory") 1)
        (func (export "main") (param i32)
            (call $log (i32.const 0) (i32.const 0x7fffffff))))"#;

    let err = host.load(source).await.unwrap_err();
    assert!(matches!(err, LoadError::EntryPoint(_)));
    assert_eq!(host.state(), LoadState::Unloaded);

    // the host is still usable
    host.load(r#"(module (memory (export "memory") 1) (func (export "main") (param i32)))"#)
        .await
        .expect("load after trap failed");
    assert_eq!(host.state(), LoadState::Ready);
}

#[tokio::test]
async fn test_missing_entry_point() {
    let host = unlinked(SandboxConfig::default());
    let err = host.load(r#"(module (memory (export "memory") 1))"#).await.unwrap_err();
    assert!(matches!(err, LoadError::MissingEntryPoint));
}

#[tokio::test]
async fn test_compile_error() {
    let host = unlinked(SandboxConfig::default());
    let err = host.load("(module").await.unwrap_err();
    assert!(matches!(err, LoadError::Compile(_)));
    assert_eq!(host.generation(), 1);
}

#[tokio::test]
async fn test_fuel_exhaustion() {
    let host = unlinked(SandboxConfig {
        budget: Budget {
            fuel: 100_000,
            ..Budget::standard()
        },
        call_timeout: Duration::from_secs(1),
    });
    let source = r#"(module (func (export "main") (param i32) (loop $spin (br $spin))))"#;

    let err = host.load(source).await.unwrap_err();
    assert!(matches!(err, LoadError::EntryPoint(_)));
}

#[tokio::test]
async fn test_memory_limit_blocks_growth() {
    let host = unlinked(SandboxConfig {
        budget: Budget {
            memory_bytes: 2 * 65536,
            ..Budget::standard()
        },
        call_timeout: Duration::from_secs(1),
    });
    // growing past the limit must fail with -1, otherwise trap
    let source = r#"(module
        (memory (export "memory") 1)
        (func (export "main") (param i32)
            (if (i32.ne (memory.grow (i32.const 16)) (i32.const -1))
                (then unreachable))))"#;

    host.load(source).await.expect("memory grew past the limit");
}
