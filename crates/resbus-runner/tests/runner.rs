use std::sync::{Arc, Mutex};
use std::time::Duration;

use resbus_events::{Event, ListenerOwner, NetEnvelope, PeerId};
use resbus_host::{
    ComponentRef, NativeRuntime, ResourceDescriptor, ResourceState, ResponseHandler, ScriptError,
    Value, args,
};
use resbus_runner::{ResbusConfig, Runner};
use tokio::sync::watch;

fn config(autostart: &[&str]) -> ResbusConfig {
    ResbusConfig {
        tick_interval_ms: 1,
        autostart: autostart.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_run_until_shutdown() {
    let said: Arc<Mutex<Vec<(Option<PeerId>, String)>>> = Arc::default();
    let unloaded: Arc<Mutex<Vec<String>>> = Arc::default();

    let u = unloaded.clone();
    let base = ResourceDescriptor::new(
        "base",
        NativeRuntime::factory(move |ctx| {
            let u = u.clone();
            ctx.on_unload(move |_| u.lock().unwrap().push("base".into()));
            Ok(())
        }),
    );

    let s = said.clone();
    let u = unloaded.clone();
    let chat = ResourceDescriptor::new(
        "chat",
        NativeRuntime::factory(move |ctx| {
            let s = s.clone();
            ctx.on("say", move |m, ev| {
                let args = ev.args()?;
                let text = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| ScriptError::new("say needs a string"))?;
                s.lock().unwrap().push((m.source(), text.to_string()));
                Ok(())
            });
            let u = u.clone();
            ctx.on_unload(move |_| u.lock().unwrap().push("chat".into()));
            Ok(())
        }),
    )
    .with_dependency("base");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = Runner::builder()
        .with_config(config(&["chat"]))
        .with_resource(base)
        .with_resource(chat)
        .with_shutdown(shutdown_rx)
        .build()
        .unwrap();

    let events = runner.events();
    let ingress = runner.net_ingress();
    let snapshots = runner.registry_snapshots();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        events
            .queue(Event::from_args("say", &args!["local"]).unwrap())
            .unwrap();

        let payload = resbus_codec::serialize(&args!["remote"]).unwrap();
        let bytes = NetEnvelope::new(PeerId(5), "say", payload).encode().unwrap();
        ingress.ingest(&bytes).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
    });

    let summary = runner.run().await;

    assert!(summary.ticks > 0);
    assert_eq!(summary.autostart_failures, 0);
    assert_eq!(summary.stopped, 2);
    assert_eq!(summary.events_dispatched, 2);

    assert_eq!(
        *said.lock().unwrap(),
        vec![
            (None, "local".to_string()),
            (Some(PeerId(5)), "remote".to_string()),
        ]
    );
    assert_eq!(*unloaded.lock().unwrap(), vec!["chat", "base"]);

    let snapshot = snapshots.borrow();
    assert!(snapshot
        .resources
        .iter()
        .all(|r| r.state == ResourceState::Stopped));
}

#[tokio::test]
async fn test_autostart_failures_are_counted() {
    let broken = ResourceDescriptor::new(
        "broken",
        NativeRuntime::factory(|_| Err(ScriptError::new("missing manifest"))),
    );
    let fine = ResourceDescriptor::new("fine", NativeRuntime::factory(|_| Ok(())));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = Runner::builder()
        .with_config(config(&["broken", "fine"]))
        .with_resources([broken, fine])
        .with_shutdown(shutdown_rx)
        .build()
        .unwrap();

    // Signal before the loop starts; the runner still shuts down cleanly
    shutdown_tx.send(true).unwrap();
    let state = runner.registry_snapshots();
    let summary = runner.run().await;

    assert_eq!(summary.autostart_failures, 1);
    assert_eq!(summary.stopped, 1);
    assert_eq!(
        state.borrow().get("broken").map(|r| r.state),
        Some(ResourceState::Error)
    );
}

#[tokio::test]
async fn test_tasks_and_pending_completions() {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = Runner::builder()
        .with_config(config(&[]))
        .with_shutdown(shutdown_rx)
        .build()
        .unwrap();

    let received: Arc<Mutex<Vec<Vec<Value>>>> = Arc::default();
    let r = received.clone();
    runner.manager().subscribe(
        "lookup:done",
        ListenerOwner::Component(ComponentRef::new("lookup")),
        move |_, ev| {
            r.lock().unwrap().push(ev.args()?);
            Ok(())
        },
    );

    let token_slot: Arc<Mutex<Option<u32>>> = Arc::default();
    let slot = token_slot.clone();
    runner
        .tasks()
        .post(move |m| {
            let token = m.issue_pending(
                ResponseHandler::Event {
                    name: "lookup:done".into(),
                    filter: None,
                },
                None,
                None,
            );
            *slot.lock().unwrap() = Some(token);
        })
        .unwrap();

    let pending = runner.pending();
    tokio::spawn(async move {
        let token = loop {
            if let Some(token) = token_slot.lock().unwrap().take() {
                break token;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        };
        pending.complete(token, args!["found"]).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
    });

    let summary = runner.run().await;

    assert_eq!(summary.tasks_run, 1);
    assert_eq!(summary.pending_completed, 1);

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0][1..], [Value::Bool(true), Value::from("found")]);
}
