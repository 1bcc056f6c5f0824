mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{RecordingBridge, RollbackSpy};
use serde_json::{Value, json};
use solar_dongle::{CommandDispatcher, Debouncer, DongleId, EntityKey, EntityKind, MqttBridge};

const WIRE_A: &str = "dongle-AA:BB:CC:DD:EE:01";
const WIRE_B: &str = "dongle-AA:BB:CC:DD:EE:02";
const WIRE_C: &str = "dongle-AA:BB:CC:DD:EE:03";

fn setup() -> (Arc<CommandDispatcher>, Arc<RecordingBridge>) {
    common::init_tracing();
    let bridge = RecordingBridge::new();
    let dispatcher = Arc::new(CommandDispatcher::new(bridge.clone() as Arc<dyn MqttBridge>));
    (dispatcher, bridge)
}

fn spawn_send(
    dispatcher: &Arc<CommandDispatcher>,
    wire: &str,
    value: Value,
    rollback: &Arc<RollbackSpy>,
) -> tokio::task::JoinHandle<bool> {
    let dispatcher = Arc::clone(dispatcher);
    let dongle = DongleId::new(wire);
    let rollback = Arc::clone(rollback);
    tokio::spawn(async move {
        dispatcher
            .send(&dongle, "ACCharge", value, rollback.as_ref())
            .await
    })
}

fn spawn_group_send(
    dispatcher: &Arc<CommandDispatcher>,
    wires: &[&str],
    value: Value,
    rollback: &Arc<RollbackSpy>,
) -> tokio::task::JoinHandle<bool> {
    let dispatcher = Arc::clone(dispatcher);
    let dongles: Vec<DongleId> = wires.iter().map(DongleId::new).collect();
    let rollback = Arc::clone(rollback);
    tokio::spawn(async move {
        dispatcher
            .send_to_group(&dongles, "ACCharge", value, rollback.as_ref())
            .await
    })
}

#[tokio::test(start_paused = true)]
async fn success_reply_resolves_true_without_rollback() {
    let (dispatcher, bridge) = setup();
    let rollback = RollbackSpy::new();

    let task = spawn_send(&dispatcher, WIRE_A, json!(1), &rollback);
    tokio::time::sleep(Duration::from_millis(10)).await;
    dispatcher.handle_response(&DongleId::new(WIRE_A), br#"{"status":"success"}"#);

    assert!(task.await.unwrap());
    assert_eq!(rollback.count(), 0);

    // Publish first, then the response subscription, released at the end.
    assert_eq!(
        bridge.ops(),
        vec![
            format!("pub:{WIRE_A}/update"),
            format!("sub:{WIRE_A}/response"),
            format!("unsub:{WIRE_A}/response"),
        ]
    );
    let payloads = bridge.published_to(&format!("{WIRE_A}/update"));
    let payload: Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(payload["setting"], "ACCharge");
    assert_eq!(payload["value"], 1);
    assert_eq!(payload["from"], "homeassistant");
}

#[tokio::test(start_paused = true)]
async fn error_reply_resolves_false_with_one_rollback() {
    let (dispatcher, _bridge) = setup();
    let rollback = RollbackSpy::new();

    let task = spawn_send(&dispatcher, WIRE_A, json!(1), &rollback);
    tokio::time::sleep(Duration::from_millis(10)).await;
    dispatcher.handle_response(&DongleId::new(WIRE_A), br#"{"status":"error"}"#);

    assert!(!task.await.unwrap());
    assert_eq!(rollback.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_resolves_false_and_releases_subscription() {
    let (dispatcher, bridge) = setup();
    let rollback = RollbackSpy::new();
    let dongle = DongleId::new(WIRE_A);

    let ok = dispatcher
        .send(&dongle, "ACCharge", json!(1), rollback.as_ref())
        .await;

    assert!(!ok);
    assert_eq!(rollback.count(), 1);
    assert!(bridge.ops().contains(&format!("unsub:{WIRE_A}/response")));
}

#[tokio::test(start_paused = true)]
async fn second_command_within_a_second_is_dropped() {
    let (dispatcher, bridge) = setup();
    let rollback = RollbackSpy::new();

    let task = spawn_send(&dispatcher, WIRE_A, json!(1), &rollback);
    tokio::time::sleep(Duration::from_millis(10)).await;
    dispatcher.handle_response(&DongleId::new(WIRE_A), br#"{"status":"success"}"#);
    assert!(task.await.unwrap());

    // Still inside the rate-limit window.
    let ok = dispatcher
        .send(&DongleId::new(WIRE_A), "ACCharge", json!(0), rollback.as_ref())
        .await;

    assert!(!ok);
    assert_eq!(bridge.published_to(&format!("{WIRE_A}/update")).len(), 1);
    // A dropped command leaves the caller's state alone.
    assert_eq!(rollback.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_command_rejected_while_in_flight() {
    let (dispatcher, bridge) = setup();
    let rollback = RollbackSpy::new();

    let task = spawn_send(&dispatcher, WIRE_A, json!(1), &rollback);
    // Step past the rate-limit window while the first command is still
    // awaiting its response, so the busy gate is what rejects.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let ok = dispatcher
        .send(&DongleId::new(WIRE_B), "ACCharge", json!(1), rollback.as_ref())
        .await;
    assert!(!ok);
    assert_eq!(bridge.published_to(&format!("{WIRE_B}/update")).len(), 0);

    dispatcher.handle_response(&DongleId::new(WIRE_A), br#"{"status":"success"}"#);
    assert!(task.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn group_subscribes_everyone_before_publishing() {
    let (dispatcher, bridge) = setup();
    let rollback = RollbackSpy::new();

    let task = spawn_group_send(&dispatcher, &[WIRE_A, WIRE_B, WIRE_C], json!(1), &rollback);
    tokio::time::sleep(Duration::from_millis(10)).await;
    for wire in [WIRE_A, WIRE_B, WIRE_C] {
        dispatcher.handle_response(&DongleId::new(wire), br#"{"status":"success"}"#);
    }

    assert!(task.await.unwrap());
    assert_eq!(rollback.count(), 0);

    let ops = bridge.ops();
    assert_eq!(
        ops[..6],
        [
            format!("sub:{WIRE_A}/response"),
            format!("sub:{WIRE_B}/response"),
            format!("sub:{WIRE_C}/response"),
            format!("pub:{WIRE_A}/update"),
            format!("pub:{WIRE_B}/update"),
            format!("pub:{WIRE_C}/update"),
        ]
    );
    for wire in [WIRE_A, WIRE_B, WIRE_C] {
        assert!(ops.contains(&format!("unsub:{wire}/response")));
    }
}

#[tokio::test(start_paused = true)]
async fn group_partial_timeout_fails_whole_operation() {
    let (dispatcher, _bridge) = setup();
    let rollback = RollbackSpy::new();

    let task = spawn_group_send(&dispatcher, &[WIRE_A, WIRE_B, WIRE_C], json!(1), &rollback);
    tokio::time::sleep(Duration::from_millis(10)).await;
    dispatcher.handle_response(&DongleId::new(WIRE_A), br#"{"status":"success"}"#);
    dispatcher.handle_response(&DongleId::new(WIRE_B), br#"{"status":"success"}"#);
    // WIRE_C never answers; the group timeout elapses.

    assert!(!task.await.unwrap());
    assert_eq!(rollback.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unparseable_group_reply_counts_as_failed_response() {
    let (dispatcher, _bridge) = setup();
    let rollback = RollbackSpy::new();

    let started = tokio::time::Instant::now();
    let task = spawn_group_send(&dispatcher, &[WIRE_A, WIRE_B], json!(1), &rollback);
    tokio::time::sleep(Duration::from_millis(10)).await;
    dispatcher.handle_response(&DongleId::new(WIRE_A), br#"{"status":"success"}"#);
    dispatcher.handle_response(&DongleId::new(WIRE_B), b"%%% not json %%%");

    assert!(!task.await.unwrap());
    assert_eq!(rollback.count(), 1);
    // The garbage reply completed the wait; no 15-second timeout ran.
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio::test(start_paused = true)]
async fn batch_command_carries_all_settings() {
    let (dispatcher, bridge) = setup();
    let rollback = RollbackSpy::new();
    let dongle = DongleId::new(WIRE_A);

    let task = {
        let dispatcher = Arc::clone(&dispatcher);
        let dongle = dongle.clone();
        let rollback = Arc::clone(&rollback);
        tokio::spawn(async move {
            let settings = vec![
                ("ACChgStart".to_string(), json!("01:30")),
                ("ACChgEnd".to_string(), json!("05:00")),
            ];
            dispatcher
                .send_batch(&dongle, &settings, rollback.as_ref())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    dispatcher.handle_response(&dongle, br#"{"status":"success"}"#);

    assert!(task.await.unwrap());
    let payloads = bridge.published_to(&format!("{WIRE_A}/update"));
    let payload: Value = serde_json::from_str(&payloads[0]).unwrap();
    let settings = payload["settings"].as_array().unwrap();
    assert_eq!(settings.len(), 2);
    assert_eq!(settings[0]["setting"], "ACChgStart");
    assert_eq!(settings[0]["value"], "01:30");
    assert_eq!(settings[1]["setting"], "ACChgEnd");
    assert_eq!(payload["from"], "homeassistant");
}

#[tokio::test(start_paused = true)]
async fn stray_response_without_pending_command_is_ignored() {
    let (dispatcher, _bridge) = setup();
    // Must not panic or poison anything.
    dispatcher.handle_response(&DongleId::new(WIRE_A), br#"{"status":"success"}"#);
}

#[tokio::test(start_paused = true)]
async fn debounced_send_keeps_only_last_edit() {
    common::init_tracing();
    let debouncer = Debouncer::new(Duration::from_secs(1));
    let fired: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let key = EntityKey::dongle(EntityKind::Time, &DongleId::new(WIRE_A), "ACChgStart");

    for value in [1, 2] {
        let fired = fired.clone();
        debouncer.schedule(key.clone(), async move {
            fired.lock().unwrap().push(value);
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(*fired.lock().unwrap(), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_debounce_never_fires() {
    let debouncer = Debouncer::new(Duration::from_secs(1));
    let fired: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let key = EntityKey::dongle(EntityKind::Time, &DongleId::new(WIRE_A), "ACChgStart");

    {
        let fired = fired.clone();
        debouncer.schedule(key.clone(), async move {
            fired.lock().unwrap().push(1);
        });
    }
    debouncer.cancel(&key);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(fired.lock().unwrap().is_empty());
}
