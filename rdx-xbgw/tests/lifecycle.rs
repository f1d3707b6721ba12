//! A gateway run from start to shutdown, driven the way a process would.

use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use xbgw::components::xbee::acknowledge;
use xbgw::config::load_overrides;
use xbgw::error::DeliveryFailure;
use xbgw::prelude::*;

fn watch(bus: &MessageBus, topic: &str) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe(topic, move |message: &Message| {
        sink.lock().unwrap().push(message.topic().to_string());
        Ok(())
    })
    .unwrap();
    seen
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_round_trip_while_running_then_shut_down_cleanly() {
    let (radio, peer) = channel_radio();
    let gateway = Gateway::builder()
        .with_xbee(Box::new(radio))
        .with_debug_commands()
        .with_data_point_reporter(Box::new(LogCollector::new()))
        .build()
        .unwrap();
    let commands = gateway.commands();
    let system = watch(gateway.bus(), "gateway.system");

    let (stop, stopped) = oneshot::channel::<()>();
    let running = tokio::spawn(gateway.run_until(async {
        let _ = stopped.await;
    }));

    // Echo goes through the dispatcher thread and back.
    let echo = {
        let commands = commands.clone();
        tokio::task::spawn_blocking(move || {
            commands.invoke("echo", &Payload::new().with("text", "ping"))
        })
        .await
        .unwrap()
        .unwrap()
    };
    assert_eq!(
        echo.replies,
        vec![Reply::success(Payload::new().with("text", "ping"))]
    );

    // The simulated radio acknowledges the one frame it is sent.
    let radio_side = thread::spawn(move || {
        let sent = peer.recv_sent_timeout(Duration::from_secs(5))?;
        peer.inject(acknowledge(&sent, 0)?).ok()?;
        Some(sent)
    });
    let serial = tokio::task::spawn_blocking(move || {
        commands.invoke(
            XBeeEventManager::SEND_SERIAL,
            &Payload::new()
                .with("addr", "00:13:a2:00:40:00:00:01!")
                .with("data", "aGVsbG8="),
        )
    })
    .await
    .unwrap()
    .unwrap();
    assert!(!serial.is_error(), "{:?}", serial.replies);
    match radio_side.join().unwrap() {
        Some(Frame::Explicit { address, data }) => {
            assert_eq!(address.node, XBeeAddress::new(0x0013_A200_4000_0001));
            assert_eq!(data, b"hello".to_vec());
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    stop.send(()).unwrap();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(
        summary,
        vec![("devicecloud".to_string(), ShutdownReport::default())]
    );

    let system = system.lock().unwrap();
    assert_eq!(system.first().map(String::as_str), Some("gateway.system.started"));
    assert!(system.iter().any(|t| t == "gateway.system.stopping"));
}

#[tokio::test]
async fn stopping_the_dispatcher_ends_the_run() {
    let gateway = Gateway::builder().with_debug_commands().build().unwrap();
    let control = gateway.control();
    let running = tokio::spawn(gateway.run_until(std::future::pending()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    control.shutdown();
    let summary = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("gateway did not stop")
        .unwrap()
        .unwrap();
    assert!(summary.is_empty());
}

/// Keeps every point it is handed.
struct Keeper(Arc<Mutex<Vec<DataPoint>>>);

impl Collector for Keeper {
    fn deliver(&mut self, points: &[DataPoint]) -> Result<(), DeliveryFailure> {
        self.0.lock().unwrap().extend_from_slice(points);
        Ok(())
    }
}

#[tokio::test]
async fn reporters_flush_even_when_the_dispatcher_cannot_run() {
    let kept = Arc::new(Mutex::new(Vec::new()));
    let mut gateway = Gateway::builder()
        .with_data_point_reporter(Box::new(Keeper(kept.clone())))
        .build()
        .unwrap();
    gateway.control().shutdown();
    gateway.dispatcher_mut().run().unwrap();

    gateway
        .bus()
        .publish(
            "xbee.sample.analog.0013A20040000001.ad0",
            Payload::new().with("value", 512i64),
        )
        .unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        gateway.run_until(std::future::pending()),
    )
    .await
    .expect("gateway did not return");
    assert!(result.is_err());

    let kept = kept.lock().unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].stream_id, "xbee/sample/analog/0013A20040000001/ad0");
    assert_eq!(kept[0].value, Value::Int(512));
}

#[test]
fn settings_file_overrides_reach_the_components() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        "[devicecloud]\nencode_serial = true\nmax_per_upload = 10\n\n[gateway]\ncommand_timeout_secs = 3"
    )
    .unwrap();

    let overrides = load_overrides(Some(file.path())).unwrap();
    let gateway = Gateway::builder()
        .overrides(overrides)
        .with_data_point_reporter(Box::new(LogCollector::new()))
        .build()
        .unwrap();

    let settings = gateway.settings();
    assert!(settings.get_bool("devicecloud", "encode_serial").unwrap());
    assert_eq!(settings.get_int("devicecloud", "max_per_upload").unwrap(), 10);
    assert_eq!(
        GatewaySettings::from_registry(settings).unwrap().command_timeout,
        Duration::from_secs(3)
    );
}

#[test]
fn settings_for_an_unknown_group_stop_the_build() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[no_such_component]\nenabled = true").unwrap();

    let overrides = load_overrides(Some(file.path())).unwrap();
    let result = Gateway::builder().overrides(overrides).build();
    assert!(result.is_err());
}

#[test]
fn a_missing_settings_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_overrides(Some(&dir.path().join("absent.toml"))).is_err());
}
