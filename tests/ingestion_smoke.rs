use instrulink_core::core::link::scripted::{ScriptStep, ScriptedOpener};
use instrulink_core::core::link::LinkOpener;
use instrulink_core::core::session::SessionSettings;
use instrulink_core::{
    AppConfig, Context, FaultKind, LinkHealth, PortConfigSource, Supervisor, SupervisorEvent,
    SupervisorSettings,
};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATION: &str = r#"
[[ports]]
port = "COM3"
baud_rate = 9600
equipment_id = 1
equipment_name = "Marel M2000"

[ports.measurement]
name = "Weight"
unit = "kg"

[ports.rule]
mode = "delimited"
delimiter = ","
field_index = 2
unit_of_measurement = "kg"

[[ports]]
port = "COM7"
baud_rate = 9600
equipment_id = 12
equipment_name = "Fish meter board"

[ports.measurement]
name = "Length"
unit = "cm"

[ports.rule]
mode = "fixed"
start_offset = 0
end_offset = 6
unit_of_measurement = "mm"
line_terminator = "\\r"

[[ports]]
port = "COM9"
baud_rate = 9600
equipment_id = 40

[ports.measurement]
name = "Label"
"#;

fn station() -> AppConfig {
    let config: AppConfig = toml::from_str(STATION).unwrap();
    config.validate().unwrap();
    config
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        session: SessionSettings {
            read_timeout: Duration::from_millis(10),
            degraded_after: Duration::from_secs(2),
            lost_after: Duration::from_secs(5),
            ..SessionSettings::default()
        },
        ..SupervisorSettings::default()
    }
}

fn collect(supervisor: &Supervisor, context: &str) -> Arc<Mutex<Vec<SupervisorEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    supervisor.subscribe(Context::new(context), move |event: &SupervisorEvent| {
        sink.lock().push(event.clone())
    });
    seen
}

fn pump_until(supervisor: &Supervisor, context: &str, done: impl Fn() -> bool) {
    let provider = || Some(Context::new(context));
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for events");
        supervisor.pump_timeout(&provider, Duration::from_millis(20));
    }
}

fn values(events: &[SupervisorEvent], port: &str) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            SupervisorEvent::Measurement(m) if m.port == port => {
                m.value.as_ref().map(|v| v.to_string())
            }
            _ => None,
        })
        .collect()
}

#[test]
fn station_config_reads_every_instrument() {
    let opener = Arc::new(ScriptedOpener::new());
    opener.script(
        "COM3",
        vec![ScriptStep::data(b"ST,GS, 1.25,kg\r\nST,GS, 0.80,kg\r\n")],
    );
    opener.script(
        "COM7",
        vec![
            ScriptStep::data(b"00123"),
            ScriptStep::Silence,
            ScriptStep::data(b".4\r0045"),
            ScriptStep::data(b"0.0\r"),
        ],
    );
    let supervisor = Supervisor::new(Arc::clone(&opener) as Arc<dyn LinkOpener>, settings());
    let config = station();
    assert_eq!(config.port_configs().unwrap().len(), 3);
    supervisor.load_from(&config).unwrap();
    assert_eq!(supervisor.start_all().unwrap(), 2);
    assert_eq!(supervisor.printers()[0].port, "COM9");

    let seen = collect(&supervisor, "sampling");
    pump_until(&supervisor, "sampling", || {
        let events = seen.lock();
        values(&events, "COM3").len() == 2 && values(&events, "COM7").len() == 2
    });

    let events = seen.lock().clone();
    assert_eq!(values(&events, "COM3"), vec!["1.25", "0.80"]);
    assert_eq!(values(&events, "COM7"), vec!["12.34", "45.00"]);
    assert_eq!(supervisor.session("COM7").unwrap().health, LinkHealth::Live);

    assert_eq!(supervisor.stop_all(), 2);
    assert_eq!(opener.stats().open_now(), 0);
}

#[test]
fn fault_on_one_port_leaves_the_others_reading() {
    let opener = Arc::new(ScriptedOpener::new());
    opener.script(
        "COM3",
        vec![ScriptStep::Error(io::ErrorKind::BrokenPipe)],
    );
    opener.script("COM7", vec![ScriptStep::data(b"0012340\r")]);
    let supervisor = Supervisor::new(Arc::clone(&opener) as Arc<dyn LinkOpener>, settings());
    supervisor.load_from(&station()).unwrap();
    supervisor.start_all().unwrap();

    let seen = collect(&supervisor, "sampling");
    pump_until(&supervisor, "sampling", || {
        let events = seen.lock();
        let faulted = events.iter().any(|e| {
            matches!(e, SupervisorEvent::Stopped { port, fault: Some(_) } if port == "COM3")
        });
        faulted && !values(&events, "COM7").is_empty()
    });

    let scale = supervisor.session("COM3").unwrap();
    assert!(!scale.running);
    assert_eq!(scale.health, LinkHealth::Lost);
    assert_eq!(scale.last_fault.unwrap().kind, FaultKind::LinkLost);
    assert!(supervisor.session("COM7").unwrap().running);

    let faults: Vec<_> = supervisor
        .diagnostics(50)
        .into_iter()
        .filter(|e| e.message.starts_with("Error: COM3 > "))
        .collect();
    assert_eq!(faults.len(), 1);
}

#[test]
fn events_follow_the_active_context() {
    let opener = Arc::new(ScriptedOpener::new());
    opener.script("COM3", vec![ScriptStep::data(b"ST,GS, 2.00,kg\r\n")]);
    let supervisor = Supervisor::new(Arc::clone(&opener) as Arc<dyn LinkOpener>, settings());
    supervisor.load_from(&station()).unwrap();

    let sampling = collect(&supervisor, "sampling");
    let tally = collect(&supervisor, "tally");
    supervisor.start_session("COM3").unwrap();

    pump_until(&supervisor, "tally", || !values(&tally.lock(), "COM3").is_empty());
    assert!(sampling.lock().is_empty());
}
