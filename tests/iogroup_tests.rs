use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;

use piio::gpio::Pull;
use piio::iogroup::{GroupContext, HandleRegistry};
use piio::mcp23017::regs as mcp_regs;
use piio::pca9685::encode_fraction;
use piio::platform::MockI2c;
use piio::{AppConfig, IoEvent, IoGroup, IoManager, MockPlatform, PiIoError, Platform};

fn manager(config: serde_json::Value) -> (IoManager<MockPlatform>, Arc<MockPlatform>) {
    let platform = Arc::new(MockPlatform::default());
    (manager_on(config, platform.clone()), platform)
}

fn manager_on(config: serde_json::Value, platform: Arc<MockPlatform>) -> IoManager<MockPlatform> {
    let config = AppConfig::from_json(&config.to_string()).unwrap();
    IoManager::new(&config, platform)
}

fn gpio_config() -> serde_json::Value {
    json!({
        "iogroups": [{
            "name": "board",
            "type": "gpio",
            "button-shortpress-time": 10,
            "io": [
                { "name": "btn", "type": "button", "pin": 17 },
                { "name": "door", "type": "inputpin", "pin": 18 },
                { "name": "led", "type": "outputpin", "pin": 22 },
                { "name": "dup", "type": "outputpin", "pin": 22 },
                { "name": "bad", "type": "outputpin", "pin": 5 },
                { "name": "named", "type": "outputpin", "pin": "GPIO4" },
                { "name": "weird", "type": "servo", "pin": 24 },
                { "name": "word", "type": "multibitout", "pins": [7, 8, 9] },
                { "name": "dial", "type": "multibitin", "pins": [10, 11] },
                { "name": "fan", "type": "pwmpin", "pin": 23 }
            ]
        }]
    })
}

fn events_of(manager: &IoManager<MockPlatform>, group: &str) -> Vec<IoEvent> {
    manager.history(group, None).unwrap()
}

#[test]
fn gpio_group_registers_valid_entries_only() {
    let (manager, _) = manager(gpio_config());
    let group = manager.group("board").unwrap();
    let input = group.as_input().unwrap();
    let output = group.as_output().unwrap();

    assert_eq!(input.buttons(), vec!["btn"]);
    assert_eq!(input.inputs(), vec!["door"]);
    assert_eq!(input.multibit_inputs(), vec!["dial"]);
    assert_eq!(output.outputs(), vec!["led"]);
    assert_eq!(output.multibit_outputs(), vec!["word"]);
    assert_eq!(group.as_pwm().pwms(), vec!["fan"]);

    assert_eq!(manager.leases().current_leaser(22), "board");
    assert_eq!(manager.leases().current_usage(22), "IO group pin");
    assert!(manager.leases().is_exclusively_leased(17));
    assert!(manager.leases().lease(24).is_none());
}

#[test]
fn gpio_outputs_notify_on_change_only() {
    let (manager, platform) = manager(gpio_config());
    let output = manager.group("board").unwrap().as_output().unwrap();

    output.set_output("led", true).unwrap();
    output.set_output("led", true).unwrap();
    assert!(output.output("led").unwrap());
    assert!(platform.line(22).unwrap().level());

    let changes: Vec<IoEvent> = events_of(&manager, "board")
        .into_iter()
        .filter(|e| matches!(e, IoEvent::OutputChanged { .. }))
        .collect();
    assert_eq!(
        changes,
        vec![IoEvent::OutputChanged {
            group: "board".into(),
            handle: "led".into(),
            value: true,
        }]
    );

    assert!(matches!(
        output.set_output("nope", true),
        Err(PiIoError::InvalidArgument(_))
    ));
}

#[test]
fn multibit_output_is_least_significant_bit_last_in_config() {
    let (manager, platform) = manager(gpio_config());
    let output = manager.group("board").unwrap().as_output().unwrap();

    // the last configured pin carries bit 0; bits past the width are dropped
    output.set_multibit_output("word", 0b1101).unwrap();
    assert_eq!(output.multibit_output("word").unwrap(), 0b101);
    assert!(platform.line(9).unwrap().level());
    assert!(!platform.line(8).unwrap().level());
    assert!(platform.line(7).unwrap().level());
}

#[test]
fn gpio_input_edges_become_events() {
    let (manager, platform) = manager(gpio_config());
    let input = manager.group("board").unwrap().as_input().unwrap();

    platform.line(18).unwrap().trigger(true);
    assert!(input.input("door").unwrap());

    platform.line(10).unwrap().set_level(true);
    platform.line(11).unwrap().trigger(true);
    assert_eq!(input.multibit_input("dial").unwrap(), 0b11);

    let events = events_of(&manager, "board");
    assert!(events.contains(&IoEvent::InputChanged {
        group: "board".into(),
        handle: "door".into(),
        value: true,
    }));
    assert!(events.contains(&IoEvent::MultibitInputChanged {
        group: "board".into(),
        handle: "dial".into(),
        value: 0b11,
    }));
}

#[test]
fn gpio_button_short_press() {
    let (manager, platform) = manager(gpio_config());
    let line = platform.line(17).unwrap();
    assert_eq!(line.pull(), Pull::Up);
    assert!(line.is_listening());

    // buttons are active low by default
    line.set_level(true);
    line.trigger(false);
    thread::sleep(Duration::from_millis(40));
    line.trigger(true);

    assert!(events_of(&manager, "board").contains(&IoEvent::ButtonPressed {
        group: "board".into(),
        handle: "btn".into(),
    }));
}

#[test]
fn gpio_pwm_runs_worker_only_between_solid_levels() {
    let (manager, platform) = manager(gpio_config());
    let group = manager.group("board").unwrap();
    let IoGroup::Gpio(gpio) = group else {
        panic!("board is not a gpio group");
    };
    let pwm = group.as_pwm();

    pwm.set_pwm_value("fan", 255.0).unwrap();
    assert!(!gpio.backend().soft_pwm().is_running());
    assert!(platform.line(23).unwrap().level());

    pwm.set_pwm_value("fan", 127.6).unwrap();
    assert_eq!(pwm.pwm_value("fan").unwrap(), 128.0);
    assert!(gpio.backend().soft_pwm().is_running());

    pwm.set_pwm_value("fan", 0.0).unwrap();
    assert!(!gpio.backend().soft_pwm().is_running());
    assert!(!platform.line(23).unwrap().level());
}

#[test]
fn unknown_and_duplicate_groups_are_skipped() {
    let (manager, _) = manager(json!({
        "iogroups": [
            { "name": "a", "type": "gpio", "io": [{ "name": "x", "type": "outputpin", "pin": 4 }] },
            { "name": "a", "type": "gpio", "io": [{ "name": "y", "type": "outputpin", "pin": 14 }] },
            { "name": "b", "type": "gpio", "io": [{ "name": "z", "type": "outputpin", "pin": 4 }] },
            { "name": "c", "type": "spi" }
        ]
    }));
    assert_eq!(manager.group_names(), vec!["a", "b"]);
    assert!(manager.leases().lease(14).is_none());

    // the pin is taken by "a", so "b" comes up empty
    let b = manager.group("b").unwrap().as_output().unwrap();
    assert!(b.outputs().is_empty());
    assert!(matches!(manager.group("c"), Err(PiIoError::InvalidArgument(_))));
}

fn mcp_config() -> serde_json::Value {
    json!({
        "iogroups": [{
            "name": "expander",
            "type": "mcp23017",
            "address": 0x20,
            "intpin": 17,
            "button-shortpress-time": 10,
            "io": [
                { "name": "knob", "type": "inputpin", "pin": 0 },
                { "name": "key", "type": "button", "pin": 1 },
                { "name": "relay", "type": "outputpin", "pin": 8 },
                { "name": "dimmer", "type": "pwmpin", "pin": 9 },
                { "name": "far", "type": "outputpin", "pin": 16 }
            ]
        }]
    })
}

fn mcp_manager() -> (IoManager<MockPlatform>, Arc<MockPlatform>, MockI2c) {
    let platform = Arc::new(MockPlatform::default());
    let bus = MockI2c::paired(0x20);
    platform.attach_bus(bus.clone());
    (manager_on(mcp_config(), platform.clone()), platform, bus)
}

fn raise_interrupt(platform: &MockPlatform, flags: u16, capture: u16, bus: &MockI2c) {
    bus.set_register16(mcp_regs::INTF, flags);
    bus.set_register16(mcp_regs::INTCAP, capture);
    let line = platform.line(17).unwrap();
    line.set_level(true);
    line.trigger(false);
}

#[test]
fn mcp_group_programs_the_chip() {
    let (manager, _, bus) = mcp_manager();
    let group = manager.group("expander").unwrap();
    assert!(group.as_output().unwrap().outputs().contains(&"relay".to_string()));
    assert!(!group.as_output().unwrap().outputs().contains(&"far".to_string()));

    assert_eq!(bus.register(mcp_regs::IOCON), 0x60);
    assert_eq!(bus.register16(mcp_regs::IODIR), 0xFCFF);
    assert_eq!(bus.register16(mcp_regs::IPOL), 0x0002);
    assert_eq!(bus.register16(mcp_regs::GPPU), 0x0002);
    assert_eq!(bus.register16(mcp_regs::GPINTEN), 0x0003);

    let leases = manager.leases();
    assert_eq!(leases.current_leaser(2), "expander");
    assert_eq!(leases.current_usage(3), "I2C SCL");
    assert_eq!(leases.current_usage(17), "MCP23017 Interrupt");
}

#[test]
fn mcp_outputs_and_inputs_go_through_the_port() {
    let (manager, _, bus) = mcp_manager();
    let group = manager.group("expander").unwrap();

    group.as_output().unwrap().set_output("relay", true).unwrap();
    assert_eq!(bus.register16(mcp_regs::GPIO), 0x0100);

    bus.set_register16(mcp_regs::GPIO, 0x0101);
    assert!(group.as_input().unwrap().input("knob").unwrap());
}

#[test]
fn mcp_interrupt_reports_captured_levels() {
    let (manager, platform, bus) = mcp_manager();
    raise_interrupt(&platform, 0x0001, 0x0001, &bus);

    assert_eq!(
        manager.events().last_event("expander"),
        Some(IoEvent::InputChanged {
            group: "expander".into(),
            handle: "knob".into(),
            value: true,
        })
    );
}

#[test]
fn mcp_interrupt_at_inactive_level_is_ignored() {
    let (manager, platform, bus) = mcp_manager();
    bus.set_register16(mcp_regs::INTF, 0x0001);
    bus.set_register16(mcp_regs::INTCAP, 0x0001);
    // rising edge on an active-low line
    platform.line(17).unwrap().trigger(true);
    assert!(events_of(&manager, "expander").is_empty());
}

#[test]
fn mcp_interrupt_bursts_are_suppressed() {
    let (manager, platform, bus) = mcp_manager();
    raise_interrupt(&platform, 0x00FF, 0x0001, &bus);
    raise_interrupt(&platform, 0x0001, 0x0001, &bus);
    assert!(events_of(&manager, "expander").is_empty());
}

#[test]
fn mcp_button_through_interrupts() {
    let (manager, platform, bus) = mcp_manager();
    raise_interrupt(&platform, 0x0002, 0x0002, &bus);
    thread::sleep(Duration::from_millis(40));
    raise_interrupt(&platform, 0x0002, 0x0000, &bus);

    assert!(events_of(&manager, "expander").contains(&IoEvent::ButtonPressed {
        group: "expander".into(),
        handle: "key".into(),
    }));
}

#[test]
fn mcp_pwm_levels() {
    let (manager, _, bus) = mcp_manager();
    let group = manager.group("expander").unwrap();
    let IoGroup::Mcp23017(mcp) = group else {
        panic!("expander is not an mcp23017 group");
    };

    group.as_pwm().set_pwm_value("dimmer", 255.0).unwrap();
    assert_eq!(bus.register16(mcp_regs::GPIO) & 0x0200, 0x0200);

    mcp.set_led_pwm("dimmer", 128).unwrap();
    assert_eq!(mcp.pwm("dimmer").unwrap(), piio::softpwm::led_gamma(128));

    group.as_pwm().set_pwm_value("dimmer", 0.0).unwrap();
    assert_eq!(bus.register16(mcp_regs::GPIO) & 0x0200, 0);
}

#[test]
fn mcp_recovers_from_a_failed_interrupt_line() {
    let (manager, platform, bus) = mcp_manager();
    let IoGroup::Mcp23017(mcp) = manager.group("expander").unwrap() else {
        panic!("expander is not an mcp23017 group");
    };
    let old_line = platform.line(17).unwrap();
    old_line.fail("poll: device gone");

    assert!(mcp.backend().is_running());
    let new_line = platform.line(17).unwrap();
    assert!(new_line.is_listening());
    assert!(!old_line.is_listening());

    raise_interrupt(&platform, 0x0001, 0x0001, &bus);
    assert!(events_of(&manager, "expander").iter().any(|e| matches!(
        e,
        IoEvent::InputChanged { handle, value: true, .. } if handle == "knob"
    )));
}

#[test]
fn failed_recovery_is_critical() {
    let (manager, platform, _) = mcp_manager();
    let IoGroup::Mcp23017(mcp) = manager.group("expander").unwrap() else {
        panic!("expander is not an mcp23017 group");
    };

    platform.set_bus_failure(true);
    platform.line(17).unwrap().fail("poll: device gone");

    assert!(!mcp.backend().is_running());
    assert!(matches!(
        manager.events().last_event("expander"),
        Some(IoEvent::CriticalError { .. })
    ));
    let input = manager.group("expander").unwrap().as_input().unwrap();
    assert!(matches!(input.input("knob"), Err(PiIoError::OperationFailed(_))));
}

#[test]
fn mcp_bad_address_fails_the_group() {
    let (manager, _) = manager(json!({
        "iogroups": [{ "name": "x", "type": "mcp23017", "address": 0x40 }]
    }));
    assert!(manager.group_names().is_empty());
    // nothing leased on the way out
    assert!(manager.leases().lease(2).is_none());
}

fn pca_config() -> serde_json::Value {
    json!({
        "iogroups": [{
            "name": "lights",
            "type": "pca9685",
            "address": 0x41,
            "pwm-frequency": 50,
            "io": [
                { "name": "lamp", "type": "pwmpin", "pin": 0, "filter": "led" },
                { "name": "arm", "type": "pwmpin", "pin": 1, "filter": "servo",
                  "servo-min-ms": 1.0, "servo-max-ms": 2.0 },
                { "name": "knob", "type": "inputpin", "pin": 2 },
                { "name": "far", "type": "pwmpin", "pin": 16 }
            ]
        }]
    })
}

fn pca_group(manager: &IoManager<MockPlatform>) -> Arc<piio::iogroup::Pca9685IoGroup<MockPlatform>> {
    match manager.group("lights").unwrap() {
        IoGroup::Pca9685(group) => group.clone(),
        _ => panic!("lights is not a pca9685 group"),
    }
}

#[test]
fn pca_group_registers_pwm_channels_only() {
    let (manager, _) = manager(pca_config());
    let group = manager.group("lights").unwrap();
    assert!(group.as_input().is_none());
    assert!(group.as_output().is_none());
    assert_eq!(group.as_pwm().pwms(), vec!["arm", "lamp"]);

    let pca = pca_group(&manager);
    // 25MHz / (4096 * 122)
    assert!((pca.pwm_frequency() - 50.03).abs() < 0.01);
}

#[test]
fn pca_led_and_servo_values() {
    let (manager, platform) = manager(pca_config());
    let pca = pca_group(&manager);
    let bus = platform.bus(0x41).unwrap();
    let chip = pca.backend().chip();

    pca.set_value("lamp", 0.5).unwrap();
    let (on, off) = encode_fraction(0.5f64.powf(2.8), 0.0);
    assert_eq!(chip.on_value(0).unwrap(), on);
    assert_eq!(chip.off_value(0).unwrap(), off);

    pca.set_value("lamp", 3.0).unwrap();
    assert_eq!(pca.value("lamp").unwrap(), 1.0);
    assert_eq!(bus.register16(piio::pca9685::regs::led_on(0)), piio::pca9685::FULL_TICK);

    // a 1.5ms pulse is the servo's mid position
    let period_ms = pca.pwm_period_ms();
    chip.set_fraction(1, 1.5 / period_ms, 0.0).unwrap();
    let value = pca.sync_from_hardware("arm").unwrap();
    assert!((value - 0.5).abs() < 0.01, "value {value}");

    assert!(matches!(pca.set_value("nope", 0.1), Err(PiIoError::InvalidArgument(_))));
}

#[test]
fn pca_group_reads_reflect_the_chip() {
    let (manager, _) = manager(pca_config());
    let pca = pca_group(&manager);
    pca.set_value("lamp", 0.5).unwrap();

    // someone else switched the channel off behind our back
    pca.backend().chip().set_fraction(0, 0.0, 0.0).unwrap();
    assert_eq!(pca.value("lamp").unwrap(), 0.5);

    let group = manager.group("lights").unwrap();
    assert_eq!(group.as_pwm().pwm_value("lamp").unwrap(), 0.0);
    assert_eq!(pca.value("lamp").unwrap(), 0.0);
}

#[test]
fn pca_value_changes_are_published() {
    let (manager, _) = manager(pca_config());
    let pca = pca_group(&manager);
    pca.set_value("lamp", 0.25).unwrap();
    pca.set_value("lamp", 0.25).unwrap();

    let events = events_of(&manager, "lights");
    assert_eq!(
        events,
        vec![IoEvent::PwmChanged {
            group: "lights".into(),
            handle: "lamp".into(),
            value: 0.25,
        }]
    );
}

#[test]
fn i2c_groups_share_bus_leases() {
    let (manager, _) = manager(json!({
        "iogroups": [
            { "name": "expander", "type": "mcp23017", "address": 0x20 },
            { "name": "lights", "type": "pca9685", "address": 0x40 },
            { "name": "board", "type": "gpio", "io": [{ "name": "sda", "type": "outputpin", "pin": 2 }] }
        ]
    }));
    assert_eq!(manager.group_names(), vec!["board", "expander", "lights"]);
    assert_eq!(manager.leases().current_leaser(2), "expander, lights");
    assert!(
        manager
            .group("board")
            .unwrap()
            .as_output()
            .unwrap()
            .outputs()
            .is_empty()
    );
}

#[test]
fn groups_can_be_built_without_a_manager() {
    let platform = Arc::new(MockPlatform::default());
    let context = GroupContext {
        leases: Arc::new(piio::PinLeaseRegistry::new(platform.board().clone())),
        events: Arc::new(piio::EventBus::new(16, 8)),
    };
    let config: piio::IoGroupConfig = serde_json::from_value(json!({
        "name": "solo",
        "type": "gpio",
        "io": [{ "name": "led", "type": "outputpin", "pin": 4 }]
    }))
    .unwrap();

    let group = piio::iogroup::create_io_group(&config, &platform, &context).unwrap();
    assert_eq!(group.name(), "solo");
    assert_eq!(group.kind(), piio::GroupKind::Gpio);
    assert_eq!(context.leases.current_leaser(4), "solo");
}

#[tokio::test]
async fn event_stream_delivers_group_events() {
    use tokio_stream::StreamExt;

    let (manager, _) = manager(gpio_config());
    let mut stream = manager.stream();
    manager
        .group("board")
        .unwrap()
        .as_output()
        .unwrap()
        .set_output("led", true)
        .unwrap();

    let event = stream.next().await.unwrap().unwrap();
    assert_eq!(event.path(), "board.led");
}

#[test]
fn multibit_output_round_trips_every_value() {
    let (manager, _) = manager(gpio_config());
    let output = manager.group("board").unwrap().as_output().unwrap();
    for value in 0..8 {
        output.set_multibit_output("word", value).unwrap();
        assert_eq!(output.multibit_output("word").unwrap(), value);
    }
}

#[test]
fn handle_registry_rejects_taken_handles_and_pins() {
    let mut handles = HandleRegistry::default();
    assert!(handles.register("a", 3));
    assert!(!handles.register("a", 4));
    assert!(!handles.register("b", 3));
    assert!(!handles.register_multibit("c", &[5, 5]));
    assert!(!handles.register_multibit("c", &[]));
    assert!(!handles.register_multibit("c", &[6, 3]));

    assert!(handles.register_multibit("c", &[6, 7]));
    assert_eq!(handles.pins("c"), Some(&[6, 7][..]));
    assert_eq!(handles.handle_of(7), Some("c"));
    assert_eq!(handles.handle_of(4), None);
    assert_eq!(handles.handles().collect::<Vec<_>>(), vec!["a", "c"]);
}
