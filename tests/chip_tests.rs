use piio::PiIoError;
use piio::mcp23017::{HwConfig, Mcp23017, Mcp23017Settings, NoiseFilter, regs as mcp_regs};
use piio::pca9685::{
    FULL_TICK, Pca9685, Pca9685Config, decode_fraction, encode_fraction, regs as pca_regs,
};
use piio::platform::MockI2c;

const TICK: f64 = 1.0 / 4096.0;

fn pca() -> (Pca9685<MockI2c>, MockI2c) {
    let bus = MockI2c::new(0x40);
    let chip = Pca9685::new(bus.clone(), 0x40, Pca9685Config::default()).unwrap();
    (chip, bus)
}

#[test]
fn prescaler_stays_in_range() {
    for frequency in [0, 1, 23, 24, 50, 200, 1000, 1526, 1527, 100_000] {
        let config = Pca9685Config {
            frequency_hz: frequency,
            ..Pca9685Config::default()
        };
        let prescaler = config.prescaler();
        assert!((3..=255).contains(&prescaler), "{frequency}Hz -> {prescaler}");
    }
}

#[test]
fn actual_frequency_never_decreases() {
    let mut last = 0.0;
    for frequency in 24..=1526 {
        let config = Pca9685Config {
            frequency_hz: frequency,
            ..Pca9685Config::default()
        };
        let actual = config.actual_frequency();
        assert!(actual >= last, "{frequency}Hz gave {actual} after {last}");
        last = actual;
    }
}

#[test]
fn bring_up_programs_mode_and_prescaler() {
    let (chip, bus) = pca();
    // 25MHz / (4096 * 200Hz) = 30.5 -> 31 - 1
    assert_eq!(bus.register(pca_regs::PRESCALE), 30);
    assert_eq!(chip.prescaler().unwrap(), 30);
    // auto-increment and all-call, awake
    assert_eq!(bus.register(pca_regs::MODE1), 0x21);
    // totem pole
    assert_eq!(bus.register(pca_regs::MODE2), 0x04);
    assert!((chip.actual_frequency() - 25_000_000.0 / (4096.0 * 31.0)).abs() < 1e-9);
}

#[test]
fn mode_registers_round_trip() {
    let mut config = Pca9685Config::default();
    config.set_mode1(0xA5);
    assert_eq!(config.mode1(), 0xA5);
    // high-impedance takes precedence over drive-high when both are set
    config.set_mode2(0x1B);
    assert_eq!(config.mode2(), 0x1A);
}

#[test]
fn channel_ticks_read_back() {
    let (chip, bus) = pca();
    chip.set_value(4, 2048, 0).unwrap();
    assert_eq!(chip.off_value(4).unwrap(), 2048);
    assert_eq!(chip.on_value(4).unwrap(), 0);
    assert_eq!(bus.register16(pca_regs::led_off(4)), 2048);
}

#[test]
fn fraction_with_offset() {
    let (chip, _) = pca();
    chip.set_fraction(0, 0.25, 0.5).unwrap();
    assert_eq!(chip.on_value(0).unwrap(), 2048);
    assert_eq!(chip.off_value(0).unwrap(), 3072);
    let (value, offset) = chip.fraction(0).unwrap();
    assert!((value - 0.25).abs() < TICK);
    assert!((offset - 0.5).abs() < TICK);
}

#[test]
fn duty_wrapping_past_cycle_end() {
    let (on, off) = encode_fraction(0.5, 0.75);
    assert_eq!((on, off), (3072, 1024));
    let (value, offset) = decode_fraction(on, off);
    assert!((value - 0.5).abs() < TICK);
    assert!((offset - 0.75).abs() < TICK);
}

#[test]
fn full_on_and_full_off_use_the_sentinel() {
    let (chip, _) = pca();
    chip.set_fraction(1, 1.0, 0.0).unwrap();
    assert_eq!(chip.on_value(1).unwrap(), FULL_TICK);
    assert_eq!(chip.fraction(1).unwrap().0, 1.0);

    chip.set_fraction(1, 0.0, 0.0).unwrap();
    assert_eq!(chip.off_value(1).unwrap(), FULL_TICK);
    assert_eq!(chip.fraction(1).unwrap().0, 0.0);

    // full-off wins when both are set
    assert_eq!(decode_fraction(FULL_TICK, FULL_TICK).0, 0.0);
}

#[test]
fn nearly_full_duty_is_not_encoded_as_zero() {
    let (on, off) = encode_fraction(0.99999, 0.0);
    assert_eq!(on, 0);
    assert_eq!(off, 4095);
}

#[test]
fn pca_channel_out_of_range() {
    let (chip, _) = pca();
    assert!(matches!(chip.set_value(16, 0, 0), Err(PiIoError::InvalidArgument(_))));
}

#[test]
fn pca_bus_errors_surface_as_operation_failed() {
    let (chip, bus) = pca();
    bus.set_failing(true);
    assert!(matches!(chip.on_value(0), Err(PiIoError::OperationFailed(_))));
}

fn mcp(settings: Mcp23017Settings) -> (Mcp23017<MockI2c>, MockI2c) {
    let bus = MockI2c::paired(settings.address);
    let chip = Mcp23017::new(bus.clone(), settings).unwrap();
    (chip, bus)
}

#[test]
fn mcp_init_sequence() {
    let (chip, bus) = mcp(Mcp23017Settings {
        iodir: 0xFF00,
        ipol: 0x0003,
        pullup: 0x00F0,
        ..Mcp23017Settings::default()
    });
    // sequential addressing off, interrupt outputs mirrored
    assert_eq!(bus.register(mcp_regs::IOCON), 0x60);
    assert_eq!(bus.register16(mcp_regs::IODIR), 0xFF00);
    assert_eq!(bus.register16(mcp_regs::IPOL), 0x0003);
    assert_eq!(bus.register16(mcp_regs::GPPU), 0x00F0);
    assert_eq!(bus.register16(mcp_regs::GPINTEN), 0);
    assert_eq!(chip.direction().unwrap(), 0xFF00);
    assert_eq!(chip.address(), 0x20);
}

#[test]
fn iocon_bits_follow_hw_config() {
    let hw = HwConfig {
        disable_slew: true,
        int_mirror: false,
        int_open_drain: true,
        int_active_high: true,
    };
    assert_eq!(hw.iocon(), 0x20 | 0x10 | 0x04 | 0x02);
}

#[test]
fn mcp_masked_writes_keep_other_bits() {
    let (chip, bus) = mcp(Mcp23017Settings::default());
    chip.set_pin(0, true).unwrap();
    assert_eq!(bus.register16(mcp_regs::GPIO), 0x0001);

    chip.set_masked_value(0xFFFF, 0x00F0).unwrap();
    assert_eq!(bus.register16(mcp_regs::GPIO), 0x00F1);

    chip.set_pin(4, false).unwrap();
    assert_eq!(chip.value().unwrap(), 0x00E1);
    assert!(chip.pin(0).unwrap());
    assert!(!chip.pin(4).unwrap());
}

#[test]
fn mcp_swap_ab_exchanges_register_halves() {
    let (chip, bus) = mcp(Mcp23017Settings {
        iodir: 0x12FF,
        swap_ab: true,
        ..Mcp23017Settings::default()
    });
    assert_eq!(bus.register(mcp_regs::IODIR + 1), 0xFF);
    assert_eq!(bus.register(mcp_regs::IODIR), 0x12);
    assert_eq!(chip.direction().unwrap(), 0x12FF);
}

#[test]
fn mcp_pin_out_of_range() {
    let (chip, _) = mcp(Mcp23017Settings::default());
    assert!(matches!(chip.set_pin(16, true), Err(PiIoError::InvalidArgument(_))));
    assert!(matches!(chip.pin(16), Err(PiIoError::InvalidArgument(_))));
}

#[test]
fn mcp_interrupt_registers() {
    let (chip, bus) = mcp(Mcp23017Settings::default());
    chip.int_config(0, 0, 0x0003).unwrap();
    assert_eq!(chip.int_enable().unwrap(), 0x0003);
    assert_eq!(chip.int_control().unwrap(), 0);

    bus.set_register16(mcp_regs::INTF, 0x0002);
    bus.set_register16(mcp_regs::INTCAP, 0x0002);
    assert_eq!(chip.int_flags().unwrap(), 0x0002);
    assert_eq!(chip.int_capture().unwrap(), 0x0002);
}

#[test]
fn mcp_pwm_owns_its_pins_while_running() {
    let (chip, bus) = mcp(Mcp23017Settings {
        iodir: 0x0000,
        ..Mcp23017Settings::default()
    });
    chip.set_pwm_state(3, true).unwrap();
    chip.set_pwm_value(3, 128).unwrap();
    assert_eq!(chip.pwm_value(3).unwrap(), 128);
    chip.pwm_start().unwrap();
    assert!(chip.is_pwm_running());

    assert!(matches!(chip.set_pin(3, true), Err(PiIoError::InvalidArgument(_))));
    chip.set_pin(2, true).unwrap();

    chip.pwm_stop().unwrap();
    assert!(!chip.is_pwm_running());
    assert_eq!(bus.register16(mcp_regs::OLAT) & 0x0008, 0);
}

#[test]
fn mcp_pwm_below_one_tick_clears_a_latched_pin() {
    let (chip, bus) = mcp(Mcp23017Settings {
        iodir: 0x0000,
        ..Mcp23017Settings::default()
    });
    // left high by an earlier full-on level
    bus.set_register16(mcp_regs::OLAT, 0x0008);

    // 8 of 255 rounds down to zero ticks out of 16
    chip.set_pwm_value(3, 8).unwrap();
    chip.set_pwm_state(3, true).unwrap();
    chip.pwm_start().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(bus.register16(mcp_regs::OLAT) & 0x0008, 0);

    // switching the pin back to full-on is latched too
    chip.set_pwm_value(3, 255).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(bus.register16(mcp_regs::OLAT) & 0x0008, 0x0008);
    chip.pwm_stop().unwrap();
}

#[test]
fn noise_filter_suppresses_bursts() {
    let mut filter = NoiseFilter::new(2, 400);
    assert!(filter.filter(0b0111, 0b0101, 0).is_empty());
    assert!(filter.is_suppressed(100));
    assert!(filter.filter(0b0001, 0b0001, 200).is_empty());

    let events = filter.filter(0b0001, 0b0001, 400);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].pin, 0);
    assert!(events[0].value);
}

#[test]
fn noise_filter_reports_each_changed_pin() {
    let mut filter = NoiseFilter::new(4, 400);
    let events = filter.filter(0b1000_0010, 0b0000_0010, 0);
    let pins: Vec<(u16, bool)> = events.iter().map(|e| (e.pin, e.value)).collect();
    assert_eq!(pins, vec![(1, true), (7, false)]);
}

#[test]
fn zero_margin_disables_the_filter() {
    let mut filter = NoiseFilter::new(0, 400);
    assert_eq!(filter.filter(0xFFFF, 0, 0).len(), 16);
    assert!(!filter.is_suppressed(1));
}
