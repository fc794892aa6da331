use piio::gpio::Board;
use piio::lease::{INVALID_LEASER, INVALID_USAGE, LeaseKind, NO_LEASER, NO_USAGE, PinLeaseRegistry};

fn registry() -> PinLeaseRegistry {
    PinLeaseRegistry::new(Board::default())
}

#[test]
fn exclusive_lease_blocks_everyone_else() {
    let leases = registry();
    assert!(leases.request_exclusive(2, "A", "status led"));
    assert!(!leases.request_exclusive(2, "B", "other"));
    assert!(!leases.request_shared(2, "B", "other"));
    assert!(leases.is_exclusively_leased(2));
    assert_eq!(leases.current_leaser(2), "A");
    assert_eq!(leases.current_usage(2), "status led");
}

#[test]
fn shared_leases_accumulate_in_call_order() {
    let leases = registry();
    assert!(leases.request_shared(3, "left", "I2C SCL"));
    assert!(leases.request_shared(3, "right", "I2C SCL"));
    assert!(leases.request_shared(3, "third", "sensor"));

    assert_eq!(leases.current_leaser(3), "left, right, third");
    assert_eq!(leases.current_usage(3), "I2C SCL, I2C SCL, sensor");
    assert!(!leases.is_exclusively_leased(3));
    assert_eq!(leases.lease(3).map(|l| l.kind), Some(LeaseKind::Shared));
}

#[test]
fn exclusive_request_fails_on_shared_pin() {
    let leases = registry();
    assert!(leases.request_shared(4, "bus", "I2C SDA"));
    assert!(!leases.request_exclusive(4, "gpio", "IO group pin"));
    assert_eq!(leases.current_leaser(4), "bus");
}

#[test]
fn invalid_pins_are_never_leased() {
    let leases = registry();
    // gpio 5 is not on the revision-2 header
    assert!(!leases.request_exclusive(5, "A", "x"));
    assert!(!leases.request_shared(5, "A", "x"));
    assert_eq!(leases.current_leaser(5), INVALID_LEASER);
    assert_eq!(leases.current_usage(5), INVALID_USAGE);
}

#[test]
fn unclaimed_pin_reports_no_one() {
    let leases = registry();
    assert_eq!(leases.current_leaser(17), NO_LEASER);
    assert_eq!(leases.current_usage(17), NO_USAGE);
    assert!(leases.lease(17).is_none());
}

#[test]
fn revision_one_board_uses_its_own_pin_numbers() {
    let leases = PinLeaseRegistry::new(Board::new("BCM2708", 0x0002));
    assert!(leases.request_exclusive(0, "A", "x"));
    assert!(!leases.request_exclusive(2, "A", "x"));
    assert_eq!(leases.current_leaser(2), INVALID_LEASER);
}
