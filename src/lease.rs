use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::gpio::Board;

pub const NO_LEASER: &str = "no one";
pub const NO_USAGE: &str = "pin unclaimed";
pub const INVALID_LEASER: &str = "n/a";
pub const INVALID_USAGE: &str = "Invalid pin number";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseKind {
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub kind: LeaseKind,
    pub leaser: String,
    pub usage: String,
}

/// Arbitrates claims on native pin numbers between independent drivers.
///
/// A pin carries either one exclusive lease or any number of shared ones.
/// Leases are taken during configuration and never released.
pub struct PinLeaseRegistry {
    board: Board,
    leases: Mutex<FxHashMap<u16, Lease>>,
}

impl PinLeaseRegistry {
    pub fn new(board: Board) -> Self {
        Self {
            board,
            leases: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    fn valid(&self, pin: u16) -> bool {
        self.board.verify_pin(i64::from(pin)).is_some()
    }

    pub fn request_exclusive(&self, pin: u16, user: &str, usage: &str) -> bool {
        if !self.valid(pin) {
            return false;
        }
        let mut leases = self.leases.lock();
        if leases.contains_key(&pin) {
            return false;
        }
        leases.insert(
            pin,
            Lease {
                kind: LeaseKind::Exclusive,
                leaser: user.to_string(),
                usage: usage.to_string(),
            },
        );
        true
    }

    pub fn request_shared(&self, pin: u16, user: &str, usage: &str) -> bool {
        if !self.valid(pin) {
            return false;
        }
        let mut leases = self.leases.lock();
        match leases.get_mut(&pin) {
            Some(lease) if lease.kind == LeaseKind::Exclusive => false,
            Some(lease) => {
                lease.leaser.push_str(", ");
                lease.leaser.push_str(user);
                lease.usage.push_str(", ");
                lease.usage.push_str(usage);
                true
            }
            None => {
                leases.insert(
                    pin,
                    Lease {
                        kind: LeaseKind::Shared,
                        leaser: user.to_string(),
                        usage: usage.to_string(),
                    },
                );
                true
            }
        }
    }

    pub fn is_exclusively_leased(&self, pin: u16) -> bool {
        self.leases
            .lock()
            .get(&pin)
            .is_some_and(|lease| lease.kind == LeaseKind::Exclusive)
    }

    pub fn lease(&self, pin: u16) -> Option<Lease> {
        self.leases.lock().get(&pin).cloned()
    }

    pub fn current_leaser(&self, pin: u16) -> String {
        if !self.valid(pin) {
            return INVALID_LEASER.to_string();
        }
        self.lease(pin)
            .map(|lease| lease.leaser)
            .unwrap_or_else(|| NO_LEASER.to_string())
    }

    pub fn current_usage(&self, pin: u16) -> String {
        if !self.valid(pin) {
            return INVALID_USAGE.to_string();
        }
        self.lease(pin)
            .map(|lease| lease.usage)
            .unwrap_or_else(|| NO_USAGE.to_string())
    }
}
