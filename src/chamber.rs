// src/chamber.rs
//! A chamber is one sealed test vessel with a gas valve and a vacuum valve,
//! addressed through two adjacent bits on the valve shift register.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed status set. `DISABLED` is one-way from the controller's point of
/// view: re-enabling is an administrative action that also has to remove the
/// slot from the persisted disabled set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChamberStatus {
    Normal,
    Disabled,
}

impl fmt::Display for ChamberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChamberStatus::Normal => write!(f, "NORMAL"),
            ChamberStatus::Disabled => write!(f, "DISABLED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Chamber {
    pub name: String,
    pub group: String,
    /// Physical position on the test bench, 1-based.
    pub slot: u8,
    status: ChamberStatus,
}

impl Chamber {
    /// Slots are 1-based; slot 0 would underflow the valve bit mapping.
    pub fn new(name: impl Into<String>, group: impl Into<String>, slot: u8) -> Self {
        assert!(slot >= 1, "chamber slots are 1-based");
        Self {
            name: name.into(),
            group: group.into(),
            slot,
            status: ChamberStatus::Normal,
        }
    }

    pub fn status(&self) -> ChamberStatus {
        self.status
    }

    pub fn is_normal(&self) -> bool {
        self.status == ChamberStatus::Normal
    }

    /// One-way transition; there is deliberately no `enable()`.
    pub fn disable(&mut self) {
        self.status = ChamberStatus::Disabled;
    }

    /// Shift-register bit driving this chamber's gas valve.
    pub fn gas_bit(&self) -> usize {
        (self.slot as usize - 1) * 2
    }

    /// Shift-register bit driving this chamber's vacuum valve.
    pub fn vacuum_bit(&self) -> usize {
        (self.slot as usize - 1) * 2 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valve_bits_map_from_slot() {
        let chamber = Chamber::new("c3", "a", 3);
        assert_eq!(chamber.gas_bit(), 4);
        assert_eq!(chamber.vacuum_bit(), 5);

        let first = Chamber::new("c1", "a", 1);
        assert_eq!(first.gas_bit(), 0);
        assert_eq!(first.vacuum_bit(), 1);
    }

    #[test]
    #[should_panic(expected = "1-based")]
    fn slot_zero_is_rejected_at_construction() {
        Chamber::new("c0", "a", 0);
    }

    #[test]
    fn disable_is_one_way() {
        let mut chamber = Chamber::new("c1", "a", 1);
        assert!(chamber.is_normal());

        chamber.disable();
        assert_eq!(chamber.status(), ChamberStatus::Disabled);

        // A second disable stays disabled.
        chamber.disable();
        assert_eq!(chamber.status(), ChamberStatus::Disabled);
    }

    #[test]
    fn status_displays_wire_form() {
        assert_eq!(ChamberStatus::Normal.to_string(), "NORMAL");
        assert_eq!(ChamberStatus::Disabled.to_string(), "DISABLED");
    }
}
