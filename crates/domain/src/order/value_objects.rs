//! Value objects for the order domain.

use common::PassengerId;
use serde::{Deserialize, Serialize};

use crate::Money;

/// Per-head prices of a cabin type, copied onto the order item at checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub adult: Money,
    pub child: Money,
    pub infant: Money,
    /// Charged per adult and child.
    pub port_fee: Money,
    /// Charged per adult and child.
    pub service_fee: Money,
}

/// Head count of one cabin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Occupancy {
    pub adults: u32,
    pub children: u32,
    pub infants: u32,
}

impl Occupancy {
    pub fn new(adults: u32, children: u32, infants: u32) -> Self {
        Self {
            adults,
            children,
            infants,
        }
    }

    /// Guests who count as passengers and pay fees. Infants do not.
    pub fn paying_guests(&self) -> u32 {
        self.adults + self.children
    }
}

impl PriceSnapshot {
    /// Price of one cabin at the given occupancy.
    pub fn subtotal(&self, occupancy: Occupancy) -> Money {
        self.adult.multiply(occupancy.adults)
            + self.child.multiply(occupancy.children)
            + self.infant.multiply(occupancy.infants)
            + (self.port_fee + self.service_fee).multiply(occupancy.paying_guests())
    }
}

/// Who to reach about the booking.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
}

string_enum! {
    pub enum PassengerKind("passenger kind") {
        Adult => "adult",
        Child => "child",
        Infant => "infant",
    }
}

/// A traveller on the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passenger {
    #[serde(default)]
    pub id: PassengerId,
    pub name: String,
    pub kind: PassengerKind,
    pub id_number: Option<String>,
    pub passport_number: Option<String>,
    pub phone: Option<String>,
}

impl Passenger {
    pub fn new(name: impl Into<String>, kind: PassengerKind) -> Self {
        Self {
            id: PassengerId::new(),
            name: name.into(),
            kind,
            id_number: None,
            passport_number: None,
            phone: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtotal_charges_fees_per_paying_guest() {
        let price = PriceSnapshot {
            adult: Money::from_major(1000),
            child: Money::from_major(600),
            infant: Money::from_major(100),
            port_fee: Money::from_major(50),
            service_fee: Money::from_major(20),
        };

        // 2*1000 + 1*600 + 1*100 + (50+20)*3
        let subtotal = price.subtotal(Occupancy::new(2, 1, 1));
        assert_eq!(subtotal, Money::from_major(2910));
    }

    #[test]
    fn infants_are_not_paying_guests() {
        assert_eq!(Occupancy::new(2, 1, 3).paying_guests(), 3);
    }
}
