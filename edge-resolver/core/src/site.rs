use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::Point;

/// A federation member advertised as running one or more services: its
/// public IP together with its geographic coordinates.
///
/// Sites are value-equal; the service table keeps them in hashed sets and a
/// site exists only for as long as some service lists it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Site {
    pub ip: IpAddr,
    #[serde(flatten)]
    pub coords: Point,
}

impl Site {
    pub fn new(ip: IpAddr, coords: Point) -> Self {
        Self { ip, coords }
    }
}

impl PartialEq for Site {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.coords == other.coords
    }
}

impl Eq for Site {}

impl std::hash::Hash for Site {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.coords.hash(state);
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ip, self.coords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(ip: &str, lon: f64, lat: f64) -> Site {
        Site::new(ip.parse().unwrap(), Point::new(lon, lat))
    }

    #[test]
    fn sites_are_value_equal() {
        assert_eq!(site("10.0.0.1", 1.0, 2.0), site("10.0.0.1", 1.0, 2.0));
        assert_ne!(site("10.0.0.1", 1.0, 2.0), site("10.0.0.2", 1.0, 2.0));
        assert_ne!(site("10.0.0.1", 1.0, 2.0), site("10.0.0.1", 1.0, 2.5));
    }

    #[test]
    fn set_membership_deduplicates() {
        let mut set = std::collections::HashSet::new();
        set.insert(site("10.0.0.1", 1.0, 2.0));
        set.insert(site("10.0.0.1", 1.0, 2.0));
        set.insert(site("10.0.0.2", 1.0, 2.0));
        assert_eq!(set.len(), 2);
    }
}
