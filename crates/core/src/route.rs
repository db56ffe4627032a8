//! C6 — CIDR route table: which session a SOCKS/Connect destination
//! address should be tunnelled through.
//!
//! Routes are matched in insertion order, first match wins — a
//! deliberate simplification of longest-prefix-match routing, since
//! the agent population here is small and operators add routes
//! deliberately rather than relying on overlap resolution. Recorded as
//! an Open Question decision in DESIGN.md.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::RwLock;

use ipnet::IpNet;

use crate::session::SessionId;

#[derive(Clone)]
struct Route {
    cidr: IpNet,
    session_id: SessionId,
}

/// Routes are stored by `session_id`, not by a reference to the
/// session itself — a session that closes simply leaves its routes
/// dangling until an operator clears them, rather than needing the
/// table to track session liveness.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<Vec<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, cidr: &str, session_id: SessionId) -> Result<(), &'static str> {
        let cidr: IpNet = cidr.parse().map_err(|_| "Invalid IP or range")?;
        let mut routes = self.routes.write().unwrap();
        routes.retain(|r| r.cidr != cidr);
        routes.push(Route { cidr, session_id });
        Ok(())
    }

    pub fn del_route(&self, cidr: &str) -> Result<(), &'static str> {
        let cidr: IpNet = IpNet::from_str(cidr).map_err(|_| "Invalid IP or range")?;
        let mut routes = self.routes.write().unwrap();
        let before = routes.len();
        routes.retain(|r| r.cidr != cidr);
        if routes.len() == before {
            return Err("Invalid route");
        }
        Ok(())
    }

    pub fn clear_routes(&self) {
        self.routes.write().unwrap().clear();
    }

    /// First route (in insertion order) whose CIDR contains `addr`.
    pub fn lookup(&self, addr: IpAddr) -> Option<SessionId> {
        self.routes
            .read()
            .unwrap()
            .iter()
            .find(|r| r.cidr.contains(&addr))
            .map(|r| r.session_id)
    }

    pub fn list(&self) -> Vec<(String, SessionId)> {
        self.routes
            .read()
            .unwrap()
            .iter()
            .map(|r| (r.cidr.to_string(), r.session_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins_on_overlap() {
        let table = RouteTable::new();
        table.add_route("10.0.0.0/8", 1).unwrap();
        table.add_route("10.0.0.0/16", 2).unwrap();
        assert_eq!(table.lookup("10.0.1.1".parse().unwrap()), Some(1));
    }

    #[test]
    fn invalid_cidr_is_rejected() {
        let table = RouteTable::new();
        assert!(table.add_route("not-a-cidr", 1).is_err());
    }

    #[test]
    fn deleting_unknown_route_errors() {
        let table = RouteTable::new();
        assert!(table.del_route("10.0.0.0/8").is_err());
    }

    #[test]
    fn clear_removes_everything() {
        let table = RouteTable::new();
        table.add_route("10.0.0.0/8", 1).unwrap();
        table.clear_routes();
        assert_eq!(table.lookup("10.0.0.1".parse().unwrap()), None);
    }
}
