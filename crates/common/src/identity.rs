//! Serving identities
//!
//! An identity is the (coldkey, hotkey, port) triple one worker serves under.
//! Identities are parsed from the shared-key list (`"cold:hot,cold:hot"`) and
//! the parallel shared-port list (`"9000,9001"`).

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// One serving endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Wallet (coldkey) name
    pub coldkey: String,

    /// Hotkey name
    pub hotkey: String,

    /// Axon port
    pub port: u16,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.coldkey, self.hotkey, self.port)
    }
}

impl Identity {
    /// Parse and zip the shared key and port lists.
    ///
    /// Both lists are comma-separated and must have the same number of
    /// entries. Every key entry is `coldkey:hotkey`. Ports and key pairs must
    /// be unique across the list.
    pub fn parse_shared(shared_keys: &str, shared_ports: &str) -> Result<Vec<Identity>> {
        let keys = split_list(shared_keys);
        let ports = split_list(shared_ports);

        if keys.is_empty() {
            return Err(FleetError::config("wallet.shared_keys is empty"));
        }

        if keys.len() != ports.len() {
            return Err(FleetError::config(format!(
                "wallet.shared_keys has {} entries but axon.shared_ports has {}",
                keys.len(),
                ports.len()
            )));
        }

        let mut identities = Vec::with_capacity(keys.len());
        let mut seen_ports = HashSet::new();
        let mut seen_keys = HashSet::new();

        for (key, port) in keys.iter().zip(ports.iter()) {
            let (coldkey, hotkey) = parse_key(key)?;
            let port = parse_port(port)?;

            if !seen_ports.insert(port) {
                return Err(FleetError::config(format!(
                    "port {} appears more than once in axon.shared_ports",
                    port
                )));
            }

            if !seen_keys.insert((coldkey.clone(), hotkey.clone())) {
                return Err(FleetError::config(format!(
                    "key {}:{} appears more than once in wallet.shared_keys",
                    coldkey, hotkey
                )));
            }

            identities.push(Identity {
                coldkey,
                hotkey,
                port,
            });
        }

        Ok(identities)
    }
}

fn split_list(list: &str) -> Vec<&str> {
    if list.trim().is_empty() {
        return Vec::new();
    }
    list.split(',').map(str::trim).collect()
}

fn parse_key(entry: &str) -> Result<(String, String)> {
    let mut parts = entry.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(cold), Some(hot), None) if !cold.trim().is_empty() && !hot.trim().is_empty() => {
            Ok((cold.trim().to_string(), hot.trim().to_string()))
        }
        _ => Err(FleetError::config(format!(
            "malformed shared key '{}', expected 'coldkey:hotkey'",
            entry
        ))),
    }
}

fn parse_port(entry: &str) -> Result<u16> {
    match entry.parse::<u16>() {
        Ok(0) | Err(_) => Err(FleetError::config(format!(
            "malformed shared port '{}', expected 1-65535",
            entry
        ))),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_identities() {
        let ids = Identity::parse_shared("A:a,B:b", "9000,9001").unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], Identity { coldkey: "A".into(), hotkey: "a".into(), port: 9000 });
        assert_eq!(ids[1], Identity { coldkey: "B".into(), hotkey: "b".into(), port: 9001 });
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let ids = Identity::parse_shared(" A:a , B:b ", "9000, 9001").unwrap();
        assert_eq!(ids[1].coldkey, "B");
        assert_eq!(ids[1].port, 9001);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        // A shorter port list must not silently truncate the identity set.
        let err = Identity::parse_shared("A:a,B:b,C:c", "9000,9001").unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));

        assert!(Identity::parse_shared("A:a", "9000,9001").is_err());
    }

    #[test]
    fn test_malformed_key_rejected() {
        assert!(Identity::parse_shared("Aa", "9000").is_err());
        assert!(Identity::parse_shared("A:a:x", "9000").is_err());
        assert!(Identity::parse_shared(":a", "9000").is_err());
        assert!(Identity::parse_shared("A:", "9000").is_err());
        assert!(Identity::parse_shared("", "").is_err());
    }

    #[test]
    fn test_malformed_port_rejected() {
        assert!(Identity::parse_shared("A:a", "http").is_err());
        assert!(Identity::parse_shared("A:a", "0").is_err());
        assert!(Identity::parse_shared("A:a", "70000").is_err());
    }

    #[test]
    fn test_duplicates_rejected() {
        assert!(Identity::parse_shared("A:a,B:b", "9000,9000").is_err());
        assert!(Identity::parse_shared("A:a,A:a", "9000,9001").is_err());
        // Same coldkey with different hotkeys is fine.
        assert!(Identity::parse_shared("A:a,A:b", "9000,9001").is_ok());
    }
}
