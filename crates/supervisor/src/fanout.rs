//! Identity fan-out
//!
//! Turns one fleet configuration into one configuration per serving
//! identity. Without shared keys the configuration is returned as-is and the
//! fleet runs in a single process.

use axonfleet_common::{FleetConfig, FleetError, Identity, Result};
use tracing::{debug, info};

/// Expand `config` into per-identity worker configurations, in key order.
///
/// Every returned configuration is an independent deep copy. All errors are
/// configuration errors and are raised before anything is spawned.
pub fn fan_out(config: &FleetConfig) -> Result<Vec<FleetConfig>> {
    let shared_keys = match &config.wallet.shared_keys {
        None => {
            debug!("No shared keys, running a single identity");
            return Ok(vec![config.clone()]);
        }
        Some(keys) => keys,
    };

    let shared_ports = config.axon.shared_ports.as_deref().ok_or_else(|| {
        FleetError::config("wallet.shared_keys is set but axon.shared_ports is missing")
    })?;

    let identities = Identity::parse_shared(shared_keys, shared_ports)?;
    info!("Fanning out {} identities", identities.len());

    Ok(identities
        .iter()
        .map(|identity| config.with_identity(identity))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn shared(keys: &str, ports: &str) -> FleetConfig {
        let mut config = FleetConfig::default();
        config.wallet.shared_keys = Some(keys.to_string());
        config.axon.shared_ports = Some(ports.to_string());
        config
    }

    #[test]
    fn test_two_identities() {
        let configs = fan_out(&shared("A:a,B:b", "9000,9001")).unwrap();
        assert_eq!(configs.len(), 2);

        assert_eq!(configs[0].wallet.name, "A");
        assert_eq!(configs[0].wallet.hotkey, "a");
        assert_eq!(configs[0].axon.port, 9000);
        assert_eq!(configs[1].wallet.name, "B");
        assert_eq!(configs[1].wallet.hotkey, "b");
        assert_eq!(configs[1].axon.port, 9001);

        for config in &configs {
            assert!(config.wallet.shared_keys.is_none());
            assert!(config.axon.shared_ports.is_none());
            assert_eq!(fan_out(config).unwrap().len(), 1);
        }
    }

    #[test]
    fn test_no_shared_keys_is_identity() {
        let mut config = FleetConfig::default();
        config.neuron.sync_interval = 7;
        let configs = fan_out(&config).unwrap();
        assert_eq!(configs, vec![config]);
    }

    #[test]
    fn test_outputs_are_distinct_and_complete() {
        let base = shared("A:a,B:b,C:c,D:d", "9000,9001,9002,9003");
        let configs = fan_out(&base).unwrap();
        assert_eq!(configs.len(), 4);

        let identities: HashSet<_> = configs.iter().map(|c| c.identity()).collect();
        assert_eq!(identities.len(), 4);

        // Everything except the identity is inherited.
        for config in &configs {
            assert_eq!(config.neuron, base.neuron);
            assert_eq!(config.metagraph, base.metagraph);
        }
    }

    #[test]
    fn test_outputs_are_deep_copies() {
        let base = shared("A:a,B:b", "9000,9001");
        let mut configs = fan_out(&base).unwrap();

        configs[0].neuron.datapath.push("mutated");
        configs[0].neuron.sync_interval = 1;

        assert_eq!(configs[1].neuron.datapath, base.neuron.datapath);
        assert_eq!(configs[1].neuron.sync_interval, 100);
        assert_eq!(base.neuron.sync_interval, 100);
    }

    #[test]
    fn test_malformed_input_fails() {
        let mut missing_ports = FleetConfig::default();
        missing_ports.wallet.shared_keys = Some("A:a".to_string());

        for config in [
            missing_ports,
            shared("", ""),
            shared("A:a,B:b", "9000"),
            shared("A-a", "9000"),
            shared("A:a", "port"),
            shared("A:a,B:b", "9000,9000"),
        ] {
            assert!(matches!(fan_out(&config), Err(FleetError::Config(_))));
        }
    }
}
