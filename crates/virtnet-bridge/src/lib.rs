//! The bridge-name allocator of spec §4.4: a literal name is used verbatim
//! (optionally collision-checked), a template name is filled with ascending
//! integers against the registry's shared bridge namespace.

use virtnet_model::{NetworkError, is_bridge_name_template};
use virtnet_registry::Registry;

const MAX_TEMPLATE_ATTEMPTS: u32 = 256;
const DEFAULT_TEMPLATE: &str = "virbr%d";

/// Resolves `requested` (the definition's `bridge_name`, possibly absent)
/// into a concrete bridge name, excluding `excluding` (the network being
/// (re)defined, if it already owns a bridge) from collision checks.
pub fn allocate(
    registry: &Registry,
    requested: Option<&str>,
    check_collision: bool,
    excluding: Option<uuid::Uuid>,
) -> Result<String, NetworkError> {
    match requested {
        Some(name) if !is_bridge_name_template(name) => {
            if check_collision {
                if let Some(other) = registry.bridge_in_use(name, excluding) {
                    return Err(NetworkError::BridgeInUse {
                        bridge: name.to_string(),
                        other_network: other,
                    });
                }
            }
            Ok(name.to_string())
        }
        template => {
            let template = template.unwrap_or(DEFAULT_TEMPLATE);
            for n in 0..MAX_TEMPLATE_ATTEMPTS {
                let candidate = template.replace("%d", &n.to_string());
                if registry.bridge_in_use(&candidate, excluding).is_none() {
                    return Ok(candidate);
                }
            }
            Err(NetworkError::BridgeExhausted {
                template: template.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtnet_model::{ForwardMode, NetworkDef};

    fn def(name: &str, bridge: &str) -> NetworkDef {
        NetworkDef {
            name: name.to_string(),
            uuid: uuid::Uuid::new_v4(),
            bridge_name: Some(bridge.to_string()),
            stp_enabled: true,
            forward_delay: 0,
            ip_address: None,
            netmask: None,
            dns_domain: None,
            dhcp_ranges: vec![],
            dhcp_hosts: vec![],
            tftp_root: None,
            bootp_file: None,
            bootp_server: None,
            forward_mode: ForwardMode::None,
            forward_dev: None,
            adjust_firewall: true,
        }
    }

    #[test]
    fn literal_name_used_verbatim() {
        let registry = Registry::new();
        let name = allocate(&registry, Some("mybr0"), true, None).unwrap();
        assert_eq!(name, "mybr0");
    }

    #[test]
    fn literal_name_collision_is_an_error() {
        let registry = Registry::new();
        registry.assign(def("net0", "mybr0")).unwrap();
        let err = allocate(&registry, Some("mybr0"), true, None).unwrap_err();
        assert!(matches!(err, NetworkError::BridgeInUse { .. }));
    }

    #[test]
    fn template_fills_ascending_integers() {
        let registry = Registry::new();
        registry.assign(def("net0", "virbr0")).unwrap();
        registry.assign(def("net1", "virbr1")).unwrap();
        let name = allocate(&registry, Some("virbr%d"), true, None).unwrap();
        assert_eq!(name, "virbr2");
    }

    #[test]
    fn missing_bridge_name_defaults_to_virbr_template() {
        let registry = Registry::new();
        let name = allocate(&registry, None, true, None).unwrap();
        assert_eq!(name, "virbr0");
    }

    #[test]
    fn template_exhaustion_is_an_error() {
        let registry = Registry::new();
        for n in 0..256 {
            registry.assign(def(&format!("net{n}"), &format!("virbr{n}"))).unwrap();
        }
        let err = allocate(&registry, Some("virbr%d"), true, None).unwrap_err();
        assert!(matches!(err, NetworkError::BridgeExhausted { .. }));
    }

    #[test]
    fn excluding_self_allows_reusing_own_bridge() {
        let registry = Registry::new();
        let uuid = registry.assign(def("net0", "virbr0")).unwrap();
        let name = allocate(&registry, Some("virbr0"), true, Some(uuid)).unwrap();
        assert_eq!(name, "virbr0");
    }
}
