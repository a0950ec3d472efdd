//! The definition-document codec of spec §6: a tag-tree with a `<network>`
//! root, encoded and parsed by hand rather than through a general XML
//! crate, since the grammar is small and fixed (spec §6's byte-equivalent
//! round-trip property only has to hold for the tags it actually names).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use virtnet_model::{DhcpHost, DhcpRange, ForwardMode, NetworkDef, NetworkError};

struct Tag {
    name: String,
    attrs: HashMap<String, String>,
    self_closing: bool,
    closing: bool,
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn parse_attrs(raw: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut chars = raw.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        // Scan an identifier.
        let mut end = start + c.len_utf8();
        while let Some(&(i, ch)) = chars.peek() {
            if ch == '=' || ch.is_whitespace() {
                break;
            }
            end = i + ch.len_utf8();
            chars.next();
        }
        let key = raw[start..end].to_string();
        // Skip whitespace and '='.
        while let Some(&(_, ch)) = chars.peek() {
            if ch == '=' || ch.is_whitespace() {
                chars.next();
            } else {
                break;
            }
        }
        let Some(&(q_pos, '"')) = chars.peek() else { continue };
        chars.next();
        let val_start = q_pos + 1;
        let mut val_end = val_start;
        for (i, ch) in raw[val_start..].char_indices() {
            if ch == '"' {
                val_end = val_start + i;
                break;
            }
        }
        let consumed = raw[val_start..val_end].chars().count() + 1;
        for _ in 0..consumed {
            chars.next();
        }
        attrs.insert(key, unescape(&raw[val_start..val_end]));
    }
    attrs
}

enum Token {
    Tag(Tag),
    Text(String),
}

fn tokenize(xml: &str) -> Result<Vec<Token>, NetworkError> {
    let mut tokens = Vec::new();
    let mut rest = xml;
    while let Some(open) = rest.find('<') {
        let text = rest[..open].trim();
        if !text.is_empty() {
            tokens.push(Token::Text(unescape(text)));
        }
        rest = &rest[open + 1..];
        let close = rest.find('>').ok_or_else(|| NetworkError::MalformedDefinition {
            reason: "unterminated tag".to_string(),
        })?;
        let mut body = &rest[..close];
        rest = &rest[close + 1..];
        let closing = body.starts_with('/');
        if closing {
            body = &body[1..];
        }
        let self_closing = body.trim_end().ends_with('/');
        if self_closing {
            body = &body[..body.trim_end().len() - 1];
        }
        let body = body.trim();
        let name_end = body.find(char::is_whitespace).unwrap_or(body.len());
        let name = body[..name_end].to_string();
        let attrs = parse_attrs(body[name_end..].trim());
        tokens.push(Token::Tag(Tag {
            name,
            attrs,
            self_closing,
            closing,
        }));
    }
    Ok(tokens)
}

fn attr<'a>(attrs: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    attrs.get(key).map(String::as_str)
}

fn parse_ipv4(attrs: &HashMap<String, String>, key: &str, context: &str) -> Result<Option<Ipv4Addr>, NetworkError> {
    match attr(attrs, key) {
        None => Ok(None),
        Some(v) => v.parse().map(Some).map_err(|_| NetworkError::MalformedDefinition {
            reason: format!("{context}: invalid address '{v}' for '{key}'"),
        }),
    }
}

/// Emits `def` as a `<network>` document. Deterministic field order so
/// repeated encodes of the same definition are byte-identical.
pub fn encode(def: &NetworkDef) -> String {
    let mut out = String::new();
    out.push_str("<network>\n");
    out.push_str(&format!("  <name>{}</name>\n", escape(&def.name)));
    out.push_str(&format!("  <uuid>{}</uuid>\n", def.uuid));

    let mut forward = format!("  <forward mode=\"{}\"", def.forward_mode);
    if let Some(dev) = &def.forward_dev {
        forward.push_str(&format!(" dev=\"{}\"", escape(dev)));
    }
    forward.push_str(&format!(
        " adjustFirewall=\"{}\"/>\n",
        if def.adjust_firewall { "on" } else { "off" }
    ));
    out.push_str(&forward);

    if let Some(bridge) = &def.bridge_name {
        out.push_str(&format!(
            "  <bridge name=\"{}\" stp=\"{}\" delay=\"{}\"/>\n",
            escape(bridge),
            if def.stp_enabled { "on" } else { "off" },
            def.forward_delay
        ));
    }

    if let Some(domain) = &def.dns_domain {
        out.push_str(&format!("  <domain name=\"{}\"/>\n", escape(domain)));
    }

    if let (Some(ip), Some(netmask)) = (def.ip_address, def.netmask) {
        let has_children = def.tftp_root.is_some() || !def.dhcp_ranges.is_empty() || !def.dhcp_hosts.is_empty()
            || def.bootp_file.is_some();
        if has_children {
            out.push_str(&format!("  <ip address=\"{ip}\" netmask=\"{netmask}\">\n"));
            if let Some(root) = &def.tftp_root {
                out.push_str(&format!("    <tftp root=\"{}\"/>\n", escape(&root.to_string_lossy())));
            }
            if !def.dhcp_ranges.is_empty() || !def.dhcp_hosts.is_empty() || def.bootp_file.is_some() {
                out.push_str("    <dhcp>\n");
                for range in &def.dhcp_ranges {
                    out.push_str(&format!("      <range start=\"{}\" end=\"{}\"", range.start, range.end));
                    if let Some(size) = range.size {
                        out.push_str(&format!(" size=\"{size}\""));
                    }
                    out.push_str("/>\n");
                }
                for host in &def.dhcp_hosts {
                    out.push_str("      <host");
                    if let Some(mac) = &host.mac {
                        out.push_str(&format!(" mac=\"{}\"", escape(mac)));
                    }
                    if let Some(name) = &host.hostname {
                        out.push_str(&format!(" name=\"{}\"", escape(name)));
                    }
                    out.push_str(&format!(" ip=\"{}\"/>\n", host.ip));
                }
                if let Some(file) = &def.bootp_file {
                    out.push_str(&format!("      <bootp file=\"{}\"", escape(file)));
                    if let Some(server) = &def.bootp_server {
                        out.push_str(&format!(" server=\"{}\"", escape(server)));
                    }
                    out.push_str("/>\n");
                }
                out.push_str("    </dhcp>\n");
            }
            out.push_str("  </ip>\n");
        } else {
            out.push_str(&format!("  <ip address=\"{ip}\" netmask=\"{netmask}\"/>\n"));
        }
    }

    out.push_str("</network>\n");
    out
}

/// Parses a `<network>` document, failing closed with `MalformedDefinition`
/// on any structural or attribute problem.
pub fn decode(xml: &str) -> Result<NetworkDef, NetworkError> {
    let tokens = tokenize(xml)?;

    let mut name = None;
    let mut uuid = None;
    let mut bridge_name = None;
    let mut stp_enabled = true;
    let mut forward_delay = 0u32;
    let mut ip_address = None;
    let mut netmask = None;
    let mut dns_domain = None;
    let mut dhcp_ranges = Vec::new();
    let mut dhcp_hosts = Vec::new();
    let mut tftp_root = None;
    let mut bootp_file = None;
    let mut bootp_server = None;
    let mut forward_mode = ForwardMode::None;
    let mut forward_dev = None;
    let mut adjust_firewall = true;

    let mut pending_text_for: Option<&str> = None;
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::Tag(tag) if !tag.closing => {
                match tag.name.as_str() {
                    "name" | "uuid" => {
                        pending_text_for = Some(if tag.name == "name" { "name" } else { "uuid" });
                    }
                    "forward" => {
                        forward_mode = match attr(&tag.attrs, "mode") {
                            None | Some("none") => ForwardMode::None,
                            Some("nat") => ForwardMode::Nat,
                            Some("route") => ForwardMode::Route,
                            Some(other) => {
                                return Err(NetworkError::MalformedDefinition {
                                    reason: format!("unknown forward mode '{other}'"),
                                });
                            }
                        };
                        forward_dev = attr(&tag.attrs, "dev").map(str::to_string);
                        adjust_firewall = attr(&tag.attrs, "adjustFirewall") != Some("off");
                    }
                    "bridge" => {
                        bridge_name = attr(&tag.attrs, "name").map(str::to_string);
                        stp_enabled = attr(&tag.attrs, "stp") != Some("off");
                        forward_delay = attr(&tag.attrs, "delay").and_then(|v| v.parse().ok()).unwrap_or(0);
                    }
                    "domain" => {
                        dns_domain = attr(&tag.attrs, "name").map(str::to_string);
                    }
                    "ip" => {
                        ip_address = parse_ipv4(&tag.attrs, "address", "ip")?;
                        netmask = parse_ipv4(&tag.attrs, "netmask", "ip")?;
                    }
                    "tftp" => {
                        tftp_root = attr(&tag.attrs, "root").map(std::path::PathBuf::from);
                    }
                    "range" => {
                        let start = parse_ipv4(&tag.attrs, "start", "range")?.ok_or_else(|| {
                            NetworkError::MalformedDefinition {
                                reason: "dhcp range missing 'start'".to_string(),
                            }
                        })?;
                        let end = parse_ipv4(&tag.attrs, "end", "range")?.ok_or_else(|| {
                            NetworkError::MalformedDefinition {
                                reason: "dhcp range missing 'end'".to_string(),
                            }
                        })?;
                        let size = attr(&tag.attrs, "size").and_then(|v| v.parse().ok());
                        dhcp_ranges.push(DhcpRange { start, end, size });
                    }
                    "host" => {
                        let ip = parse_ipv4(&tag.attrs, "ip", "host")?.ok_or_else(|| {
                            NetworkError::MalformedDefinition {
                                reason: "dhcp host missing 'ip'".to_string(),
                            }
                        })?;
                        dhcp_hosts.push(DhcpHost {
                            mac: attr(&tag.attrs, "mac").map(str::to_string),
                            hostname: attr(&tag.attrs, "name").map(str::to_string),
                            ip,
                        });
                    }
                    "bootp" => {
                        bootp_file = attr(&tag.attrs, "file").map(str::to_string);
                        bootp_server = attr(&tag.attrs, "server").map(str::to_string);
                    }
                    _ => {}
                }
            }
            Token::Text(text) => {
                match pending_text_for {
                    Some("name") => name = Some(text.clone()),
                    Some("uuid") => {
                        uuid = Some(text.parse::<uuid::Uuid>().map_err(|_| NetworkError::MalformedDefinition {
                            reason: format!("invalid uuid literal '{text}'"),
                        })?);
                    }
                    _ => {}
                }
                pending_text_for = None;
            }
            _ => {}
        }
        i += 1;
    }

    let name = name.ok_or_else(|| NetworkError::MalformedDefinition {
        reason: "missing <name>".to_string(),
    })?;
    let uuid = uuid.ok_or_else(|| NetworkError::MalformedDefinition {
        reason: format!("network '{name}': missing <uuid>"),
    })?;

    let def = NetworkDef {
        name,
        uuid,
        bridge_name,
        stp_enabled,
        forward_delay,
        ip_address,
        netmask,
        dns_domain,
        dhcp_ranges,
        dhcp_hosts,
        tftp_root,
        bootp_file,
        bootp_server,
        forward_mode,
        forward_dev,
        adjust_firewall,
    };
    def.validate()?;
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtnet_model::ForwardMode;

    fn sample() -> NetworkDef {
        NetworkDef {
            name: "net0".to_string(),
            uuid: uuid::Uuid::new_v4(),
            bridge_name: Some("virbr0".to_string()),
            stp_enabled: true,
            forward_delay: 0,
            ip_address: Some("192.168.100.1".parse().unwrap()),
            netmask: Some("255.255.255.0".parse().unwrap()),
            dns_domain: Some("example.com".to_string()),
            dhcp_ranges: vec![DhcpRange {
                start: "192.168.100.2".parse().unwrap(),
                end: "192.168.100.254".parse().unwrap(),
                size: None,
            }],
            dhcp_hosts: vec![DhcpHost {
                mac: Some("52:54:00:11:22:33".to_string()),
                hostname: Some("host1".to_string()),
                ip: "192.168.100.5".parse().unwrap(),
            }],
            tftp_root: None,
            bootp_file: None,
            bootp_server: None,
            forward_mode: ForwardMode::Nat,
            forward_dev: Some("eth0".to_string()),
            adjust_firewall: true,
        }
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let def = sample();
        let xml = encode(&def);
        let back = decode(&xml).unwrap();
        assert_eq!(def, back);
    }

    #[test]
    fn byte_identical_on_second_encode() {
        let def = sample();
        assert_eq!(encode(&def), encode(&decode(&encode(&def)).unwrap()));
    }

    #[test]
    fn decode_rejects_missing_uuid() {
        let xml = "<network><name>net0</name></network>";
        let err = decode(xml).unwrap_err();
        assert!(matches!(err, NetworkError::MalformedDefinition { .. }));
    }

    #[test]
    fn decode_rejects_unknown_forward_mode() {
        let xml = format!(
            "<network><name>net0</name><uuid>{}</uuid><forward mode=\"bogus\"/></network>",
            uuid::Uuid::new_v4()
        );
        assert!(decode(&xml).is_err());
    }

    #[test]
    fn decode_isolated_network_needs_no_ip() {
        let xml = format!(
            "<network><name>isolated0</name><uuid>{}</uuid><forward mode=\"none\"/></network>",
            uuid::Uuid::new_v4()
        );
        let def = decode(&xml).unwrap();
        assert_eq!(def.forward_mode, ForwardMode::None);
        assert!(def.ip_address.is_none());
    }

    #[test]
    fn escapes_attribute_special_characters() {
        let mut def = sample();
        def.dns_domain = Some("a&b<c>d\"e".to_string());
        let xml = encode(&def);
        let back = decode(&xml).unwrap();
        assert_eq!(def.dns_domain, back.dns_domain);
    }
}
