use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// CDN ports that serve plain HTTP.
pub const PLAIN_PORTS: &[u16] = &[80, 8080, 8880, 2052, 2082, 2086, 2095];

/// CDN ports that serve HTTPS.
pub const SECURE_PORTS: &[u16] = &[443, 2053, 2083, 2087, 2096, 8443];

/// Used when the caller enables no ports at all.
pub const FALLBACK_PORTS: &[u16] = &[80, 443];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortClass {
    Plain,
    Secure,
}

impl PortClass {
    pub fn protocol(self) -> Protocol {
        match self {
            PortClass::Plain => Protocol::Http,
            PortClass::Secure => Protocol::Https,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

/// Port → class lookup, built once per run. Ports not in the table are plain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTable {
    classes: HashMap<u16, PortClass>,
}

impl PortTable {
    /// Table with the given secure ports; every other port is plain.
    pub fn with_secure(secure: impl IntoIterator<Item = u16>) -> Self {
        let mut classes: HashMap<u16, PortClass> =
            PLAIN_PORTS.iter().map(|&p| (p, PortClass::Plain)).collect();
        for p in secure {
            classes.insert(p, PortClass::Secure);
        }
        Self { classes }
    }

    pub fn cdn_default() -> Self {
        Self::with_secure(SECURE_PORTS.iter().copied())
    }

    pub fn class_of(&self, port: u16) -> PortClass {
        self.classes.get(&port).copied().unwrap_or(PortClass::Plain)
    }

    pub fn protocol_of(&self, port: u16) -> Protocol {
        self.class_of(port).protocol()
    }

    /// Order enabled ports for probing: plain group first, then secure, each in
    /// the order given.
    pub fn probe_order(&self, enabled: &[u16]) -> Vec<u16> {
        let (plain, secure): (Vec<u16>, Vec<u16>) = enabled
            .iter()
            .copied()
            .partition(|&p| self.class_of(p) == PortClass::Plain);
        plain.into_iter().chain(secure).collect()
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::cdn_default()
    }
}

/// All CDN ports, plain group first.
pub fn default_enabled_ports() -> Vec<u16> {
    PLAIN_PORTS.iter().chain(SECURE_PORTS).copied().collect()
}

/// Parse a port list into deduplicated TCP ports (1..=65535), keeping first-seen order.
///
/// Entries are separated by newlines or commas:
/// - single port number: `80`
/// - inclusive range: `2052-2053`
/// - comments: everything after `#` on a line is ignored
/// - whitespace and blank entries are ignored
pub fn parse_ports_str(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        // Strip comments, then split on commas
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            // Range `start-end`
            if let Some((a, b)) = entry.split_once('-') {
                let start = parse_port_str(a.trim())
                    .with_context(|| format!("line {line_no}: invalid start in range: {a}"))?;
                let end = parse_port_str(b.trim())
                    .with_context(|| format!("line {line_no}: invalid end in range: {b}"))?;
                if start > end {
                    bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            // Single number
            let p = parse_port_str(entry)
                .with_context(|| format!("line {line_no}: invalid port value: {entry}"))?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_comma_list_and_ranges() {
        let ports = parse_ports_str("80, 443,2052-2053\n8443").unwrap();
        assert_eq!(ports, vec![80, 443, 2052, 2053, 8443]);
    }

    #[test]
    fn parse_with_comments_and_dedup() {
        let input = r#"
            # plain
            80  # http
            8080,80
            # secure
            443
        "#;
        let ports = parse_ports_str(input).unwrap();
        assert_eq!(ports, vec![80, 8080, 443]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_ports_str("70000\n").is_err());
        assert!(parse_ports_str("443-80").is_err());
    }

    #[test]
    fn secure_ports_map_to_https() {
        let t = PortTable::cdn_default();
        for &p in SECURE_PORTS {
            assert_eq!(t.protocol_of(p), Protocol::Https);
        }
        for &p in PLAIN_PORTS {
            assert_eq!(t.protocol_of(p), Protocol::Http);
        }
        assert_eq!(t.class_of(22), PortClass::Plain);
    }

    #[test]
    fn probe_order_puts_plain_first() {
        let t = PortTable::cdn_default();
        assert_eq!(t.probe_order(&[443, 80, 2053, 8080]), vec![80, 8080, 443, 2053]);
    }

    #[test]
    fn custom_secure_port() {
        let t = PortTable::with_secure([9443]);
        assert_eq!(t.class_of(9443), PortClass::Secure);
        assert_eq!(t.class_of(443), PortClass::Plain);
    }
}
