use edge_scan_rs::ports::{parse_ports_str, PortClass, PortTable, PLAIN_PORTS, SECURE_PORTS};

#[test]
fn parse_single_and_ranges_and_comments() {
    let input = r#"
        # plain group
        80
        8080  # alt http
        2052-2053
        2053  # duplicate
        # secure group follows

        443, 8443
    "#;

    let ports = parse_ports_str(input).expect("parse ok");
    // Dedup, preserve insertion order of first appearance in each range/line
    assert_eq!(ports, vec![80, 8080, 2052, 2053, 443, 8443]);
}

#[test]
fn invalid_port_rejected() {
    let input = "0\n"; // invalid: out of range
    assert!(parse_ports_str(input).is_err());
    assert!(parse_ports_str("80,abc").is_err());
}

#[test]
fn default_groups_do_not_overlap() {
    let table = PortTable::cdn_default();
    assert_eq!(PLAIN_PORTS.len() + SECURE_PORTS.len(), 13);
    for p in PLAIN_PORTS {
        assert!(!SECURE_PORTS.contains(p));
        assert_eq!(table.class_of(*p), PortClass::Plain);
    }
}

#[test]
fn probe_order_keeps_configured_order_within_groups() {
    let table = PortTable::cdn_default();
    let enabled = parse_ports_str("8443,2095,443,80").unwrap();
    assert_eq!(table.probe_order(&enabled), vec![2095, 80, 8443, 443]);
}
