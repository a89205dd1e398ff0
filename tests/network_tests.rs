#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::process::Command;
    use std::time::{Duration, Instant};

    use gw_failover::network::{
        parse_default_routes, parse_interface_addresses, run_with_timeout,
    };
    use gw_failover::{select_source, AddressFamily, FailoverError, InterfaceAddress};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn addr(address: &str, prefix_len: u8, scope: &str) -> InterfaceAddress {
        InterfaceAddress {
            address: ip(address),
            prefix_len,
            scope: scope.to_string(),
        }
    }

    #[test]
    fn test_parse_default_routes() {
        let json = r#"[
            {"dst":"default","gateway":"10.0.0.1","dev":"eth0","protocol":"static","metric":100,"flags":[]},
            {"dst":"default","gateway":"10.0.1.1","dev":"eth1","protocol":"static","prefsrc":"10.0.1.7","metric":10100,"flags":[]},
            {"dst":"10.0.0.0/24","dev":"eth0","protocol":"kernel","scope":"link","prefsrc":"10.0.0.2","flags":[]}
        ]"#;

        let routes = parse_default_routes(AddressFamily::V4, json).unwrap();
        assert_eq!(routes.len(), 2);

        assert_eq!(routes[0].interface.as_deref(), Some("eth0"));
        assert_eq!(routes[0].gateway, Some(ip("10.0.0.1")));
        assert_eq!(routes[0].source, None);
        assert_eq!(routes[0].metric, 100);
        assert!(!routes[0].multipath);

        assert_eq!(routes[1].source, Some(ip("10.0.1.7")));
        assert_eq!(routes[1].metric, 10100);
    }

    #[test]
    fn test_parse_multipath_and_defaults() {
        let json = r#"[
            {"dst":"default","protocol":"static","metric":10,"flags":[],
             "nexthops":[{"gateway":"10.0.0.1","dev":"eth0","weight":1,"flags":[]},
                         {"gateway":"10.0.1.1","dev":"eth1","weight":1,"flags":[]}]},
            {"dst":"default","gateway":"10.0.2.1","dev":"eth2","flags":[]}
        ]"#;

        let routes = parse_default_routes(AddressFamily::V4, json).unwrap();
        assert!(routes[0].multipath);
        assert_eq!(routes[0].interface, None);

        // Metric 0 and the boot protocol are omitted by iproute2
        assert_eq!(routes[1].metric, 0);
        assert_eq!(routes[1].protocol, "boot");
    }

    #[test]
    fn test_parse_skips_unreachable_defaults() {
        let json = r#"[{"type":"unreachable","dst":"default","dev":"lo","metric":4278198272,"flags":[]}]"#;
        let routes = parse_default_routes(AddressFamily::V6, json).unwrap();
        assert!(routes.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_default_routes(AddressFamily::V4, "not json"),
            Err(FailoverError::Parse(_))
        ));
        assert!(matches!(
            parse_default_routes(
                AddressFamily::V4,
                r#"[{"dst":"default","gateway":"nonsense","dev":"eth0"}]"#
            ),
            Err(FailoverError::UnsupportedRoute(_))
        ));
        assert!(parse_default_routes(AddressFamily::V4, "").unwrap().is_empty());
    }

    #[test]
    fn test_parse_interface_addresses() {
        let json = r#"[{"ifindex":2,"ifname":"eth0","flags":["UP"],"mtu":1500,
            "addr_info":[
                {"family":"inet","local":"10.0.0.2","prefixlen":24,"scope":"global","label":"eth0"},
                {"family":"inet6","local":"fe80::2","prefixlen":64,"scope":"link"},
                {"family":"inet6","local":"2001:db8::2","prefixlen":64,"scope":"global"}
            ]}]"#;

        let addresses = parse_interface_addresses(json).unwrap();
        assert_eq!(
            addresses,
            vec![
                addr("10.0.0.2", 24, "global"),
                addr("fe80::2", 64, "link"),
                addr("2001:db8::2", 64, "global"),
            ]
        );
    }

    #[test]
    fn test_subnet_contains() {
        assert!(addr("10.0.0.2", 24, "global").contains(&ip("10.0.0.1")));
        assert!(!addr("10.0.0.2", 24, "global").contains(&ip("10.0.1.1")));
        assert!(addr("10.0.0.2", 0, "global").contains(&ip("192.0.2.1")));
        assert!(addr("10.0.0.2", 32, "global").contains(&ip("10.0.0.2")));
        assert!(addr("2001:db8::2", 64, "global").contains(&ip("2001:db8::1")));
        assert!(!addr("2001:db8::2", 64, "global").contains(&ip("2001:db9::1")));
        assert!(!addr("10.0.0.2", 24, "global").contains(&ip("::1")));
    }

    #[test]
    fn test_select_source() {
        let addresses = vec![
            addr("10.0.0.2", 24, "global"),
            addr("192.168.5.2", 24, "global"),
            addr("fe80::2", 64, "link"),
            addr("2001:db8::2", 64, "global"),
        ];

        assert_eq!(select_source(&addresses, &ip("192.168.5.1")), Some(ip("192.168.5.2")));
        assert_eq!(select_source(&addresses, &ip("fe80::1")), Some(ip("fe80::2")));
        assert_eq!(select_source(&addresses, &ip("2001:db8::1")), Some(ip("2001:db8::2")));
        assert_eq!(select_source(&addresses, &ip("172.16.0.1")), None);
    }

    #[test]
    fn test_run_with_timeout_captures_output() {
        let output = run_with_timeout(
            Command::new("sh").args(["-c", "echo routed"]),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "routed");
    }

    #[test]
    fn test_run_with_timeout_kills_hung_command() {
        let started = Instant::now();
        let result = run_with_timeout(
            Command::new("sleep").arg("30"),
            Duration::from_millis(200),
        );
        assert!(matches!(result, Err(FailoverError::CommandExecution(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_run_with_timeout_drains_large_output() {
        let output = run_with_timeout(
            Command::new("sh").args(["-c", "head -c 300000 /dev/zero; echo oops >&2; exit 3"]),
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout.len(), 300000);
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "oops");
    }

    #[test]
    #[ignore = "Requires iproute2 and a configured default route"]
    fn test_list_real_default_routes() {
        use gw_failover::{IpRouteTable, RouteTable};

        let table = IpRouteTable::new("static", Duration::from_secs(5));
        let routes = table.list_default_routes(AddressFamily::V4).unwrap();
        println!("Default routes: {:?}", routes);
    }
}
