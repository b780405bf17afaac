//! Integration tests for IPVS operations against a real kernel.
//!
//! These tests require:
//! - Root privileges (CAP_NET_ADMIN)
//! - IPVS kernel module loaded (modprobe ip_vs)
//! - Set IPVS_TEST_ENABLED=1 environment variable to run
//!
//! Run with: sudo -E cargo test --test integration_test -- --test-threads 1

use ipvs::{
    AddressFamily, Client, Destination, FwdMethod, Protocol, Scheduler, Service, ServiceFlags,
    ServiceId,
};

/// Helper to check if tests should run
fn should_run_tests() -> bool {
    std::env::var("IPVS_TEST_ENABLED").is_ok()
}

/// Helper to skip test if not enabled
macro_rules! skip_unless_enabled {
    () => {
        if !should_run_tests() {
            eprintln!("skipping test (set IPVS_TEST_ENABLED=1 to enable)");
            return;
        }
    };
}

fn tcp_service(addr: &str, port: u16, scheduler: Scheduler) -> Service {
    Service {
        id: ServiceId::Addr {
            af: AddressFamily::Inet,
            protocol: Protocol::Tcp,
            addr: addr.parse().unwrap(),
            port,
        },
        scheduler,
        flags: ServiceFlags::default(),
        timeout: 0,
        netmask: 0,
    }
}

#[test]
fn test_client_creation() {
    skip_unless_enabled!();

    let client = Client::new().expect("failed to create client");
    assert!(client.family_id() > 0);
}

#[test]
fn test_get_info() {
    skip_unless_enabled!();

    let mut client = Client::new().expect("failed to create client");
    let info = client.get_info().expect("failed to get info");
    assert!(info.version.major > 0, "version major should be > 0");
    assert!(info.conn_tab_size > 0, "conn table size should be > 0");
}

#[test]
fn test_service_lifecycle() {
    skip_unless_enabled!();

    let mut client = Client::new().expect("failed to create client");
    client.flush().expect("failed to flush");

    let service = tcp_service("10.0.0.1", 80, Scheduler::RoundRobin);
    client.new_service(&service).expect("failed to add service");

    // settings change on the same identity
    let mut updated = service.clone();
    updated.scheduler = Scheduler::WeightedRoundRobin;
    client
        .set_service(&updated)
        .expect("failed to update service");

    let services = client.list_services().expect("failed to list services");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, service.id);
    assert_eq!(services[0].scheduler, Scheduler::WeightedRoundRobin);

    let dest = Destination {
        addr: "192.168.1.10".parse().unwrap(),
        port: 8080,
        fwd_method: FwdMethod::DirectRoute,
        weight: 100,
        upper_threshold: 0,
        lower_threshold: 0,
    };
    client
        .new_dest(&updated, &dest)
        .expect("failed to add destination");

    let mut heavier = dest.clone();
    heavier.weight = 200;
    client
        .set_dest(&updated, &heavier)
        .expect("failed to update destination");

    let dests = client.list_dests(&updated).expect("failed to list dests");
    assert_eq!(dests.len(), 1);
    assert_eq!(dests[0].id(), dest.id());
    assert_eq!(dests[0].weight, 200);

    client
        .del_dest(&updated, &heavier)
        .expect("failed to delete destination");
    client
        .del_service(&updated)
        .expect("failed to delete service");

    assert!(client.list_services().unwrap().is_empty());
}

#[test]
fn test_firewall_mark_service() {
    skip_unless_enabled!();

    let mut client = Client::new().expect("failed to create client");
    client.flush().expect("failed to flush");

    let service = Service {
        id: ServiceId::Fwmark {
            af: AddressFamily::Inet,
            mark: 100,
        },
        scheduler: Scheduler::LeastConnection,
        flags: ServiceFlags::default(),
        timeout: 0,
        netmask: 0,
    };

    client
        .new_service(&service)
        .expect("failed to add fwmark service");

    let services = client.list_services().expect("failed to list services");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, service.id);

    client.del_service(&service).expect("failed to delete service");
}

#[test]
fn test_udp_service() {
    skip_unless_enabled!();

    let mut client = Client::new().expect("failed to create client");
    client.flush().expect("failed to flush");

    let service = Service {
        id: ServiceId::Addr {
            af: AddressFamily::Inet,
            protocol: Protocol::Udp,
            addr: "10.0.0.2".parse().unwrap(),
            port: 53,
        },
        scheduler: Scheduler::SourceHashing,
        flags: ServiceFlags::default(),
        timeout: 0,
        netmask: 0,
    };

    client.new_service(&service).expect("failed to add UDP service");
    client.del_service(&service).expect("failed to delete service");
}

#[test]
fn test_kernel_rejects_unknown_service() {
    skip_unless_enabled!();

    let mut client = Client::new().expect("failed to create client");
    client.flush().expect("failed to flush");

    let service = tcp_service("10.9.9.9", 9999, Scheduler::RoundRobin);
    let err = client.del_service(&service).unwrap_err();
    assert!(matches!(err, common::Error::KernelReject { .. }));
}

#[test]
fn test_multiple_destinations() {
    skip_unless_enabled!();

    let mut client = Client::new().expect("failed to create client");
    client.flush().expect("failed to flush");

    let service = tcp_service("10.0.0.3", 443, Scheduler::WeightedLeastConnection);
    client.new_service(&service).expect("failed to add service");

    for i in 1..=3u8 {
        let dest = Destination {
            addr: format!("192.168.1.{}", 10 + i).parse().unwrap(),
            port: 8443,
            fwd_method: FwdMethod::Masq,
            weight: 100 * u32::from(i),
            upper_threshold: 0,
            lower_threshold: 0,
        };
        client
            .new_dest(&service, &dest)
            .unwrap_or_else(|e| panic!("failed to add destination {i}: {e}"));
    }

    let dests = client.list_dests(&service).expect("failed to list dests");
    assert_eq!(dests.len(), 3);

    client.del_service(&service).expect("failed to delete service");
    assert!(client.list_services().unwrap().is_empty());
}
