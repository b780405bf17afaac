//! Tests for the frontend projector: diffing, ordering, and merging across
//! frontends.

mod support;

use std::collections::HashMap;

use director::{Frontend, IpvsDriver, Routes, ServerRecord, ServiceRecord};
use ipvs::{AddressFamily, DestId, FwdMethod, Protocol, Scheduler, ServiceFlags, ServiceId};
use support::{FakeTransport, Op};

fn driver() -> IpvsDriver<FakeTransport> {
    driver_with_routes(Routes::default())
}

fn driver_with_routes(routes: Routes) -> IpvsDriver<FakeTransport> {
    IpvsDriver::with_transport(
        FakeTransport::new(),
        routes,
        FwdMethod::Masq,
        Scheduler::WeightedLeastConnection,
    )
}

fn v4_record(addr: &str, port: u16) -> ServiceRecord {
    ServiceRecord {
        ipv4: Some(addr.parse().unwrap()),
        tcp: Some(port),
        ..ServiceRecord::default()
    }
}

fn v4_server(addr: &str, port: u16, weight: u32) -> ServerRecord {
    ServerRecord {
        ipv4: Some(addr.parse().unwrap()),
        tcp: Some(port),
        weight: Some(weight),
        ..ServerRecord::default()
    }
}

fn servers(entries: &[(&str, ServerRecord)]) -> HashMap<String, ServerRecord> {
    entries
        .iter()
        .map(|(name, record)| (name.to_string(), record.clone()))
        .collect()
}

fn tcp_id(addr: &str, port: u16) -> ServiceId {
    ServiceId::Addr {
        af: AddressFamily::Inet,
        protocol: Protocol::Tcp,
        addr: addr.parse().unwrap(),
        port,
    }
}

fn dest_id(addr: &str, port: u16) -> DestId {
    DestId {
        addr: addr.parse().unwrap(),
        port,
    }
}

#[test]
fn service_with_one_server_reaches_the_kernel() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    let mut record = v4_record("10.0.0.1", 80);
    record.sched = Some("wrr".to_string());

    frontend
        .apply(
            &mut driver,
            Some(&record),
            &servers(&[("a", v4_server("10.0.0.2", 80, 1))]),
        )
        .unwrap();

    let id = tcp_id("10.0.0.1", 80);
    let service = driver.transport().service(&id).expect("service missing");
    assert_eq!(service.scheduler, Scheduler::WeightedRoundRobin);
    assert_eq!(
        driver.transport().dest_weight(&id, &dest_id("10.0.0.2", 80)),
        Some(1)
    );
}

#[test]
fn two_frontends_merge_and_unmerge() {
    let mut driver = driver();
    let mut f1 = Frontend::new();
    let mut f2 = Frontend::new();

    let record = v4_record("10.0.0.1", 80);
    let id = tcp_id("10.0.0.1", 80);
    let did = dest_id("10.0.0.2", 80);

    f1.apply(
        &mut driver,
        Some(&record),
        &servers(&[("a", v4_server("10.0.0.2", 80, 1))]),
    )
    .unwrap();
    f2.apply(
        &mut driver,
        Some(&record),
        &servers(&[("b", v4_server("10.0.0.2", 80, 2))]),
    )
    .unwrap();

    assert_eq!(driver.transport().dest_weight(&id, &did), Some(3));

    f1.withdraw(&mut driver).unwrap();
    assert_eq!(driver.transport().dest_weight(&id, &did), Some(2));
    // f2 still references the service
    assert!(driver.transport().service(&id).is_some());

    f2.withdraw(&mut driver).unwrap();
    assert_eq!(driver.transport().dest_weight(&id, &did), None);
    assert!(driver.transport().service(&id).is_none());
}

#[test]
fn weight_change_adjusts_in_place() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    let record = v4_record("10.0.0.1", 80);
    frontend
        .apply(
            &mut driver,
            Some(&record),
            &servers(&[("a", v4_server("10.0.0.2", 80, 2))]),
        )
        .unwrap();

    let ops_before = driver.transport().ops.len();
    frontend
        .apply(
            &mut driver,
            Some(&record),
            &servers(&[("a", v4_server("10.0.0.2", 80, 5))]),
        )
        .unwrap();

    let id = tcp_id("10.0.0.1", 80);
    assert_eq!(
        driver.transport().dest_weight(&id, &dest_id("10.0.0.2", 80)),
        Some(5)
    );
    // a single set, no delete/create churn
    assert_eq!(
        &driver.transport().ops[ops_before..],
        &[Op::SetDest(id.to_string(), "10.0.0.2:80".to_string(), 5)]
    );
}

#[test]
fn teardown_orders_dest_deletes_before_service_delete() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    let record = v4_record("10.0.0.1", 80);
    frontend
        .apply(
            &mut driver,
            Some(&record),
            &servers(&[
                ("a", v4_server("10.0.0.2", 80, 1)),
                ("b", v4_server("10.0.0.3", 80, 1)),
            ]),
        )
        .unwrap();

    frontend.apply(&mut driver, None, &HashMap::new()).unwrap();

    let ops = &driver.transport().ops;
    let del_dests: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| matches!(op, Op::DelDest(..)))
        .map(|(i, _)| i)
        .collect();
    let del_service = ops
        .iter()
        .position(|op| matches!(op, Op::DelService(_)))
        .expect("service was not deleted");

    assert_eq!(del_dests.len(), 2);
    assert!(del_dests.iter().all(|i| *i < del_service));

    let id = tcp_id("10.0.0.1", 80);
    assert_eq!(driver.merged_weight(&id, &dest_id("10.0.0.2", 80)), None);
    assert_eq!(driver.merged_weight(&id, &dest_id("10.0.0.3", 80)), None);
}

#[test]
fn service_exists_before_its_destinations() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    frontend
        .apply(
            &mut driver,
            Some(&v4_record("10.0.0.1", 80)),
            &servers(&[("a", v4_server("10.0.0.2", 80, 1))]),
        )
        .unwrap();

    let ops = &driver.transport().ops;
    let new_service = ops
        .iter()
        .position(|op| matches!(op, Op::NewService(_)))
        .unwrap();
    let new_dest = ops
        .iter()
        .position(|op| matches!(op, Op::NewDest(..)))
        .unwrap();
    assert!(new_service < new_dest);
}

#[test]
fn record_expands_over_the_family_protocol_matrix() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    let record = ServiceRecord {
        ipv4: Some("10.0.0.1".parse().unwrap()),
        ipv6: Some("2001:db8::1".parse().unwrap()),
        tcp: Some(80),
        udp: Some(53),
        ..ServiceRecord::default()
    };
    let server = ServerRecord {
        ipv4: Some("10.0.0.2".parse().unwrap()),
        ipv6: Some("2001:db8::2".parse().unwrap()),
        tcp: Some(80),
        udp: Some(53),
        weight: Some(1),
        ..ServerRecord::default()
    };

    frontend
        .apply(&mut driver, Some(&record), &servers(&[("a", server)]))
        .unwrap();

    assert_eq!(driver.transport().services.len(), 4);
    for id in [
        tcp_id("10.0.0.1", 80),
        ServiceId::Addr {
            af: AddressFamily::Inet,
            protocol: Protocol::Udp,
            addr: "10.0.0.1".parse().unwrap(),
            port: 53,
        },
        ServiceId::Addr {
            af: AddressFamily::Inet6,
            protocol: Protocol::Tcp,
            addr: "2001:db8::1".parse().unwrap(),
            port: 80,
        },
        ServiceId::Addr {
            af: AddressFamily::Inet6,
            protocol: Protocol::Udp,
            addr: "2001:db8::1".parse().unwrap(),
            port: 53,
        },
    ] {
        assert_eq!(driver.transport().dest_count(&id), 1, "missing dests for {id}");
    }
}

#[test]
fn defaults_apply_when_records_are_sparse() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    let server = ServerRecord {
        ipv4: Some("10.0.0.2".parse().unwrap()),
        tcp: Some(80),
        ..ServerRecord::default()
    };
    frontend
        .apply(
            &mut driver,
            Some(&v4_record("10.0.0.1", 80)),
            &servers(&[("a", server)]),
        )
        .unwrap();

    let id = tcp_id("10.0.0.1", 80);
    let service = driver.transport().service(&id).unwrap();
    assert_eq!(service.scheduler, Scheduler::WeightedLeastConnection);

    let dest = driver
        .transport()
        .dest(&id, &dest_id("10.0.0.2", 80))
        .unwrap();
    assert_eq!(dest.weight, 1);
    assert_eq!(dest.fwd_method, FwdMethod::Masq);
}

#[test]
fn forwarding_method_resolution_order() {
    let routes = Routes::from_config(&[director::config::RouteConfig {
        prefix: "10.1.0.0/16".to_string(),
        fwd_method: Some("droute".to_string()),
    }])
    .unwrap();
    let mut driver = driver_with_routes(routes);
    let mut frontend = Frontend::new();

    let mut routed = v4_server("10.1.0.2", 80, 1);
    routed.fwd_method = None;
    let mut pinned = v4_server("10.1.0.3", 80, 1);
    pinned.fwd_method = Some("tunnel".to_string());
    let outside = v4_server("10.2.0.2", 80, 1);

    frontend
        .apply(
            &mut driver,
            Some(&v4_record("10.0.0.1", 80)),
            &servers(&[("a", routed), ("b", pinned), ("c", outside)]),
        )
        .unwrap();

    let id = tcp_id("10.0.0.1", 80);
    let dest = |addr: &str| driver.transport().dest(&id, &dest_id(addr, 80)).unwrap();
    assert_eq!(dest("10.1.0.2").fwd_method, FwdMethod::DirectRoute);
    assert_eq!(dest("10.1.0.3").fwd_method, FwdMethod::Tunnel);
    assert_eq!(dest("10.2.0.2").fwd_method, FwdMethod::Masq);
}

#[test]
fn settings_change_reconfigures_in_place() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    let mut record = v4_record("10.0.0.1", 80);
    let backing = servers(&[("a", v4_server("10.0.0.2", 80, 1))]);
    frontend.apply(&mut driver, Some(&record), &backing).unwrap();

    record.sched = Some("rr".to_string());
    let ops_before = driver.transport().ops.len();
    frontend.apply(&mut driver, Some(&record), &backing).unwrap();

    let id = tcp_id("10.0.0.1", 80);
    assert_eq!(
        &driver.transport().ops[ops_before..],
        &[Op::SetService(id.to_string())]
    );
    assert_eq!(
        driver.transport().service(&id).unwrap().scheduler,
        Scheduler::RoundRobin
    );
    // the destination is untouched
    assert_eq!(
        driver.transport().dest_weight(&id, &dest_id("10.0.0.2", 80)),
        Some(1)
    );
}

#[test]
fn identity_change_rebuilds_the_projection() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    let backing = servers(&[("a", v4_server("10.0.0.2", 80, 1))]);
    frontend
        .apply(&mut driver, Some(&v4_record("10.0.0.1", 80)), &backing)
        .unwrap();

    frontend
        .apply(&mut driver, Some(&v4_record("10.0.0.1", 81)), &backing)
        .unwrap();

    assert!(driver.transport().service(&tcp_id("10.0.0.1", 80)).is_none());
    let id = tcp_id("10.0.0.1", 81);
    assert_eq!(
        driver.transport().dest_weight(&id, &dest_id("10.0.0.2", 80)),
        Some(1)
    );
}

#[test]
fn persistence_sets_flags_and_timeout() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    let mut record = v4_record("10.0.0.1", 80);
    record.persistence = Some(300);
    frontend
        .apply(&mut driver, Some(&record), &HashMap::new())
        .unwrap();

    let service = driver
        .transport()
        .service(&tcp_id("10.0.0.1", 80))
        .unwrap();
    assert_eq!(service.flags.flags, ServiceFlags::PERSISTENT);
    assert_eq!(service.flags.mask, ServiceFlags::PERSISTENT);
    assert_eq!(service.timeout, 300);
}

#[test]
fn servers_on_the_same_endpoint_fold_their_weights() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    frontend
        .apply(
            &mut driver,
            Some(&v4_record("10.0.0.1", 80)),
            &servers(&[
                ("a", v4_server("10.0.0.2", 80, 2)),
                ("b", v4_server("10.0.0.2", 80, 3)),
            ]),
        )
        .unwrap();

    let id = tcp_id("10.0.0.1", 80);
    assert_eq!(
        driver.transport().dest_weight(&id, &dest_id("10.0.0.2", 80)),
        Some(5)
    );
    assert_eq!(driver.transport().dest_count(&id), 1);
}

#[test]
fn zero_weight_servers_are_not_projected() {
    let mut driver = driver();
    let mut frontend = Frontend::new();

    frontend
        .apply(
            &mut driver,
            Some(&v4_record("10.0.0.1", 80)),
            &servers(&[("a", v4_server("10.0.0.2", 80, 0))]),
        )
        .unwrap();

    let id = tcp_id("10.0.0.1", 80);
    assert!(driver.transport().service(&id).is_some());
    assert_eq!(driver.transport().dest_count(&id), 0);
}
