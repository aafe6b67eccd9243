mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ::common::{DnsDomain, FloatingIp, Network, RequestedNetwork};
use rknet::NetworkError;
use rknet::config::NetworkConfig;
use rknet::create::CreateNetworkRequest;
use rknet::driver::DnsManager;
use rknet::manager::{InstanceIp, IpFilter};
use rknet::rpc::{NetworkRequest, NetworkResponse, RpcHandler};
use rknet::store::{MemoryStore, Store, StoreError};
use rknet::topology::TopologyKind;

use crate::common::{CollidingMacStore, Host, LoopbackRpc, flat_config, host, instance};

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

async fn with_network(kind: TopologyKind, config: NetworkConfig, cidr: &str) -> (Host, Arc<MemoryStore>, Network) {
    let store = Arc::new(MemoryStore::new());
    let rpc = Arc::new(LoopbackRpc::default());
    let net1 = host("net-1", kind, config, store.clone(), &rpc);
    let network = net1
        .manager
        .create_networks(CreateNetworkRequest {
            label: "private".to_string(),
            cidr: Some(cidr.parse().unwrap()),
            num_networks: Some(1),
            dns2: Some("1.1.1.1".parse().unwrap()),
            rxtx_base: Some(10),
            ..Default::default()
        })
        .await
        .unwrap()
        .remove(0);
    (net1, store, network)
}

fn requested(network: &Network, address: &str) -> Vec<RequestedNetwork> {
    vec![RequestedNetwork {
        network_uuid: network.uuid.clone(),
        address: Some(ip(address)),
    }]
}

#[tokio::test]
async fn test_first_flat_allocation_skips_reserved_addresses() {
    let (net1, store, network) = with_network(TopologyKind::Flat, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;

    let info = net1
        .manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    assert_eq!(info.0.len(), 1);
    let addresses: Vec<IpAddr> = info.0[0].fixed_ips().map(|f| f.address).collect();
    assert_eq!(addresses, [IpAddr::V4(ip("10.0.0.2"))]);

    let row = store.fixed_ip_get_by_address(ip("10.0.0.2")).await.unwrap();
    assert!(row.allocated);
    assert_eq!(row.instance_uuid.as_deref(), Some("i-1"));
    let vifs = store.virtual_interface_get_by_instance("i-1").await.unwrap();
    assert_eq!(vifs.len(), 1);
    assert_eq!(vifs[0].network_id, network.id);
    assert_eq!(row.virtual_interface_id, Some(vifs[0].id));
    assert!(vifs[0].address.starts_with("fa:16:3e:"));
}

#[tokio::test]
async fn test_flat_allocate_then_deallocate_frees_the_row() {
    let (net1, store, _) = with_network(TopologyKind::Flat, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;

    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();

    let row = store.fixed_ip_get_by_address(ip("10.0.0.2")).await.unwrap();
    assert!(!row.allocated);
    assert!(!row.leased);
    assert_eq!(row.virtual_interface_id, None);
    assert_eq!(row.instance_uuid, None);
    assert!(store.virtual_interface_get_by_instance("i-1").await.unwrap().is_empty());

    // The same address is handed out again.
    store.insert_instance(instance("i-2", "p1", Some("net-1"))).await;
    net1.manager
        .allocate_for_instance("i-2", None, &[], false)
        .await
        .unwrap();
    let row = store.fixed_ip_get_by_address(ip("10.0.0.2")).await.unwrap();
    assert_eq!(row.instance_uuid.as_deref(), Some("i-2"));
}

#[tokio::test]
async fn test_dhcp_lease_cycle_returns_address_to_pool() {
    let (net1, store, network) = with_network(TopologyKind::FlatDhcp, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;

    net1.manager
        .allocate_for_instance("i-1", Some("net-1"), &[], false)
        .await
        .unwrap();
    let address = ip("10.0.0.2");
    assert_eq!(
        store.network_get(network.id).await.unwrap().host.as_deref(),
        Some("net-1")
    );
    assert!(net1.recorder.count("initialize_gateway") >= 1);
    assert!(net1.recorder.count("update_dhcp") >= 1);

    net1.manager.lease_fixed_ip(address).await.unwrap();
    assert!(store.fixed_ip_get_by_address(address).await.unwrap().leased);

    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();
    let row = store.fixed_ip_get_by_address(address).await.unwrap();
    assert!(!row.allocated);
    assert_eq!(row.virtual_interface_id, None);
    // Still bound until the DHCP server reports the release.
    assert_eq!(row.instance_uuid.as_deref(), Some("i-1"));

    net1.manager.release_fixed_ip(address).await.unwrap();
    let row = store.fixed_ip_get_by_address(address).await.unwrap();
    assert!(!row.leased);
    assert_eq!(row.instance_uuid, None);
}

#[tokio::test]
async fn test_deallocate_succeeds_for_deleted_instance() {
    let (net1, store, _) = with_network(TopologyKind::Flat, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();

    store.delete_instance("i-1").await;
    assert!(matches!(
        store.instance_get_by_uuid("i-1", false).await,
        Err(StoreError::InstanceNotFound(_))
    ));

    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();
    let row = store.fixed_ip_get_by_address(ip("10.0.0.2")).await.unwrap();
    assert!(!row.allocated);
    assert_eq!(row.instance_uuid, None);
}

#[tokio::test]
async fn test_requested_address_in_use_is_rejected_without_mutation() {
    let (net1, store, network) = with_network(TopologyKind::Flat, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    store.insert_instance(instance("i-2", "p1", Some("net-1"))).await;

    net1.manager
        .allocate_for_instance("i-1", None, &requested(&network, "10.0.0.5"), false)
        .await
        .unwrap();
    let before = store.fixed_ip_get_by_address(ip("10.0.0.5")).await.unwrap();

    let err = net1
        .manager
        .validate_networks(&requested(&network, "10.0.0.5"))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Store(StoreError::FixedIpAlreadyInUse { .. })));

    let err = net1
        .manager
        .allocate_for_instance("i-2", None, &requested(&network, "10.0.0.5"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Store(StoreError::FixedIpAlreadyInUse { .. })));

    let after = store.fixed_ip_get_by_address(ip("10.0.0.5")).await.unwrap();
    assert_eq!(after.instance_uuid.as_deref(), Some("i-1"));
    assert_eq!(after.virtual_interface_id, before.virtual_interface_id);
    assert!(after.allocated);
    assert!(store.fixed_ip_get_by_instance("i-2").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_validate_networks() {
    let (net1, _, network) = with_network(TopologyKind::Flat, flat_config(), "10.0.0.0/24").await;

    net1.manager.validate_networks(&[]).await.unwrap();
    net1.manager
        .validate_networks(&requested(&network, "10.0.0.9"))
        .await
        .unwrap();

    let unknown = RequestedNetwork {
        network_uuid: "missing".to_string(),
        address: None,
    };
    let err = net1.manager.validate_networks(&[unknown]).await.unwrap_err();
    assert!(matches!(err, NetworkError::Store(StoreError::NetworkNotFound(_))));

    let err = net1
        .manager
        .validate_networks(&requested(&network, "10.1.0.9"))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Store(StoreError::FixedIpNotFound(_))));
}

#[tokio::test]
async fn test_mac_exhaustion_removes_every_vif_of_the_instance() {
    let store = Arc::new(CollidingMacStore::new(1));
    let rpc = Arc::new(LoopbackRpc::default());
    let net1 = host("net-1", TopologyKind::Flat, flat_config(), store.clone(), &rpc);
    net1.manager
        .create_networks(CreateNetworkRequest {
            label: "pair".to_string(),
            cidr: Some("10.0.0.0/24".parse().unwrap()),
            num_networks: Some(2),
            network_size: Some(128),
            ..Default::default()
        })
        .await
        .unwrap();
    store.inner.insert_instance(instance("i-1", "p1", Some("net-1"))).await;

    let err = net1
        .manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::VirtualInterfaceMacAddressExhausted(5)));
    assert_eq!(store.attempts.load(Ordering::SeqCst), 6);
    assert!(store.virtual_interface_get_by_instance("i-1").await.unwrap().is_empty());
    assert!(store.fixed_ip_get_by_instance("i-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dns_entries_follow_the_address() {
    let config = NetworkConfig {
        instance_dns_domain: Some("example.org".to_string()),
        ..flat_config()
    };
    let (net1, store, _) = with_network(TopologyKind::Flat, config, "10.0.0.0/24").await;
    store
        .insert_dns_domain(DnsDomain {
            domain: "example.org".to_string(),
            availability_zone: Some("az1".to_string()),
            project_id: None,
        })
        .await;
    let mut web = instance("i-1", "p1", Some("net-1"));
    web.display_name = "Web Server_1".to_string();
    web.availability_zone = Some("az1".to_string());
    store.insert_instance(web).await;
    let mut elsewhere = instance("i-2", "p1", Some("net-1"));
    elsewhere.availability_zone = Some("az2".to_string());
    store.insert_instance(elsewhere).await;

    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    net1.manager
        .allocate_for_instance("i-2", None, &[], false)
        .await
        .unwrap();

    let names = net1
        .dns
        .get_entries_by_address(ip("10.0.0.2"), "example.org")
        .await
        .unwrap();
    assert_eq!(names, ["i-1", "web-server-1"]);
    let names = net1
        .dns
        .get_entries_by_address(ip("10.0.0.3"), "example.org")
        .await
        .unwrap();
    assert!(names.is_empty());

    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();
    let names = net1
        .dns
        .get_entries_by_address(ip("10.0.0.2"), "example.org")
        .await
        .unwrap();
    assert!(names.is_empty());
}

#[tokio::test]
async fn test_security_groups_are_refreshed() {
    let (net1, store, _) = with_network(TopologyKind::Flat, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;

    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();

    let events = net1.recorder.events();
    assert!(events.contains(&"instance_add_security_group i-1 default".to_string()));
    assert!(events.contains(&"instance_remove_security_group i-1 default".to_string()));
    assert_eq!(net1.recorder.count("members_refresh default"), 2);
}

#[tokio::test]
async fn test_forced_dhcp_release_uses_the_vif_mac() {
    let config = NetworkConfig {
        force_dhcp_release: true,
        ..flat_config()
    };
    let (net1, store, _) = with_network(TopologyKind::FlatDhcp, config, "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;

    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    let mac = store.virtual_interface_get_by_instance("i-1").await.unwrap()[0]
        .address
        .clone();
    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();

    let releases: Vec<String> = net1
        .recorder
        .events()
        .into_iter()
        .filter(|e| e.starts_with("release_dhcp"))
        .collect();
    assert_eq!(releases.len(), 1);
    assert!(releases[0].ends_with(&format!("10.0.0.2 {mac}")));
}

#[tokio::test]
async fn test_network_info_for_dhcp_topology() {
    let (net1, store, network) = with_network(TopologyKind::FlatDhcp, flat_config(), "10.0.0.0/24").await;
    let mut vm = instance("i-1", "p1", Some("net-1"));
    vm.rxtx_factor = Some(2.0);
    store.insert_instance(vm).await;

    let info = net1
        .manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    let vif = &info.0[0];
    assert_eq!(vif.rxtx_cap, Some(20.0));
    let model = vif.network.as_ref().unwrap();
    assert_eq!(model.id, network.uuid);
    assert_eq!(model.should_create_bridge, Some(true));
    assert_eq!(model.multi_host, Some(false));

    let subnet = &model.subnets[0];
    assert_eq!(subnet.version(), 4);
    assert_eq!(subnet.gateway, Some(IpAddr::V4(ip("10.0.0.1"))));
    assert_eq!(subnet.dhcp_server, Some(ip("10.0.0.1")));
    assert_eq!(
        subnet.dns,
        [IpAddr::V4(ip("8.8.4.4")), IpAddr::V4(ip("1.1.1.1"))]
    );
    assert_eq!(subnet.routes.len(), 1);
    assert_eq!(subnet.routes[0].cidr.to_string(), "0.0.0.0/0");
}

#[tokio::test]
async fn test_network_info_keeps_vifs_of_missing_networks() {
    let (net1, store, network) = with_network(TopologyKind::Flat, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();
    net1.manager
        .add_fixed_ip_to_instance("i-1", None, &network.uuid)
        .await
        .unwrap();

    net1.manager
        .remove_fixed_ip_from_instance("i-1", None, ip("10.0.0.2"))
        .await
        .unwrap();
    net1.manager
        .delete_network(Some(&network.uuid), None, false)
        .await
        .unwrap();

    let info = net1.manager.get_instance_nw_info("i-1", None).await.unwrap();
    assert_eq!(info.0.len(), 1);
    assert!(info.0[0].network.is_none());
    assert!(!info.0[0].address.is_empty());
}

#[tokio::test]
async fn test_add_and_remove_fixed_ip() {
    let (net1, store, _) = with_network(TopologyKind::Flat, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();

    let second = net1
        .manager
        .create_networks(CreateNetworkRequest {
            label: "second".to_string(),
            cidr: Some("10.1.0.0/24".parse().unwrap()),
            ..Default::default()
        })
        .await
        .unwrap()
        .remove(0);
    let info = net1
        .manager
        .add_fixed_ip_to_instance("i-1", None, &second.uuid)
        .await
        .unwrap();
    assert_eq!(info.0.len(), 2);
    assert_eq!(store.fixed_ip_get_by_instance("i-1").await.unwrap().len(), 2);

    let info = net1
        .manager
        .remove_fixed_ip_from_instance("i-1", None, ip("10.1.0.2"))
        .await
        .unwrap();
    assert_eq!(info.0.iter().flat_map(|v| v.fixed_ips()).count(), 1);
    let row = store.fixed_ip_get_by_address(ip("10.1.0.2")).await.unwrap();
    assert_eq!(row.instance_uuid, None);

    let err = net1
        .manager
        .remove_fixed_ip_from_instance("i-1", None, ip("10.1.0.3"))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::FixedIpNotFoundForInstance { .. }));
}

#[tokio::test]
async fn test_instances_by_ip_filter() {
    let (net1, store, _) = with_network(TopologyKind::FlatDhcp, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    store.insert_instance(instance("i-2", "p1", Some("net-1"))).await;
    for uuid in ["i-1", "i-2"] {
        net1.manager
            .allocate_for_instance(uuid, None, &[], false)
            .await
            .unwrap();
    }
    store
        .insert_floating_ip(FloatingIp {
            address: ip("192.0.2.5"),
            fixed_address: Some(ip("10.0.0.2")),
            project_id: Some("p1".to_string()),
            host: Some("net-1".to_string()),
        })
        .await;

    let by_fixed = net1
        .manager
        .get_instance_uuids_by_ip_filter(&IpFilter {
            fixed_ip: Some(ip("10.0.0.3")),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        by_fixed,
        [InstanceIp {
            instance_uuid: "i-2".to_string(),
            ip: IpAddr::V4(ip("10.0.0.3")),
        }]
    );

    let by_prefix = net1
        .manager
        .get_instance_uuids_by_ip_filter(&IpFilter {
            ip: Some(r"10\.0\.0\.".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_prefix.len(), 2);

    let by_floating = net1
        .manager
        .get_instance_uuids_by_ip_filter(&IpFilter {
            ip: Some(r"192\.0\.2\.5".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        by_floating,
        [InstanceIp {
            instance_uuid: "i-1".to_string(),
            ip: IpAddr::V4(ip("192.0.2.5")),
        }]
    );

    let err = net1
        .manager
        .get_instance_uuids_by_ip_filter(&IpFilter {
            ip: Some("(".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::InvalidInput(_)));
}

#[tokio::test]
async fn test_stale_addresses_are_reclaimed() {
    let config = NetworkConfig {
        fixed_ip_disassociate_timeout: 0,
        ..flat_config()
    };
    let (net1, store, _) = with_network(TopologyKind::FlatDhcp, config, "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();

    // Allocated addresses are never reclaimed.
    assert_eq!(net1.manager.disassociate_stale_fixed_ips().await.unwrap(), 0);

    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(net1.manager.disassociate_stale_fixed_ips().await.unwrap(), 1);
    let row = store.fixed_ip_get_by_address(ip("10.0.0.2")).await.unwrap();
    assert_eq!(row.instance_uuid, None);
}

#[tokio::test]
async fn test_dhcp_callbacks_over_rpc_handler() {
    let (net1, store, _) = with_network(TopologyKind::FlatDhcp, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();

    let response = net1
        .manager
        .handle(NetworkRequest::LeaseFixedIp {
            address: ip("10.0.0.2"),
        })
        .await;
    assert_eq!(response, NetworkResponse::Ack);
    assert!(store.fixed_ip_get_by_address(ip("10.0.0.2")).await.unwrap().leased);

    let response = net1
        .manager
        .handle(NetworkRequest::LeaseFixedIp {
            address: ip("10.0.0.9"),
        })
        .await;
    assert!(matches!(response, NetworkResponse::Error(_)));
    assert_eq!(net1.manager.handle(NetworkRequest::Ping).await, NetworkResponse::Pong);
}

#[tokio::test]
async fn test_dhcp_leases_list_leased_addresses() {
    let (net1, store, network) = with_network(TopologyKind::FlatDhcp, flat_config(), "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    store.insert_instance(instance("i-2", "p1", Some("net-1"))).await;
    for uuid in ["i-1", "i-2"] {
        net1.manager
            .allocate_for_instance(uuid, None, &[], false)
            .await
            .unwrap();
    }
    net1.manager.lease_fixed_ip(ip("10.0.0.2")).await.unwrap();

    let leases = net1.manager.get_dhcp_leases(&network.uuid).await.unwrap();
    let lines: Vec<&str> = leases.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(" 10.0.0.2 vm-i-1.novalocal "));
}

#[tokio::test]
async fn test_dhcp_lease_hostnames_use_configured_domain() {
    let config = NetworkConfig {
        dhcp_domain: "cloud.example".to_string(),
        ..flat_config()
    };
    let (net1, store, network) = with_network(TopologyKind::FlatDhcp, config, "10.0.0.0/24").await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    net1.manager.lease_fixed_ip(ip("10.0.0.2")).await.unwrap();

    let leases = net1.manager.get_dhcp_leases(&network.uuid).await.unwrap();
    assert!(leases.contains(" 10.0.0.2 vm-i-1.cloud.example "));
}
