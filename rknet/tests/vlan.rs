mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;

use ::common::{Network, RequestedNetwork};
use rknet::NetworkError;
use rknet::config::NetworkConfig;
use rknet::create::CreateNetworkRequest;
use rknet::store::{MemoryStore, Store, StoreError};
use rknet::topology::{Association, TopologyKind};

use crate::common::{Host, LoopbackRpc, flat_config, host, instance};

const VPN_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);

fn vlan_config() -> NetworkConfig {
    NetworkConfig {
        vlan_interface: Some("eth1".to_string()),
        vpn_ip: Some(VPN_IP),
        ..Default::default()
    }
}

async fn vlan_host(config: NetworkConfig, multi_host: bool) -> (Host, Arc<MemoryStore>, Vec<Network>) {
    let store = Arc::new(MemoryStore::new());
    let rpc = Arc::new(LoopbackRpc::default());
    let net1 = host("net-1", TopologyKind::Vlan, config, store.clone(), &rpc);
    let networks = net1
        .manager
        .create_networks(CreateNetworkRequest {
            label: "tenant".to_string(),
            cidr: Some("10.0.0.0/24".parse().unwrap()),
            num_networks: Some(2),
            network_size: Some(128),
            multi_host: Some(multi_host),
            ..Default::default()
        })
        .await
        .unwrap();
    (net1, store, networks)
}

fn address_of(info: &::common::NetworkInfo) -> String {
    info.0[0].fixed_ips().next().unwrap().address.to_string()
}

#[tokio::test]
async fn test_project_is_given_a_network_with_vpn_forward() {
    let (net1, store, networks) = vlan_host(vlan_config(), false).await;
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    store.insert_instance(instance("i-2", "p1", Some("net-1"))).await;
    store.insert_instance(instance("i-3", "p2", Some("net-1"))).await;

    let info = net1
        .manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    // .0 to .2 are held back for the network, gateway and VPN endpoint.
    assert_eq!(address_of(&info), "10.0.0.3");
    let model = info.0[0].network.as_ref().unwrap();
    assert_eq!(model.vlan, Some(100));
    assert_eq!(model.should_create_vlan, Some(true));
    assert_eq!(model.tenant_id.as_deref(), Some("p1"));

    let first = store.network_get(networks[0].id).await.unwrap();
    assert_eq!(first.project_id.as_deref(), Some("p1"));
    assert_eq!(first.vpn_public_address, Some(VPN_IP));
    assert!(
        net1.recorder
            .events()
            .contains(&"add_vpn 192.0.2.10:1000 10.0.0.2".to_string())
    );

    let info = net1
        .manager
        .allocate_for_instance("i-2", None, &[], false)
        .await
        .unwrap();
    assert_eq!(address_of(&info), "10.0.0.4");

    let info = net1
        .manager
        .allocate_for_instance("i-3", None, &[], false)
        .await
        .unwrap();
    assert_eq!(address_of(&info), "10.0.0.131");
    let second = store.network_get(networks[1].id).await.unwrap();
    assert_eq!(second.project_id.as_deref(), Some("p2"));
}

#[tokio::test]
async fn test_vpn_instance_gets_the_reserved_vpn_address() {
    let (net1, store, networks) = vlan_host(vlan_config(), false).await;
    net1.manager
        .add_network_to_project("p1", Some(&networks[0].uuid))
        .await
        .unwrap();
    store.insert_instance(instance("vpn-1", "p1", Some("net-1"))).await;

    let info = net1
        .manager
        .allocate_for_instance("vpn-1", None, &[], true)
        .await
        .unwrap();
    assert_eq!(address_of(&info), "10.0.0.2");
    let row = store.fixed_ip_get_by_address(Ipv4Addr::new(10, 0, 0, 2)).await.unwrap();
    assert!(row.reserved);
    assert!(row.allocated);
    assert_eq!(row.instance_uuid.as_deref(), Some("vpn-1"));
    // VPN instances are not security group members.
    assert_eq!(net1.recorder.count("instance_add_security_group"), 0);
}

#[tokio::test]
async fn test_requested_network_of_another_project_is_not_found() {
    let (net1, store, networks) = vlan_host(vlan_config(), false).await;
    net1.manager
        .add_network_to_project("p1", Some(&networks[0].uuid))
        .await
        .unwrap();
    store.insert_instance(instance("i-1", "p2", Some("net-1"))).await;

    let requested = [RequestedNetwork {
        network_uuid: networks[0].uuid.clone(),
        address: None,
    }];
    let err = net1
        .manager
        .allocate_for_instance("i-1", None, &requested, false)
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Store(StoreError::NetworkNotFound(_))));
    assert!(store.fixed_ip_get_by_instance("i-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_associate_and_disassociate() {
    let (net1, store, networks) = vlan_host(vlan_config(), false).await;
    let uuid = &networks[0].uuid;

    net1.manager
        .associate(
            uuid,
            &Association {
                host: Some(Some("net-2".to_string())),
                project: Some(Some("p3".to_string())),
            },
        )
        .await
        .unwrap();
    let network = store.network_get_by_uuid(uuid).await.unwrap();
    assert_eq!(network.host.as_deref(), Some("net-2"));
    assert_eq!(network.project_id.as_deref(), Some("p3"));

    net1.manager
        .associate(
            uuid,
            &Association {
                host: Some(None),
                project: None,
            },
        )
        .await
        .unwrap();
    let network = store.network_get_by_uuid(uuid).await.unwrap();
    assert_eq!(network.host, None);
    assert_eq!(network.project_id.as_deref(), Some("p3"));

    let err = net1
        .manager
        .associate(uuid, &Association::default())
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::InvalidInput(_)));

    net1.manager.disassociate_network(uuid).await.unwrap();
    let network = store.network_get_by_uuid(uuid).await.unwrap();
    assert_eq!(network.project_id, None);

    // add_network_to_project takes any free network.
    let added = net1.manager.add_network_to_project("p4", None).await.unwrap();
    assert_eq!(added.project_id.as_deref(), Some("p4"));
}

#[tokio::test]
async fn test_flat_topology_has_no_project_association() {
    let store = Arc::new(MemoryStore::new());
    let rpc = Arc::new(LoopbackRpc::default());
    let flat = host("net-1", TopologyKind::Flat, flat_config(), store, &rpc);

    let err = flat
        .manager
        .associate(
            "any",
            &Association {
                host: Some(None),
                project: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::NotSupported("associate", "flat")));
    let err = flat.manager.add_network_to_project("p1", None).await.unwrap_err();
    assert!(matches!(err, NetworkError::NotSupported(..)));
}

#[tokio::test]
async fn test_unused_gateway_is_removed_on_teardown() {
    let config = NetworkConfig {
        teardown_unused_network_gateway: true,
        ..vlan_config()
    };
    let (net1, store, networks) = vlan_host(config, true).await;
    // Forwarding handled elsewhere.
    let mut network = networks[0].clone();
    network.vpn_public_address = Some(Ipv4Addr::new(203, 0, 113, 1));
    network.project_id = Some("p1".to_string());
    store.network_update(&network).await.unwrap();
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;

    net1.manager
        .allocate_for_instance("i-1", None, &[], false)
        .await
        .unwrap();
    assert_eq!(net1.recorder.count("add_vpn"), 0);
    let dhcp = store
        .fixed_ip_get_by_network_host(network.id, "net-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dhcp.address, Ipv4Addr::new(10, 0, 0, 4));

    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();
    assert_eq!(net1.recorder.count("kill_dhcp"), 1);
    assert_eq!(net1.recorder.count("remove_gateway"), 1);
    assert!(
        store
            .fixed_ip_get_by_network_host(network.id, "net-1")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_gateway_stays_while_network_is_in_use() {
    let config = NetworkConfig {
        teardown_unused_network_gateway: true,
        ..vlan_config()
    };
    let (net1, store, networks) = vlan_host(config, true).await;
    let mut network = networks[0].clone();
    network.vpn_public_address = Some(Ipv4Addr::new(203, 0, 113, 1));
    network.project_id = Some("p1".to_string());
    store.network_update(&network).await.unwrap();
    store.insert_instance(instance("i-1", "p1", Some("net-1"))).await;
    store.insert_instance(instance("i-2", "p1", Some("net-1"))).await;

    for uuid in ["i-1", "i-2"] {
        net1.manager
            .allocate_for_instance(uuid, None, &[], false)
            .await
            .unwrap();
    }
    net1.manager.deallocate_for_instance("i-1", None).await.unwrap();
    assert_eq!(net1.recorder.count("kill_dhcp"), 0);
    assert_eq!(net1.recorder.count("remove_gateway"), 0);
}
