mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::time::Duration;
use ubr_bridge::{BridgeConfig, FdbKey, FdbOrigin, MacAddress, PortVector, VlanId};

fn short_ageing() -> BridgeConfig {
    BridgeConfig {
        ageing_time_secs: 10,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_stations_age_out() {
    let lab = Lab::with_config(short_ageing(), 2);
    lab.bridge.start_ageing().unwrap();

    lab.bridge
        .receive(lab.port(1), frame(MacAddress::BROADCAST, station(1)));
    lab.bridge
        .receive(lab.port(2), frame(MacAddress::BROADCAST, station(2)));
    assert_eq!(lab.bridge.fdb().len(), 2);

    // Station 2 keeps talking; station 1 goes quiet.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(4)).await;
        lab.bridge
            .receive(lab.port(2), frame(MacAddress::BROADCAST, station(2)));
    }

    let entries = lab.bridge.fdb_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, FdbKey::mac(VlanId::NONE, station(2)));
    assert_eq!(lab.bridge.counters().aged, 1);

    // Unknown again: the next frame to station 1 floods.
    lab.drain();
    lab.bridge
        .receive(lab.port(2), frame(station(1), station(2)));
    assert_eq!(lab.receivers(), vec![1]);
    assert_eq!(lab.stack.take_received().len(), 1);

    lab.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_static_entries_never_age() {
    let lab = Lab::with_config(short_ageing(), 1);
    lab.bridge.start_ageing().unwrap();
    let key = FdbKey::mac(VlanId::NONE, station(9));
    lab.bridge
        .fdb_add(key, PortVector::single(1), FdbOrigin::User)
        .unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    let entry = lab.bridge.fdb().get(&key).unwrap();
    assert_eq!(entry.origin(), FdbOrigin::User);
    assert_eq!(lab.bridge.counters().aged, 0);

    lab.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_every_port() {
    let lab = Lab::with_config(short_ageing(), 3);
    lab.bridge.start_ageing().unwrap();

    lab.bridge.shutdown().await;
    assert_eq!(lab.bridge.ports().len(), 1);
    assert!(lab.devices.iter().all(|d| d.master().is_none()));
    assert_eq!(lab.bridge.active_ports(), PortVector::single(0));

    // Ageing can be restarted on a bridge that was shut down.
    lab.bridge.start_ageing().unwrap();
    lab.bridge.shutdown().await;
}
