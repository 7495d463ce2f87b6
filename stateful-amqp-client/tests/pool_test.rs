//! Integration tests for connection pooling and token renewal

mod common;

use common::{eventually, identity_with, within, MockNetwork, TIMEOUT};
use stateful_amqp_client::{
    ConnectionPoolManager, FixedRate, TransportBuilder, TransportMetrics, TransportState,
    DEVICE_CONNECT_CLAIM,
};
use stateful_amqp_core::{AmqpMessage, AmqpTransportSettings, AuthenticationModel, Topic};
use std::sync::Arc;
use std::time::Duration;

fn pooled(pool_size: u32) -> AmqpTransportSettings {
    AmqpTransportSettings::default().with_pooling(pool_size)
}

fn shared_pool(network: &Arc<MockNetwork>) -> Arc<ConnectionPoolManager> {
    Arc::new(ConnectionPoolManager::new(
        network.connector(),
        Arc::new(TransportMetrics::new()),
    ))
}

#[tokio::test]
async fn test_pooled_transports_share_one_connection() {
    let network = MockNetwork::new();
    let pool = shared_pool(&network);

    let first = TransportBuilder::new(identity_with("device-1", AuthenticationModel::SasIndividual, pooled(1)))
        .with_pool(Arc::clone(&pool))
        .build()
        .unwrap();
    let second = TransportBuilder::new(identity_with("device-2", AuthenticationModel::SasIndividual, pooled(1)))
        .with_pool(Arc::clone(&pool))
        .build()
        .unwrap();

    within(first.open(TIMEOUT)).await.unwrap();
    within(second.open(TIMEOUT)).await.unwrap();
    assert_eq!(network.connection_attempts(), 1);
    assert_eq!(network.session_attempts(), 2);
    assert_eq!(pool.pooled_holder_count(), 1);

    // Closing one transport leaves the shared connection to the other
    within(first.close(TIMEOUT)).await.unwrap();
    assert_eq!(network.open_connections(), 1);
    within(second.send_message(Topic::Message, AmqpMessage::new(b"x".to_vec()), TIMEOUT))
        .await
        .unwrap();

    within(first.dispose()).await;
    assert_eq!(network.open_connections(), 1);
    within(second.send_message(Topic::Message, AmqpMessage::new(b"y".to_vec()), TIMEOUT))
        .await
        .unwrap();
    assert_eq!(network.sent_messages(), 2);
}

#[tokio::test]
async fn test_certificate_identities_get_dedicated_connections() {
    let network = MockNetwork::new();
    let pool = shared_pool(&network);
    let settings = pooled(1).with_client_certificate("device.pem");

    let first = TransportBuilder::new(identity_with("device-1", AuthenticationModel::X509, settings.clone()))
        .with_pool(Arc::clone(&pool))
        .build()
        .unwrap();
    let second = TransportBuilder::new(identity_with("device-2", AuthenticationModel::X509, settings))
        .with_pool(Arc::clone(&pool))
        .build()
        .unwrap();

    within(first.open(TIMEOUT)).await.unwrap();
    within(second.open(TIMEOUT)).await.unwrap();
    assert_eq!(network.connection_attempts(), 2);
    assert_eq!(pool.pooled_holder_count(), 0);
    // Certificates authenticate the TLS session; no tokens are sent
    assert_eq!(network.tokens_sent(), 0);
}

#[tokio::test]
async fn test_shared_connection_loss_reconnects_every_transport() {
    let network = MockNetwork::new();
    let pool = shared_pool(&network);
    let build = |device: &str| {
        TransportBuilder::new(identity_with(device, AuthenticationModel::SasIndividual, pooled(1)))
            .with_pool(Arc::clone(&pool))
            .with_retry(|| FixedRate::new(Duration::from_millis(10), 3))
            .build()
            .unwrap()
    };
    let first = build("device-1");
    let second = build("device-2");
    within(first.open(TIMEOUT)).await.unwrap();
    within(second.open(TIMEOUT)).await.unwrap();

    network.drop_latest_connection();

    assert!(eventually(TIMEOUT, || network.open_links_with_suffix("_TelemetrySenderLink") == 2
        && first.state() == TransportState::Connected
        && second.state() == TransportState::Connected)
    .await);
    // Both reconnect loops converge on one replacement connection
    assert_eq!(network.connection_attempts(), 2);
    assert_eq!(network.open_connections(), 1);
}

#[tokio::test]
async fn test_grouped_sas_refreshes_hub_token() {
    let network = MockNetwork::new();
    network.set_token_lifetime(Duration::from_millis(30));
    let identity = identity_with("device-1", AuthenticationModel::SasGrouped, AmqpTransportSettings::default())
        .with_shared_access_key_name("registryRw");

    let transport = TransportBuilder::new(identity)
        .with_connector(network.connector())
        .build()
        .unwrap();
    within(transport.open(TIMEOUT)).await.unwrap();

    {
        let requests = network.token_requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].audience, "hub.example.net");
        assert_eq!(requests[0].claims, vec![DEVICE_CONNECT_CLAIM.to_string()]);
    }

    assert!(eventually(TIMEOUT, || network.tokens_sent() >= 3).await);

    within(transport.dispose()).await;
    let sent = network.tokens_sent();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(network.tokens_sent(), sent);
}

#[tokio::test]
async fn test_individual_sas_refresher_stops_with_session() {
    let network = MockNetwork::new();
    network.set_token_lifetime(Duration::from_millis(30));
    let transport = TransportBuilder::new(identity_with(
        "device-1",
        AuthenticationModel::SasIndividual,
        AmqpTransportSettings::default(),
    ))
    .with_connector(network.connector())
    .build()
    .unwrap();
    within(transport.open(TIMEOUT)).await.unwrap();
    assert_eq!(
        network.token_requests.lock()[0].audience,
        "hub.example.net/devices/device-1"
    );
    assert!(eventually(TIMEOUT, || network.tokens_sent() >= 2).await);

    within(transport.close(TIMEOUT)).await.unwrap();
    let sent = network.tokens_sent();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(network.tokens_sent(), sent);
}
