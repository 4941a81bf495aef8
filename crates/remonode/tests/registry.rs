//! Discovery through a registry node.

mod common;

use std::time::Duration;

use remonode::Config;
use remonode::Node;
use remonode::ReplicaState;
use remonode::Value;
use remonode::node::Error;
use remonode::replica;

use common::TIMEOUT;
use common::counter;
use common::counter_schema;
use common::eventually;
use common::init_tracing;
use common::unique_local;

struct Cluster {
    registry: Node,
    registry_address: String,
}

impl Cluster {
    async fn start() -> anyhow::Result<Self> {
        let registry = Node::new(Config::new())?;
        let registry_address = unique_local("registry");
        registry.listen(&registry_address).await?;
        registry.host_registry()?;
        Ok(Self { registry, registry_address })
    }

    fn config(&self) -> Config {
        Config::new()
            .with_registry(self.registry_address.clone())
            .with_retry_interval(Duration::from_millis(50))
    }

    /// A node that is listening and uses the registry.
    async fn host(&self, prefix: &str) -> anyhow::Result<(Node, String)> {
        let node = Node::new(self.config())?;
        let address = node.listen(&unique_local(prefix)).await?.to_string();
        node.wait_for_registry(TIMEOUT).await?;
        Ok((node, address))
    }

    fn client(&self) -> anyhow::Result<Node> {
        Ok(Node::new(self.config())?)
    }
}

fn addresses_of(node: &Node, name: &str) -> Vec<String> {
    node.registry_locations()
        .into_iter()
        .filter(|l| l.name == name)
        .map(|l| l.address)
        .collect()
}

// ============================================================================
//  1. LOOKUP
// ============================================================================

#[tokio::test]
async fn test_waiting_replica_is_connected_through_the_registry() -> anyhow::Result<()> {
    init_tracing();
    let cluster = Cluster::start().await?;
    let client = cluster.client()?;
    let replica = client.acquire_typed("Counter", counter_schema());

    let (host, host_address) = cluster.host("host").await?;
    host.enable_remoting(counter(3), "Counter")?;

    replica.wait_for_source(TIMEOUT).await?;
    assert_eq!(replica.property(0), Some(Value::Int(3)));
    eventually("client sees the location", || addresses_of(&client, "Counter") == vec![host_address.clone()]).await;

    let location = cluster
        .registry
        .registry_locations()
        .into_iter()
        .find(|l| l.name == "Counter")
        .expect("registered");
    assert_eq!(location.type_name, "Counter");
    assert_eq!(location.signature, counter_schema().signature());

    for node in [&client, &host, &cluster.registry] {
        node.shutdown();
    }
    Ok(())
}

#[tokio::test]
async fn test_source_published_before_the_replica_exists() -> anyhow::Result<()> {
    let cluster = Cluster::start().await?;
    let (host, host_address) = cluster.host("early").await?;
    host.enable_remoting(counter(8), "Counter")?;
    eventually("registered", || addresses_of(&cluster.registry, "Counter") == vec![host_address.clone()]).await;

    let client = cluster.client()?;
    client.wait_for_registry(TIMEOUT).await?;
    let replica = client.acquire("Counter");
    replica.wait_for_source(TIMEOUT).await?;
    assert_eq!(replica.property_by_name("value"), Some(Value::Int(8)));
    Ok(())
}

#[tokio::test]
async fn test_registry_node_announces_its_own_sources() -> anyhow::Result<()> {
    let cluster = Cluster::start().await?;
    cluster.registry.enable_remoting(counter(1), "Counter")?;
    assert_eq!(addresses_of(&cluster.registry, "Counter"), vec![cluster.registry_address.clone()]);
    assert!(addresses_of(&cluster.registry, "Registry").is_empty(), "the registry does not list itself");

    let client = cluster.client()?;
    let replica = client.acquire_typed("Counter", counter_schema());
    replica.wait_for_source(TIMEOUT).await?;
    assert_eq!(replica.property(0), Some(Value::Int(1)));
    Ok(())
}

// ============================================================================
//  2. CONFLICTS AND CLEANUP
// ============================================================================

#[tokio::test]
async fn test_first_registration_wins() -> anyhow::Result<()> {
    let cluster = Cluster::start().await?;
    let (first, first_address) = cluster.host("first").await?;
    first.enable_remoting(counter(1), "Counter")?;
    eventually("first registered", || addresses_of(&cluster.registry, "Counter") == vec![first_address.clone()]).await;

    let (second, _) = cluster.host("second").await?;
    second.enable_remoting(counter(2), "Counter")?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(addresses_of(&cluster.registry, "Counter"), vec![first_address.clone()]);

    let client = cluster.client()?;
    let replica = client.acquire_typed("Counter", counter_schema());
    replica.wait_for_source(TIMEOUT).await?;
    assert_eq!(replica.property(0), Some(Value::Int(1)));
    Ok(())
}

#[tokio::test]
async fn test_locations_are_dropped_when_their_host_leaves() -> anyhow::Result<()> {
    let cluster = Cluster::start().await?;
    let (host, host_address) = cluster.host("leaving").await?;
    host.enable_remoting(counter(0), "Counter")?;
    host.enable_remoting(counter(0), "Other")?;

    let client = cluster.client()?;
    let replica = client.acquire_typed("Counter", counter_schema());
    replica.wait_for_source(TIMEOUT).await?;
    eventually("both registered", || cluster.registry.registry_locations().len() == 2).await;

    host.shutdown();
    eventually("registry forgets the host", || cluster.registry.registry_locations().is_empty()).await;
    eventually("client forgets the host", || addresses_of(&client, "Counter").is_empty()).await;
    eventually("replica goes suspect", || replica.state() == ReplicaState::Suspect).await;
    assert!(!cluster.registry.registry_locations().iter().any(|l| l.address == host_address));
    Ok(())
}

#[tokio::test]
async fn test_withdrawn_source_is_unregistered() -> anyhow::Result<()> {
    let cluster = Cluster::start().await?;
    let (host, _) = cluster.host("withdraw").await?;
    host.enable_remoting(counter(0), "Counter")?;
    host.enable_remoting(counter(0), "Other")?;
    eventually("both registered", || cluster.registry.registry_locations().len() == 2).await;

    host.disable_remoting_by_name("Counter")?;
    eventually("only Other remains", || {
        let names: Vec<String> = cluster.registry.registry_locations().into_iter().map(|l| l.name).collect();
        names == vec!["Other".to_string()]
    })
    .await;
    Ok(())
}

// ============================================================================
//  3. REGISTRY AVAILABILITY
// ============================================================================

#[tokio::test]
async fn test_wait_for_registry() -> anyhow::Result<()> {
    let standalone = Node::new(Config::new())?;
    assert!(matches!(standalone.wait_for_registry(TIMEOUT).await, Err(Error::NoRegistry)));
    assert!(matches!(standalone.host_registry(), Err(Error::NotListening)));

    // the client starts first and keeps dialing
    let registry_address = unique_local("registry-late");
    let client = Node::new(
        Config::new()
            .with_registry(registry_address.clone())
            .with_retry_interval(Duration::from_millis(50)),
    )?;
    let early = client.wait_for_registry(Duration::from_millis(100)).await;
    assert!(matches!(early, Err(Error::Replica(replica::Error::Timeout))));

    let registry = Node::new(Config::new())?;
    registry.listen(&registry_address).await?;
    registry.host_registry()?;
    registry.wait_for_registry(TIMEOUT).await?;
    client.wait_for_registry(TIMEOUT).await?;
    assert!(client.registry_locations().is_empty());
    Ok(())
}
