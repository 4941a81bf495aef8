//! Randomized convergence checks: whatever interleaving of writes and calls
//! the replicas produce, they all end up showing the Source's final state.

mod common;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use remonode::Config;
use remonode::Node;
use remonode::Replica;
use remonode::Value;

use common::TIMEOUT;
use common::counter;
use common::counter_schema;
use common::eventually;
use common::init_tracing;
use common::unique_local;
use common::wait_for_value;

const CLIENTS: usize = 4;
const OPERATIONS: usize = 50;

/// Random writes and calls, finished by a call whose reply proves every
/// earlier request from this replica reached the Source.
async fn churn(replica: Replica, seed: u64) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    for _ in 0..OPERATIONS {
        match rng.gen_range(0..3) {
            0 => replica.set_property(0, rng.gen_range(-1000i64..1000))?,
            1 => replica.invoke_by_name("add", vec![Value::Int(rng.gen_range(-5..5))])?,
            _ => {
                replica.call_by_name("increment", vec![])?.wait().await?;
            }
        }
        if rng.gen_bool(0.1) {
            tokio::task::yield_now().await;
        }
    }
    replica.call_by_name("add", vec![Value::Int(0)])?.wait().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_converge() -> anyhow::Result<()> {
    init_tracing();
    let seed: u64 = rand::thread_rng().r#gen();
    tracing::info!(seed, "convergence run");

    let host = Node::new(Config::new())?;
    let address = unique_local("converge");
    host.listen(&address).await?;
    let source = counter(0);
    host.enable_remoting(source.clone(), "Counter")?;

    let mut clients = Vec::new();
    let mut replicas = Vec::new();
    for _ in 0..CLIENTS {
        let client = Node::new(Config::new())?;
        client.connect(&address)?;
        let replica = client.acquire_typed("Counter", counter_schema());
        replica.wait_for_source(TIMEOUT).await?;
        replicas.push(replica);
        clients.push(client);
    }
    // a replica on the hosting node itself
    let local = host.acquire_typed("Counter", counter_schema());
    local.wait_for_source(TIMEOUT).await?;
    replicas.push(local);

    let workers: Vec<_> = replicas
        .iter()
        .enumerate()
        .map(|(i, replica)| tokio::spawn(churn(replica.clone(), seed.wrapping_add(i as u64))))
        .collect();
    for worker in workers {
        worker.await??;
    }

    let expected = source.get(0).expect("counter has a value");
    for (i, replica) in replicas.iter().enumerate() {
        let what = format!("replica {} converges to {:?} (seed {})", i, expected, seed);
        eventually(&what, || replica.property(0).as_ref() == Some(&expected)).await;
        assert!(replica.is_valid());
    }

    for client in &clients {
        client.shutdown();
    }
    host.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_joiner_sees_current_state() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let host = Node::new(Config::new())?;
    let address = unique_local("late-joiner");
    host.listen(&address).await?;
    let source = counter(0);
    host.enable_remoting(source.clone(), "Counter")?;

    let mut last = Value::Int(0);
    for _ in 0..20 {
        last = Value::Int(rng.gen_range(0..10_000));
        source.set(0, last.clone())?;
    }

    let client = Node::new(Config::new())?;
    client.connect(&address)?;
    let replica = client.acquire("Counter");
    replica.wait_for_source(TIMEOUT).await?;
    wait_for_value(&replica, 0, last).await;
    client.shutdown();
    host.shutdown();
    Ok(())
}
