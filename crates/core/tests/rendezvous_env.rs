//! Process environment written by the bootstrap. Kept in its own test binary
//! so no other test races on the variables.

use std::thread;
use std::time::Duration;

use cosmoflow_io_core::bootstrap::{local_hostname, Backend, CoordinationOptions};
use cosmoflow_io_core::{DistributedContext, Topology};

fn options(group: &str, master_port: u16) -> CoordinationOptions {
    CoordinationOptions {
        backend: Backend::Shmem,
        group_id: format!("{}_{}", group, std::process::id()),
        master_port,
        join_timeout: Duration::from_secs(10),
    }
}

#[test]
fn establish_publishes_rendezvous_to_every_rank() {
    let world = 3;
    let handles: Vec<_> = (0..world)
        .map(|rank| {
            thread::spawn(move || {
                if rank != 0 {
                    thread::sleep(Duration::from_millis(50));
                }
                let topo = Topology {
                    local_rank: rank,
                    local_size: world,
                    world_rank: rank,
                    world_size: world,
                };
                let ctx = DistributedContext::establish(topo, &options("env3", 29500)).unwrap();
                assert!(ctx.with_coordination());
                ctx.rendezvous().cloned().unwrap()
            })
        })
        .collect();

    let rendezvous: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for r in &rendezvous {
        assert_eq!(r, &rendezvous[0]);
        assert_eq!(r.master_addr, local_hostname());
        assert_eq!(r.master_port, 29500);
    }

    // All three ranks share this process, so RANK holds whichever wrote last.
    assert_eq!(std::env::var("MASTER_ADDR").unwrap(), local_hostname());
    assert_eq!(std::env::var("MASTER_PORT").unwrap(), "29500");
    assert_eq!(std::env::var("WORLD_SIZE").unwrap(), "3");
    let rank: usize = std::env::var("RANK").unwrap().parse().unwrap();
    assert!(rank < world);

    // A lone rank overwrites every variable with its own view.
    let ctx = DistributedContext::establish(Topology::single_process(), &options("env1", 29501)).unwrap();
    assert!(ctx.with_coordination());
    assert_eq!(std::env::var("RANK").unwrap(), "0");
    assert_eq!(std::env::var("WORLD_SIZE").unwrap(), "1");
    assert_eq!(std::env::var("MASTER_PORT").unwrap(), "29501");
    assert_eq!(std::env::var("MASTER_ADDR").unwrap(), local_hostname());
}
