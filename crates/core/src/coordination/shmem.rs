//! Node-local rank coordination using shared memory and atomic operations
//!
//! Rank 0 creates a group segment every other rank opens and registers in.
//! Each rank claims its own registration slot, so a rank number can join a
//! group once. Rank 0 stamps the group with a random session id that names
//! every broadcast segment of the run. Each broadcast gets its own segment,
//! created by the root, sized for the payload and unlinked once every rank has
//! acknowledged the copy.

use anyhow::{Context, Result};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::Communicator;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Progress is logged this often while a rank waits on its peers.
const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(10);

const SLOT_FREE: u32 = 0;
const SLOT_REGISTERED: u32 = 1;

/// Shared group state between all ranks
///
/// Followed in the segment by `world_size` registration slots.
#[repr(C)]
struct GroupState {
    /// Total number of ranks in this execution
    world_size: AtomicU32,

    /// Number of ranks that have registered
    registered_ranks: AtomicU32,

    /// Set by rank 0 once the state is initialised
    active: AtomicBool,

    /// Set by rank 0 once every rank has registered
    complete: AtomicBool,

    /// Set when a later run takes the group name over
    retired: AtomicBool,

    /// Emergency abort flag, raised when the root cannot publish a broadcast
    abort: AtomicBool,

    /// Random per-run stamp, part of every broadcast segment name
    session: AtomicU64,

    /// Rank 0 liveness during registration (nanoseconds since UNIX_EPOCH)
    heartbeat_ns: AtomicU64,
}

impl GroupState {
    fn new(world_size: u32, session: u64) -> Self {
        Self {
            world_size: AtomicU32::new(world_size),
            registered_ranks: AtomicU32::new(0),
            active: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            session: AtomicU64::new(session),
            heartbeat_ns: AtomicU64::new(now_ns()),
        }
    }

    fn touch(&self) {
        self.heartbeat_ns.store(now_ns(), Ordering::Release);
    }

    /// Time since rank 0 last showed signs of life.
    fn idle(&self) -> Duration {
        Duration::from_nanos(now_ns().saturating_sub(self.heartbeat_ns.load(Ordering::Acquire)))
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

const STATE_SIZE: usize = std::mem::size_of::<GroupState>();

fn group_segment_len(world_size: usize) -> usize {
    STATE_SIZE + world_size * std::mem::size_of::<AtomicU32>()
}

/// Header at the start of every broadcast segment; the payload follows it.
#[repr(C)]
struct BroadcastHeader {
    /// Payload fully written
    ready: AtomicBool,

    /// Non-root ranks done copying
    acks: AtomicU32,

    /// Payload length in bytes
    len: AtomicU64,
}

const HEADER_SIZE: usize = std::mem::size_of::<BroadcastHeader>();

/// Outcome of one attempt by a non-root rank to join the group segment.
enum JoinAttempt {
    Joined(Shmem),
    Retry(String),
}

/// Shared memory process group for ranks on one node
pub struct ShmemCommunicator {
    rank: usize,
    world_size: usize,
    shared_mem: Shmem, // Must keep alive to maintain shared memory mapping
    group_id: String,
    session: u64,
    sequence: AtomicU64,
}

impl ShmemCommunicator {
    /// Create (rank 0) or join (others) a coordination group and wait until
    /// all `world_size` ranks have registered.
    pub fn join(rank: usize, world_size: usize, group_id: &str, timeout: Duration) -> Result<Self> {
        if rank >= world_size {
            return Err(anyhow::anyhow!("Rank {} >= world_size {}", rank, world_size));
        }
        let expected = u32::try_from(world_size)
            .with_context(|| format!("World size {} does not fit the group state", world_size))?;

        let shmem_name = format!("cosmoflow_coord_{}", group_id);

        info!(
            "🔗 Rank {}: Joining coordination group '{}' (world_size={})",
            rank, group_id, world_size
        );

        let deadline = Instant::now() + timeout;
        let shared_mem = if rank == 0 {
            let shmem = create_group(&shmem_name, expected, timeout)?;
            debug!("Rank 0: Created coordination group '{}'", group_id);
            register_root(&shmem, expected, deadline)?;
            shmem
        } else {
            let mut last_reason = String::from("group segment not found");
            loop {
                if Instant::now() >= deadline {
                    anyhow::bail!(
                        "Timed out joining coordination group '{}' after {:?}: {}",
                        group_id,
                        timeout,
                        last_reason
                    );
                }
                match attempt_join(&shmem_name, rank, expected, deadline)? {
                    JoinAttempt::Joined(shmem) => break shmem,
                    JoinAttempt::Retry(reason) => {
                        debug!("Rank {}: {}; retrying", rank, reason);
                        last_reason = reason;
                        std::thread::sleep(POLL_INTERVAL);
                    }
                }
            }
        };

        let session = group_state(&shared_mem).session.load(Ordering::Acquire);
        info!(
            "✅ Rank {}: All ranks registered in '{}' (session {:016x})",
            rank, group_id, session
        );
        Ok(Self {
            rank,
            world_size,
            shared_mem,
            group_id: group_id.to_string(),
            session,
            sequence: AtomicU64::new(0),
        })
    }

    fn state(&self) -> &GroupState {
        group_state(&self.shared_mem)
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    fn broadcast_segment_name(&self, sequence: u64) -> String {
        format!("cosmoflow_bcast_{}_{:016x}_{}", self.group_id, self.session, sequence)
    }

    fn send(&self, name: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let shmem = match ShmemConf::new()
            .size(HEADER_SIZE + payload.len().max(1))
            .os_id(name)
            .create()
        {
            Ok(shmem) => shmem,
            Err(e) => {
                // Peers would otherwise wait on this segment forever.
                self.state().abort.store(true, Ordering::Release);
                return Err(e).with_context(|| format!("Failed to create broadcast segment: {}", name));
            }
        };

        let base = shmem.as_ptr();
        // Only the root touches the segment until `ready` is published.
        let header = unsafe {
            std::ptr::write(
                base as *mut BroadcastHeader,
                BroadcastHeader {
                    ready: AtomicBool::new(false),
                    acks: AtomicU32::new(0),
                    len: AtomicU64::new(payload.len() as u64),
                },
            );
            std::ptr::copy_nonoverlapping(payload.as_ptr(), base.add(HEADER_SIZE), payload.len());
            &*(base as *const BroadcastHeader)
        };
        header.ready.store(true, Ordering::Release);
        debug!("📡 Rank {}: Published {} bytes on {}", self.rank, payload.len(), name);

        let peers = (self.world_size - 1) as u32;
        let mut last_log = Instant::now();
        while header.acks.load(Ordering::Acquire) < peers {
            if last_log.elapsed() > WAIT_LOG_INTERVAL {
                warn!(
                    "⏳ Rank {}: Waiting on broadcast {} - {}/{} ranks received",
                    self.rank,
                    name,
                    header.acks.load(Ordering::Acquire),
                    peers
                );
                last_log = Instant::now();
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        // Dropping the owning handle unlinks the segment.
        drop(shmem);
        Ok(payload)
    }

    fn receive(&self, name: &str) -> Result<Vec<u8>> {
        let mut last_log = Instant::now();
        let shmem = loop {
            if self.state().abort.load(Ordering::Acquire) {
                anyhow::bail!("Coordination group '{}' aborted before broadcast {}", self.group_id, name);
            }
            match ShmemConf::new().os_id(name).open() {
                Ok(shmem) if shmem.len() >= HEADER_SIZE => break shmem,
                _ => {
                    if last_log.elapsed() > WAIT_LOG_INTERVAL {
                        warn!("⏳ Rank {}: Still waiting for broadcast {}", self.rank, name);
                        last_log = Instant::now();
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        };

        let base = shmem.as_ptr();
        let header = unsafe { &*(base as *const BroadcastHeader) };
        while !header.ready.load(Ordering::Acquire) {
            if self.state().abort.load(Ordering::Acquire) {
                anyhow::bail!("Coordination group '{}' aborted during broadcast {}", self.group_id, name);
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let len = header.len.load(Ordering::Acquire) as usize;
        if HEADER_SIZE + len > shmem.len() {
            anyhow::bail!(
                "Broadcast {} announces {} bytes but the segment holds {}",
                name,
                len,
                shmem.len() - HEADER_SIZE
            );
        }
        let mut payload = vec![0u8; len];
        // `ready` was published with Release after the payload copy.
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(HEADER_SIZE), payload.as_mut_ptr(), len);
        }
        header.acks.fetch_add(1, Ordering::AcqRel);
        debug!("📡 Rank {}: Received {} bytes from {}", self.rank, len, name);
        Ok(payload)
    }
}

fn group_state(shmem: &Shmem) -> &GroupState {
    unsafe { &*(shmem.as_ptr() as *const GroupState) }
}

/// Registration slot of `rank`. The caller has checked the segment length.
fn rank_slot(shmem: &Shmem, rank: usize) -> &AtomicU32 {
    unsafe { &*(shmem.as_ptr().add(STATE_SIZE) as *const AtomicU32).add(rank) }
}

/// Create the group segment, reclaiming a stale one left under the same name.
fn create_group(name: &str, world_size: u32, timeout: Duration) -> Result<Shmem> {
    let len = group_segment_len(world_size as usize);
    let shmem = match ShmemConf::new().size(len).os_id(name).create() {
        Ok(shmem) => shmem,
        Err(ShmemError::MappingIdExists) => {
            reclaim_stale_group(name, timeout)?;
            ShmemConf::new()
                .size(len)
                .os_id(name)
                .create()
                .with_context(|| format!("Failed to create shared memory: {}", name))?
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to create shared memory: {}", name)),
    };

    let state_ptr = shmem.as_ptr() as *mut GroupState;
    // Peers wait for `active` before reading anything else.
    unsafe {
        std::ptr::write(state_ptr, GroupState::new(world_size, rand::random()));
    }
    for rank in 0..world_size as usize {
        rank_slot(&shmem, rank).store(SLOT_FREE, Ordering::Relaxed);
    }
    group_state(&shmem).active.store(true, Ordering::Release);
    Ok(shmem)
}

/// Unlink a group segment no live run is registering in.
///
/// A segment is stale once its registration completed, once it was retired,
/// or when its rank 0 has been silent for longer than `timeout`.
fn reclaim_stale_group(name: &str, timeout: Duration) -> Result<()> {
    let mut old = ShmemConf::new()
        .os_id(name)
        .open()
        .with_context(|| format!("Failed to open existing shared memory: {}", name))?;

    if old.len() >= STATE_SIZE {
        let state = group_state(&old);
        let finished = state.complete.load(Ordering::Acquire) || state.retired.load(Ordering::Acquire);
        let idle = state.idle();
        if !finished && idle < timeout {
            anyhow::bail!(
                "Coordination segment {} is in use by another run (rank 0 seen {:?} ago)",
                name,
                idle
            );
        }
        state.retired.store(true, Ordering::Release);
    }

    warn!("♻️  Rank 0: Reclaiming stale coordination segment {}", name);
    old.set_owner(true);
    drop(old);
    Ok(())
}

/// Claim slot 0 and wait for every other rank, keeping the heartbeat fresh.
fn register_root(shmem: &Shmem, world_size: u32, deadline: Instant) -> Result<()> {
    let state = group_state(shmem);
    rank_slot(shmem, 0)
        .compare_exchange(SLOT_FREE, SLOT_REGISTERED, Ordering::AcqRel, Ordering::Acquire)
        .map_err(|_| anyhow::anyhow!("Rank 0 is already registered"))?;
    state.registered_ranks.fetch_add(1, Ordering::AcqRel);

    loop {
        state.touch();
        let registered = state.registered_ranks.load(Ordering::Acquire);
        if registered > world_size {
            anyhow::bail!("{} ranks registered in a group of {}", registered, world_size);
        }
        if registered == world_size {
            break;
        }
        if Instant::now() >= deadline {
            warn!(
                "⚠️  Rank 0: Registration timeout - {}/{} registered",
                registered, world_size
            );
            anyhow::bail!("Registration timeout: {}/{} registered", registered, world_size);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    state.complete.store(true, Ordering::Release);
    Ok(())
}

/// Open the group segment once, claim this rank's slot and wait for the rest.
fn attempt_join(name: &str, rank: usize, world_size: u32, deadline: Instant) -> Result<JoinAttempt> {
    let shmem = match ShmemConf::new().os_id(name).open() {
        Ok(shmem) if shmem.len() >= STATE_SIZE => shmem,
        Ok(_) => return Ok(JoinAttempt::Retry(format!("segment {} is truncated", name))),
        Err(e) => return Ok(JoinAttempt::Retry(format!("cannot open {}: {}", name, e))),
    };
    let state = group_state(&shmem);

    // Rank 0 may not have initialised the segment yet.
    while !state.active.load(Ordering::Acquire) {
        if Instant::now() >= deadline {
            return Ok(JoinAttempt::Retry(format!("segment {} was never initialised", name)));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    if state.retired.load(Ordering::Acquire) || state.complete.load(Ordering::Acquire) {
        return Ok(JoinAttempt::Retry(format!("segment {} belongs to an earlier run", name)));
    }

    let existing_world_size = state.world_size.load(Ordering::Acquire);
    if existing_world_size != world_size {
        return Ok(JoinAttempt::Retry(format!(
            "world size mismatch: expected {}, found {}",
            world_size, existing_world_size
        )));
    }
    if shmem.len() < group_segment_len(world_size as usize) {
        return Ok(JoinAttempt::Retry(format!("segment {} is truncated", name)));
    }

    if rank_slot(&shmem, rank)
        .compare_exchange(SLOT_FREE, SLOT_REGISTERED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Ok(JoinAttempt::Retry(format!("rank {} is already registered in {}", rank, name)));
    }
    let registered = state.registered_ranks.fetch_add(1, Ordering::AcqRel) + 1;
    debug!("📝 Rank {}: Registered ({}/{})", rank, registered, world_size);

    loop {
        let current = state.registered_ranks.load(Ordering::Acquire);
        if current > world_size {
            anyhow::bail!("{} ranks registered in a group of {}", current, world_size);
        }
        if current == world_size || state.complete.load(Ordering::Acquire) {
            return Ok(JoinAttempt::Joined(shmem));
        }
        if state.retired.load(Ordering::Acquire) {
            return Ok(JoinAttempt::Retry(format!("segment {} was reclaimed by a new run", name)));
        }
        if Instant::now() >= deadline {
            warn!(
                "⚠️  Rank {}: Registration timeout - {}/{} registered",
                rank, current, world_size
            );
            anyhow::bail!("Registration timeout: {}/{} registered", current, world_size);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl Communicator for ShmemCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, root: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        if root >= self.world_size {
            anyhow::bail!("Broadcast root {} outside world of {}", root, self.world_size);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let name = self.broadcast_segment_name(sequence);

        if self.rank == root {
            let payload = payload
                .ok_or_else(|| anyhow::anyhow!("Rank {} is the broadcast root but has no payload", root))?;
            if self.world_size == 1 {
                return Ok(payload);
            }
            self.send(&name, payload)
        } else {
            self.receive(&name)
        }
    }

    fn backend(&self) -> &'static str {
        "shmem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn group_id(test: &str) -> String {
        format!("{}_{}", test, std::process::id())
    }

    #[test]
    fn single_rank_group_broadcasts_locally() {
        let comm = ShmemCommunicator::join(0, 1, &group_id("single"), Duration::from_secs(5)).unwrap();
        assert_eq!(comm.size(), 1);
        let got = comm.broadcast(0, Some(b"node-a".to_vec())).unwrap();
        assert_eq!(got, b"node-a");
    }

    #[test]
    fn broadcast_reaches_every_rank() {
        let id = group_id("bcast");
        let world = 3;
        let handles: Vec<_> = (0..world)
            .map(|rank| {
                let id = id.clone();
                thread::spawn(move || {
                    // Let rank 0 create the group first.
                    if rank != 0 {
                        thread::sleep(Duration::from_millis(50));
                    }
                    let comm = ShmemCommunicator::join(rank, world, &id, Duration::from_secs(10)).unwrap();
                    let first = comm
                        .broadcast(0, (rank == 0).then(|| b"host-0".to_vec()))
                        .unwrap();
                    let second = comm
                        .broadcast(0, (rank == 0).then(|| vec![7u8; 4096]))
                        .unwrap();
                    (first, second)
                })
            })
            .collect();

        for handle in handles {
            let (first, second) = handle.join().unwrap();
            assert_eq!(first, b"host-0");
            assert_eq!(second, vec![7u8; 4096]);
        }
    }

    #[test]
    fn join_times_out_without_root() {
        let result = ShmemCommunicator::join(1, 2, &group_id("orphan"), Duration::from_millis(100));
        assert!(result.is_err());
    }

    #[test]
    fn rank_outside_world_is_rejected() {
        assert!(ShmemCommunicator::join(2, 2, &group_id("outside"), Duration::from_millis(10)).is_err());
    }

    #[test]
    fn rank_registers_only_once() {
        let id = group_id("duplicate");
        let root = {
            let id = id.clone();
            thread::spawn(move || ShmemCommunicator::join(0, 2, &id, Duration::from_secs(5)).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        let peers: Vec<_> = (0..2)
            .map(|_| {
                let id = id.clone();
                thread::spawn(move || ShmemCommunicator::join(1, 2, &id, Duration::from_millis(500)).is_ok())
            })
            .collect();

        assert!(root.join().unwrap().is_ok());
        let joined = peers.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(joined, 1);
    }

    #[test]
    fn stale_group_is_reclaimed_by_next_run() {
        let id = group_id("stale");
        // A run that never cleaned up leaves its segment linked.
        let crashed = ShmemCommunicator::join(0, 1, &id, Duration::from_secs(1)).unwrap();
        let stale_session = crashed.session();
        std::mem::forget(crashed);

        let peer = {
            let id = id.clone();
            thread::spawn(move || {
                let comm = ShmemCommunicator::join(1, 2, &id, Duration::from_secs(5)).unwrap();
                (comm.session(), comm.broadcast(0, None).unwrap())
            })
        };
        let root = ShmemCommunicator::join(0, 2, &id, Duration::from_secs(5)).unwrap();
        assert_ne!(root.session(), stale_session);
        root.broadcast(0, Some(b"fresh".to_vec())).unwrap();

        let (peer_session, payload) = peer.join().unwrap();
        assert_eq!(peer_session, root.session());
        assert_eq!(payload, b"fresh");
    }

    #[test]
    fn second_root_cannot_take_over_live_group() {
        let id = group_id("contended");
        let first = {
            let id = id.clone();
            thread::spawn(move || ShmemCommunicator::join(0, 2, &id, Duration::from_secs(5)).map(|c| c.session()))
        };
        thread::sleep(Duration::from_millis(100));

        let err = ShmemCommunicator::join(0, 2, &id, Duration::from_secs(5)).err().unwrap();
        assert!(format!("{:#}", err).contains("in use"));

        let peer = ShmemCommunicator::join(1, 2, &id, Duration::from_secs(5)).unwrap();
        assert_eq!(first.join().unwrap().unwrap(), peer.session());
    }

    #[test]
    fn failed_root_publish_aborts_waiting_peers() {
        let id = group_id("abort");
        let peer = {
            let id = id.clone();
            thread::spawn(move || {
                let comm = ShmemCommunicator::join(1, 2, &id, Duration::from_secs(5)).unwrap();
                comm.broadcast(0, None)
            })
        };
        let root = ShmemCommunicator::join(0, 2, &id, Duration::from_secs(5)).unwrap();

        let _squatter = ShmemConf::new()
            .size(64)
            .os_id(root.broadcast_segment_name(0))
            .create()
            .unwrap();
        assert!(root.broadcast(0, Some(b"host".to_vec())).is_err());

        let err = peer.join().unwrap().unwrap_err();
        assert!(format!("{:#}", err).contains("aborted"));
    }
}
