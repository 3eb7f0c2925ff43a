//! Test harness for ITR integration tests
//!
//! Runs a real worker thread over an in-memory capture and a recording
//! egress, and plays the control plane: it reads punts and resolves
//! entries through its own encapsulator.

#![allow(dead_code)]

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use ipnet::Ipv6Net;

use mvirt_itr::encap::Encapsulator;
use mvirt_itr::map_cache::{MapCache, MapEntry, Rloc};
use mvirt_itr::punt::{PuntMessage, punt_channel};
use mvirt_itr::registry::InterfaceRegistry;
use mvirt_itr::test_util::{ChannelCapture, FrameInjector, RecordingEgress};
use mvirt_itr::worker::{WorkerContext, WorkerHandle, WorkerStatsSnapshot, spawn};
use mvirt_itr::ItrConfig;

/// Capture interface of the worker under test
pub const IFNAME: &str = "eth0";

/// Instance ID bound to `IFNAME`
pub const IID: u32 = 42;

/// Capture poll deadline used by tests
pub const POLL: Duration = Duration::from_millis(20);

/// How long to wait for asynchronous effects
pub const TIMEOUT: Duration = Duration::from_secs(2);

pub fn addr(s: &str) -> Ipv6Addr {
    s.parse().unwrap()
}

pub fn net(s: &str) -> Ipv6Net {
    s.parse().unwrap()
}

pub fn local_eid() -> Ipv6Addr {
    addr("fd00::1")
}

/// Config with short intervals.
pub fn test_config() -> ItrConfig {
    ItrConfig {
        poll_interval: POLL,
        eid_retry_interval: POLL,
        ..Default::default()
    }
}

/// Poll `cond` until it holds or `TIMEOUT` passes.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// A running worker plus the control-plane side of it.
pub struct TestItr {
    pub handle: Option<WorkerHandle>,
    pub injector: FrameInjector,
    /// Datagrams sent by the worker
    pub egress: RecordingEgress,
    /// Datagrams sent while the controller drains buffers
    pub controller_egress: RecordingEgress,
    pub controller: Encapsulator<RecordingEgress>,
    pub map_cache: Arc<MapCache>,
    pub registry: Arc<InterfaceRegistry>,
    pub punt_rx: Receiver<Vec<u8>>,
}

impl TestItr {
    pub fn start() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ItrConfig) -> Self {
        let registry = Arc::new(InterfaceRegistry::new());
        registry.bind(IFNAME, IID);
        registry.add_eid(IID, local_eid());

        let map_cache = Arc::new(MapCache::with_config(config.map_cache_config()));
        let (punt, punt_rx) = punt_channel(config.punt_capacity);
        let (capture, injector) = ChannelCapture::new(config.poll_interval);
        let egress = RecordingEgress::new();
        let controller_egress = RecordingEgress::new();
        let controller =
            Encapsulator::new(controller_egress.clone(), config.ipv6_source_or_unspecified());

        let ctx = WorkerContext {
            map_cache: Arc::clone(&map_cache),
            registry: registry.clone(),
            punt,
            config,
        };
        let handle = spawn(IFNAME, capture, egress.clone(), ctx).expect("spawn worker");

        TestItr {
            handle: Some(handle),
            injector,
            egress,
            controller_egress,
            controller,
            map_cache,
            registry,
            punt_rx,
        }
    }

    pub fn inject(&self, frame: Vec<u8>) {
        self.injector.inject(frame);
    }

    pub fn handle(&self) -> &WorkerHandle {
        self.handle.as_ref().expect("worker already joined")
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.handle().stats()
    }

    /// Next raw punt, if one arrives in time.
    pub fn next_punt_bytes(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.punt_rx.recv_timeout(timeout).ok()
    }

    pub fn next_punt(&self) -> Option<PuntMessage> {
        let bytes = self.next_punt_bytes(TIMEOUT)?;
        Some(PuntMessage::from_json(&bytes).expect("valid punt JSON"))
    }

    /// Install `rlocs` and drain the entry through the controller's egress.
    pub fn resolve(&mut self, prefix: &str, rlocs: Vec<Rloc>) -> usize {
        self.map_cache
            .resolve(IID, net(prefix), rlocs, &mut self.controller)
            .expect("resolve")
    }

    pub fn entry(&self, prefix: &str) -> Option<Arc<MapEntry>> {
        self.map_cache.get(IID, net(prefix))
    }

    /// Terminate and join the worker.
    pub fn stop(&mut self) -> Duration {
        let handle = self.handle.take().expect("worker already joined");
        let started = Instant::now();
        handle.terminate();
        handle.join().expect("worker exited with error");
        started.elapsed()
    }
}
