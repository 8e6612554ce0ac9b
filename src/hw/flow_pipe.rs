use tracing::{info, warn};
use triomphe::Arc;

use super::{Context, ReceiveQueue, TrafficFilter};
use crate::errors::{Result, StatusExt};
use crate::sim::flow::{EntryId, Fwd, PipeCfg, PipeCounters, PipeId, PipeType};

pub const PRIORITY_HIGH: u32 = 1;
pub const PRIORITY_LOW: u32 = 3;

const BASIC_PIPE: &str = "GPU_RXQ_PIPE";
const ROOT_PIPE: &str = "ROOT_PIPE";

/// Destroys its pipe on drop.
struct PipeGuard {
    context: Arc<Context>,
    id: PipeId,
    name: &'static str,
}

impl Drop for PipeGuard {
    fn drop(&mut self) {
        let res = self.context.flow_port().lock().pipe_destroy(self.id);
        if let Err(status) = res {
            warn!(pipe = self.name, %status, "pipe destroy failed");
        }
    }
}

/// Counters of both pipes, plus their committed entry counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowPipeStats {
    pub root: PipeCounters,
    pub basic: PipeCounters,
    pub root_entries: usize,
    pub basic_entries: usize,
}

/// Steering from the NIC port into one receive queue: a root control pipe
/// with a single filter entry forwarding into a basic pipe that spreads
/// matches over the queue.
pub struct FlowPipe {
    // Root goes first: the basic pipe cannot be destroyed while targeted.
    root: PipeGuard,
    basic: PipeGuard,
    root_entry: EntryId,
    placeholder: EntryId,
    filter: TrafficFilter,
}

impl FlowPipe {
    pub fn create(context: &Arc<Context>, rxq: &ReceiveQueue, filter: TrafficFilter) -> Result<Self> {
        let port = context.flow_port();

        let basic_cfg = PipeCfg {
            name: BASIC_PIPE,
            kind: PipeType::Basic,
            is_root: false,
            match_spec: filter.pipe_match(),
            fwd: Some(Fwd::rss(rxq.flow_queue_id())),
            miss: Fwd::Drop,
            count: true,
        };
        let id = port.lock().pipe_create(basic_cfg).or_flow_config("pipe_create")?;
        let basic = PipeGuard {
            context: context.clone(),
            id,
            name: BASIC_PIPE,
        };

        let placeholder = port
            .lock()
            .pipe_add_entry(basic.id, None)
            .or_flow_config("pipe_add_entry")?;
        port.lock().entries_process().or_flow_config("entries_process")?;

        let root_cfg = PipeCfg {
            name: ROOT_PIPE,
            kind: PipeType::Control,
            is_root: true,
            match_spec: Default::default(),
            fwd: None,
            miss: Fwd::Drop,
            count: true,
        };
        let id = port
            .lock()
            .pipe_create(root_cfg)
            .or_flow_config("control_pipe_create")?;
        let root = PipeGuard {
            context: context.clone(),
            id,
            name: ROOT_PIPE,
        };

        let root_entry = port
            .lock()
            .control_add_entry(root.id, PRIORITY_LOW, filter.root_match(), Fwd::Pipe(basic.id))
            .or_flow_config("control_add_entry")?;
        port.lock().entries_process().or_flow_config("entries_process")?;

        info!(%filter, queue = rxq.flow_queue_id(), "flow pipe installed");
        Ok(Self {
            root,
            basic,
            root_entry,
            placeholder,
            filter,
        })
    }

    pub fn filter(&self) -> TrafficFilter {
        self.filter
    }

    pub fn root_entry(&self) -> EntryId {
        self.root_entry
    }

    pub fn placeholder_entry(&self) -> EntryId {
        self.placeholder
    }

    pub fn stats(&self) -> FlowPipeStats {
        let engine = self.root.context.flow_port().lock();
        FlowPipeStats {
            root: engine.counters(self.root.id).unwrap_or_default(),
            basic: engine.counters(self.basic.id).unwrap_or_default(),
            root_entries: engine.committed_entries(self.root.id).unwrap_or(0),
            basic_entries: engine.committed_entries(self.basic.id).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::errors::{Error, Status};
    use crate::hw::testing::context;
    use crate::sim::Delivery;
    use crate::sim::traffic::FrameSpec;

    fn frame(src: Ipv4Addr) -> Vec<u8> {
        FrameSpec::tcp(src, Ipv4Addr::new(10, 0, 0, 1)).build().unwrap()
    }

    #[test]
    fn source_filter_installs_one_entry_per_pipe() {
        let (_platform, wire, ctx) = context();
        let rxq = ReceiveQueue::create(&ctx, 64).unwrap();
        let filter = TrafficFilter::parse("10.0.0.5", "tcp").unwrap();
        let pipe = FlowPipe::create(&ctx, &rxq, filter).unwrap();

        let stats = pipe.stats();
        assert_eq!((stats.root_entries, stats.basic_entries), (1, 1));

        let queue = rxq.flow_queue_id();
        assert_eq!(wire.inject(&frame(Ipv4Addr::new(10, 0, 0, 5))), Delivery::Queued(queue));
        assert_eq!(wire.inject(&frame(Ipv4Addr::new(10, 0, 0, 6))), Delivery::Dropped);
        let udp = FrameSpec::udp(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::LOCALHOST)
            .build()
            .unwrap();
        assert_eq!(wire.inject(&udp), Delivery::Dropped);

        let stats = pipe.stats();
        assert_eq!(stats.root.hits, 1);
        assert_eq!(stats.root.misses, 2);
        assert_eq!(stats.basic.hits, 1);
    }

    #[test]
    fn drop_removes_both_pipes() {
        let (_platform, wire, ctx) = context();
        let rxq = ReceiveQueue::create(&ctx, 64).unwrap();
        let pipe = FlowPipe::create(&ctx, &rxq, TrafficFilter::default()).unwrap();
        assert_eq!(ctx.flow_port().lock().pipe_count(), 2);
        drop(pipe);
        assert_eq!(ctx.flow_port().lock().pipe_count(), 0);
        assert_eq!(wire.inject(&frame(Ipv4Addr::new(1, 2, 3, 4))), Delivery::Dropped);
    }

    #[test]
    fn second_root_fails_and_cleans_up() {
        let (_platform, _wire, ctx) = context();
        let rxq = ReceiveQueue::create(&ctx, 64).unwrap();
        let _first = FlowPipe::create(&ctx, &rxq, TrafficFilter::default()).unwrap();
        let err = FlowPipe::create(&ctx, &rxq, TrafficFilter::default()).err().unwrap();
        match err {
            Error::FlowConfig { call, status, site } => {
                assert_eq!(call, "control_pipe_create");
                assert_eq!(status, Status::InUse);
                assert!(site.file.ends_with("flow_pipe.rs"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ctx.flow_port().lock().pipe_count(), 2);
    }
}
