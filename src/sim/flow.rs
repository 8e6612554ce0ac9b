//! Hardware flow table of a NIC port.
//!
//! Pipes hold match/action entries. Entries become visible to classification
//! only after [`FlowEngine::entries_process`] commits them. Ingress starts at
//! the single root pipe, whose entries are evaluated in priority order (lower
//! value first, insertion order on ties).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use arrayvec::ArrayVec;
use etherparse::{NetHeaders, PacketHeaders, TransportHeader};

use crate::errors::Status;

/// Maximum number of RSS target queues per forward action.
pub const MAX_QUEUE: usize = 4;

/// Bound on pipe-to-pipe forwarding, against misconfigured loops.
const MAX_PIPE_HOPS: usize = 8;

pub type PipeId = u32;
pub type EntryId = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L3Type {
    Ipv4,
    Ipv6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L4Type {
    Tcp,
    Udp,
}

/// Header fields the flow table can match on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowKey {
    pub l3: Option<L3Type>,
    pub l4: Option<L4Type>,
    pub src_ip: Option<Ipv4Addr>,
    pub dst_ip: Option<Ipv4Addr>,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn from_frame(frame: &[u8]) -> Self {
        let Ok(headers) = PacketHeaders::from_ethernet_slice(frame) else {
            return Self::default();
        };
        let mut key = Self::default();
        match headers.net {
            Some(NetHeaders::Ipv4(ip, _)) => {
                key.l3 = Some(L3Type::Ipv4);
                key.src_ip = Some(Ipv4Addr::from(ip.source));
                key.dst_ip = Some(Ipv4Addr::from(ip.destination));
            }
            Some(NetHeaders::Ipv6(..)) => key.l3 = Some(L3Type::Ipv6),
            _ => {}
        }
        match headers.transport {
            Some(TransportHeader::Tcp(tcp)) => {
                key.l4 = Some(L4Type::Tcp);
                key.src_port = tcp.source_port;
                key.dst_port = tcp.destination_port;
            }
            Some(TransportHeader::Udp(udp)) => {
                key.l4 = Some(L4Type::Udp);
                key.src_port = udp.source_port;
                key.dst_port = udp.destination_port;
            }
            _ => {}
        }
        key
    }

    fn rss_hash(&self) -> u32 {
        // FNV-1a over the 4-tuple.
        let mut h: u32 = 0x811c_9dc5;
        let src = self.src_ip.map(u32::from).unwrap_or(0);
        let dst = self.dst_ip.map(u32::from).unwrap_or(0);
        for b in src
            .to_be_bytes()
            .into_iter()
            .chain(dst.to_be_bytes())
            .chain(self.src_port.to_be_bytes())
            .chain(self.dst_port.to_be_bytes())
        {
            h ^= b as u32;
            h = h.wrapping_mul(0x0100_0193);
        }
        h
    }
}

/// Match criteria; `None` fields are wildcards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowMatch {
    pub l3: Option<L3Type>,
    pub l4: Option<L4Type>,
    pub src_ip: Option<Ipv4Addr>,
    pub dst_ip: Option<Ipv4Addr>,
}

impl FlowMatch {
    pub fn matches(&self, key: &FlowKey) -> bool {
        fn field<T: PartialEq>(want: Option<T>, got: Option<T>) -> bool {
            want.is_none() || want == got
        }
        field(self.l3, key.l3)
            && field(self.l4, key.l4)
            && field(self.src_ip, key.src_ip)
            && field(self.dst_ip, key.dst_ip)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fwd {
    Drop,
    Rss { queues: ArrayVec<u16, MAX_QUEUE> },
    Pipe(PipeId),
}

impl Fwd {
    pub fn rss(queue: u16) -> Self {
        let mut queues = ArrayVec::new();
        queues.push(queue);
        Fwd::Rss { queues }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeType {
    Basic,
    Control,
}

#[derive(Clone, Debug)]
pub struct PipeCfg {
    pub name: &'static str,
    pub kind: PipeType,
    pub is_root: bool,
    pub match_spec: FlowMatch,
    pub fwd: Option<Fwd>,
    pub miss: Fwd,
    pub count: bool,
}

/// Hit/miss counters of a pipe with the counting monitor enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipeCounters {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct Entry {
    id: EntryId,
    priority: u32,
    match_spec: Option<FlowMatch>,
    fwd: Option<Fwd>,
    committed: bool,
}

#[derive(Debug)]
struct Pipe {
    cfg: PipeCfg,
    entries: Vec<Entry>,
    counters: PipeCounters,
}

impl Pipe {
    fn committed(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|e| e.committed)
    }
}

/// Where the flow table sends a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Queue(u16),
    Drop,
}

#[derive(Debug, Default)]
pub struct FlowEngine {
    started: bool,
    pipes: BTreeMap<PipeId, Pipe>,
    root: Option<PipeId>,
    next_id: u32,
}

impl FlowEngine {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn port_start(&mut self) -> Result<(), Status> {
        if self.started {
            return Err(Status::InUse);
        }
        self.started = true;
        Ok(())
    }

    pub(crate) fn port_stop(&mut self) {
        self.started = false;
        self.pipes.clear();
        self.root = None;
    }

    pub fn pipe_create(&mut self, cfg: PipeCfg) -> Result<PipeId, Status> {
        if !self.started {
            return Err(Status::BadState);
        }
        match cfg.kind {
            PipeType::Basic if cfg.fwd.is_none() => return Err(Status::InvalidValue),
            PipeType::Basic if cfg.is_root => return Err(Status::NotSupported),
            _ => {}
        }
        if cfg.is_root && self.root.is_some() {
            return Err(Status::InUse);
        }
        for fwd in cfg.fwd.iter().chain(std::iter::once(&cfg.miss)) {
            self.check_fwd(fwd)?;
        }
        let id = self.next_id();
        if cfg.is_root {
            self.root = Some(id);
        }
        self.pipes.insert(
            id,
            Pipe {
                cfg,
                entries: Vec::new(),
                counters: PipeCounters::default(),
            },
        );
        Ok(id)
    }

    /// Adds an entry to a basic pipe. `None` matches whatever the pipe
    /// template matches.
    pub fn pipe_add_entry(
        &mut self,
        pipe: PipeId,
        match_spec: Option<FlowMatch>,
    ) -> Result<EntryId, Status> {
        let id = self.next_id();
        let pipe = self.pipes.get_mut(&pipe).ok_or(Status::NotFound)?;
        if pipe.cfg.kind != PipeType::Basic {
            return Err(Status::NotSupported);
        }
        pipe.entries.push(Entry {
            id,
            priority: 0,
            match_spec,
            fwd: None,
            committed: false,
        });
        Ok(id)
    }

    /// Adds a prioritized entry to a control pipe.
    ///
    /// Forwarding into a pipe with no committed entries is refused, so a
    /// control entry never points at a pipe that cannot classify anything.
    pub fn control_add_entry(
        &mut self,
        pipe: PipeId,
        priority: u32,
        match_spec: FlowMatch,
        fwd: Fwd,
    ) -> Result<EntryId, Status> {
        self.check_fwd(&fwd)?;
        if let Fwd::Pipe(target) = fwd {
            if self.pipes[&target].committed().next().is_none() {
                return Err(Status::BadState);
            }
        }
        let id = self.next_id();
        let pipe = self.pipes.get_mut(&pipe).ok_or(Status::NotFound)?;
        if pipe.cfg.kind != PipeType::Control {
            return Err(Status::NotSupported);
        }
        pipe.entries.push(Entry {
            id,
            priority,
            match_spec: Some(match_spec),
            fwd: Some(fwd),
            committed: false,
        });
        Ok(id)
    }

    /// Commits every pending entry. Returns how many were committed.
    pub fn entries_process(&mut self) -> Result<usize, Status> {
        if !self.started {
            return Err(Status::BadState);
        }
        let mut n = 0;
        for entry in self.pipes.values_mut().flat_map(|p| p.entries.iter_mut()) {
            if !entry.committed {
                entry.committed = true;
                n += 1;
            }
        }
        Ok(n)
    }

    /// Destroys a pipe. Pipes still targeted by another pipe's entries or
    /// actions are refused with [`Status::InUse`].
    pub fn pipe_destroy(&mut self, pipe: PipeId) -> Result<(), Status> {
        if !self.pipes.contains_key(&pipe) {
            return Err(Status::NotFound);
        }
        let referenced = self.pipes.iter().filter(|(id, _)| **id != pipe).any(|(_, p)| {
            let target = Fwd::Pipe(pipe);
            p.cfg.fwd.as_ref() == Some(&target)
                || p.cfg.miss == target
                || p.entries.iter().any(|e| e.fwd.as_ref() == Some(&target))
        });
        if referenced {
            return Err(Status::InUse);
        }
        self.pipes.remove(&pipe);
        if self.root == Some(pipe) {
            self.root = None;
        }
        Ok(())
    }

    pub fn committed_entries(&self, pipe: PipeId) -> Option<usize> {
        self.pipes.get(&pipe).map(|p| p.committed().count())
    }

    pub fn counters(&self, pipe: PipeId) -> Option<PipeCounters> {
        self.pipes.get(&pipe).map(|p| p.counters)
    }

    pub fn pipe_count(&self) -> usize {
        self.pipes.len()
    }

    pub fn root(&self) -> Option<PipeId> {
        self.root
    }

    fn check_fwd(&self, fwd: &Fwd) -> Result<(), Status> {
        match fwd {
            Fwd::Pipe(target) if !self.pipes.contains_key(target) => Err(Status::NotFound),
            Fwd::Rss { queues } if queues.is_empty() => Err(Status::InvalidValue),
            _ => Ok(()),
        }
    }

    pub(crate) fn classify(&mut self, key: &FlowKey) -> Verdict {
        let Some(mut pipe_id) = self.root else {
            return Verdict::Drop;
        };
        for _ in 0..MAX_PIPE_HOPS {
            let Some(pipe) = self.pipes.get_mut(&pipe_id) else {
                return Verdict::Drop;
            };
            let fwd = match pipe.cfg.kind {
                PipeType::Control => control_lookup(pipe, key),
                PipeType::Basic => basic_lookup(pipe, key),
            };
            match fwd {
                Fwd::Drop => return Verdict::Drop,
                Fwd::Rss { queues } => {
                    let idx = key.rss_hash() as usize % queues.len();
                    return Verdict::Queue(queues[idx]);
                }
                Fwd::Pipe(next) => pipe_id = next,
            }
        }
        Verdict::Drop
    }
}

fn control_lookup(pipe: &mut Pipe, key: &FlowKey) -> Fwd {
    let hit = pipe
        .committed()
        .filter(|e| e.match_spec.is_none_or(|m| m.matches(key)))
        .min_by_key(|e| (e.priority, e.id))
        .and_then(|e| e.fwd.clone());
    count(pipe, hit.is_some());
    hit.unwrap_or_else(|| pipe.cfg.miss.clone())
}

fn basic_lookup(pipe: &mut Pipe, key: &FlowKey) -> Fwd {
    let template = pipe.cfg.match_spec;
    let hit = template.matches(key)
        && pipe
            .committed()
            .any(|e| e.match_spec.is_none_or(|m| m.matches(key)));
    count(pipe, hit);
    if hit {
        pipe.cfg.fwd.clone().unwrap_or(Fwd::Drop)
    } else {
        pipe.cfg.miss.clone()
    }
}

fn count(pipe: &mut Pipe, hit: bool) {
    if !pipe.cfg.count {
        return;
    }
    if hit {
        pipe.counters.hits += 1;
    } else {
        pipe.counters.misses += 1;
    }
}
