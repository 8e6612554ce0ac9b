use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// Numeric status returned by every device-layer call.
///
/// The numbering follows the hardware SDK so a logged status can be looked up
/// directly in vendor documentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Status {
    Unknown = 1,
    NotPermitted = 2,
    InUse = 3,
    NotSupported = 4,
    Again = 5,
    InvalidValue = 6,
    NoMemory = 7,
    Initialization = 8,
    TimedOut = 9,
    Shutdown = 10,
    NotFound = 14,
    Driver = 22,
    BadState = 26,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn describe(self) -> &'static str {
        match self {
            Status::Unknown => "unknown error",
            Status::NotPermitted => "operation not permitted",
            Status::InUse => "resource already in use",
            Status::NotSupported => "operation not supported",
            Status::Again => "resource temporarily unavailable",
            Status::InvalidValue => "invalid input",
            Status::NoMemory => "out of memory",
            Status::Initialization => "initialization failed",
            Status::TimedOut => "timed out",
            Status::Shutdown => "device is shutting down",
            Status::NotFound => "resource not found",
            Status::Driver => "driver error",
            Status::BadState => "bad state",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.describe())
    }
}

impl std::error::Error for Status {}

/// Source location of the device call that produced an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for CallSite {
    fn from(loc: &'static Location<'static>) -> Self {
        Self {
            file: loc.file(),
            line: loc.line(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("device init error at {site}: {what}: {status}")]
    DeviceInit {
        site: CallSite,
        what: String,
        status: Status,
    },
    #[error("receive queue allocation error at {site}: {status}")]
    QueueAlloc { site: CallSite, status: Status },
    #[error("flow configuration error at {site}: {call}: {status}")]
    FlowConfig {
        site: CallSite,
        call: &'static str,
        status: Status,
    },
    #[error("kernel launch error at {site}: {kernel}: {status}")]
    KernelLaunch {
        site: CallSite,
        kernel: &'static str,
        status: Status,
    },
    #[error("stream synchronization error at {site}: stream {stream}: {status}")]
    StreamSync {
        site: CallSite,
        stream: u32,
        status: Status,
    },
    #[error("device allocation of {requested} bytes failed at {site}: {available} bytes available")]
    Allocation {
        site: CallSite,
        requested: usize,
        available: usize,
    },
    #[error("invalid traffic filter {input:?}: {reason}")]
    FilterParse { input: String, reason: String },
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },
    #[error("cannot replay {path}: {reason}")]
    Replay { path: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lifts a raw device-layer result into the error taxonomy, recording the
/// caller's location.
pub trait StatusExt<T> {
    fn or_device_init(self, what: &str) -> Result<T>;
    fn or_queue_alloc(self) -> Result<T>;
    fn or_flow_config(self, call: &'static str) -> Result<T>;
}

impl<T> StatusExt<T> for std::result::Result<T, Status> {
    #[track_caller]
    fn or_device_init(self, what: &str) -> Result<T> {
        let site = CallSite::caller();
        self.map_err(|status| Error::DeviceInit {
            site,
            what: what.to_owned(),
            status,
        })
    }

    #[track_caller]
    fn or_queue_alloc(self) -> Result<T> {
        let site = CallSite::caller();
        self.map_err(|status| Error::QueueAlloc { site, status })
    }

    #[track_caller]
    fn or_flow_config(self, call: &'static str) -> Result<T> {
        let site = CallSite::caller();
        self.map_err(|status| Error::FlowConfig { site, call, status })
    }
}

impl Error {
    /// Hardware status attached to this error, if it came from a device call.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::DeviceInit { status, .. }
            | Error::QueueAlloc { status, .. }
            | Error::FlowConfig { status, .. }
            | Error::KernelLaunch { status, .. }
            | Error::StreamSync { status, .. } => Some(*status),
            Error::Allocation { .. } => Some(Status::NoMemory),
            Error::FilterParse { .. } | Error::InvalidConfig { .. } | Error::Replay { .. } => None,
        }
    }
}
