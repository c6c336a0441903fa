//! TCP port allocation for worker endpoints.
//!
//! Allocation is probe-then-use: a port is bound, released, and handed out.
//! Nothing is reserved, so another process can grab the port before the
//! worker binds it. Callers revalidate right before launch and treat a lost
//! race as a retryable start failure.

use std::net::TcpListener;

use serde::{Deserialize, Serialize};

use crate::config::PortsConfig;
use crate::error::{Error, Result};

/// A contiguous range of candidate ports for one purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port to try.
    pub start: u16,
    /// Number of ports to scan.
    pub size: u16,
}

impl PortRange {
    /// Creates a new port range.
    pub const fn new(start: u16, size: u16) -> Self {
        Self { start, size }
    }

    /// Last port in the range, or `None` if the range is empty or overflows.
    pub fn last(&self) -> Option<u16> {
        if self.size == 0 {
            return None;
        }
        self.start.checked_add(self.size - 1)
    }

    /// Returns true if `port` falls inside the range.
    pub fn contains(&self, port: u16) -> bool {
        match self.last() {
            Some(last) => port >= self.start && port <= last,
            None => false,
        }
    }

    /// Returns true if the two ranges share any port.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        match (self.last(), other.last()) {
            (Some(a_last), Some(b_last)) => self.start <= b_last && other.start <= a_last,
            _ => false,
        }
    }
}

/// Returns true if nothing is currently listening on `port`.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Scans up to `range_size` ports from `start_port` and returns the first one
/// that binds.
pub fn allocate(start_port: u16, range_size: u16) -> Result<u16> {
    let candidates = (start_port..=u16::MAX).take(range_size as usize);
    for port in candidates {
        if port == 0 {
            continue;
        }
        if is_port_free(port) {
            return Ok(port);
        }
    }

    Err(Error::ResourceExhausted {
        start: start_port,
        size: range_size,
    })
}

fn allocate_in(range: PortRange) -> Result<u16> {
    allocate(range.start, range.size)
}

/// Ports assigned to one running worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    /// Port the worker's execution server listens on.
    pub execution: u16,
    /// Port for the editor endpoint.
    pub editor: u16,
    /// Generic application ports exposed by the worker.
    pub app: Vec<u16>,
}

impl PortAssignment {
    /// Allocates one port per purpose from the configured ranges.
    ///
    /// Purposes draw from disjoint ranges, so a single assignment never
    /// hands out the same port twice.
    pub fn allocate(config: &PortsConfig) -> Result<Self> {
        let execution = allocate_in(config.execution)?;
        let editor = match config.editor_port {
            Some(port) => port,
            None => allocate_in(config.editor)?,
        };
        let app = vec![allocate_in(config.app_1)?, allocate_in(config.app_2)?];

        Ok(Self {
            execution,
            editor,
            app,
        })
    }

    /// Every port in the assignment.
    pub fn all(&self) -> Vec<u16> {
        let mut ports = vec![self.execution, self.editor];
        ports.extend(&self.app);
        ports
    }

    /// Returns true if every allocated port still binds.
    ///
    /// A fixed editor port is skipped since it was never probed.
    pub fn still_free(&self, config: &PortsConfig) -> bool {
        self.all()
            .into_iter()
            .filter(|port| config.editor_port != Some(*port))
            .all(is_port_free)
    }

    /// Returns true if another process now holds one of the allocated ports.
    ///
    /// Only meaningful once our own worker has exited.
    pub fn contended(&self, config: &PortsConfig) -> bool {
        !self.still_free(config)
    }
}
