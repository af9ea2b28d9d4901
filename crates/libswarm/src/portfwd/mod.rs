//! Port-forwarding supervision.
//!
//! Keeps the peer port mapped on the gateway through two backends, NAT-PMP
//! and UPnP. The supervisor moves no bytes itself: it pulses the backends
//! on a timer, aggregates their status, and publishes the externally
//! visible port for trackers to announce.

pub mod natpmp;
pub mod upnp;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::info;

/// Lifetime requested for gateway mappings, in seconds. Mapped ports are
/// re-checked well before this expires.
pub(crate) const MAPPING_LIFETIME_SECS: u32 = 3_600;

/// Per-backend mapping state. The ordering matters: the aggregate status
/// is the numeric max, so an active problem masks a quiet success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MappingStatus {
    Unmapped = 0,
    Mapping = 1,
    Mapped = 2,
    Unmapping = 3,
    Error = 4,
}

impl MappingStatus {
    pub fn label(self) -> &'static str {
        match self {
            MappingStatus::Unmapped => "not forwarded",
            MappingStatus::Mapping => "starting",
            MappingStatus::Mapped => "forwarded",
            MappingStatus::Unmapping => "stopping",
            MappingStatus::Error => "error",
        }
    }
}

/// A gateway mapping client driven by periodic pulses.
#[async_trait]
pub trait PortMappingBackend: Send {
    /// Advance the backend state machine one step. `enabled = false`
    /// drives unmapping; `do_check` asks a mapped backend to re-verify its
    /// mapping.
    async fn pulse(&mut self, private_port: u16, enabled: bool, do_check: bool) -> MappingStatus;

    /// External port observed by the backend, when mapped.
    fn external_port(&self) -> Option<u16> {
        None
    }
}

/// Timer-driven state machine keeping the peer port reachable.
pub struct PortSupervisor {
    natpmp: Box<dyn PortMappingBackend>,
    upnp: Box<dyn PortMappingBackend>,
    natpmp_status: MappingStatus,
    upnp_status: MappingStatus,
    enabled: bool,
    shutting_down: bool,
    do_port_check: bool,
    private_port: u16,
    external_port: watch::Sender<Option<u16>>,
}

impl PortSupervisor {
    pub fn new(
        private_port: u16,
        natpmp: Box<dyn PortMappingBackend>,
        upnp: Box<dyn PortMappingBackend>,
    ) -> Self {
        let (external_port, _) = watch::channel(None);
        Self {
            natpmp,
            upnp,
            natpmp_status: MappingStatus::Unmapped,
            upnp_status: MappingStatus::Unmapped,
            enabled: false,
            shutting_down: false,
            do_port_check: false,
            private_port,
            external_port,
        }
    }

    /// Supervisor wired to the real NAT-PMP and UPnP clients.
    pub fn with_default_backends(private_port: u16) -> Self {
        Self::new(
            private_port,
            Box::new(natpmp::NatPmpBackend::new()),
            Box::new(upnp::UpnpBackend::new()),
        )
    }

    /// Aggregate over both backends: numeric max, so `Error` beats
    /// `Mapped`.
    pub fn status(&self) -> MappingStatus {
        self.natpmp_status.max(self.upnp_status)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn external_port(&self) -> Option<u16> {
        *self.external_port.borrow()
    }

    pub fn watch_external_port(&self) -> watch::Receiver<Option<u16>> {
        self.external_port.subscribe()
    }

    /// One timer tick: consume any pending re-check request and pulse.
    pub async fn pulse(&mut self) {
        let do_check = std::mem::take(&mut self.do_port_check);
        self.nat_pulse(do_check).await;
    }

    async fn nat_pulse(&mut self, do_check: bool) {
        let old = self.status();
        let enabled = self.enabled && !self.shutting_down;

        self.natpmp_status = self.natpmp.pulse(self.private_port, enabled, do_check).await;
        if self.natpmp_status == MappingStatus::Mapped {
            if let Some(port) = self.natpmp.external_port() {
                self.external_port.send_replace(Some(port));
            }
        }

        self.upnp_status = self.upnp.pulse(self.private_port, enabled, do_check).await;

        let new = self.status();
        if new != old {
            info!(from = old.label(), to = new.label(), "port forwarding state changed");
        }
    }

    /// When to tick next. A mapped port is re-checked after 20 minutes to
    /// renew the lease, an error retried after a minute; anything in
    /// progress pulses fast.
    pub fn retime(&mut self) -> Duration {
        match self.status() {
            MappingStatus::Mapped => {
                self.do_port_check = true;
                Duration::from_secs(20 * 60)
            }
            MappingStatus::Error => Duration::from_secs(60),
            _ => Duration::from_millis(333),
        }
    }

    /// Enabling arms the timer for an immediate first tick (driven by the
    /// session); disabling pulses once right away to start unmapping.
    pub async fn enable(&mut self, enabled: bool) {
        if enabled {
            self.enabled = true;
        } else {
            self.enabled = false;
            info!("stopped port forwarding");
            self.nat_pulse(false).await;
        }
    }

    /// The private peer port changed; remap right away when enabled.
    pub async fn port_changed(&mut self, private_port: u16) {
        self.private_port = private_port;
        if self.enabled {
            self.nat_pulse(false).await;
        }
    }

    /// Final unmap on session shutdown.
    pub async fn close(&mut self) {
        self.shutting_down = true;
        self.nat_pulse(false).await;
    }
}
