//! NAT-PMP backend.
//!
//! Thin state machine over the `natpmp` client. Requests are single UDP
//! datagrams, so each pulse either fires a request or polls for the
//! gateway's answer without blocking the caller.

use async_trait::async_trait;
use natpmp::{Natpmp, Protocol, Response};
use tracing::{debug, info, warn};

use super::{MappingStatus, PortMappingBackend, MAPPING_LIFETIME_SECS};

pub struct NatPmpBackend {
    client: Option<Natpmp>,
    state: MappingStatus,
    external_port: Option<u16>,
}

impl Default for NatPmpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NatPmpBackend {
    pub fn new() -> Self {
        Self {
            client: None,
            state: MappingStatus::Unmapped,
            external_port: None,
        }
    }

    fn client(&mut self) -> Option<&mut Natpmp> {
        if self.client.is_none() {
            match Natpmp::new() {
                Ok(client) => self.client = Some(client),
                Err(err) => debug!(error = ?err, "nat-pmp gateway unavailable"),
            }
        }
        self.client.as_mut()
    }

    /// Fire a mapping (or, with `lifetime` 0, unmapping) request.
    fn request(&mut self, private_port: u16, lifetime: u32) -> bool {
        let Some(client) = self.client() else {
            self.state = MappingStatus::Error;
            return false;
        };
        match client.send_port_mapping_request(Protocol::TCP, private_port, private_port, lifetime)
        {
            Ok(()) => {
                debug!(port = private_port, lifetime, "sent nat-pmp mapping request");
                true
            }
            Err(err) => {
                warn!(error = ?err, "nat-pmp request failed");
                self.state = MappingStatus::Error;
                false
            }
        }
    }

    /// Poll for the gateway's answer to an outstanding request.
    fn poll(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        match client.read_response_or_retry() {
            Ok(Response::TCP(mapping)) => {
                if self.state == MappingStatus::Unmapping {
                    info!("nat-pmp mapping removed");
                    self.external_port = None;
                    self.state = MappingStatus::Unmapped;
                } else {
                    info!(external_port = mapping.public_port(), "nat-pmp port mapped");
                    self.external_port = Some(mapping.public_port());
                    self.state = MappingStatus::Mapped;
                }
            }
            Ok(_) => {}
            Err(natpmp::Error::NATPMP_TRYAGAIN) => {}
            Err(err) => {
                warn!(error = ?err, "nat-pmp response error");
                self.state = MappingStatus::Error;
            }
        }
    }
}

#[async_trait]
impl PortMappingBackend for NatPmpBackend {
    async fn pulse(&mut self, private_port: u16, enabled: bool, do_check: bool) -> MappingStatus {
        match self.state {
            MappingStatus::Unmapped | MappingStatus::Error if enabled => {
                if self.request(private_port, MAPPING_LIFETIME_SECS) {
                    self.state = MappingStatus::Mapping;
                }
            }
            MappingStatus::Mapping | MappingStatus::Unmapping => {
                self.poll();
            }
            MappingStatus::Mapped if !enabled => {
                if self.request(private_port, 0) {
                    self.state = MappingStatus::Unmapping;
                }
            }
            MappingStatus::Mapped if do_check => {
                // renew the lease before it expires
                if self.request(private_port, MAPPING_LIFETIME_SECS) {
                    self.state = MappingStatus::Mapping;
                }
            }
            _ => {}
        }
        self.state
    }

    fn external_port(&self) -> Option<u16> {
        self.external_port
    }
}
