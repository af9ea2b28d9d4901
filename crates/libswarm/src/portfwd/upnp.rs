//! UPnP (IGD) backend.
//!
//! Gateway discovery and the mapping calls are delegated to the `igd`
//! client; this keeps only the pulse-driven state and the route lookup for
//! the local address to map.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use async_trait::async_trait;
use igd::aio::{search_gateway, Gateway};
use igd::{PortMappingProtocol, SearchOptions};
use tracing::{debug, info, warn};

use super::{MappingStatus, PortMappingBackend, MAPPING_LIFETIME_SECS};
use crate::error::SwarmError;

const MAPPING_DESCRIPTION: &str = "libswarm";

pub struct UpnpBackend {
    gateway: Option<Gateway>,
    state: MappingStatus,
    mapped_port: Option<u16>,
}

impl Default for UpnpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl UpnpBackend {
    pub fn new() -> Self {
        Self {
            gateway: None,
            state: MappingStatus::Unmapped,
            mapped_port: None,
        }
    }
}

#[async_trait]
impl PortMappingBackend for UpnpBackend {
    async fn pulse(&mut self, private_port: u16, enabled: bool, do_check: bool) -> MappingStatus {
        if enabled && self.gateway.is_none() {
            self.state = MappingStatus::Mapping;
            match search_gateway(SearchOptions::default()).await {
                Ok(gateway) => {
                    debug!(gateway = %gateway.addr, "found upnp gateway");
                    self.gateway = Some(gateway);
                }
                Err(err) => {
                    debug!(error = %err, "upnp gateway discovery failed");
                    self.state = MappingStatus::Error;
                    return self.state;
                }
            }
        }

        match (self.gateway.take(), enabled) {
            (Some(gateway), true) => {
                if self.state == MappingStatus::Mapped && !do_check {
                    self.gateway = Some(gateway);
                } else {
                    match self.map(&gateway, private_port).await {
                        Ok(()) => {
                            if self.state != MappingStatus::Mapped {
                                info!(port = private_port, "upnp port mapped");
                            }
                            self.mapped_port = Some(private_port);
                            self.state = MappingStatus::Mapped;
                            self.gateway = Some(gateway);
                        }
                        Err(err) => {
                            warn!(error = %err, "upnp mapping failed");
                            self.mapped_port = None;
                            self.state = MappingStatus::Error;
                        }
                    }
                }
            }
            (Some(gateway), false) => {
                if let Some(port) = self.mapped_port.take() {
                    self.state = MappingStatus::Unmapping;
                    match gateway.remove_port(PortMappingProtocol::TCP, port).await {
                        Ok(()) => info!(port, "upnp mapping removed"),
                        Err(err) => debug!(error = %err, "upnp unmap failed"),
                    }
                }
                self.state = MappingStatus::Unmapped;
            }
            (None, false) => {
                self.state = MappingStatus::Unmapped;
            }
            (None, true) => {}
        }

        self.state
    }

    fn external_port(&self) -> Option<u16> {
        if self.state == MappingStatus::Mapped {
            self.mapped_port
        } else {
            None
        }
    }
}

impl UpnpBackend {
    async fn map(&self, gateway: &Gateway, private_port: u16) -> Result<(), SwarmError> {
        let local = local_address_toward(gateway.addr)?;
        gateway
            .add_port(
                PortMappingProtocol::TCP,
                private_port,
                SocketAddrV4::new(local, private_port),
                MAPPING_LIFETIME_SECS,
                MAPPING_DESCRIPTION,
            )
            .await
            .map_err(|err| SwarmError::PortMapping(err.to_string()))
    }
}

/// Local IPv4 address the OS routes toward the gateway.
fn local_address_toward(gateway: SocketAddrV4) -> Result<Ipv4Addr, SwarmError> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    probe.connect(gateway)?;
    match probe.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(_) => Err(SwarmError::PortMapping("gateway route is not ipv4".into())),
    }
}
