use std::{
    future::Future,
    net::{IpAddr, SocketAddr, UdpSocket},
    time::Duration,
};

use igd_next::{
    PortMappingProtocol, SearchOptions,
    aio::{Gateway, tokio::Tokio},
};
use tokio::sync::Mutex;

use crate::error::{GatewayError, NatAction};

const MAPPING_DESCRIPTION: &str = "SLNet game server port mapping";
// 0 asks the gateway for a permanent lease.
const PERMANENT_LEASE: u32 = 0;

/// A gateway that can expose one TCP port. Each call is exactly one attempt;
/// retrying is the caller's business.
pub trait PortMapper: Send + Sync + 'static {
    fn open(&self, port: u16) -> impl Future<Output = Result<(), GatewayError>> + Send;
    fn close(&self, port: u16) -> impl Future<Output = Result<(), GatewayError>> + Send;
    fn external_ip(&self) -> impl Future<Output = Result<IpAddr, GatewayError>> + Send;
}

/// UPnP IGD gateway found by SSDP discovery on the local network.
///
/// The discovered device is cached and dropped after any failed request, so
/// a rebooted router is rediscovered on the next attempt.
pub struct IgdGateway {
    timeout: Duration,
    cached: Mutex<Option<Gateway<Tokio>>>,
}

impl IgdGateway {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cached: Mutex::new(None),
        }
    }

    async fn gateway<'a>(
        &self,
        cached: &'a mut Option<Gateway<Tokio>>,
    ) -> Result<&'a Gateway<Tokio>, GatewayError> {
        if cached.is_none() {
            let options = SearchOptions {
                timeout: Some(self.timeout),
                ..Default::default()
            };
            let found = igd_next::aio::tokio::search_gateway(options)
                .await
                .map_err(|e| GatewayError::Discovery(e.to_string()))?;
            tracing::debug!(gateway = %found.addr, "discovered UPnP gateway");
            *cached = Some(found);
        }
        cached
            .as_ref()
            .ok_or_else(|| GatewayError::Discovery("gateway cache empty".to_string()))
    }

    async fn bounded<T, E: std::fmt::Display>(
        &self,
        fut: impl Future<Output = Result<T, E>>,
        map: impl FnOnce(String) -> GatewayError,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res.map_err(|e| map(e.to_string())),
            Err(_) => Err(GatewayError::Timeout(self.timeout.as_millis() as u64)),
        }
    }
}

impl PortMapper for IgdGateway {
    async fn open(&self, port: u16) -> Result<(), GatewayError> {
        let mut cached = self.cached.lock().await;
        let res = match self.gateway(&mut cached).await {
            Ok(gateway) => match local_addr_toward(gateway.addr, port) {
                Ok(local) => {
                    let added = self
                        .bounded(
                            gateway.add_port(
                                PortMappingProtocol::TCP,
                                port,
                                local,
                                PERMANENT_LEASE,
                                MAPPING_DESCRIPTION,
                            ),
                            |message| GatewayError::Rejected {
                                action: NatAction::Open,
                                port,
                                message,
                            },
                        )
                        .await;
                    if added.is_ok() {
                        tracing::info!(port, %local, "port mapping opened");
                    }
                    added
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if res.is_err() {
            *cached = None;
        }
        res
    }

    async fn close(&self, port: u16) -> Result<(), GatewayError> {
        let mut cached = self.cached.lock().await;
        let res = match self.gateway(&mut cached).await {
            Ok(gateway) => {
                self.bounded(
                    gateway.remove_port(PortMappingProtocol::TCP, port),
                    |message| GatewayError::Rejected {
                        action: NatAction::Close,
                        port,
                        message,
                    },
                )
                .await
            }
            Err(e) => Err(e),
        };
        match &res {
            Ok(()) => tracing::info!(port, "port mapping removed"),
            Err(_) => *cached = None,
        }
        res
    }

    async fn external_ip(&self) -> Result<IpAddr, GatewayError> {
        let mut cached = self.cached.lock().await;
        let res = match self.gateway(&mut cached).await {
            Ok(gateway) => {
                self.bounded(gateway.get_external_ip(), GatewayError::Discovery)
                    .await
            }
            Err(e) => Err(e),
        };
        if res.is_err() {
            *cached = None;
        }
        res
    }
}

/// This host's LAN address on the route toward the gateway. The connected UDP
/// socket sends nothing; connecting only makes the OS pick the interface.
fn local_addr_toward(gateway: SocketAddr, port: u16) -> Result<SocketAddr, GatewayError> {
    let bind: SocketAddr = if gateway.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).map_err(GatewayError::LocalAddress)?;
    socket.connect(gateway).map_err(GatewayError::LocalAddress)?;
    let ip = socket.local_addr().map_err(GatewayError::LocalAddress)?.ip();
    Ok(SocketAddr::new(ip, port))
}
