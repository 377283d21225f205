//! Transport plumbing: TCP ports and mDNS peer discovery.
//!
//! The protocol itself only needs "a bidirectional byte stream to some
//! peer"; this module supplies the streams. Listeners announce an mDNS
//! service, requesters browse for it and dial whatever they find.

use std::collections::HashMap;
use std::net::SocketAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::util;

/// The stream protocol identifier, also advertised as a TXT property.
pub const PROTOCOL: &str = "/P3/1.0.0";

/// The mDNS service type nodes announce and browse.
pub const SERVICE_TYPE: &str = "_p3._tcp.local.";

/// Port range cover-traffic nodes bind in.
pub const FAKE_PORT_MIN: u16 = 5000;

/// Exclusive upper bound of the cover-traffic port range.
pub const FAKE_PORT_MAX: u16 = 60000;

/// An error setting up discovery.
#[derive(Debug, Error)]
pub enum NetError {
    /// The mDNS daemon could not be started or used.
    #[error("mDNS failure")]
    Mdns(#[from] mdns_sd::Error),
}

/// Checks whether a TCP port can still be bound.
pub fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Picks a random free port in the cover-traffic range, avoiding the
/// ports already claimed by this process.
pub fn random_free_port(in_use: &[u16]) -> u16 {
    loop {
        let port = util::random_range(FAKE_PORT_MIN as usize, FAKE_PORT_MAX as usize) as u16;
        if !in_use.contains(&port) && port_is_free(port) {
            return port;
        }
    }
}

/// A live mDNS announcement; dropping it withdraws the service.
pub struct Announcement {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Drop for Announcement {
    fn drop(&mut self) {
        let _ = self.daemon.unregister(&self.fullname);
    }
}

/// Announces a node on the local network.
pub fn announce(instance: &str, port: u16) -> Result<Announcement, NetError> {
    let daemon = ServiceDaemon::new()?;
    let properties: HashMap<String, String> =
        HashMap::from([("proto".to_string(), PROTOCOL.to_string())]);
    let info = ServiceInfo::new(
        SERVICE_TYPE,
        instance,
        &format!("{instance}.local."),
        "",
        port,
        properties,
    )?
    .enable_addr_auto();
    let fullname = info.get_fullname().to_string();
    daemon.register(info)?;
    Ok(Announcement { daemon, fullname })
}

/// Starts browsing for peers; resolved services arrive as socket
/// addresses on the returned channel. Browsing stops when the receiver is
/// dropped.
pub fn browse() -> Result<mpsc::Receiver<SocketAddr>, NetError> {
    let daemon = ServiceDaemon::new()?;
    let events = daemon.browse(SERVICE_TYPE)?;
    let (tx, rx) = mpsc::channel(512);

    tokio::spawn(async move {
        // The daemon must outlive the browse.
        let _daemon = daemon;
        while let Ok(event) = events.recv_async().await {
            if let ServiceEvent::ServiceResolved(info) = event {
                let port = info.get_port();
                for addr in info.get_addresses() {
                    if tx.send(SocketAddr::new((*addr).into(), port)).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    Ok(rx)
}
