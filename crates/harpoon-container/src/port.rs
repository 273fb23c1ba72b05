//! ホストポートの確認と割り当て

use crate::error::{ContainerError, Result};
use harpoon_core::{PortSpec, Transport};
use std::net::{TcpListener, UdpSocket};
use tracing::debug;

/// ホスト側のポートが既に使われているか
pub fn is_port_bound(port: &PortSpec) -> bool {
    let Some(host_port) = port.host_port.filter(|p| *p != 0) else {
        return false;
    };
    let host = port.host_ip.as_deref().unwrap_or("127.0.0.1");
    let bound = match port.transport {
        Transport::Tcp => TcpListener::bind((host, host_port)).is_err(),
        Transport::Udp => UdpSocket::bind((host, host_port)).is_err(),
    };
    if bound {
        debug!(port = host_port, transport = %port.transport, "Host port is already bound");
    }
    bound
}

/// 使用中のホストポートがあれば `PortsBound`
pub fn check_ports_available<'a>(ports: impl IntoIterator<Item = &'a PortSpec>) -> Result<()> {
    let bound: Vec<String> = ports
        .into_iter()
        .filter(|port| is_port_bound(port))
        .map(|port| {
            let host_port = port.host_port.unwrap_or_default();
            match port.transport {
                Transport::Tcp => host_port.to_string(),
                Transport::Udp => format!("{}/udp", host_port),
            }
        })
        .collect();

    if bound.is_empty() {
        Ok(())
    } else {
        Err(ContainerError::PortsBound { ports: bound })
    }
}

/// 空いているホストポートを1つ確保する
pub fn allocate_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_port_is_reported() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let spec = PortSpec::new(Some(port), 80);
        match check_ports_available([&spec]) {
            Err(ContainerError::PortsBound { ports }) => assert_eq!(ports, vec![port.to_string()]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_engine_assigned_ports_are_never_bound() {
        let specs = [PortSpec::new(None, 80), PortSpec::new(Some(0), 81)];
        assert!(check_ports_available(&specs).is_ok());
    }

    #[test]
    fn test_allocate_port_returns_free_port() {
        let port = allocate_port().unwrap();
        assert_ne!(port, 0);
        assert!(!is_port_bound(&PortSpec::new(Some(port), 80)));
    }
}
