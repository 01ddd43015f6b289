use std::net::{IpAddr, Ipv4Addr, TcpListener};

/// True if nothing is listening on `port` at `bind_address`.
///
/// The test listener is dropped before returning, so the answer can be stale
/// by the time the helper binds.
pub(crate) fn is_port_free(bind_address: &str, port: u16) -> bool {
    let addr: IpAddr = bind_address
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    TcpListener::bind((addr, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupied_port_is_not_free() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_free("127.0.0.1", port));

        drop(listener);
        assert!(is_port_free("127.0.0.1", port));
    }
}
