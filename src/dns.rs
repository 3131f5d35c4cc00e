use dns_lookup::lookup_host;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Resolves `host` to the first IPv4 address it maps to.
///
/// Numeric-looking input is never sent to the resolver, so a malformed
/// dotted quad such as `256.256.256.256` fails without touching the network.
pub async fn resolve_ipv4(host: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    if host.is_empty() || host.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(anyhow::anyhow!("'{}' is not a valid IPv4 address", host));
    }

    if host.parse::<Ipv6Addr>().is_ok() {
        return Err(anyhow::anyhow!("IPv6 address provided but only IPv4 is supported"));
    }

    let addresses = tokio::task::spawn_blocking({
        let hostname = host.to_string();
        move || lookup_host(&hostname)
    })
    .await??;

    addresses
        .into_iter()
        .find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow::anyhow!("No IPv4 addresses found for hostname: {}", host))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_address_parsing() {
        let result = resolve_ipv4("8.8.8.8").await;
        assert_eq!(result.unwrap(), Ipv4Addr::new(8, 8, 8, 8));
    }

    #[tokio::test]
    async fn test_malformed_dotted_quad() {
        assert!(resolve_ipv4("256.256.256.256").await.is_err());
        assert!(resolve_ipv4("10.0.0").await.is_err());
        assert!(resolve_ipv4("").await.is_err());
    }

    #[tokio::test]
    async fn test_ipv6_rejected() {
        assert!(resolve_ipv4("::1").await.is_err());
        assert!(resolve_ipv4("fe80::1").await.is_err());
    }

    #[tokio::test]
    async fn test_localhost_resolution() {
        // Depends on the resolver configuration of the test host
        match resolve_ipv4("localhost").await {
            Ok(ip) => assert!(ip.is_loopback()),
            Err(e) => println!("localhost did not resolve: {}", e),
        }
    }
}
