use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};

/// Most upstreams a single node may be configured with.
pub(crate) const MAX_UPSTREAMS: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scheme {
    Dns,
    Tls,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Upstream {
    pub addr: SocketAddr,
    pub scheme: Scheme,
}

/// Parses `[dns://|tls://]host[:port]`. The port defaults to 53, and a
/// `tls://` upstream left on port 53 is moved to 853.
pub(crate) fn parse_upstream(raw: &str) -> Result<Upstream> {
    let (scheme, rest) = if let Some(rest) = raw.strip_prefix("tls://") {
        (Scheme::Tls, rest)
    } else if let Some(rest) = raw.strip_prefix("dns://") {
        (Scheme::Dns, rest)
    } else {
        (Scheme::Dns, raw)
    };

    let mut addr = parse_host_port(rest)?;
    if scheme == Scheme::Tls && addr.port() == 53 {
        addr.set_port(853);
    }
    Ok(Upstream { addr, scheme })
}

fn parse_host_port(raw: &str) -> Result<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip = raw
        .parse::<IpAddr>()
        .with_context(|| format!("invalid upstream address {:?}", raw))?;
    Ok(SocketAddr::new(ip, 53))
}

/// Lowercases a domain name and makes it fully qualified.
pub(crate) fn normalize_domain(name: &str) -> String {
    let mut name = name.trim().to_ascii_lowercase();
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Loads the client TLS material for `tls://` upstreams.
///
/// One argument is a CA bundle, two are a client certificate and key, and
/// three are certificate, key and CA.
pub(crate) fn client_tls_config(args: &[String]) -> Result<Arc<rustls::ClientConfig>> {
    let (cert_key, ca) = match args {
        [ca] => (None, Some(ca.as_str())),
        [cert, key] => (Some((cert.as_str(), key.as_str())), None),
        [cert, key, ca] => (Some((cert.as_str(), key.as_str())), Some(ca.as_str())),
        _ => bail!("tls expects a ca, a cert and key, or a cert, key and ca"),
    };

    let mut roots = rustls::RootCertStore::empty();
    if let Some(ca) = ca {
        for cert in read_certs(ca)? {
            roots
                .add(&cert)
                .map_err(|error| anyhow!("invalid ca certificate in {}: {:?}", ca, error))?;
        }
    }

    let builder = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);
    let config = match cert_key {
        Some((cert, key)) => builder
            .with_single_cert(read_certs(cert)?, read_key(key)?)
            .context("invalid client certificate")?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn read_certs(path: &str) -> Result<Vec<rustls::Certificate>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .with_context(|| format!("failed to read certificates from {}", path))?;
    Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn read_key(path: &str) -> Result<rustls::PrivateKey> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path))?;
    let keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(file))
        .with_context(|| format!("failed to read private key from {}", path))?;
    keys.into_iter()
        .next()
        .map(rustls::PrivateKey)
        .ok_or_else(|| anyhow!("no pkcs8 private key in {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_scheme_defaults_to_dns() {
        let upstream = parse_upstream("203.0.113.10:53").unwrap();
        assert_eq!(upstream.scheme, Scheme::Dns);
        assert_eq!(upstream.addr, "203.0.113.10:53".parse().unwrap());
    }

    #[test]
    fn upstream_port_defaults_to_53() {
        let upstream = parse_upstream("dns://203.0.113.10").unwrap();
        assert_eq!(upstream.addr.port(), 53);
    }

    #[test]
    fn tls_upstreams_move_off_port_53() {
        let upstream = parse_upstream("tls://203.0.113.10").unwrap();
        assert_eq!(upstream.scheme, Scheme::Tls);
        assert_eq!(upstream.addr.port(), 853);

        // An explicit non-53 port is the operator's choice.
        let upstream = parse_upstream("tls://203.0.113.10:9953").unwrap();
        assert_eq!(upstream.addr.port(), 9953);
    }

    #[test]
    fn garbage_upstreams_are_rejected() {
        assert!(parse_upstream("not an address").is_err());
    }

    #[test]
    fn domains_are_lowercased_and_rooted() {
        assert_eq!(normalize_domain("Cluster.External"), "cluster.external.");
        assert_eq!(normalize_domain("cluster.external."), "cluster.external.");
    }
}
