use std::net::IpAddr;

use ipnet::IpNet;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid source restriction {entry:?}")]
    Parse { entry: String },
    #[error("source {source_ip} not allowed for instance {instance_id}")]
    Restricted { instance_id: i64, source_ip: IpAddr },
}

/// Parsed `allowed_source_ips` allow-list. Every entry is validated when the
/// restriction is configured; requests only ever see the parsed form. An
/// empty list admits everything.
#[derive(Debug, Clone, Default)]
pub struct Restriction {
    nets: Vec<IpNet>,
}

impl Restriction {
    /// Accepts a comma-separated list of CIDR ranges; bare addresses are
    /// treated as host-length prefixes.
    pub fn parse(csv: &str) -> Result<Self, Error> {
        let nets = csv
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<IpNet>()
                    .or_else(|_| entry.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|_| Error::Parse {
                        entry: entry.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { nets })
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }

    pub fn allows(&self, source_ip: IpAddr) -> bool {
        self.is_empty() || self.nets.iter().any(|net| net.contains(&source_ip))
    }

    pub fn check(&self, instance_id: i64, source_ip: IpAddr) -> Result<(), Error> {
        if self.allows(source_ip) {
            return Ok(());
        }

        Err(Error::Restricted {
            instance_id,
            source_ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_admits_everything() {
        let restriction = Restriction::parse("").unwrap();

        assert!(restriction.is_empty());
        assert!(restriction.allows(ip("8.8.8.8")));
    }

    #[test]
    fn cidr_boundaries() {
        let restriction = Restriction::parse("10.0.0.0/8, 172.16.0.0/12").unwrap();

        assert!(restriction.allows(ip("10.255.255.255")));
        assert!(restriction.allows(ip("172.31.255.255")));

        assert!(!restriction.allows(ip("192.168.1.1")));
        assert!(!restriction.allows(ip("8.8.8.8")));
        assert!(!restriction.allows(ip("172.32.0.1")));
        assert!(!restriction.allows(ip("11.0.0.1")));
    }

    #[test]
    fn bare_address_is_host_prefix() {
        let restriction = Restriction::parse("10.1.2.3").unwrap();

        assert!(restriction.allows(ip("10.1.2.3")));
        assert!(!restriction.allows(ip("10.1.2.4")));
    }

    #[test]
    fn malformed_entries_fail_at_parse_time() {
        assert!(Restriction::parse("not-an-ip").is_err());
        assert!(Restriction::parse("10.0.0.0/33").is_err());
        assert!(Restriction::parse("10.0.0.0/8, nope").is_err());
    }

    #[test]
    fn check_carries_the_denied_source() {
        let restriction = Restriction::parse("10.0.0.0/8").unwrap();

        let err = restriction.check(7, ip("8.8.8.8")).unwrap_err();
        let Error::Restricted {
            instance_id,
            source_ip,
        } = err
        else {
            panic!("expected restriction");
        };

        assert_eq!(instance_id, 7);
        assert_eq!(source_ip, ip("8.8.8.8"));
    }
}
