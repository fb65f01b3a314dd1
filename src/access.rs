//! Static whitelist/blacklist matching.
//!
//! An entry containing `/` is an address mask such as `192.168.1.0/24` or
//! `2001:db8::/32`. Anything else is compared verbatim against the client
//! identifier, so non-address identifiers work as well.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Literal(String),
    Mask(IpNet),
}

/// A parsed whitelist or blacklist.
#[derive(Debug, Clone, Default)]
pub struct AddrList {
    entries: Vec<Entry>,
}

impl AddrList {
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self, ConfigError> {
        let entries = items
            .iter()
            .map(|item| {
                let item = item.as_ref();
                if item.contains('/') {
                    item.parse::<IpNet>()
                        .map(Entry::Mask)
                        .map_err(|source| ConfigError::InvalidMask {
                            mask: item.to_string(),
                            source,
                        })
                } else {
                    Ok(Entry::Literal(item.to_string()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn matches(&self, client_id: &str) -> bool {
        // parsed lazily, most lists are literal-only
        let mut ip: Option<Option<IpAddr>> = None;
        self.entries.iter().any(|entry| match entry {
            Entry::Literal(id) => id == client_id,
            Entry::Mask(net) => ip
                .get_or_insert_with(|| client_id.parse().ok())
                .is_some_and(|ip| net.contains(&ip)),
        })
    }
}
