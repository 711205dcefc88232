//! Endpoint addressing
//!
//! An endpoint address names a reachable memory resource:
//!
//! ```text
//! protocol ":" [resource (":" | ";")] size "." maxMailboxes "." mailbox
//! ```
//!
//! The trailing numeric triplet is read right to left, so drivers may put any
//! text (including dots and colons) in the resource part. The canonical form
//! produced by [`EndPointAddress`]'s `Display` uses `:` as the resource
//! separator.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::constants::MAX_MAILBOXES;
use crate::error::{Result, TransportError};

/// Parsed endpoint address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndPointAddress {
    pub protocol: String,
    /// Driver-specific resource text preceding the numeric triplet
    pub resource: String,
    /// Size of the endpoint's memory region in bytes
    pub size: usize,
    pub max_mailboxes: u32,
    pub mailbox: u32,
}

impl EndPointAddress {
    pub fn new(
        protocol: impl Into<String>,
        resource: impl Into<String>,
        size: usize,
        max_mailboxes: u32,
        mailbox: u32,
    ) -> Result<Self> {
        let address = Self {
            protocol: protocol.into(),
            resource: resource.into(),
            size,
            max_mailboxes,
            mailbox,
        };
        address.validate(&address.to_string())?;
        Ok(address)
    }

    pub fn parse(input: &str) -> Result<Self> {
        let (protocol, suffix) = input
            .split_once(':')
            .ok_or_else(|| TransportError::malformed(input, "missing protocol separator"))?;
        if protocol.is_empty() {
            return Err(TransportError::malformed(input, "empty protocol"));
        }

        let mut fields = suffix.rsplitn(3, '.');
        let mailbox = fields.next().unwrap_or_default();
        let max_mailboxes = fields
            .next()
            .ok_or_else(|| TransportError::malformed(input, "missing maxMailboxes field"))?;
        let head = fields
            .next()
            .ok_or_else(|| TransportError::malformed(input, "missing size field"))?;

        let digits = head
            .bytes()
            .rev()
            .take_while(|b| b.is_ascii_digit())
            .count();
        let (resource, size) = head.split_at(head.len() - digits);
        let resource = resource
            .strip_suffix(':')
            .or_else(|| resource.strip_suffix(';'))
            .unwrap_or(resource);

        let size = parse_number::<usize>(input, "size", size)?;
        let max_mailboxes = parse_number::<u32>(input, "maxMailboxes", max_mailboxes)?;
        let mailbox = parse_number::<u32>(input, "mailbox", mailbox)?;

        let address = Self {
            protocol: protocol.to_string(),
            resource: resource.to_string(),
            size,
            max_mailboxes,
            mailbox,
        };
        address.validate(input)?;
        Ok(address)
    }

    fn validate(&self, input: &str) -> Result<()> {
        if self.protocol.is_empty() || self.protocol.contains(':') {
            return Err(TransportError::malformed(input, "invalid protocol name"));
        }
        if self.max_mailboxes == 0 || self.max_mailboxes > MAX_MAILBOXES {
            return Err(TransportError::malformed(
                input,
                format!("maxMailboxes must be between 1 and {}", MAX_MAILBOXES),
            ));
        }
        if self.mailbox >= self.max_mailboxes {
            return Err(TransportError::malformed(
                input,
                format!(
                    "mailbox {} is not below maxMailboxes {}",
                    self.mailbox, self.max_mailboxes
                ),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(input: &str, field: &str, text: &str) -> Result<T> {
    text.parse::<T>()
        .map_err(|_| TransportError::malformed(input, format!("{} '{}' is not a number", field, text)))
}

impl fmt::Display for EndPointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.protocol)?;
        if !self.resource.is_empty() {
            write!(f, "{}:", self.resource)?;
        }
        write!(f, "{}.{}.{}", self.size, self.max_mailboxes, self.mailbox)
    }
}

impl FromStr for EndPointAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A resolved endpoint shared by every holder of the same canonical address
#[derive(Debug)]
pub struct EndPoint {
    address: EndPointAddress,
    canonical: String,
    local: AtomicBool,
}

impl EndPoint {
    fn new(address: EndPointAddress) -> Self {
        let canonical = address.to_string();
        Self {
            address,
            canonical,
            local: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &EndPointAddress {
        &self.address
    }

    pub fn protocol(&self) -> &str {
        &self.address.protocol
    }

    pub fn mailbox(&self) -> u32 {
        self.address.mailbox
    }

    pub fn size(&self) -> usize {
        self.address.size
    }

    /// Canonical address string
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Whether the memory behind this endpoint was created by this participant
    pub fn is_local(&self) -> bool {
        self.local.load(Ordering::Acquire)
    }

    pub(crate) fn mark_local(&self) {
        self.local.store(true, Ordering::Release);
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Endpoint identity cache keyed by canonical address
#[derive(Debug, Default)]
pub struct EndpointCache {
    entries: HashMap<String, Arc<EndPoint>>,
}

impl EndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `input` and return the shared endpoint for its canonical form
    ///
    /// Returns the endpoint and whether this call created it.
    pub fn resolve(&mut self, input: &str) -> Result<(Arc<EndPoint>, bool)> {
        let address = EndPointAddress::parse(input)?;
        let canonical = address.to_string();
        if let Some(existing) = self.entries.get(&canonical) {
            return Ok((Arc::clone(existing), false));
        }

        let endpoint = Arc::new(EndPoint::new(address));
        tracing::debug!("Resolved new endpoint {}", canonical);
        self.entries.insert(canonical, Arc::clone(&endpoint));
        Ok((endpoint, true))
    }

    pub fn get(&self, canonical: &str) -> Option<Arc<EndPoint>> {
        self.entries.get(canonical).cloned()
    }

    /// Drop a cached endpoint so a later resolve builds a fresh identity
    pub fn evict(&mut self, canonical: &str) -> Option<Arc<EndPoint>> {
        self.entries.remove(canonical)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_colon_form() {
        let addr = EndPointAddress::parse("shm:dp_region:1048576.8.3").unwrap();
        assert_eq!(addr.protocol, "shm");
        assert_eq!(addr.resource, "dp_region");
        assert_eq!(addr.size, 1048576);
        assert_eq!(addr.max_mailboxes, 8);
        assert_eq!(addr.mailbox, 3);
    }

    #[test]
    fn test_parse_semicolon_variant() {
        let addr = EndPointAddress::parse("ocpi-smb-pio:pioXfer123;4096.2.1").unwrap();
        assert_eq!(addr.protocol, "ocpi-smb-pio");
        assert_eq!(addr.resource, "pioXfer123");
        assert_eq!(addr.size, 4096);
        assert_eq!(addr.to_string(), "ocpi-smb-pio:pioXfer123:4096.2.1");
    }

    #[test]
    fn test_parse_driver_text_with_dots() {
        let addr = EndPointAddress::parse("socket:10.0.0.1:4000;65536.4.0").unwrap();
        assert_eq!(addr.resource, "10.0.0.1:4000");
        assert_eq!(addr.size, 65536);
        assert_eq!(addr.max_mailboxes, 4);
        assert_eq!(addr.mailbox, 0);
    }

    #[test]
    fn test_parse_without_resource() {
        let addr = EndPointAddress::parse("local:1024.2.1").unwrap();
        assert_eq!(addr.resource, "");
        assert_eq!(addr.to_string(), "local:1024.2.1");
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "no-separator",
            ":res:10.2.1",
            "shm:res:10.2",
            "shm:res:abc.2.1",
            "shm:res:10.x.1",
            "shm:res:10.2.y",
            "shm:res:10.2.2",
            "shm:res:10.0.0",
            "shm:res:.2.1",
        ] {
            let err = EndPointAddress::parse(bad).unwrap_err();
            assert!(
                matches!(err, TransportError::MalformedAddress { .. }),
                "{} should be malformed, got {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_cache_returns_same_identity() {
        let mut cache = EndpointCache::new();
        let (a, created_a) = cache.resolve("local:r1;4096.4.2").unwrap();
        let (b, created_b) = cache.resolve("local:r1:4096.4.2").unwrap();
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));

        a.mark_local();
        assert!(b.is_local());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_evict() {
        let mut cache = EndpointCache::new();
        let (a, _) = cache.resolve("local:r1:4096.4.2").unwrap();
        cache.evict(a.as_str());
        let (b, created) = cache.resolve("local:r1:4096.4.2").unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&a, &b));
    }

    proptest! {
        #[test]
        fn prop_format_parse_roundtrip(
            protocol in "[a-z][a-z0-9-]{0,11}",
            resource in "[a-zA-Z0-9_./;:-]{0,16}",
            size in 0usize..(1 << 40),
            max in 1u32..=MAX_MAILBOXES,
            mailbox_seed in any::<u32>(),
        ) {
            let mailbox = mailbox_seed % max;
            let addr = EndPointAddress::new(protocol, resource, size, max, mailbox).unwrap();
            let parsed = EndPointAddress::parse(&addr.to_string()).unwrap();
            prop_assert_eq!(parsed, addr);
        }
    }
}
