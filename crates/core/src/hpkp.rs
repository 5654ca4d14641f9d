//! HTTP Public Key Pinning (RFC 7469) host cache.
//!
//! Binds hosts to sets of accepted public-key digests. The HTTP client
//! feeds records in from `Public-Key-Pins` response headers and asks,
//! after each TLS handshake, whether the presented public key matches a
//! stored pin.

use std::io::{self, Write};
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::domain::parent_domains;
use crate::error::Error;
use crate::persist::{self, LoadOutcome};
use crate::store::{PolicyRecord, PolicyStore};
use crate::time;

/// Capability surface of a key-pin database.
///
/// The built-in [`HpkpStore`] implements it; an external module may
/// register a replacement with a higher priority (see
/// `fetchguard-plugin`).
pub trait KeyPinDatabase: Send + Sync {
    /// Populate the store from its backing file, if one is configured
    /// and has changed since the last load.
    fn load(&self) -> Result<LoadOutcome, Error>;

    /// Write all unexpired records with at least one pin back to the
    /// backing file, merging records another process saved meanwhile.
    fn save(&self) -> Result<(), Error>;

    /// Record a policy update. Ownership of the record moves into the
    /// store; a record with no pins or zero max-age revokes the entry
    /// for its host.
    fn add(&self, record: HpkpRecord);

    /// Validate a presented public key against the stored pins for
    /// `host` (or a covering parent domain).
    fn check_pubkey(&self, host: &str, pubkey: &[u8]) -> PinVerdict;
}

/// Outcome of validating a presented public key against the pin cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinVerdict {
    /// Host is pinned and the key matches one of its pins.
    Accepted,
    /// Host is not covered by any pin set.
    NotCovered,
    /// Digest computation failed.
    HashError,
    /// Host is pinned but the key matches none of its pins.
    Rejected,
}

impl PinVerdict {
    /// Numeric code used across the capability boundary: 1 accepted,
    /// 0 not covered, -1 hash failure, -2 rejected.
    pub fn code(self) -> i32 {
        match self {
            PinVerdict::Accepted => 1,
            PinVerdict::NotCovered => 0,
            PinVerdict::HashError => -1,
            PinVerdict::Rejected => -2,
        }
    }
}

/// One accepted public-key digest.
///
/// Keeps both the binary digest (for comparisons) and its base64 form
/// (for the on-disk format) so neither path ever re-encodes.
#[derive(Debug, Clone, Eq)]
pub struct Pin {
    pub hash_type: String,
    pub digest: Vec<u8>,
    pub digest_b64: String,
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        self.hash_type == other.hash_type && self.digest == other.digest
    }
}

impl Pin {
    /// Decode a base64 pin as found in a `Public-Key-Pins` header or a
    /// cache file.
    pub fn decode(hash_type: &str, b64: &str) -> Result<Self, Error> {
        let digest = BASE64.decode(b64).map_err(|_| Error::Parse(format!("{hash_type} {b64}")))?;
        Ok(Self { hash_type: hash_type.to_string(), digest, digest_b64: b64.to_string() })
    }

    /// Pin for a raw SPKI digest, keeping the base64 form alongside.
    pub fn from_digest(hash_type: &str, digest: Vec<u8>) -> Self {
        let digest_b64 = BASE64.encode(&digest);
        Self { hash_type: hash_type.to_string(), digest, digest_b64 }
    }
}

/// One learned HPKP policy: a host bound to a set of accepted pins until
/// `expires`.
#[derive(Debug, Clone, PartialEq)]
pub struct HpkpRecord {
    pub host: String,
    pub created: i64,
    pub max_age: i64,
    pub expires: i64,
    pub include_subdomains: bool,
    pub pins: Vec<Pin>,
}

impl HpkpRecord {
    /// Build a record created now. See [`HpkpRecord::with_created`].
    pub fn new(host: impl Into<String>, max_age: i64, include_subdomains: bool) -> Self {
        Self::with_created(host, time::now(), max_age, include_subdomains)
    }

    /// Build a record with clamped timestamps and an empty pin set. A
    /// non-positive or overflowing max-age yields a revocation record.
    pub fn with_created(host: impl Into<String>, created: i64, max_age: i64, include_subdomains: bool) -> Self {
        let created = time::clamp_epoch(created);
        let max_age = time::clamp_epoch(max_age);
        Self {
            host: host.into(),
            created,
            max_age,
            expires: time::expiry(created, max_age),
            include_subdomains,
            pins: Vec::new(),
        }
    }

    /// Add a pin, ignoring duplicates of the same (hash type, digest).
    pub fn add_pin(&mut self, pin: Pin) {
        if !self.pins.contains(&pin) {
            self.pins.push(pin);
        }
    }
}

impl PolicyRecord for HpkpRecord {
    type Key = String;

    fn key(&self) -> String {
        self.host.clone()
    }

    fn is_revocation(&self) -> bool {
        self.max_age == 0 || self.pins.is_empty()
    }

    fn expires_at(&self) -> i64 {
        self.expires
    }

    fn merge_from(&mut self, incoming: Self) {
        // Same conservative rule as HSTS: an out-of-order duplicate must
        // not move the record backward in time. The pin set is replaced
        // wholesale; pins no longer advertised are forgotten.
        if incoming.created > self.created {
            self.created = incoming.created;
        }
        self.max_age = incoming.max_age;
        self.expires = incoming.expires;
        self.include_subdomains = incoming.include_subdomains;
        self.pins = incoming.pins;
    }
}

/// The built-in key-pin store: a mutex-guarded map persisted to a flat
/// file, one host line followed by its `*`-prefixed pin lines.
#[derive(Debug)]
pub struct HpkpStore {
    inner: PolicyStore<HpkpRecord>,
}

impl HpkpStore {
    /// Create an empty store. Nothing is read from disk until
    /// [`KeyPinDatabase::load`] runs.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { inner: PolicyStore::new(path) }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of parse passes over the backing file, for staleness
    /// tests.
    pub fn parse_passes(&self) -> u64 {
        self.inner.parse_passes()
    }

    /// One line of the cache file. A host line commits the group built
    /// so far through the merge-on-add path, so pin-less or expired
    /// groups are discarded by the revocation rule.
    fn parse_line(&self, line: &str, pending: &mut Option<HpkpRecord>, now: i64) {
        if let Some(rest) = line.strip_prefix('*') {
            let Some(current) = pending.as_mut() else {
                warn!(line, "skipping HPKP pin line with no preceding host");
                return;
            };
            let mut fields = rest.split_ascii_whitespace();
            match (fields.next(), fields.next()) {
                (Some(hash_type), Some(b64)) => match Pin::decode(hash_type, b64) {
                    Ok(pin) => current.add_pin(pin),
                    Err(_) => warn!(line, "failed to parse HPKP pin line"),
                },
                _ => warn!(line, "failed to parse HPKP pin line"),
            }
        } else {
            if let Some(record) = pending.take() {
                self.inner.add(record);
            }
            match parse_host_line(line) {
                Some(record) if record.max_age != 0 && record.expires >= now => *pending = Some(record),
                Some(record) => debug!(host = %record.host, "dropping expired HPKP entry"),
                None => warn!(line, "failed to parse HPKP host line"),
            }
        }
    }
}

/// `<host> <includeSubdomains> <created> <maxage>`
fn parse_host_line(line: &str) -> Option<HpkpRecord> {
    let mut fields = line.split_ascii_whitespace();
    let host = fields.next()?;
    let include_subdomains = fields.next()?.parse::<i64>().ok()? != 0;
    let created = fields.next()?.parse::<i64>().ok()?;
    let max_age = fields.next()?.parse::<i64>().ok()?;
    Some(HpkpRecord::with_created(host, created, max_age, include_subdomains))
}

fn write_record(out: &mut dyn Write, r: &HpkpRecord) -> io::Result<()> {
    writeln!(out, "{} {} {} {}", r.host, r.include_subdomains as u8, r.created, r.max_age)?;
    for pin in &r.pins {
        writeln!(out, "*{} {}", pin.hash_type, pin.digest_b64)?;
    }
    Ok(())
}

impl KeyPinDatabase for HpkpStore {
    fn load(&self) -> Result<LoadOutcome, Error> {
        let now = time::now();
        let mut pending: Option<HpkpRecord> = None;
        let outcome = persist::load_lines(self.inner.path(), self.inner.last_load(), |line| {
            self.parse_line(line, &mut pending, now);
        })?;
        // Commit the group still open at end of file.
        if let Some(record) = pending.take() {
            self.inner.add(record);
        }
        if outcome == LoadOutcome::Loaded {
            self.inner.note_parse_pass();
            debug!(path = ?self.inner.path(), entries = self.inner.len(), "loaded HPKP cache");
        }
        Ok(outcome)
    }

    fn save(&self) -> Result<(), Error> {
        let now = time::now();
        // Both closures below touch the open group: the reload pass
        // builds it, the write pass commits the leftover.
        let pending: std::cell::RefCell<Option<HpkpRecord>> = std::cell::RefCell::new(None);
        persist::update_file(
            self.inner.path(),
            self.inner.last_load(),
            |line| self.parse_line(line, &mut *pending.borrow_mut(), now),
            |out| {
                // A group left open by the reload pass is committed
                // before the snapshot below is taken.
                if let Some(record) = pending.borrow_mut().take() {
                    self.inner.add(record);
                }
                let mut records = self.inner.snapshot_valid(now);
                if records.is_empty() {
                    debug!("no HPKP entries to save");
                    return Ok(());
                }
                records.sort_by(|a, b| a.host.cmp(&b.host));

                writeln!(out, "# HPKP 1.0 file")?;
                writeln!(out, "#Generated by fetchguard. Edit at your own risk.")?;
                writeln!(out, "#<hostname> <incl. subdomains> <created> <max-age>")?;
                writeln!(out)?;
                for record in &records {
                    write_record(out, record)?;
                }
                debug!(entries = records.len(), "saved HPKP cache");
                Ok(())
            },
        )
    }

    fn add(&self, record: HpkpRecord) {
        if record.is_revocation() {
            debug!(host = %record.host, "revoking HPKP entry");
        }
        self.inner.add(record);
    }

    fn check_pubkey(&self, host: &str, pubkey: &[u8]) -> PinVerdict {
        self.inner.with_entries(|entries| {
            let mut found: Option<&HpkpRecord> = None;
            let mut subdomain = false;
            for (depth, domain) in parent_domains(host).enumerate() {
                if let Some(record) = entries.get(domain) {
                    found = Some(record);
                    subdomain = depth > 0;
                    break;
                }
            }

            let Some(record) = found else {
                return PinVerdict::NotCovered;
            };
            if subdomain && !record.include_subdomains {
                // An ancestor's policy does not bind a subdomain unless
                // explicitly extended.
                return PinVerdict::NotCovered;
            }

            let digest = Sha256::digest(pubkey);
            for pin in &record.pins {
                if pin.hash_type == "sha256" && pin.digest.as_slice() == digest.as_slice() {
                    return PinVerdict::Accepted;
                }
            }
            debug!(host, digest = %hex::encode(digest), "public key not in pin set");
            PinVerdict::Rejected
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBKEY: &[u8] = b"-----test public key material-----";

    fn pin_for(pubkey: &[u8]) -> Pin {
        Pin::from_digest("sha256", Sha256::digest(pubkey).to_vec())
    }

    fn record_with_pin(host: &str, include_subdomains: bool) -> HpkpRecord {
        let mut r = HpkpRecord::new(host, 3600, include_subdomains);
        r.add_pin(pin_for(PUBKEY));
        r
    }

    #[test]
    fn test_pin_decode_round_trip() {
        let pin = pin_for(PUBKEY);
        let decoded = Pin::decode("sha256", &pin.digest_b64).unwrap();
        assert_eq!(decoded, pin);
        assert_eq!(decoded.digest_b64, pin.digest_b64);
    }

    #[test]
    fn test_pin_decode_rejects_bad_base64() {
        assert!(matches!(Pin::decode("sha256", "!!!not-base64!!!").unwrap_err(), Error::Parse(_)));
    }

    #[test]
    fn test_add_pin_deduplicates() {
        let mut r = HpkpRecord::new("example.com", 3600, false);
        r.add_pin(pin_for(PUBKEY));
        r.add_pin(pin_for(PUBKEY));
        assert_eq!(r.pins.len(), 1);
    }

    #[test]
    fn test_check_pubkey_accepted_and_rejected() {
        let store = HpkpStore::new(None);
        store.add(record_with_pin("example.com", false));

        assert_eq!(store.check_pubkey("example.com", PUBKEY), PinVerdict::Accepted);
        assert_eq!(store.check_pubkey("example.com", b"some other key"), PinVerdict::Rejected);
        assert_eq!(store.check_pubkey("example.com", PUBKEY).code(), 1);
        assert_eq!(store.check_pubkey("example.com", b"some other key").code(), -2);
    }

    #[test]
    fn test_check_pubkey_uncovered_host() {
        let store = HpkpStore::new(None);
        assert_eq!(store.check_pubkey("example.com", PUBKEY), PinVerdict::NotCovered);
        assert_eq!(store.check_pubkey("example.com", PUBKEY).code(), 0);
    }

    #[test]
    fn test_ancestor_does_not_cover_subdomain_by_default() {
        let store = HpkpStore::new(None);
        store.add(record_with_pin("example.com", false));
        assert_eq!(store.check_pubkey("sub.example.com", PUBKEY), PinVerdict::NotCovered);
    }

    #[test]
    fn test_ancestor_covers_subdomain_when_extended() {
        let store = HpkpStore::new(None);
        store.add(record_with_pin("example.com", true));
        assert_eq!(store.check_pubkey("a.b.example.com", PUBKEY), PinVerdict::Accepted);
        assert_eq!(store.check_pubkey("a.b.example.com", b"other"), PinVerdict::Rejected);
    }

    #[test]
    fn test_empty_pin_set_revokes() {
        let store = HpkpStore::new(None);
        store.add(record_with_pin("example.com", false));
        assert_eq!(store.len(), 1);

        store.add(HpkpRecord::new("example.com", 3600, false));
        assert!(store.is_empty());
        assert_eq!(store.check_pubkey("example.com", PUBKEY), PinVerdict::NotCovered);
    }

    #[test]
    fn test_zero_max_age_revokes() {
        let store = HpkpStore::new(None);
        store.add(record_with_pin("example.com", false));

        let mut revoke = HpkpRecord::new("example.com", 0, false);
        revoke.add_pin(pin_for(PUBKEY));
        store.add(revoke);
        assert!(store.is_empty());
    }

    #[test]
    fn test_merge_replaces_pin_set() {
        let store = HpkpStore::new(None);
        store.add(record_with_pin("example.com", false));

        let mut update = HpkpRecord::new("example.com", 7200, true);
        update.add_pin(pin_for(b"rotated key"));
        store.add(update);

        assert_eq!(store.check_pubkey("example.com", b"rotated key"), PinVerdict::Accepted);
        assert_eq!(store.check_pubkey("example.com", PUBKEY), PinVerdict::Rejected);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpkp.db");

        let store = HpkpStore::new(Some(path.clone()));
        store.add(record_with_pin("example.com", true));
        let mut second = HpkpRecord::new("other.org", 600, false);
        second.add_pin(pin_for(b"another key"));
        second.add_pin(pin_for(b"backup key"));
        store.add(second);
        store.save().unwrap();

        let reloaded = HpkpStore::new(Some(path));
        assert_eq!(reloaded.load().unwrap(), LoadOutcome::Loaded);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.check_pubkey("sub.example.com", PUBKEY), PinVerdict::Accepted);
        assert_eq!(reloaded.check_pubkey("other.org", b"backup key"), PinVerdict::Accepted);
    }

    #[test]
    fn test_load_drops_orphan_pin_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpkp.db");
        let pin = pin_for(PUBKEY);
        let now = time::now();
        std::fs::write(
            &path,
            format!("*sha256 {}\nexample.com 0 {now} 3600\n*sha256 {}\n", pin.digest_b64, pin.digest_b64),
        )
        .unwrap();

        let store = HpkpStore::new(Some(path));
        store.load().unwrap();
        // The orphan pin was dropped; the trailing group committed at EOF.
        assert_eq!(store.len(), 1);
        assert_eq!(store.check_pubkey("example.com", PUBKEY), PinVerdict::Accepted);
    }

    #[test]
    fn test_load_drops_pinless_group() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpkp.db");
        let pin = pin_for(PUBKEY);
        let now = time::now();
        std::fs::write(
            &path,
            format!("bare.com 0 {now} 3600\npinned.com 0 {now} 3600\n*sha256 {}\n", pin.digest_b64),
        )
        .unwrap();

        let store = HpkpStore::new(Some(path));
        store.load().unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.check_pubkey("pinned.com", PUBKEY), PinVerdict::Accepted);
        assert_eq!(store.check_pubkey("bare.com", PUBKEY), PinVerdict::NotCovered);
    }

    #[test]
    fn test_load_drops_expired_group() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpkp.db");
        let pin = pin_for(PUBKEY);
        let now = time::now();
        std::fs::write(&path, format!("stale.com 0 {} 10\n*sha256 {}\n", now - 100, pin.digest_b64)).unwrap();

        let store = HpkpStore::new(Some(path));
        store.load().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_second_load_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpkp.db");
        let pin = pin_for(PUBKEY);
        let now = time::now();
        std::fs::write(&path, format!("example.com 0 {now} 3600\n*sha256 {}\n", pin.digest_b64)).unwrap();

        let store = HpkpStore::new(Some(path));
        assert_eq!(store.load().unwrap(), LoadOutcome::Loaded);
        assert_eq!(store.load().unwrap(), LoadOutcome::Unchanged);
        assert_eq!(store.parse_passes(), 1);
    }

    #[test]
    fn test_save_drops_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpkp.db");

        let store = HpkpStore::new(Some(path.clone()));
        let mut stale = HpkpRecord::with_created("stale.com", time::now() - 100, 10, false);
        stale.add_pin(pin_for(PUBKEY));
        store.add(stale);
        store.add(record_with_pin("fresh.com", false));
        store.save().unwrap();

        let reloaded = HpkpStore::new(Some(path));
        reloaded.load().unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.check_pubkey("fresh.com", PUBKEY), PinVerdict::Accepted);
    }
}
