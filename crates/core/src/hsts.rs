//! HTTP Strict Transport Security (RFC 6797) host cache.
//!
//! Records which hosts must only be reached over an upgraded scheme,
//! keyed by `(host, port)`. Learned from `Strict-Transport-Security`
//! response headers by the HTTP client and consulted before every
//! connection.

use std::io::{self, Write};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::domain::parent_domains;
use crate::error::Error;
use crate::persist::{self, LoadOutcome};
use crate::store::{PolicyRecord, PolicyStore};
use crate::time;

/// Capability surface of an HSTS database.
///
/// The built-in [`HstsStore`] implements it; an external module may
/// register a replacement with a higher priority (see
/// `fetchguard-plugin`).
pub trait HstsDatabase: Send + Sync {
    /// Populate the store from its backing file, if one is configured
    /// and has changed since the last load.
    fn load(&self) -> Result<LoadOutcome, Error>;

    /// Write all unexpired records back to the backing file, merging
    /// any records another process saved in the meantime.
    fn save(&self) -> Result<(), Error>;

    /// Record a policy update from a response header. `max_age == 0`
    /// revokes the entry for `(host, port)`.
    fn add(&self, host: &str, port: u16, max_age: i64, include_subdomains: bool);

    /// Whether `host:port` is covered by an unexpired policy, either
    /// exactly or through a parent domain with `includeSubDomains`.
    fn host_match(&self, host: &str, port: u16) -> bool;
}

/// One learned HSTS policy: `host:port` must be reached over an upgraded
/// scheme until `expires`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HstsRecord {
    pub host: String,
    pub port: u16,
    pub created: i64,
    pub max_age: i64,
    pub expires: i64,
    pub include_subdomains: bool,
}

impl HstsRecord {
    /// Build a record created now. See [`HstsRecord::with_created`].
    pub fn new(host: impl Into<String>, port: u16, max_age: i64, include_subdomains: bool) -> Self {
        Self::with_created(host, port, time::now(), max_age, include_subdomains)
    }

    /// Build a record with clamped timestamps. Port 0 and the plaintext
    /// default 80 normalize to 443. A non-positive or overflowing
    /// max-age yields a revocation record (`max_age == expires == 0`).
    pub fn with_created(
        host: impl Into<String>,
        port: u16,
        created: i64,
        max_age: i64,
        include_subdomains: bool,
    ) -> Self {
        let created = time::clamp_epoch(created);
        let max_age = time::clamp_epoch(max_age);
        Self {
            host: host.into(),
            port: normalize_port(port),
            created,
            max_age,
            expires: time::expiry(created, max_age),
            include_subdomains,
        }
    }
}

impl PolicyRecord for HstsRecord {
    type Key = (String, u16);

    fn key(&self) -> Self::Key {
        (self.host.clone(), self.port)
    }

    fn is_revocation(&self) -> bool {
        self.max_age == 0
    }

    fn expires_at(&self) -> i64 {
        self.expires
    }

    fn merge_from(&mut self, incoming: Self) {
        // A reordered or duplicate response must not move the record
        // backward in time.
        if incoming.created > self.created {
            self.created = incoming.created;
        }
        self.max_age = incoming.max_age;
        self.expires = incoming.expires;
        self.include_subdomains = incoming.include_subdomains;
    }
}

/// HSTS records are meaningful only for upgraded connections, so the
/// plaintext default port maps onto the upgraded default.
fn normalize_port(port: u16) -> u16 {
    if port == 0 || port == 80 { 443 } else { port }
}

/// The built-in HSTS store: a mutex-guarded map persisted to a flat
/// file, one record per line.
#[derive(Debug)]
pub struct HstsStore {
    inner: PolicyStore<HstsRecord>,
}

impl HstsStore {
    /// Create an empty store. Nothing is read from disk until
    /// [`HstsDatabase::load`] runs.
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

    /// Add a prebuilt record. Ownership moves into the store.
    pub fn add_record(&self, record: HstsRecord) {
        if record.is_revocation() {
            debug!(host = %record.host, port = record.port, "revoking HSTS entry");
        }
        self.inner.add(record);
    }

    fn parse_line(&self, line: &str, now: i64) {
        match parse_record(line) {
            // Expired entries are dropped silently during load.
            Some(record) if record.expires >= now => self.inner.add(record),
            Some(_) => {}
            None => warn!(line, "failed to parse HSTS line"),
        }
    }
}

/// `<host> <port> <includeSubdomains> <created> <maxage>`
///
/// Numeric fields that fail to parse fall back to 0 (port 0 then
/// normalizes to 443); only a missing field makes the line malformed.
fn parse_record(line: &str) -> Option<HstsRecord> {
    let mut fields = line.split_ascii_whitespace();
    let host = fields.next()?;
    let port = fields.next()?.parse::<u16>().unwrap_or(0);
    let include_subdomains = fields.next()?.parse::<i64>().map(|v| v != 0).unwrap_or(false);
    let created = fields.next()?.parse::<i64>().unwrap_or(0);
    let max_age = fields.next()?.parse::<i64>().unwrap_or(0);
    Some(HstsRecord::with_created(host, port, created, max_age, include_subdomains))
}

fn write_record(out: &mut dyn Write, r: &HstsRecord) -> io::Result<()> {
    writeln!(out, "{} {} {} {} {}", r.host, r.port, r.include_subdomains as u8, r.created, r.max_age)
}

impl HstsDatabase for HstsStore {
    fn load(&self) -> Result<LoadOutcome, Error> {
        let now = time::now();
        let outcome = persist::load_lines(self.inner.path(), self.inner.last_load(), |line| {
            self.parse_line(line, now);
        })?;
        if outcome == LoadOutcome::Loaded {
            self.inner.note_parse_pass();
            debug!(path = ?self.inner.path(), entries = self.inner.len(), "loaded HSTS cache");
        }
        Ok(outcome)
    }

    fn save(&self) -> Result<(), Error> {
        let now = time::now();
        persist::update_file(
            self.inner.path(),
            self.inner.last_load(),
            |line| self.parse_line(line, now),
            |out| {
                let mut records = self.inner.snapshot_valid(now);
                if records.is_empty() {
                    debug!("no HSTS entries to save");
                    return Ok(());
                }
                records.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));

                writeln!(out, "#HSTS 1.0 file")?;
                writeln!(out, "#Generated by fetchguard. Edit at your own risk.")?;
                writeln!(out, "# <hostname> <port> <incl. subdomains> <created> <max-age>")?;
                for record in &records {
                    write_record(out, record)?;
                }
                debug!(entries = records.len(), "saved HSTS cache");
                Ok(())
            },
        )
    }

    fn add(&self, host: &str, port: u16, max_age: i64, include_subdomains: bool) {
        self.add_record(HstsRecord::new(host, port, max_age, include_subdomains));
    }

    fn host_match(&self, host: &str, port: u16) -> bool {
        let now = time::now();
        let port = normalize_port(port);
        self.inner.with_entries(|entries| {
            // Exact match first.
            if let Some(r) = entries.get(&(host.to_string(), port)) {
                if r.expires >= now {
                    return true;
                }
            }
            // Then each parent domain, which must opt in through
            // includeSubDomains.
            for parent in parent_domains(host).skip(1) {
                if let Some(r) = entries.get(&(parent.to_string(), port)) {
                    if r.include_subdomains && r.expires >= now {
                        return true;
                    }
                }
            }
            false
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(records: &[(&str, u16, i64, bool)]) -> HstsStore {
        let store = HstsStore::new(None);
        for &(host, port, max_age, subs) in records {
            store.add(host, port, max_age, subs);
        }
        store
    }

    #[test]
    fn test_port_defaults_to_443() {
        let r = HstsRecord::new("example.com", 0, 3600, false);
        assert_eq!(r.port, 443);
        let r = HstsRecord::new("example.com", 80, 3600, false);
        assert_eq!(r.port, 443);
        let r = HstsRecord::new("example.com", 8443, 3600, false);
        assert_eq!(r.port, 8443);
    }

    #[test]
    fn test_expiry_invariant() {
        let r = HstsRecord::with_created("example.com", 443, 1000, 3600, false);
        assert_eq!(r.expires, 4600);
        let r = HstsRecord::with_created("example.com", 443, 1000, 0, false);
        assert_eq!(r.expires, 0);
        // Overflowing max-age collapses into a revocation record.
        let r = HstsRecord::with_created("example.com", 443, 1000, i64::MAX - 1, false);
        assert_eq!(r.max_age, 0);
        assert_eq!(r.expires, 0);
    }

    #[test]
    fn test_exact_match() {
        let store = store_with(&[("example.com", 443, 3600, false)]);
        assert!(store.host_match("example.com", 443));
        assert!(!store.host_match("other.com", 443));
    }

    #[test]
    fn test_probe_port_80_normalizes() {
        let store = store_with(&[("example.com", 443, 3600, false)]);
        assert!(store.host_match("example.com", 80));
        assert!(!store.host_match("example.com", 8443));
    }

    #[test]
    fn test_subdomain_requires_flag() {
        let store = store_with(&[("example.com", 443, 3600, true)]);
        assert!(store.host_match("a.b.example.com", 443));
        assert!(store.host_match("example.com", 443));

        let store = store_with(&[("example.com", 443, 3600, false)]);
        assert!(!store.host_match("a.b.example.com", 443));
        assert!(store.host_match("example.com", 443));
    }

    #[test]
    fn test_revocation() {
        let store = store_with(&[("example.com", 443, 3600, false)]);
        assert!(store.host_match("example.com", 443));
        store.add("example.com", 443, 0, false);
        assert!(!store.host_match("example.com", 443));
        assert!(store.is_empty());
    }

    #[test]
    fn test_merge_updates_fields_keeps_created_monotonic() {
        let store = HstsStore::new(None);
        store.add_record(HstsRecord::with_created("example.com", 443, time::now(), 3600, false));
        store.add_record(HstsRecord::with_created("example.com", 443, time::now() - 100, 7200, true));
        assert_eq!(store.len(), 1);
        store.inner.with_entries(|e| {
            let r = &e[&("example.com".to_string(), 443)];
            assert_eq!(r.max_age, 7200);
            assert!(r.include_subdomains);
            // The older duplicate did not move the record back in time.
            assert!(r.created >= time::now() - 10);
        });
    }

    #[test]
    fn test_parse_record_line() {
        let r = parse_record("example.com 443 1 1000 3600").unwrap();
        assert_eq!(r.host, "example.com");
        assert_eq!(r.port, 443);
        assert!(r.include_subdomains);
        assert_eq!(r.created, 1000);
        assert_eq!(r.max_age, 3600);
    }

    #[test]
    fn test_parse_record_short_line() {
        assert!(parse_record("example.com 443 1").is_none());
    }

    #[test]
    fn test_parse_record_bad_port_falls_back() {
        let r = parse_record("example.com nonsense 0 1000 3600").unwrap();
        assert_eq!(r.port, 443);
        assert!(!r.include_subdomains);
    }

    #[test]
    fn test_load_skips_unparsable_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsts.db");
        let now = time::now();
        std::fs::write(&path, format!("example.com 443 1 {now} 3600\nshort line\n")).unwrap();

        let store = HstsStore::new(Some(path));
        assert_eq!(store.load().unwrap(), LoadOutcome::Loaded);
        assert_eq!(store.len(), 1);
        assert!(store.host_match("example.com", 443));
    }

    #[test]
    fn test_load_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsts.db");
        let now = time::now();
        std::fs::write(&path, format!("old.com 443 0 {} 10\nfresh.com 443 0 {now} 3600\n", now - 100)).unwrap();

        let store = HstsStore::new(Some(path));
        store.load().unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.host_match("fresh.com", 443));
        assert!(!store.host_match("old.com", 443));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsts.db");

        let store = HstsStore::new(Some(path.clone()));
        store.add("example.com", 443, 3600, true);
        store.add("other.org", 8443, 600, false);
        store.save().unwrap();

        let reloaded = HstsStore::new(Some(path));
        assert_eq!(reloaded.load().unwrap(), LoadOutcome::Loaded);
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.host_match("sub.example.com", 443));
        assert!(reloaded.host_match("other.org", 8443));
    }

    #[test]
    fn test_second_load_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsts.db");
        let now = time::now();
        std::fs::write(&path, format!("example.com 443 0 {now} 3600\n")).unwrap();

        let store = HstsStore::new(Some(path));
        assert_eq!(store.load().unwrap(), LoadOutcome::Loaded);
        assert_eq!(store.load().unwrap(), LoadOutcome::Unchanged);
        assert_eq!(store.parse_passes(), 1);
    }

    #[test]
    fn test_save_without_path_fails() {
        let store = store_with(&[("example.com", 443, 3600, false)]);
        assert!(matches!(store.save().unwrap_err(), Error::NoBackingFile));
    }

    #[test]
    fn test_save_merges_concurrent_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsts.db");
        let now = time::now();
        // Another process saved this after our last load.
        std::fs::write(&path, format!("foreign.com 443 0 {now} 3600\n")).unwrap();

        let store = HstsStore::new(Some(path.clone()));
        store.add("ours.com", 443, 3600, false);
        store.save().unwrap();

        let merged = HstsStore::new(Some(path));
        merged.load().unwrap();
        assert!(merged.host_match("foreign.com", 443));
        assert!(merged.host_match("ours.com", 443));
    }
}
