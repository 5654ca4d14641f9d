//! Hierarchical host matching shared by both caches.

/// Iterate a host and each of its parent domains, stripping one leading
/// label at a time.
///
/// `a.b.example.com` yields `a.b.example.com`, `b.example.com`,
/// `example.com`, `com`. Empty labels produced by consecutive dots are
/// skipped; a trailing dot ends the walk.
pub fn parent_domains(host: &str) -> ParentDomains<'_> {
    ParentDomains { rest: Some(host) }
}

/// Iterator returned by [`parent_domains`].
#[derive(Debug, Clone)]
pub struct ParentDomains<'a> {
    rest: Option<&'a str>,
}

impl<'a> Iterator for ParentDomains<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let cur = self.rest.take()?;
        if let Some((_, tail)) = cur.split_once('.') {
            let tail = tail.trim_start_matches('.');
            if !tail.is_empty() {
                self.rest = Some(tail);
            }
        }
        Some(cur)
    }
}
