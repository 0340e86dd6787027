//! GTID position handling.
//!
//! A MariaDB global transaction id is a `domain-server-sequence` triple. A
//! server's replication position is a list of such triples with at most one
//! entry per domain, printed as `0-1-42,1-3-1000`. Positions are compared
//! per domain: a replica may connect to a master only if the master's binlog
//! position covers every domain the replica has already seen.

use std::fmt;
use std::str::FromStr;

/// One replicated transaction id: `domain-server-sequence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gtid {
    pub domain: u32,
    pub server_id: u32,
    pub sequence: u64,
}

impl FromStr for Gtid {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let domain = parts.next().and_then(|p| p.trim().parse().ok()).ok_or(())?;
        let server_id = parts.next().and_then(|p| p.trim().parse().ok()).ok_or(())?;
        let sequence = parts.next().and_then(|p| p.trim().parse().ok()).ok_or(())?;
        if parts.next().is_some() {
            return Err(());
        }
        Ok(Gtid { domain, server_id, sequence })
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.domain, self.server_id, self.sequence)
    }
}

/// How `events_ahead` treats a domain present on one side only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingDomainPolicy {
    /// The missing domain contributes nothing. Used when the other side may
    /// legitimately lag behind on a domain it has never replicated, or when a
    /// relay position can outrun an io position on a multi-master replica.
    Ignore,
    /// The missing domain contributes the full sequence of the present side.
    Subtract,
}

/// A replication position: one [`Gtid`] per domain, kept sorted by domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidList {
    triples: Vec<Gtid>,
}

impl GtidList {
    /// Parse the textual `d-s-n[,d-s-n]*` form. The empty string parses to
    /// the empty position. Malformed input (bad integers, a repeated domain)
    /// yields the empty position and a logged warning, never an error.
    pub fn from_string(text: &str) -> GtidList {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return GtidList::default();
        }

        let mut triples = Vec::new();
        for part in trimmed.split(',') {
            match part.trim().parse::<Gtid>() {
                Ok(gtid) => triples.push(gtid),
                Err(()) => {
                    tracing::warn!(input = %text, "ignoring malformed gtid list");
                    return GtidList::default();
                }
            }
        }

        triples.sort_by_key(|g| g.domain);
        if triples.windows(2).any(|w| w[0].domain == w[1].domain) {
            tracing::warn!(input = %text, "ignoring gtid list with duplicate domain");
            return GtidList::default();
        }
        GtidList { triples }
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    pub fn triples(&self) -> &[Gtid] {
        &self.triples
    }

    /// The sequence of the given domain, if present.
    pub fn sequence(&self, domain: u32) -> Option<u64> {
        self.triples
            .binary_search_by_key(&domain, |g| g.domain)
            .ok()
            .map(|i| self.triples[i].sequence)
    }

    /// How many events this position contains that `other` has not yet seen,
    /// summed over the domains of `self`. Domains absent from `other` are
    /// handled per `policy`.
    pub fn events_ahead(&self, other: &GtidList, policy: MissingDomainPolicy) -> u64 {
        let mut events = 0u64;
        for gtid in &self.triples {
            match other.sequence(gtid.domain) {
                Some(other_seq) => events += gtid.sequence.saturating_sub(other_seq),
                None => {
                    if policy == MissingDomainPolicy::Subtract {
                        events += gtid.sequence;
                    }
                }
            }
        }
        events
    }

    /// True if a replica at this position can attach to a master whose binlog
    /// position is `master_pos`: every domain of `self` must be present there
    /// with at least the same sequence. The empty position can replicate from
    /// anywhere.
    pub fn can_replicate_from(&self, master_pos: &GtidList) -> bool {
        self.triples.iter().all(|gtid| {
            master_pos
                .sequence(gtid.domain)
                .is_some_and(|master_seq| master_seq >= gtid.sequence)
        })
    }
}

impl fmt::Display for GtidList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, gtid) in self.triples.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{gtid}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_print_roundtrip() {
        for text in ["", "0-1-100", "0-1-100,1-1-50", "2-77-9000,5-3-1,9-9-9"] {
            let parsed = GtidList::from_string(text);
            assert_eq!(parsed.to_string(), text);
            assert_eq!(GtidList::from_string(&parsed.to_string()), parsed);
        }
    }

    #[test]
    fn test_parse_sorts_by_domain() {
        let list = GtidList::from_string("1-1-50,0-1-100");
        assert_eq!(list.to_string(), "0-1-100,1-1-50");
        assert_eq!(list.triples().len(), 2);
    }

    #[test]
    fn test_malformed_input_parses_to_empty() {
        for text in ["1-2", "a-b-c", "1-2-3-4", "0-1-100,,1-1-2", "0-1-100,0-2-5"] {
            assert!(GtidList::from_string(text).is_empty(), "input: {text}");
        }
    }

    #[test]
    fn test_events_ahead_single_domain() {
        let a = GtidList::from_string("0-1-100");
        let b = GtidList::from_string("0-1-90");
        assert_eq!(a.events_ahead(&b, MissingDomainPolicy::Ignore), 10);
        assert_eq!(b.events_ahead(&a, MissingDomainPolicy::Ignore), 0);
    }

    #[test]
    fn test_events_ahead_missing_domain_policies() {
        let a = GtidList::from_string("0-1-100,1-1-50");
        let b = GtidList::from_string("0-1-100");
        assert_eq!(a.events_ahead(&b, MissingDomainPolicy::Ignore), 0);
        assert_eq!(a.events_ahead(&b, MissingDomainPolicy::Subtract), 50);
    }

    #[test]
    fn test_events_ahead_zero_iff_no_domain_is_ahead() {
        let a = GtidList::from_string("0-1-10,1-1-20");
        let b = GtidList::from_string("0-1-10,1-1-25");
        assert_eq!(a.events_ahead(&b, MissingDomainPolicy::Ignore), 0);

        let c = GtidList::from_string("0-1-11,1-1-25");
        assert_eq!(c.events_ahead(&b, MissingDomainPolicy::Ignore), 1);
    }

    #[test]
    fn test_can_replicate_from() {
        let empty = GtidList::default();
        let master = GtidList::from_string("0-1-100,1-1-50");
        assert!(empty.can_replicate_from(&master));

        let behind = GtidList::from_string("0-1-90");
        assert!(behind.can_replicate_from(&master));

        let ahead = GtidList::from_string("0-1-101");
        assert!(!ahead.can_replicate_from(&master));

        let foreign_domain = GtidList::from_string("7-1-1");
        assert!(!foreign_domain.can_replicate_from(&master));
    }

    #[test]
    fn test_sequence_lookup() {
        let list = GtidList::from_string("0-1-100,4-2-7");
        assert_eq!(list.sequence(0), Some(100));
        assert_eq!(list.sequence(4), Some(7));
        assert_eq!(list.sequence(1), None);
    }
}
