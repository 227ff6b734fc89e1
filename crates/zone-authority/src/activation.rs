//! The zone activation checker.
//!
//! A zone is created inactive and only becomes queryable once its
//! delegation at the parent actually points at this service.  This
//! task periodically probes the public DNS for each pending zone's NS
//! set, flips the zone active on a match, and announces it on the
//! event bus so every query-plane instance picks it up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dns_types::protocol::types::{
    DomainName, QueryClass, QueryType, Question, Rdata, RecordClass, RecordType, ResourceRecord,
};

use crate::events::{ChangeEvent, EventKind, EventPublisher};
use crate::store::{Zone, ZoneStore};
use crate::upstream;

/// How often to sweep for zones awaiting delegation.
pub const ACTIVATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct ActivationChecker {
    store: Arc<dyn ZoneStore>,
    publisher: Arc<dyn EventPublisher>,
    /// Canonical (lowercase, no trailing dot) delegation targets.
    ns1: String,
    ns2: String,
    upstream: SocketAddr,
}

impl ActivationChecker {
    pub fn new(
        store: Arc<dyn ZoneStore>,
        publisher: Arc<dyn EventPublisher>,
        ns1: &str,
        ns2: &str,
        upstream: SocketAddr,
    ) -> Self {
        Self {
            store,
            publisher,
            ns1: canonical_host(ns1),
            ns2: canonical_host(ns2),
            upstream,
        }
    }

    /// Sweep forever.  The first sweep runs immediately, not an
    /// interval from now.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(ACTIVATION_INTERVAL);
        loop {
            ticker.tick().await;
            Arc::clone(&self).sweep().await;
        }
    }

    /// One pass over the pending zones.  Each probe runs on its own
    /// task so a slow or failing zone never holds up the rest.
    pub async fn sweep(self: Arc<Self>) {
        let zones = match self.store.inactive_zones().await {
            Ok(zones) => zones,
            Err(error) => {
                tracing::warn!(?error, "could not scan for inactive zones");
                return;
            }
        };

        tracing::debug!(pending = zones.len(), "delegation sweep");
        for zone in zones {
            let checker = Arc::clone(&self);
            tokio::spawn(async move {
                checker.probe(zone).await;
            });
        }
    }

    async fn probe(&self, zone: Zone) {
        let Some(name) = DomainName::from_dotted_string(&zone.zone_name) else {
            tracing::warn!(zone_name = %zone.zone_name, "stored zone name does not parse, skipping");
            return;
        };

        let question = Question {
            name,
            qtype: QueryType::Record(RecordType::NS),
            qclass: QueryClass::Record(RecordClass::IN),
        };

        let Some(response) = upstream::exchange(self.upstream, &question).await else {
            tracing::debug!(zone_name = %zone.zone_name, "delegation probe got no response");
            return;
        };

        if !self.delegation_matches(&response.answers) {
            tracing::debug!(zone_name = %zone.zone_name, "delegation does not point here yet");
            return;
        }

        if let Err(error) = self.store.activate_zone(&zone.id).await {
            tracing::warn!(zone_name = %zone.zone_name, ?error, "could not mark zone active");
            return;
        }

        let event = ChangeEvent {
            kind: EventKind::ZoneCreate,
            zone_name: zone.zone_name.clone(),
        };
        if let Err(error) = self.publisher.publish(&event).await {
            tracing::warn!(zone_name = %zone.zone_name, ?error, "could not publish activation event");
        }

        tracing::info!(zone_name = %zone.zone_name, "delegation verified, zone activated");
    }

    fn delegation_matches(&self, answers: &[ResourceRecord]) -> bool {
        answers.iter().any(|rr| match &rr.rdata {
            Rdata::NS { nsdname } => {
                let host = canonical_host(&nsdname.to_dotted_string());
                host == self.ns1 || host == self.ns2
            }
            _ => false,
        })
    }
}

/// Lowercase and trim the trailing dot, so a host compares equal
/// however the resolver spells it.
pub fn canonical_host(host: &str) -> String {
    host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use tokio::net::UdpSocket;

    use dns_types::protocol::types::Message;

    use super::*;
    use crate::test_util::{zone, CapturingPublisher, MemoryStore};

    fn domain(s: &str) -> DomainName {
        DomainName::from_dotted_string(s).unwrap()
    }

    /// A one-shot upstream resolver stub answering every NS question
    /// with the given hosts.
    async fn ns_upstream(hosts: &'static [&'static str]) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (size, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..size]).unwrap();
            let mut response = request.make_response();
            response.answers = hosts
                .iter()
                .map(|host| ResourceRecord {
                    name: request.questions[0].name.clone(),
                    rdata: Rdata::NS {
                        nsdname: domain(host),
                    },
                    rclass: RecordClass::IN,
                    ttl: 3600,
                })
                .collect();
            let octets = response.to_octets().unwrap();
            socket.send_to(&octets, peer).await.unwrap();
        });
        address
    }

    fn checker_over(
        store: Arc<MemoryStore>,
        publisher: Arc<CapturingPublisher>,
        upstream: SocketAddr,
    ) -> ActivationChecker {
        ActivationChecker::new(
            store,
            publisher,
            "ns1.example-dns.net",
            "ns2.example-dns.net",
            upstream,
        )
    }

    #[test]
    fn canonical_host_lowercases_and_trims() {
        assert_eq!("ns1.example-dns.net", canonical_host("NS1.Example-DNS.NET."));
        assert_eq!("ns1.example-dns.net", canonical_host("ns1.example-dns.net"));
    }

    #[test]
    fn delegation_matches_despite_case_and_trailing_dot() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(CapturingPublisher::new());
        let checker = checker_over(store, publisher, "127.0.0.1:1".parse().unwrap());

        let answers = vec![ResourceRecord {
            name: domain("pending.example."),
            rdata: Rdata::NS {
                nsdname: domain("NS2.EXAMPLE-DNS.NET."),
            },
            rclass: RecordClass::IN,
            ttl: 3600,
        }];
        assert!(checker.delegation_matches(&answers));

        let elsewhere = vec![ResourceRecord {
            name: domain("pending.example."),
            rdata: Rdata::NS {
                nsdname: domain("ns1.somewhere-else.net."),
            },
            rclass: RecordClass::IN,
            ttl: 3600,
        }];
        assert!(!checker.delegation_matches(&elsewhere));
    }

    #[tokio::test]
    async fn probe_activates_a_delegated_zone_and_announces_it() {
        let upstream = ns_upstream(&["ns1.example-dns.net", "ns9.unrelated.net"]).await;
        let store = Arc::new(MemoryStore::new());
        store.add_zone(zone("pending.example", false));
        let publisher = Arc::new(CapturingPublisher::new());
        let checker = checker_over(Arc::clone(&store), Arc::clone(&publisher), upstream);

        let pending = store.inactive_zones().await.unwrap().remove(0);
        checker.probe(pending).await;

        assert!(store.inactive_zones().await.unwrap().is_empty());
        assert_eq!(
            vec![ChangeEvent {
                kind: EventKind::ZoneCreate,
                zone_name: "pending.example".to_string(),
            }],
            publisher.published(),
        );
    }

    #[tokio::test]
    async fn probe_leaves_an_undelegated_zone_alone() {
        let upstream = ns_upstream(&["ns1.somewhere-else.net"]).await;
        let store = Arc::new(MemoryStore::new());
        store.add_zone(zone("pending.example", false));
        let publisher = Arc::new(CapturingPublisher::new());
        let checker = checker_over(Arc::clone(&store), Arc::clone(&publisher), upstream);

        let pending = store.inactive_zones().await.unwrap().remove(0);
        checker.probe(pending).await;

        assert_eq!(1, store.inactive_zones().await.unwrap().len());
        assert!(publisher.published().is_empty());
    }
}
