//! The authoritative query handler.
//!
//! One stateless pass per query: normalize each question name, decide
//! whether the zone is ours, and build the answer section from the
//! cached record set plus a little synthesis (SOA/NS/CAA are derived
//! from configuration, not stored).

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Datelike, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

use dns_types::protocol::types::{
    DomainName, Message, QueryClass, QueryType, Question, Rcode, Rdata, RecordClass, RecordType,
    ResourceRecord, CHARSTRING_MAX_LEN,
};

use crate::cache::ZoneCache;
use crate::filter::ZoneFilter;
use crate::store::{StoreError, ZoneRecord};
use crate::upstream;

/// Names nobody can register: answered NXDOMAIN before any lookup.
const BLACKLISTED_NAMES: &[&str] = &["version.bind", "hostname.bind", "id.server"];

/// TTL on synthesized metadata answers (SOA, NS, CAA, TXT).
const METADATA_TTL: u32 = 3600;

/// Static configuration baked into synthesized answers.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Primary nameserver host: SOA MNAME, first NS answer, and one of
    /// the two delegation targets.
    pub ns1: DomainName,
    /// Secondary nameserver host.
    pub ns2: DomainName,
    /// SOA RNAME, the responsible mailbox.
    pub rname: DomainName,
    /// The recursive resolver used for CNAME flattening.
    pub upstream: SocketAddr,
}

impl AuthorityConfig {
    /// Build from raw environment values.  The mailbox may be given as
    /// a mail address: `hostmaster@example.com` becomes the RNAME
    /// `hostmaster.example.com.`.
    pub fn from_parts(ns1: &str, ns2: &str, mbox: &str, upstream: SocketAddr) -> Option<Self> {
        Some(Self {
            ns1: DomainName::from_dotted_string(ns1)?,
            ns2: DomainName::from_dotted_string(ns2)?,
            rname: DomainName::from_dotted_string(&mbox.replacen('@', ".", 1))?,
            upstream,
        })
    }
}

/// The optional text generator behind the novelty TXT path.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GeneratorError>;
}

#[derive(Debug, Error)]
#[error("text generation failed: {message}")]
pub struct GeneratorError {
    pub message: String,
}

/// The outcome of one question: either answers to append, or an rcode
/// for the message header.
enum Outcome {
    Answers(Vec<ResourceRecord>),
    Rcode(Rcode),
}

/// The query plane's single entry point: parsed message in, response
/// message out.
pub struct Authority {
    config: AuthorityConfig,
    filter: Arc<ZoneFilter>,
    cache: Arc<ZoneCache>,
    generator: Option<Arc<dyn TextGenerator>>,
}

impl Authority {
    pub fn new(config: AuthorityConfig, filter: Arc<ZoneFilter>, cache: Arc<ZoneCache>) -> Self {
        Self {
            config,
            filter,
            cache,
            generator: None,
        }
    }

    /// Enable the novelty TXT path.  Without a generator those
    /// questions are answered NOTIMP.
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Answer a query.  The response has AA set and the question
    /// section echoed; answers are appended in question order, and any
    /// failing question overwrites the message-level rcode (so a
    /// message mixing outcomes reports the last failure).
    pub async fn respond(&self, query: &Message) -> Message {
        let mut response = query.make_response();
        response.header.is_authoritative = true;

        // one store round-trip per zone per message, however many
        // questions repeat it
        let mut fetched = HashMap::new();

        for question in &query.questions {
            match self.answer_question(question, &mut fetched).await {
                Outcome::Answers(mut rrs) => response.answers.append(&mut rrs),
                Outcome::Rcode(rcode) => response.header.rcode = rcode,
            }
        }

        response
    }

    async fn answer_question(
        &self,
        question: &Question,
        fetched: &mut HashMap<String, Arc<[ZoneRecord]>>,
    ) -> Outcome {
        let raw_name = question.name.to_dotted_string();

        let Some(qname) = normalize_name(&raw_name) else {
            // a name IDNA cannot make sense of has no authoritative
            // answer; TXT questions for one get the novelty treatment
            if question.qtype == QueryType::Record(RecordType::TXT) {
                return self.novelty_txt(question).await;
            }
            tracing::debug!(name = %raw_name, "unnormalizable question name");
            return Outcome::Rcode(Rcode::NameError);
        };

        if BLACKLISTED_NAMES.contains(&qname.as_str()) {
            return Outcome::Rcode(Rcode::NameError);
        }

        let Some(zone_name) = psl::domain_str(&qname) else {
            return Outcome::Rcode(Rcode::NameError);
        };
        if BLACKLISTED_NAMES.contains(&zone_name) {
            return Outcome::Rcode(Rcode::NameError);
        }

        if !self.filter.contains(zone_name) {
            tracing::debug!(%zone_name, "zone not hosted");
            return Outcome::Rcode(Rcode::NameError);
        }

        match question.qtype {
            QueryType::Record(RecordType::SOA) => Outcome::Answers(vec![self.soa_record(question)]),
            QueryType::Record(RecordType::NS) => self.ns_answers(question),
            QueryType::Record(RecordType::CAA) => self.caa_answer(question, &qname),
            QueryType::Record(RecordType::A) => {
                match self.zone_records(zone_name, fetched).await {
                    Ok(records) => self.a_answer(question, &qname, &records).await,
                    Err(error) => {
                        tracing::error!(%zone_name, ?error, "could not fetch zone records");
                        Outcome::Rcode(Rcode::ServerFailure)
                    }
                }
            }
            QueryType::Record(RecordType::CNAME) => {
                match self.zone_records(zone_name, fetched).await {
                    Ok(records) => self.cname_answer(question, &qname, &records),
                    Err(error) => {
                        tracing::error!(%zone_name, ?error, "could not fetch zone records");
                        Outcome::Rcode(Rcode::ServerFailure)
                    }
                }
            }
            _ => Outcome::Rcode(Rcode::NotImplemented),
        }
    }

    async fn zone_records(
        &self,
        zone_name: &str,
        fetched: &mut HashMap<String, Arc<[ZoneRecord]>>,
    ) -> Result<Arc<[ZoneRecord]>, StoreError> {
        if let Some(records) = fetched.get(zone_name) {
            return Ok(Arc::clone(records));
        }

        let records = self.cache.get_records(zone_name).await?;
        fetched.insert(zone_name.to_string(), Arc::clone(&records));
        Ok(records)
    }

    fn soa_record(&self, question: &Question) -> ResourceRecord {
        let today = Utc::now();
        // the conventional YYYYMMDD date serial
        let serial = today.year().unsigned_abs() * 10_000 + today.month() * 100 + today.day();

        ResourceRecord {
            name: question.name.clone(),
            rdata: Rdata::SOA {
                mname: self.config.ns1.clone(),
                rname: self.config.rname.clone(),
                serial,
                refresh: 1800,
                retry: 600,
                expire: 86400,
                minimum: 60,
            },
            rclass: RecordClass::IN,
            ttl: METADATA_TTL,
        }
    }

    fn ns_answers(&self, question: &Question) -> Outcome {
        let answers = [&self.config.ns1, &self.config.ns2]
            .into_iter()
            .map(|host| ResourceRecord {
                name: question.name.clone(),
                rdata: Rdata::NS {
                    nsdname: host.clone(),
                },
                rclass: RecordClass::IN,
                ttl: METADATA_TTL,
            })
            .collect();

        Outcome::Answers(answers)
    }

    fn caa_answer(&self, question: &Question, qname: &str) -> Outcome {
        // no issue/issuewild property is published, so any CA may
        // issue; the iodef address gives them somewhere to report to
        Outcome::Answers(vec![ResourceRecord {
            name: question.name.clone(),
            rdata: Rdata::CAA {
                flags: 0,
                tag: Bytes::from_static(b"iodef"),
                value: Bytes::from(format!("mailto:security@{qname}")),
            },
            rclass: RecordClass::IN,
            ttl: METADATA_TTL,
        }])
    }

    async fn a_answer(
        &self,
        question: &Question,
        qname: &str,
        records: &[ZoneRecord],
    ) -> Outcome {
        let a_candidates: Vec<&ZoneRecord> = records
            .iter()
            .filter(|r| r.name == qname && r.record_type == "A")
            .collect();

        if !a_candidates.is_empty() {
            let picked = a_candidates[weighted_index(&mut rand::thread_rng(), &a_candidates)];
            return match picked.content.parse::<Ipv4Addr>() {
                Ok(address) => Outcome::Answers(vec![ResourceRecord {
                    name: question.name.clone(),
                    rdata: Rdata::A { address },
                    rclass: RecordClass::IN,
                    ttl: record_ttl(picked),
                }]),
                Err(_) => {
                    tracing::error!(
                        record_id = %picked.id,
                        content = %picked.content,
                        "A record content is not an IPv4 address"
                    );
                    Outcome::Rcode(Rcode::ServerFailure)
                }
            };
        }

        let cname_candidates: Vec<&ZoneRecord> = records
            .iter()
            .filter(|r| r.name == qname && r.record_type == "CNAME")
            .collect();

        if !cname_candidates.is_empty() {
            let picked =
                cname_candidates[weighted_index(&mut rand::thread_rng(), &cname_candidates)];
            return self.flatten_cname(question, picked).await;
        }

        Outcome::Rcode(Rcode::NameError)
    }

    /// Resolve a CNAME target's addresses through the upstream
    /// resolver and answer with them under the query's owner name, so
    /// clients never see the alias.
    async fn flatten_cname(&self, question: &Question, cname: &ZoneRecord) -> Outcome {
        let Some(target) = DomainName::from_dotted_string(&cname.content) else {
            tracing::error!(
                record_id = %cname.id,
                content = %cname.content,
                "CNAME record content is not a domain name"
            );
            return Outcome::Rcode(Rcode::ServerFailure);
        };

        let upstream_question = Question {
            name: target,
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };

        let Some(response) = upstream::exchange(self.config.upstream, &upstream_question).await
        else {
            tracing::warn!(target = %cname.content, "upstream exchange failed");
            return Outcome::Rcode(Rcode::ServerFailure);
        };

        if response.header.rcode != Rcode::NoError {
            return Outcome::Rcode(response.header.rcode);
        }

        let answers: Vec<ResourceRecord> = response
            .answers
            .iter()
            .filter_map(|rr| match rr.rdata {
                Rdata::A { address } => Some(ResourceRecord {
                    name: question.name.clone(),
                    rdata: Rdata::A { address },
                    rclass: RecordClass::IN,
                    ttl: record_ttl(cname),
                }),
                _ => None,
            })
            .collect();

        if answers.is_empty() {
            Outcome::Rcode(Rcode::NameError)
        } else {
            Outcome::Answers(answers)
        }
    }

    fn cname_answer(&self, question: &Question, qname: &str, records: &[ZoneRecord]) -> Outcome {
        let candidates: Vec<&ZoneRecord> = records
            .iter()
            .filter(|r| r.name == qname && r.record_type == "CNAME")
            .collect();

        if candidates.is_empty() {
            return Outcome::Rcode(Rcode::NameError);
        }

        let picked = candidates[weighted_index(&mut rand::thread_rng(), &candidates)];
        match DomainName::from_dotted_string(&picked.content) {
            Some(cname) => Outcome::Answers(vec![ResourceRecord {
                name: question.name.clone(),
                rdata: Rdata::CNAME { cname },
                rclass: RecordClass::IN,
                ttl: record_ttl(picked),
            }]),
            None => {
                tracing::error!(
                    record_id = %picked.id,
                    content = %picked.content,
                    "CNAME record content is not a domain name"
                );
                Outcome::Rcode(Rcode::ServerFailure)
            }
        }
    }

    /// TXT questions whose name IDNA rejected: decode the punycoded
    /// labels into a prompt and answer with generated text.
    async fn novelty_txt(&self, question: &Question) -> Outcome {
        let Some(generator) = &self.generator else {
            return Outcome::Rcode(Rcode::NotImplemented);
        };

        let raw_name = question.name.to_dotted_string();
        let stripped = raw_name.strip_suffix('.').unwrap_or(&raw_name);
        let (prompt, _) = idna::domain_to_unicode(stripped);

        match generator.generate(&prompt).await {
            Ok(text) => Outcome::Answers(vec![ResourceRecord {
                name: question.name.clone(),
                rdata: Rdata::TXT {
                    strings: split_txt_strings(&text),
                },
                rclass: RecordClass::IN,
                ttl: METADATA_TTL,
            }]),
            Err(error) => {
                tracing::warn!(%error, "text generation failed");
                Outcome::Rcode(Rcode::ServerFailure)
            }
        }
    }
}

/// Normalize a question name: strip the trailing dot, lowercase, and
/// convert to ASCII punycode.  `None` means IDNA could not make sense
/// of the name.
pub fn normalize_name(raw: &str) -> Option<String> {
    let stripped = raw.strip_suffix('.').unwrap_or(raw);
    idna::domain_to_ascii(&stripped.to_lowercase()).ok()
}

/// Pick an index from a non-empty candidate list, with probability
/// proportional to record weight.  All-zero weights fall back to a
/// uniform pick.  Every call draws fresh.
pub fn weighted_index<R: Rng>(rng: &mut R, records: &[&ZoneRecord]) -> usize {
    let total: u64 = records.iter().map(|r| weight_of(r)).sum();
    if total == 0 {
        return rng.gen_range(0..records.len());
    }

    index_for_draw(rng.gen_range(0..total), records)
}

/// The accumulation half of weighted selection: walk the candidates in
/// input order and return the first whose running weight total exceeds
/// the draw.
fn index_for_draw(draw: u64, records: &[&ZoneRecord]) -> usize {
    let mut acc = 0;
    for (i, record) in records.iter().enumerate() {
        acc += weight_of(record);
        if draw < acc {
            return i;
        }
    }
    records.len() - 1
}

fn weight_of(record: &ZoneRecord) -> u64 {
    u64::from(record.weight.max(0).unsigned_abs())
}

fn record_ttl(record: &ZoneRecord) -> u32 {
    record.ttl.max(0).unsigned_abs()
}

/// Split text into TXT character strings: each at most 255 octets,
/// never splitting a code point, concatenating back to the original.
pub fn split_txt_strings(text: &str) -> Vec<Bytes> {
    let mut strings = Vec::with_capacity(text.len() / CHARSTRING_MAX_LEN + 1);
    let mut current = String::new();

    for ch in text.chars() {
        if current.len() + ch.len_utf8() > CHARSTRING_MAX_LEN {
            strings.push(Bytes::from(current));
            current = String::new();
        }
        current.push(ch);
    }
    if !current.is_empty() || strings.is_empty() {
        strings.push(Bytes::from(current));
    }

    strings
}

#[cfg(test)]
mod tests {
    use tokio::net::UdpSocket;

    use super::*;
    use crate::cache::{DEFAULT_CAPACITY, DEFAULT_ENTRY_TTL};
    use crate::store::ZoneStore;
    use crate::test_util::{record, MemoryStore};

    fn domain(s: &str) -> DomainName {
        DomainName::from_dotted_string(s).unwrap()
    }

    fn query(name: &str, rtype: RecordType) -> Message {
        Message::from_question(
            42,
            Question {
                name: domain(name),
                qtype: QueryType::Record(rtype),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        )
    }

    fn authority_over(
        store: Arc<MemoryStore>,
        hosted: &[&str],
        upstream: SocketAddr,
    ) -> Authority {
        let cache = Arc::new(ZoneCache::new(
            store as Arc<dyn ZoneStore>,
            DEFAULT_CAPACITY,
            DEFAULT_ENTRY_TTL,
        ));
        let filter = Arc::new(ZoneFilter::from_names(hosted.iter().copied()));
        let config = AuthorityConfig::from_parts(
            "ns1.example-dns.net",
            "ns2.example-dns.net",
            "hostmaster@example-dns.net",
            upstream,
        )
        .unwrap();
        Authority::new(config, filter, cache)
    }

    fn unreachable_upstream() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    struct FixedGenerator(Result<String, String>);

    #[async_trait]
    impl TextGenerator for FixedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, GeneratorError> {
            self.0.clone().map_err(|message| GeneratorError { message })
        }
    }

    #[tokio::test]
    async fn basic_a_resolution() {
        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "api.example.com", "A", "203.0.113.5", 60, 0));
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("api.example.com.", RecordType::A)).await;

        assert!(response.header.is_authoritative);
        assert_eq!(Rcode::NoError, response.header.rcode);
        assert_eq!(1, response.questions.len());
        assert_eq!(
            vec![ResourceRecord {
                name: domain("api.example.com."),
                rdata: Rdata::A { address: "203.0.113.5".parse().unwrap() },
                rclass: RecordClass::IN,
                ttl: 60,
            }],
            response.answers,
        );
    }

    #[tokio::test]
    async fn a_resolution_only_matches_the_question_name() {
        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "api.example.com", "A", "203.0.113.5", 60, 0));
        store.add_record(record("example.com", "web.example.com", "A", "203.0.113.6", 60, 0));
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("web.example.com.", RecordType::A)).await;

        assert_eq!(
            vec![Rdata::A { address: "203.0.113.6".parse().unwrap() }],
            response.answers.iter().map(|rr| rr.rdata.clone()).collect::<Vec<_>>(),
        );
    }

    #[tokio::test]
    async fn uppercase_names_are_normalized() {
        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "api.example.com", "A", "203.0.113.5", 60, 0));
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("API.EXAMPLE.COM.", RecordType::A)).await;

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert_eq!(1, response.answers.len());
    }

    #[tokio::test]
    async fn unhosted_zone_is_nxdomain_without_a_store_read() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &[], unreachable_upstream());

        let response = authority.respond(&query("foo.unhosted.test.", RecordType::A)).await;

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert!(response.answers.is_empty());
        assert_eq!(0, store.record_fetches());
    }

    #[tokio::test]
    async fn blacklisted_names_are_nxdomain_without_a_store_read() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["version.bind"], unreachable_upstream());

        let response = authority.respond(&query("version.bind.", RecordType::A)).await;

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert_eq!(0, store.record_fetches());
    }

    #[tokio::test]
    async fn name_present_but_recordless_is_nxdomain() {
        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "api.example.com", "A", "203.0.113.5", 60, 0));
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("missing.example.com.", RecordType::A)).await;

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn soa_is_synthesized_from_configuration() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("example.com.", RecordType::SOA)).await;

        let today = Utc::now();
        let expected_serial =
            today.year().unsigned_abs() * 10_000 + today.month() * 100 + today.day();

        assert_eq!(Rcode::NoError, response.header.rcode);
        match &response.answers[0].rdata {
            Rdata::SOA { mname, rname, serial, refresh, retry, expire, minimum } => {
                assert_eq!(&domain("ns1.example-dns.net."), mname);
                assert_eq!(&domain("hostmaster.example-dns.net."), rname);
                assert_eq!(&expected_serial, serial);
                assert_eq!(&1800, refresh);
                assert_eq!(&600, retry);
                assert_eq!(&86400, expire);
                assert_eq!(&60, minimum);
            }
            other => panic!("expected SOA, got {other:?}"),
        }
        assert_eq!(3600, response.answers[0].ttl);
        // metadata answers never touch the store
        assert_eq!(0, store.record_fetches());
    }

    #[tokio::test]
    async fn ns_answers_list_both_nameservers() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("example.com.", RecordType::NS)).await;

        assert_eq!(
            vec![
                Rdata::NS { nsdname: domain("ns1.example-dns.net.") },
                Rdata::NS { nsdname: domain("ns2.example-dns.net.") },
            ],
            response.answers.iter().map(|rr| rr.rdata.clone()).collect::<Vec<_>>(),
        );
        assert_eq!(0, store.record_fetches());
    }

    #[tokio::test]
    async fn caa_answer_points_at_the_security_mailbox() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("Example.Com.", RecordType::CAA)).await;

        match &response.answers[0].rdata {
            Rdata::CAA { flags, tag, value } => {
                assert_eq!(&0, flags);
                assert_eq!(&Bytes::from_static(b"iodef"), tag);
                assert_eq!(&Bytes::from_static(b"mailto:security@example.com"), value);
            }
            other => panic!("expected CAA, got {other:?}"),
        }
        assert_eq!(0, store.record_fetches());
    }

    #[tokio::test]
    async fn cname_question_returns_the_alias_target() {
        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "cdn.example.com", "CNAME", "up.example.net", 300, 0));
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("cdn.example.com.", RecordType::CNAME)).await;

        assert_eq!(
            vec![ResourceRecord {
                name: domain("cdn.example.com."),
                rdata: Rdata::CNAME { cname: domain("up.example.net.") },
                rclass: RecordClass::IN,
                ttl: 300,
            }],
            response.answers,
        );
    }

    #[tokio::test]
    async fn a_question_over_a_cname_is_flattened() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (size, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..size]).unwrap();
            assert_eq!(domain("up.example.net."), request.questions[0].name);
            let mut response = request.make_response();
            response.answers = vec![ResourceRecord {
                name: request.questions[0].name.clone(),
                rdata: Rdata::A { address: "198.51.100.7".parse().unwrap() },
                rclass: RecordClass::IN,
                ttl: 30,
            }];
            let octets = response.to_octets().unwrap();
            upstream.send_to(&octets, peer).await.unwrap();
        });

        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "cdn.example.com", "CNAME", "up.example.net", 300, 0));
        let authority = authority_over(Arc::clone(&store), &["example.com"], upstream_addr);

        let response = authority.respond(&query("cdn.example.com.", RecordType::A)).await;

        // the alias is hidden: the answer is an A record under the
        // query's owner name, with the CNAME record's TTL
        assert_eq!(
            vec![ResourceRecord {
                name: domain("cdn.example.com."),
                rdata: Rdata::A { address: "198.51.100.7".parse().unwrap() },
                rclass: RecordClass::IN,
                ttl: 300,
            }],
            response.answers,
        );
    }

    #[tokio::test]
    async fn flattening_propagates_the_upstream_rcode() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (size, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let request = Message::from_octets(&buf[..size]).unwrap();
            let mut response = request.make_response();
            response.header.rcode = Rcode::NameError;
            let octets = response.to_octets().unwrap();
            upstream.send_to(&octets, peer).await.unwrap();
        });

        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "cdn.example.com", "CNAME", "gone.example.net", 300, 0));
        let authority = authority_over(Arc::clone(&store), &["example.com"], upstream_addr);

        let response = authority.respond(&query("cdn.example.com.", RecordType::A)).await;

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert!(response.answers.is_empty());
    }

    #[tokio::test]
    async fn txt_question_with_a_normal_name_is_notimp() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("example.com.", RecordType::TXT)).await;

        assert_eq!(Rcode::NotImplemented, response.header.rcode);
    }

    #[tokio::test]
    async fn unsupported_qtype_is_notimp() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let mut message = query("example.com.", RecordType::A);
        message.questions[0].qtype = QueryType::AXFR;
        let response = authority.respond(&message).await;

        assert_eq!(Rcode::NotImplemented, response.header.rcode);
    }

    #[tokio::test]
    async fn mixed_questions_keep_answers_and_report_the_failure() {
        let store = Arc::new(MemoryStore::new());
        store.add_record(record("example.com", "api.example.com", "A", "203.0.113.5", 60, 0));
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let mut message = query("api.example.com.", RecordType::A);
        message.questions.push(Question {
            name: domain("example.com."),
            qtype: QueryType::AXFR,
            qclass: QueryClass::Record(RecordClass::IN),
        });
        let response = authority.respond(&message).await;

        assert_eq!(1, response.answers.len());
        assert_eq!(Rcode::NotImplemented, response.header.rcode);
    }

    #[tokio::test]
    async fn bad_punycode_txt_without_a_generator_is_notimp() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("xn--$$$.example.com.", RecordType::TXT)).await;

        assert_eq!(Rcode::NotImplemented, response.header.rcode);
        assert_eq!(0, store.record_fetches());
    }

    #[tokio::test]
    async fn bad_punycode_txt_with_a_generator_answers() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream())
            .with_generator(Arc::new(FixedGenerator(Ok("forty-two".to_string()))));

        let response = authority.respond(&query("xn--$$$.example.com.", RecordType::TXT)).await;

        assert_eq!(Rcode::NoError, response.header.rcode);
        match &response.answers[0].rdata {
            Rdata::TXT { strings } => {
                assert_eq!(vec![Bytes::from_static(b"forty-two")], *strings);
            }
            other => panic!("expected TXT, got {other:?}"),
        }
        assert_eq!(3600, response.answers[0].ttl);
    }

    #[tokio::test]
    async fn bad_punycode_txt_with_a_failing_generator_is_servfail() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream())
            .with_generator(Arc::new(FixedGenerator(Err("over capacity".to_string()))));

        let response = authority.respond(&query("xn--$$$.example.com.", RecordType::TXT)).await;

        assert_eq!(Rcode::ServerFailure, response.header.rcode);
    }

    #[tokio::test]
    async fn bad_punycode_non_txt_is_nxdomain() {
        let store = Arc::new(MemoryStore::new());
        let authority = authority_over(Arc::clone(&store), &["example.com"], unreachable_upstream());

        let response = authority.respond(&query("xn--$$$.example.com.", RecordType::A)).await;

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert_eq!(0, store.record_fetches());
    }

    #[test]
    fn weighted_index_follows_the_weights() {
        let heavy = record("example.com", "www.example.com", "A", "203.0.113.2", 60, 3);
        let light = record("example.com", "www.example.com", "A", "203.0.113.1", 60, 1);
        let candidates = vec![&light, &heavy];

        let mut rng = rand::thread_rng();
        let trials = 10_000;
        let mut heavy_picks = 0;
        for _ in 0..trials {
            if weighted_index(&mut rng, &candidates) == 1 {
                heavy_picks += 1;
            }
        }

        // expect 0.75 +/- 3 sigma (sigma ~= 0.0043 over 10k trials)
        let frequency = f64::from(heavy_picks) / f64::from(trials);
        assert!(
            (frequency - 0.75).abs() < 0.015,
            "heavy pick frequency {frequency} too far from 0.75"
        );
    }

    #[test]
    fn weighted_index_with_zero_weights_is_uniform() {
        let a = record("example.com", "www.example.com", "A", "203.0.113.1", 60, 0);
        let b = record("example.com", "www.example.com", "A", "203.0.113.2", 60, 0);
        let candidates = vec![&a, &b];

        let mut rng = rand::thread_rng();
        let trials = 10_000;
        let mut first_picks = 0;
        for _ in 0..trials {
            if weighted_index(&mut rng, &candidates) == 0 {
                first_picks += 1;
            }
        }

        let frequency = f64::from(first_picks) / f64::from(trials);
        assert!(
            (frequency - 0.5).abs() < 0.015,
            "uniform pick frequency {frequency} too far from 0.5"
        );
    }

    #[test]
    fn weighted_selection_accumulates_in_input_order() {
        let w2 = record("example.com", "www.example.com", "A", "203.0.113.1", 60, 2);
        let w3 = record("example.com", "www.example.com", "A", "203.0.113.2", 60, 3);
        let candidates = vec![&w2, &w3];

        // draws 0 and 1 land in the first record's share, 2 to 4 in
        // the second's
        let picks: Vec<usize> = (0..5).map(|draw| index_for_draw(draw, &candidates)).collect();
        assert_eq!(vec![0, 0, 1, 1, 1], picks);
    }

    #[test]
    fn negative_weights_count_as_zero() {
        let bad = record("example.com", "www.example.com", "A", "203.0.113.1", 60, -5);
        let good = record("example.com", "www.example.com", "A", "203.0.113.2", 60, 1);
        let candidates = vec![&bad, &good];

        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            assert_eq!(1, weighted_index(&mut rng, &candidates));
        }
    }

    #[test]
    fn split_txt_strings_handles_short_text() {
        let strings = split_txt_strings("hello");
        assert_eq!(vec![Bytes::from_static(b"hello")], strings);
    }

    #[test]
    fn split_txt_strings_handles_empty_text() {
        assert_eq!(vec![Bytes::new()], split_txt_strings(""));
    }

    #[test]
    fn split_txt_strings_respects_code_point_boundaries() {
        // three-octet code points: 255 is not a multiple of 3, so a
        // naive byte split would cut one apart
        let text = "\u{20AC}".repeat(300);
        let strings = split_txt_strings(&text);

        let mut reassembled = Vec::new();
        for s in &strings {
            assert!(s.len() <= CHARSTRING_MAX_LEN);
            assert!(std::str::from_utf8(s).is_ok(), "fragment splits a code point");
            reassembled.extend_from_slice(s);
        }
        assert_eq!(text.as_bytes(), &reassembled[..]);
    }

    #[test]
    fn normalize_name_strips_lowercases_and_encodes() {
        assert_eq!(Some("api.example.com".to_string()), normalize_name("API.Example.Com."));
        assert_eq!(Some("xn--mnchen-3ya.example".to_string()), normalize_name("M\u{FC}nchen.example"));
        assert_eq!(None, normalize_name("xn--$$$.example.com."));
    }
}
