//! Talking to the upstream recursive resolver.
//!
//! The query plane is authoritative and never recurses for clients,
//! but two jobs still need someone else's view of the DNS: resolving
//! CNAME targets during flattening, and checking a zone's delegation
//! before activating it.  Both go through here.

use bytes::BytesMut;
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use dns_types::protocol::types::{Message, Question};

use crate::net::{read_tcp_bytes, send_tcp_bytes, send_udp_bytes, UDP_PAYLOAD_LIMIT};

/// Hard deadline for a single exchange attempt.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ask the upstream resolver a question, preferring UDP and falling
/// back to TCP if the response came back truncated.
///
/// Returns `None` on transport failure or if no response matching the
/// request arrives in time.  A returned message may still carry a
/// non-success rcode: that is the upstream's verdict and callers are
/// expected to pass it on.
pub async fn exchange(address: SocketAddr, question: &Question) -> Option<Message> {
    let mut request = Message::from_question(rand::thread_rng().gen(), question.clone());
    request.header.recursion_desired = true;

    match request.to_octets() {
        Ok(mut serialised_request) => {
            tracing::trace!(%question, %address, "querying upstream resolver");

            if let Some(response) = exchange_udp(address, &mut serialised_request).await {
                if response_matches_request(&request, &response) {
                    if !response.header.is_truncated {
                        return Some(response);
                    }
                    tracing::trace!(%question, "upstream UDP response truncated, retrying over TCP");
                }
            }

            if let Some(response) = exchange_tcp(address, &mut serialised_request).await {
                if response_matches_request(&request, &response) {
                    return Some(response);
                }
            }

            None
        }
        Err(error) => {
            tracing::warn!(message = ?request, ?error, "could not serialise upstream query");
            None
        }
    }
}

/// One UDP attempt, bounded by `EXCHANGE_TIMEOUT`.
async fn exchange_udp(address: SocketAddr, serialised_request: &mut [u8]) -> Option<Message> {
    timeout(
        EXCHANGE_TIMEOUT,
        exchange_udp_notimeout(address, serialised_request),
    )
    .await
    .ok()
    .flatten()
}

async fn exchange_udp_notimeout(
    address: SocketAddr,
    serialised_request: &mut [u8],
) -> Option<Message> {
    if serialised_request.len() > UDP_PAYLOAD_LIMIT {
        return None;
    }

    let mut buf = BytesMut::zeroed(UDP_PAYLOAD_LIMIT);
    let sock = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    sock.connect(address).await.ok()?;
    send_udp_bytes(&sock, serialised_request).await.ok()?;
    let size = sock.recv(&mut buf).await.ok()?;

    Message::from_octets(&buf[..size]).ok()
}

/// One TCP attempt, bounded by `EXCHANGE_TIMEOUT`.
async fn exchange_tcp(address: SocketAddr, serialised_request: &mut [u8]) -> Option<Message> {
    timeout(
        EXCHANGE_TIMEOUT,
        exchange_tcp_notimeout(address, serialised_request),
    )
    .await
    .ok()
    .flatten()
}

async fn exchange_tcp_notimeout(
    address: SocketAddr,
    serialised_request: &mut [u8],
) -> Option<Message> {
    let mut stream = TcpStream::connect(address).await.ok()?;
    send_tcp_bytes(&mut stream, serialised_request).await.ok()?;
    let bytes = read_tcp_bytes(&mut stream).await.ok()?;

    Message::from_octets(bytes.as_ref()).ok()
}

/// Basic validation that a resolver response belongs to the request:
/// ID, opcode, and questions match, and it is actually a response.
///
/// The rcode is deliberately not checked here - failure rcodes are
/// meaningful to callers.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    if request.header.id != response.header.id {
        return false;
    }
    if !response.header.is_response {
        return false;
    }
    if request.header.opcode != response.header.opcode {
        return false;
    }
    if request.questions != response.questions {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use dns_types::protocol::types::*;
    use std::net::Ipv4Addr;

    use super::*;

    fn matching_pair() -> (Message, Message) {
        let request = Message::from_question(
            1234,
            Question {
                name: DomainName::from_dotted_string("www.example.com.").unwrap(),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            },
        );

        let mut response = request.make_response();
        response.answers = vec![ResourceRecord {
            name: DomainName::from_dotted_string("www.example.com.").unwrap(),
            rdata: Rdata::A {
                address: Ipv4Addr::new(1, 1, 1, 1),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }];

        (request, response)
    }

    #[test]
    fn response_matches_request_accepts() {
        let (request, response) = matching_pair();
        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_id() {
        let (request, mut response) = matching_pair();
        response.header.id += 1;
        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_qr() {
        let (request, mut response) = matching_pair();
        response.header.is_response = false;
        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_questions() {
        let (request, mut response) = matching_pair();
        response.questions.clear();
        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_allows_failure_rcodes() {
        let (request, mut response) = matching_pair();
        response.header.rcode = Rcode::ServerFailure;
        assert!(response_matches_request(&request, &response));
    }
}
