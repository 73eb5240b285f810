use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

const MAX_DNS_RESPONSE_SIZE: usize = 4096;

/// Result of talking to the nameservers about one domain.
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    Successful { addresses: Vec<IpAddr> },
    Failed { description: String },
}

/// Issues and correlates UDP nameserver queries.
///
/// Each lookup asks for A and AAAA records, walking the configured
/// nameservers until one of them answers; individual queries are bounded by
/// `query_timeout`. Network errors never escape as errors: every failure
/// becomes a `LookupOutcome::Failed` with a description.
pub struct NameserverInteractor {
    nameservers: Vec<SocketAddr>,
    query_timeout: Duration,
    attempts: usize,
    next_query_id: AtomicU16,
}

impl NameserverInteractor {
    pub fn new(nameservers: Vec<SocketAddr>, query_timeout: Duration, attempts: usize) -> Self {
        Self {
            nameservers,
            query_timeout,
            attempts: attempts.max(1),
            next_query_id: AtomicU16::new(1),
        }
    }

    pub async fn lookup(&self, domain: &str) -> LookupOutcome {
        let name = match Name::from_str(&format!("{}.", domain.trim_end_matches('.'))) {
            Ok(name) => name,
            Err(e) => {
                return LookupOutcome::Failed {
                    description: format!("invalid domain name '{}': {}", domain, e),
                }
            }
        };

        if self.nameservers.is_empty() {
            return LookupOutcome::Failed {
                description: "no nameservers configured".to_string(),
            };
        }

        let mut last_error = String::new();

        for attempt in 0..self.attempts {
            for nameserver in &self.nameservers {
                match self.query_with_fallback(*nameserver, &name).await {
                    Ok(addresses) if !addresses.is_empty() => {
                        debug!(
                            domain,
                            nameserver = %nameserver,
                            count = addresses.len(),
                            "lookup finished"
                        );
                        return LookupOutcome::Successful { addresses };
                    }
                    Ok(_) => {
                        last_error = format!("{} returned no addresses", nameserver);
                    }
                    Err(e) => {
                        trace!(
                            domain,
                            nameserver = %nameserver,
                            attempt,
                            error = %e,
                            "query failed"
                        );
                        last_error = e;
                    }
                }
            }
        }

        warn!(domain, error = %last_error, "lookup failed");
        LookupOutcome::Failed {
            description: last_error,
        }
    }

    /// One A query; AAAA only when the name has no A records at all, so the
    /// usual case costs a single datagram.
    async fn query_with_fallback(
        &self,
        nameserver: SocketAddr,
        name: &Name,
    ) -> Result<Vec<IpAddr>, String> {
        let addresses = self.query_one(nameserver, name, RecordType::A).await?;
        if !addresses.is_empty() {
            return Ok(addresses);
        }

        trace!(name = %name, "no A records, asking for AAAA");
        self.query_one(nameserver, name, RecordType::AAAA).await
    }

    async fn query_one(
        &self,
        nameserver: SocketAddr,
        name: &Name,
        record_type: RecordType,
    ) -> Result<Vec<IpAddr>, String> {
        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);

        let mut message = Message::new();
        message
            .set_id(query_id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name.clone(), record_type));

        let request = message
            .to_vec()
            .map_err(|e| format!("query encoding failed: {}", e))?;

        let bind_addr: SocketAddr = if nameserver.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16, 0, 0, 0, 0, 0, 0, 0], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| format!("bind failed: {}", e))?;
        socket
            .connect(nameserver)
            .await
            .map_err(|e| format!("connect to {} failed: {}", nameserver, e))?;

        timeout(self.query_timeout, socket.send(&request))
            .await
            .map_err(|_| format!("send to {} timed out", nameserver))?
            .map_err(|e| format!("send to {} failed: {}", nameserver, e))?;

        let mut buf = vec![0u8; MAX_DNS_RESPONSE_SIZE];

        // Ignore stale/foreign datagrams until the matching response or the
        // query timeout arrives.
        loop {
            let n = timeout(self.query_timeout, socket.recv(&mut buf))
                .await
                .map_err(|_| format!("no answer from {} in time", nameserver))?
                .map_err(|e| format!("recv from {} failed: {}", nameserver, e))?;

            let response = match Message::from_vec(&buf[..n]) {
                Ok(response) => response,
                Err(_) => continue,
            };

            if response.id() != query_id || response.message_type() != MessageType::Response {
                continue;
            }

            if response.response_code() != ResponseCode::NoError {
                return Err(format!(
                    "{} answered {} for {} {}",
                    nameserver,
                    response.response_code(),
                    name,
                    record_type
                ));
            }

            let addresses = response
                .answers()
                .iter()
                .filter_map(|record| match record.data() {
                    RData::A(a) => Some(IpAddr::V4(a.0)),
                    RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
                    _ => None,
                })
                .collect();

            return Ok(addresses);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;

    /// Minimal fake nameserver: answers every A query with 127.0.0.1 and
    /// counts the queries it saw.
    async fn spawn_fake_nameserver() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let query = match Message::from_vec(&buf[..n]) {
                    Ok(query) => query,
                    Err(_) => continue,
                };
                let _ = seen_tx.send(());

                let mut response = Message::new();
                response
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .set_op_code(OpCode::Query)
                    .set_recursion_desired(true)
                    .set_recursion_available(true);

                if let Some(q) = query.queries().first() {
                    response.add_query(q.clone());
                    if q.query_type() == RecordType::A {
                        response.add_answer(Record::from_rdata(
                            q.name().clone(),
                            60,
                            RData::A(A::new(127, 0, 0, 1)),
                        ));
                    }
                }

                let bytes = response.to_vec().unwrap();
                let _ = socket.send_to(&bytes, peer).await;
            }
        });

        (addr, seen_rx)
    }

    #[tokio::test]
    async fn lookup_collects_a_records() {
        let (addr, _seen) = spawn_fake_nameserver().await;
        let interactor =
            NameserverInteractor::new(vec![addr], Duration::from_millis(500), 1);

        match interactor.lookup("echo.test").await {
            LookupOutcome::Successful { addresses } => {
                assert!(addresses.contains(&IpAddr::V4([127, 0, 0, 1].into())));
            }
            LookupOutcome::Failed { description } => panic!("lookup failed: {}", description),
        }
    }

    #[tokio::test]
    async fn unreachable_nameserver_reports_failure() {
        // Reserved port with nothing listening; the query must time out.
        let interactor = NameserverInteractor::new(
            vec!["127.0.0.1:9".parse().unwrap()],
            Duration::from_millis(100),
            1,
        );

        match interactor.lookup("echo.test").await {
            LookupOutcome::Failed { description } => {
                assert!(!description.is_empty());
            }
            LookupOutcome::Successful { .. } => panic!("expected a failure"),
        }
    }
}
