//! Port knocking: touch a sequence of TCP ports so a firewall daemon on the
//! server opens the SSH port before we connect.

use crate::config::KnockConfig;
use crate::error::{ApiError, ErrorCode, MuxResult};
use rand::seq::index;
use std::time::Duration;
use tokio::net::TcpStream;

pub const MIN_SEQUENCE_LEN: usize = 3;
pub const MAX_SEQUENCE_LEN: usize = 10;

const COMMON_SERVICE_PORTS: [u16; 7] = [21, 22, 25, 80, 443, 3306, 5432];
const GENERATED_PORT_MIN: u16 = 7000;
const GENERATED_PORT_MAX: u16 = 9999;

/// Knock every port in order. Individual knocks never fail the sequence: a
/// refused or timed-out connect still delivered its SYN.
pub async fn knock(host: &str, ports: &[u16], config: &KnockConfig) {
    if ports.is_empty() {
        return;
    }
    tracing::info!(host, ports = ?ports, "Starting knock sequence");

    let timeout = Duration::from_millis(config.timeout_ms);
    for (index, port) in ports.iter().enumerate() {
        knock_port(host, *port, timeout).await;
        tracing::debug!(host, port, step = index + 1, total = ports.len(), "Knocked");
        if index + 1 < ports.len() {
            tokio::time::sleep(Duration::from_millis(config.delay_ms)).await;
        }
    }

    tokio::time::sleep(Duration::from_millis(config.settle_ms)).await;
}

async fn knock_port(host: &str, port: u16, timeout: Duration) {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => drop(stream),
        Ok(Err(err)) => tracing::trace!(host, port, error = %err, "Knock refused"),
        Err(_) => tracing::trace!(host, port, "Knock timed out"),
    }
}

/// Parse a comma or whitespace separated knock sequence such as
/// `"7000, 8000 9000"`.
pub fn parse_knock_sequence(sequence: &str) -> MuxResult<Vec<u16>> {
    let parts: Vec<&str> = sequence
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        return Err(invalid("Knock sequence is empty"));
    }
    if parts.len() < MIN_SEQUENCE_LEN {
        return Err(invalid(format!(
            "Knock sequence must have at least {MIN_SEQUENCE_LEN} ports"
        )));
    }
    if parts.len() > MAX_SEQUENCE_LEN {
        return Err(invalid(format!(
            "Knock sequence cannot exceed {MAX_SEQUENCE_LEN} ports"
        )));
    }

    let mut ports = Vec::with_capacity(parts.len());
    for part in parts {
        let value: u32 = part
            .parse()
            .map_err(|_| invalid(format!("Invalid port number: {part}")))?;
        let port = u16::try_from(value)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| invalid(format!("Port out of range (1-65535): {value}")))?;
        if COMMON_SERVICE_PORTS.contains(&port) {
            tracing::warn!(port, "Knock sequence uses a common service port");
        }
        ports.push(port);
    }
    Ok(ports)
}

/// Random sequence of distinct ports in 7000-9999.
pub fn generate_knock_sequence(len: usize) -> MuxResult<Vec<u16>> {
    if !(MIN_SEQUENCE_LEN..=MAX_SEQUENCE_LEN).contains(&len) {
        return Err(invalid(format!(
            "Knock sequence length must be between {MIN_SEQUENCE_LEN} and {MAX_SEQUENCE_LEN}"
        )));
    }
    let span = usize::from(GENERATED_PORT_MAX - GENERATED_PORT_MIN) + 1;
    let mut rng = rand::thread_rng();
    Ok(index::sample(&mut rng, span, len)
        .into_iter()
        .map(|offset| GENERATED_PORT_MIN + offset as u16)
        .collect())
}

fn invalid(message: impl Into<String>) -> crate::error::MuxError {
    ApiError::new(ErrorCode::InvalidArgument, message).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::net::TcpListener;

    #[test]
    fn parses_mixed_separators() {
        assert_eq!(
            parse_knock_sequence("7000, 8000 9000,\t9100").unwrap(),
            vec![7000, 8000, 9000, 9100]
        );
    }

    #[test]
    fn rejects_bad_sequences() {
        for input in ["", "  ", "7000,8000", "1,2,3,4,5,6,7,8,9,10,11", "7000,abc,9000", "0,1,2", "7000,8000,70000"] {
            let err = parse_knock_sequence(input).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "input {input:?}");
        }
    }

    #[test]
    fn common_ports_are_allowed() {
        assert_eq!(parse_knock_sequence("22 80 443").unwrap(), vec![22, 80, 443]);
    }

    #[test]
    fn generated_sequence_is_distinct_and_in_range() {
        let ports = generate_knock_sequence(6).unwrap();
        assert_eq!(ports.len(), 6);
        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), 6);
        assert!(ports.iter().all(|p| (7000..=9999).contains(p)));
        assert!(generate_knock_sequence(2).is_err());
    }

    #[tokio::test]
    async fn knock_touches_each_port_in_order() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ports = [
            first.local_addr().unwrap().port(),
            second.local_addr().unwrap().port(),
        ];
        let config = KnockConfig {
            delay_ms: 10,
            timeout_ms: 200,
            settle_ms: 0,
        };

        knock("127.0.0.1", &ports, &config).await;

        let (_a, _) = tokio::time::timeout(Duration::from_secs(1), first.accept())
            .await
            .unwrap()
            .unwrap();
        let (_b, _) = tokio::time::timeout(Duration::from_secs(1), second.accept())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn knock_ignores_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let config = KnockConfig {
            delay_ms: 1,
            timeout_ms: 100,
            settle_ms: 0,
        };
        knock("127.0.0.1", &[port, port, port], &config).await;
    }
}
