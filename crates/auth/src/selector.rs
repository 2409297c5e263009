use crate::callback::CallbackServer;
use crate::deadline::Deadline;
use crate::error::AuthError;
use crate::port;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a freshly bound server must keep serving before it is committed to.
pub const STARTUP_GRACE: Duration = Duration::from_millis(100);

/// Starts a callback server on the first bindable port of `candidates`.
///
/// Ports are tried strictly in order, one at a time. Occupied ports are
/// skipped; any other failure aborts the search.
pub async fn acquire(
    deadline: &Deadline,
    candidates: &[u16],
    expected_state: Option<&str>,
) -> Result<CallbackServer, AuthError> {
    acquire_with(deadline, candidates, |port| {
        CallbackServer::bind(port, expected_state.map(str::to_string))
    })
    .await
}

async fn acquire_with<F, Fut>(
    deadline: &Deadline,
    candidates: &[u16],
    mut bind: F,
) -> Result<CallbackServer, AuthError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = Result<CallbackServer, AuthError>>,
{
    if candidates.is_empty() {
        return Err(AuthError::NoCandidatePorts);
    }

    for (attempt, &candidate) in candidates.iter().enumerate() {
        if deadline.is_expired() {
            return Err(AuthError::Timeout);
        }

        if port::is_occupied(candidate) {
            info!(
                "Port {} is occupied, trying next candidate ({}/{})",
                candidate,
                attempt + 1,
                candidates.len()
            );
            continue;
        }

        let server = match bind(candidate).await {
            Ok(server) => server,
            Err(AuthError::PortOccupied { port }) => {
                warn!("Port {} was taken between probe and bind, moving on", port);
                continue;
            }
            Err(e) => return Err(e),
        };

        let server = server.ensure_serving(deadline, STARTUP_GRACE).await?;
        debug!("Committed to callback port {}", server.port());
        return Ok(server);
    }

    Err(AuthError::AllPortsOccupied {
        attempted: candidates.to_vec(),
    })
}

/// Acquires a port and blocks until its callback resolves.
pub async fn acquire_and_wait(
    deadline: &Deadline,
    candidates: &[u16],
    expected_state: Option<&str>,
) -> Result<(String, u16), AuthError> {
    let server = acquire(deadline, candidates, expected_state).await?;
    let port = server.port();
    let code = server.wait(deadline).await?;
    Ok((code, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::is_occupied;
    use crate::port::test_support::{free_port, occupy};
    use pretty_assertions::assert_eq;
    use std::io;
    use std::net::TcpListener;

    fn distinct_free_ports(n: usize) -> Vec<u16> {
        let holders: Vec<TcpListener> = (0..n).map(|_| occupy(0)).collect();
        holders
            .iter()
            .map(|l| l.local_addr().unwrap().port())
            .collect()
    }

    #[tokio::test]
    async fn falls_back_to_last_free_candidate() {
        let candidates = distinct_free_ports(4);
        let _held: Vec<TcpListener> = candidates[..3].iter().map(|&p| occupy(p)).collect();
        let deadline = Deadline::after(Duration::from_secs(10));

        let server = acquire(&deadline, &candidates, None).await.unwrap();
        assert_eq!(server.port(), candidates[3]);
    }

    #[tokio::test]
    async fn prefers_first_candidate_when_free() {
        let candidates = distinct_free_ports(3);
        let deadline = Deadline::after(Duration::from_secs(10));

        let server = acquire(&deadline, &candidates, None).await.unwrap();
        assert_eq!(server.port(), candidates[0]);
        for &other in &candidates[1..] {
            assert!(!is_occupied(other));
        }
    }

    #[tokio::test]
    async fn reports_every_candidate_when_all_occupied() {
        let candidates = distinct_free_ports(3);
        let _held: Vec<TcpListener> = candidates.iter().map(|&p| occupy(p)).collect();
        let deadline = Deadline::after(Duration::from_secs(10));

        let err = acquire(&deadline, &candidates, None).await.err().unwrap();
        match err {
            AuthError::AllPortsOccupied { attempted } => assert_eq!(attempted, candidates),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn no_server_left_bound_after_exhaustion() {
        let candidates = distinct_free_ports(2);
        let held: Vec<TcpListener> = candidates.iter().map(|&p| occupy(p)).collect();
        let deadline = Deadline::after(Duration::from_secs(10));

        assert!(acquire(&deadline, &candidates, None).await.is_err());
        drop(held);
        for &p in &candidates {
            assert!(!is_occupied(p));
        }
    }

    #[tokio::test]
    async fn startup_failure_aborts_without_trying_later_ports() {
        let candidates = distinct_free_ports(2);
        let refused = candidates[0];
        let deadline = Deadline::after(Duration::from_secs(10));
        let mut tried = Vec::new();

        let err = acquire_with(&deadline, &candidates, |port| {
            tried.push(port);
            async move {
                if port == refused {
                    Err(AuthError::ServerStartup {
                        port,
                        source: io::Error::from(io::ErrorKind::PermissionDenied),
                    })
                } else {
                    CallbackServer::bind(port, None).await
                }
            }
        })
        .await
        .err()
        .unwrap();

        match err {
            AuthError::ServerStartup { port, source } => {
                assert_eq!(port, refused);
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tried, vec![refused]);
        assert!(!is_occupied(candidates[1]));
    }

    #[tokio::test]
    async fn empty_candidate_list_is_rejected() {
        let deadline = Deadline::after(Duration::from_secs(10));
        let err = acquire(&deadline, &[], None).await.err().unwrap();
        assert!(matches!(err, AuthError::NoCandidatePorts));
    }

    #[tokio::test]
    async fn expired_deadline_stops_the_search() {
        let candidates = vec![free_port()];
        let deadline = Deadline::after(Duration::ZERO);
        let err = acquire(&deadline, &candidates, None).await.err().unwrap();
        assert!(matches!(err, AuthError::Timeout));
        assert!(!is_occupied(candidates[0]));
    }

    #[tokio::test]
    async fn acquire_and_wait_returns_code_with_port() {
        let candidates = distinct_free_ports(2);
        let _held = occupy(candidates[0]);
        let deadline = Deadline::after(Duration::from_secs(10));
        let target = candidates[1];

        let browser = tokio::spawn(async move {
            for _ in 0..50 {
                let url = format!("http://127.0.0.1:{}/callback?code=XYZ", target);
                if let Ok(response) = reqwest::get(url).await {
                    return response.status();
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("callback server never came up");
        });

        let (code, used) = acquire_and_wait(&deadline, &candidates, None).await.unwrap();
        assert_eq!(code, "XYZ");
        assert_eq!(used, target);
        assert_eq!(browser.await.unwrap(), reqwest::StatusCode::OK);
    }
}
