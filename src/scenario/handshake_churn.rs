use super::{close_quietly, settle, Scenario, ScenarioReport};
use crate::error::{Error, ErrorKind};
use crate::harness::Harness;
use crate::role;
use crate::transport::SecureListener;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

const NAME: &str = "handshake_churn";

const GREETING: &[u8] = b"hi";
const ACK: &[u8] = b"ok";

/// Floods a TLS listener with raw connections that close before saying
/// anything, then checks that a well-formed client is still served and that
/// tearing the listener down while connections keep arriving leaves nothing
/// listening.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandshakeChurnScenario;

#[derive(Debug, Clone)]
pub struct ChurnReport {
    /// Raw connect/close cycles by the churn clients.
    pub churned: usize,
    pub failed_handshakes: usize,
    /// Accepted connections that dropped before sending the greeting.
    pub aborted: usize,
    pub served: usize,
    /// Raw connects made while the listener was being torn down.
    pub late_attempts: usize,
    pub refused_after_teardown: bool,
}

#[derive(Debug, Default)]
struct AcceptorStats {
    failed_handshakes: usize,
    aborted: usize,
    served: usize,
}

// Accepts until the listener is closed. Handshakes cut short by churn are
// counted, not fatal.
fn serve(listener: &mut SecureListener, greeting_timeout: Duration) -> Result<AcceptorStats, Error> {
    let mut stats = AcceptorStats::default();
    loop {
        match listener.accept() {
            Ok((mut stream, peer_addr)) => {
                stream.set_timeout(Some(greeting_timeout));
                let mut greeting = [0u8; 2];
                match stream.recv_exact(&mut greeting) {
                    Ok(()) if greeting == GREETING => {
                        stream.send_all(ACK)?;
                        stats.served += 1;
                        debug!(%peer_addr, "Served well-formed client");
                    }
                    Ok(()) => {
                        return Err(Error::ScenarioFailed {
                            scenario: NAME,
                            reason: format!("unexpected greeting {greeting:?} from {peer_addr}"),
                        });
                    }
                    Err(err) => {
                        debug!(%peer_addr, %err, "Client left after the handshake");
                        stats.aborted += 1;
                    }
                }
                close_quietly(Some(stream));
            }
            Err(err) => match err.kind() {
                ErrorKind::ListenerClosed => break,
                ErrorKind::Handshake
                | ErrorKind::UnexpectedEof
                | ErrorKind::ConnectionReset
                | ErrorKind::Timeout => {
                    trace!(%err, "Handshake failed");
                    stats.failed_handshakes += 1;
                }
                _ => return Err(err),
            },
        }
    }
    info!(?stats, "Acceptor finished");
    Ok(stats)
}

// One raw connect followed by an immediate close.
fn churn_once(addr: SocketAddr, timeout: Duration) -> io::Result<()> {
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    drop(stream);
    Ok(())
}

fn churn(addr: SocketAddr, connections: usize, timeout: Duration) -> Result<usize, Error> {
    for _ in 0..connections {
        churn_once(addr, timeout)?;
    }
    Ok(connections)
}

// Spreads the churn over `clients` threads scoped to the main flow. All of
// them have finished when this returns.
fn churn_concurrently(
    addr: SocketAddr,
    connections: usize,
    clients: usize,
    timeout: Duration,
) -> Result<usize, Error> {
    let per_client = connections / clients;
    let extra = connections % clients;
    thread::scope(|scope| -> Result<usize, Error> {
        let workers: Vec<_> = (0..clients)
            .map(|i| {
                let share = per_client + usize::from(i < extra);
                scope.spawn(move || churn(addr, share, timeout))
            })
            .collect();
        let mut churned = 0;
        for worker in workers {
            churned += worker.join().map_err(|_| Error::ScenarioFailed {
                scenario: NAME,
                reason: "churn thread panicked".to_string(),
            })??;
        }
        Ok(churned)
    })
}

// Keeps connecting until the listener refuses. Gives up after `limit`.
fn connect_until_refused(
    addr: SocketAddr,
    timeout: Duration,
    limit: Duration,
    ready: &role::Readiness,
) -> Result<usize, Error> {
    let start = Instant::now();
    let mut attempts = 0;
    loop {
        let result = churn_once(addr, timeout);
        if attempts == 0 {
            ready.signal();
        }
        match result {
            Ok(()) => attempts += 1,
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                debug!(attempts, "Listener refused connection");
                return Ok(attempts);
            }
            Err(err) => return Err(err.into()),
        }
        if start.elapsed() >= limit {
            return Err(Error::timeout("connect until refused", limit));
        }
    }
}

fn greeting_round_trip(harness: &Harness, port: u16) -> Result<(), Error> {
    let timeout = harness.config().connect_timeout;
    let mut client = harness.connect(port, Some(timeout))?;
    client.send_all(GREETING)?;
    let mut ack = [0u8; 2];
    client.recv_exact(&mut ack)?;
    close_quietly(Some(client));
    if ack != ACK {
        return Err(Error::ScenarioFailed {
            scenario: NAME,
            reason: format!("unexpected acknowledgement {ack:?}"),
        });
    }
    Ok(())
}

impl Scenario for HandshakeChurnScenario {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(&self, harness: &Harness) -> Result<ScenarioReport, Error> {
        let config = harness.config().clone();

        let mut listener = harness.listen()?;
        listener.set_handshake_timeout(Some(config.connect_timeout));
        let port = listener.port();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let closer = listener.closer();

        let greeting_timeout = config.connect_timeout;
        let mut acceptor = role::spawn("churn-acceptor", move |ready| {
            ready.signal();
            // The listener is dropped, and its port released, when this returns.
            serve(&mut listener, greeting_timeout)
        })?;

        let main = acceptor.wait_ready(config.ready_timeout).and_then(|()| {
            let churned = churn_concurrently(
                addr,
                config.churn_connections,
                config.churn_clients,
                config.connect_timeout,
            )?;
            info!(churned, "Churn finished");

            greeting_round_trip(harness, port)?;
            info!("Well-formed client served after churn");

            let timeout = config.connect_timeout;
            let mut late = role::spawn("late-client", move |ready| {
                connect_until_refused(addr, timeout, timeout * 2, ready)
            })?;
            let ready = late.wait_ready(config.ready_timeout);
            closer.close();
            ready?;
            Ok((churned, late))
        });
        // The acceptor only exits once the listener is closed. Roles are
        // joined in creation order: acceptor, then late client.
        closer.close();

        let ((churned, late), stats) = settle(main, acceptor.join())?;
        let late_attempts = late.join()?;

        let refused_after_teardown = match churn_once(addr, config.connect_timeout) {
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => true,
            Err(err) => return Err(err.into()),
            Ok(()) => false,
        };
        if !refused_after_teardown {
            return Err(Error::ScenarioFailed {
                scenario: NAME,
                reason: format!("{addr} still accepts connections after teardown"),
            });
        }
        if stats.served != 1 {
            return Err(Error::ScenarioFailed {
                scenario: NAME,
                reason: format!("expected one served client, got {}", stats.served),
            });
        }
        let dropped = stats.failed_handshakes + stats.aborted;
        if dropped > churned + late_attempts {
            return Err(Error::ScenarioFailed {
                scenario: NAME,
                reason: format!(
                    "{dropped} dropped connections from {} raw connects",
                    churned + late_attempts
                ),
            });
        }

        Ok(ScenarioReport::HandshakeChurn(ChurnReport {
            churned,
            failed_handshakes: stats.failed_handshakes,
            aborted: stats.aborted,
            served: stats.served,
            late_attempts,
            refused_after_teardown,
        }))
    }
}
