use super::{close_quietly, settle, Scenario, ScenarioReport};
use crate::error::{Error, ErrorKind};
use crate::harness::Harness;
use crate::oracle::{Condition, ExpectedOutcome};
use crate::payload::Payload;
use crate::role;
use crate::transport::BlockingMode;
use tracing::{debug, info, warn};

const NAME: &str = "large_send";

/// Sends a payload larger than the socket buffers over a stream with a short
/// timeout, set before the handshake, while the peer drains it. Whatever
/// arrives must be a prefix of what was sent; a send that completes must
/// deliver everything, and one that fails must fail with a timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct LargeSendScenario;

#[derive(Debug, Clone)]
pub struct LargeSendReport {
    pub reference_len: usize,
    pub received_len: usize,
    /// Whether the receiver saw close_notify.
    pub clean_eof: bool,
    /// Kind of the send (or connect) failure, if any.
    pub send_error: Option<ErrorKind>,
}

struct Received {
    bytes: Vec<u8>,
    clean_eof: bool,
}

impl Received {
    fn nothing() -> Self {
        Self {
            bytes: Vec::new(),
            clean_eof: false,
        }
    }
}

// The receiver side. Ends of stream with and without close_notify both count
// as "done"; the checks afterwards decide whether that was acceptable.
fn drain(listener: &mut crate::transport::SecureListener) -> Result<Received, Error> {
    let mut stream = match listener.accept() {
        Ok((stream, _)) => stream,
        Err(err) if matches!(err.kind(), ErrorKind::Handshake | ErrorKind::ListenerClosed) => {
            debug!(%err, "Sender went away before the handshake finished");
            return Ok(Received::nothing());
        }
        Err(err) => return Err(err),
    };

    let mut bytes = Vec::new();
    let clean_eof = match stream.recv_to_end(&mut bytes) {
        Ok(()) => true,
        Err(err) if matches!(err.kind(), ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset) => {
            debug!(%err, len = bytes.len(), "Stream ended without close_notify");
            false
        }
        Err(err) => return Err(err),
    };
    close_quietly(Some(stream));

    debug!(len = bytes.len(), clean_eof, "Receiver drained stream");
    Ok(Received { bytes, clean_eof })
}

impl Scenario for LargeSendScenario {
    fn name(&self) -> &'static str {
        NAME
    }

    fn run(&self, harness: &Harness) -> Result<ScenarioReport, Error> {
        let config = harness.config();
        let reference = Payload::large_send_reference();
        let send_timeout = config.send_timeout;

        let mut listener = harness.listen()?;
        listener.set_handshake_timeout(Some(config.connect_timeout));
        let port = listener.port();
        let closer = listener.closer();

        let mut acceptor = role::spawn("large-send-acceptor", move |ready| {
            ready.signal();
            drain(&mut listener)
        })?;

        // Connect and send failures of the expected kind are outcomes, not
        // errors; only anything else aborts the scenario.
        let main = acceptor.wait_ready(config.ready_timeout).and_then(|()| {
            let mut client = match harness.connect(port, Some(send_timeout)) {
                Ok(client) => client,
                Err(err) if err.kind() == ErrorKind::Timeout => {
                    warn!(%err, "Handshake did not finish within the send timeout");
                    closer.close();
                    return Ok(Err(err));
                }
                Err(err) => return Err(err),
            };
            let sent = client.send_payload(&reference);
            close_quietly(Some(client));
            Ok(sent)
        });
        if main.is_err() {
            closer.close();
        }

        let (sent, received) = settle(main, acceptor.join())?;

        let expected = match &sent {
            Ok(()) => ExpectedOutcome::ExactByteMatch,
            Err(_) => ExpectedOutcome::for_condition(
                BlockingMode::Timeout(send_timeout),
                Condition::DeadlineExceeded,
            )
            .ok_or_else(|| Error::ScenarioFailed {
                scenario: NAME,
                reason: "no expected outcome for a timed send".to_string(),
            })?,
        };
        if let Err(err) = &sent {
            expected.check_error(NAME, err)?;
        }
        expected.check_bytes(NAME, &reference, &received.bytes)?;

        info!(
            sent = reference.len(),
            received = received.bytes.len(),
            clean_eof = received.clean_eof,
            "Large send finished"
        );

        Ok(ScenarioReport::LargeSend(LargeSendReport {
            reference_len: reference.len(),
            received_len: received.bytes.len(),
            clean_eof: received.clean_eof,
            send_error: sent.err().map(|err| err.kind()),
        }))
    }
}
