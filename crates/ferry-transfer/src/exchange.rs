/// Request/response over UDP with timeout-driven retransmission.
///
/// One request is outstanding at a time. Any datagram that reaches the bound
/// socket inside the current timeout window is taken as the answer; callers
/// that care about stale answers check the decoded message themselves.
use std::io;
use std::iter;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Result, TransferError};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{MAX_DATAGRAM, Message};

/// Default first receive timeout.
pub const INITIAL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default attempts per request (1s, 2s, 4s, 8s, 16s).
pub const MAX_ATTEMPTS: u32 = 5;

/// Backoff schedule: `max_attempts` tries, doubling the timeout after each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: INITIAL_TIMEOUT,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// At least one attempt and a non-zero timeout are always kept.
    pub fn new(initial_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            initial_timeout: initial_timeout.max(Duration::from_millis(1)),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Receive timeout of each attempt, in order.
    pub fn timeouts(&self) -> impl Iterator<Item = Duration> + use<> {
        iter::successors(Some(self.initial_timeout), |t| Some(t.saturating_mul(2)))
            .take(self.max_attempts as usize)
    }
}

/// Client end of the request/response primitive.
pub struct Exchanger {
    socket: UdpSocket,
    policy: RetryPolicy,
    logger: Arc<dyn TransferLogger>,
    recv_buf: Vec<u8>,
}

impl Exchanger {
    /// Bind a client socket on `local` (port 0 for any).
    pub fn bind(
        local: SocketAddr,
        policy: RetryPolicy,
        logger: Arc<dyn TransferLogger>,
    ) -> io::Result<Self> {
        let socket = create_udp_socket(local)?;
        Ok(Self {
            socket,
            policy,
            logger,
            recv_buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Send `request` to `target` and return the first datagram received.
    ///
    /// Fails with `Timeout` once every attempt of the policy went unanswered.
    pub fn exchange(&mut self, request: &Message, target: SocketAddr) -> Result<Vec<u8>> {
        let datagram = request.encode();

        for (idx, timeout) in self.policy.timeouts().enumerate() {
            let attempt = idx as u32 + 1;
            let started = Instant::now();

            self.socket.set_read_timeout(Some(timeout))?;
            self.socket.send_to(&datagram, target)?;

            match self.recv_within(timeout, started) {
                Ok((len, from)) => {
                    if from != target {
                        debug!("Answer for {} came from {} instead of {}", request.filename(), from, target);
                    }
                    return Ok(self.recv_buf[..len].to_vec());
                }
                Err(e) => match classify(&e) {
                    RecvFailure::Unanswered => {}
                    // Windows reports ICMP port-unreachable on the next recv; wait
                    // out the window so the schedule still holds.
                    RecvFailure::Unreachable => {
                        thread::sleep(timeout.saturating_sub(started.elapsed()));
                    }
                    RecvFailure::Interrupted | RecvFailure::Fatal => return Err(TransferError::Io(e)),
                },
            }

            self.logger.log(TransferLog {
                component: "client",
                filename: request.filename().to_string(),
                event: TransferEvent::AttemptTimedOut { attempt, timeout },
            });
        }

        Err(TransferError::Timeout {
            attempts: self.policy.max_attempts,
        })
    }

    /// One receive for the current attempt. A signal interrupting the wait
    /// resumes it with whatever is left of the window.
    fn recv_within(&mut self, timeout: Duration, started: Instant) -> io::Result<(usize, SocketAddr)> {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Err(e) if matches!(classify(&e), RecvFailure::Interrupted) => {
                    let left = timeout.saturating_sub(started.elapsed());
                    if left.is_zero() {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                    self.socket.set_read_timeout(Some(left))?;
                }
                other => return other,
            }
        }
    }
}

/// How a failed receive affects the current attempt.
#[derive(Debug, PartialEq, Eq)]
enum RecvFailure {
    /// Signal delivered mid-wait; keep waiting.
    Interrupted,
    /// Window elapsed without a datagram.
    Unanswered,
    /// ICMP unreachable surfaced on the socket.
    Unreachable,
    Fatal,
}

fn classify(e: &io::Error) -> RecvFailure {
    match e.kind() {
        io::ErrorKind::Interrupted => RecvFailure::Interrupted,
        // Windows returns TimedOut, Unix returns WouldBlock
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => RecvFailure::Unanswered,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused => RecvFailure::Unreachable,
        _ => RecvFailure::Fatal,
    }
}

/// Create a blocking UDP socket bound to `addr`.
fn create_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}
