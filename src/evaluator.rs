use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time;

use crate::error::ProbeError;
use crate::types::{PortResult, PortStatus};

/// Classifies one port of a target.
///
/// Implementations must not panic on unreachable hosts; failures come back as
/// [`ProbeError`] and the scheduler decides what to do with them.
#[async_trait]
pub trait PortEvaluator: Send + Sync {
    async fn evaluate(&self, target: &str, port: u16) -> Result<PortResult, ProbeError>;
}

const OPEN_THRESHOLD: f64 = 0.92;
const FILTERED_THRESHOLD: f64 = 0.95;

/// Stand-in evaluator drawing classifications from a fixed distribution:
/// about 8% open, then 5% of the rest filtered, everything else closed.
///
/// With a seed, each port's draw depends only on the seed and the port
/// number, so evaluating the same port twice gives the same answer.
#[derive(Debug, Clone, Default)]
pub struct SimulatedEvaluator {
    seed: Option<u64>,
}

impl SimulatedEvaluator {
    pub fn new() -> Self {
        Self { seed: None }
    }

    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }

    fn classify<R: Rng>(rng: &mut R, port: u16) -> PortResult {
        let is_open = rng.gen::<f64>() > OPEN_THRESHOLD;
        let is_filtered = !is_open && rng.gen::<f64>() > FILTERED_THRESHOLD;
        if is_open {
            let version = format!("v{}.{}", rng.gen_range(1..=5), rng.gen_range(0..=9));
            PortResult::open(port, Some(version))
        } else if is_filtered {
            PortResult::filtered(port)
        } else {
            PortResult::closed(port)
        }
    }
}

#[async_trait]
impl PortEvaluator for SimulatedEvaluator {
    async fn evaluate(&self, _target: &str, port: u16) -> Result<PortResult, ProbeError> {
        let result = match self.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(port_seed(seed, port));
                Self::classify(&mut rng, port)
            }
            None => Self::classify(&mut rand::thread_rng(), port),
        };
        Ok(result)
    }
}

fn port_seed(seed: u64, port: u16) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ u64::from(port)
}

/// Evaluates ports with a plain TCP connect bounded by a timeout.
///
/// - connect succeeds: open; a short passive banner read supplies the version
/// - connection refused: closed
/// - no answer in time: [`ProbeError::Timeout`]
/// - anything else: [`ProbeError::Io`]
#[derive(Debug, Clone)]
pub struct ConnectEvaluator {
    timeout: Duration,
    banner_timeout: Duration,
}

impl ConnectEvaluator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            banner_timeout: Duration::from_millis(200),
        }
    }

    pub fn with_banner_timeout(mut self, banner_timeout: Duration) -> Self {
        self.banner_timeout = banner_timeout;
        self
    }
}

impl Default for ConnectEvaluator {
    fn default() -> Self {
        Self::new(Duration::from_millis(400))
    }
}

#[async_trait]
impl PortEvaluator for ConnectEvaluator {
    async fn evaluate(&self, target: &str, port: u16) -> Result<PortResult, ProbeError> {
        match time::timeout(self.timeout, TcpStream::connect((target, port))).await {
            Ok(Ok(mut stream)) => {
                let version = read_banner(&mut stream, self.banner_timeout).await;
                Ok(PortResult::new(port, PortStatus::Open, version))
            }
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => Ok(PortResult::closed(port)),
            Ok(Err(source)) => Err(ProbeError::Io { port, source }),
            Err(_elapsed) => Err(ProbeError::Timeout { port }),
        }
    }
}

/// Read up to 256 bytes the service volunteers and keep the first non-empty line.
async fn read_banner(stream: &mut TcpStream, wait: Duration) -> Option<String> {
    let mut buf = vec![0u8; 256];
    match time::timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            let s = String::from_utf8_lossy(&buf);
            s.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        }
        _ => None,
    }
}
