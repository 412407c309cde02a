//! The decrypt oracle wire protocol and the per-track decrypt session.
//!
//! Protocol, client-initiated over one TCP connection:
//! - Key announcement: `[1B len][trackId/sentinel][1B len][keyURI]`, sent at
//!   the start and on every key-group transition. Mid-stream transitions are
//!   preceded by a 4-byte zero frame so the oracle resets its key state.
//! - Sample: `[4B LE u32 len][encrypted bytes]`; the oracle answers with
//!   exactly `len` plaintext bytes.
//! - Terminator: `[0 0 0 0]` after the last sample, then graceful close.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::DecryptRetryConfig;
use crate::device::{DeviceLink, EscalationStep, RetryLedger};
use crate::error::RipError;
use crate::plan::{KeySet, SamplePlan, PREFETCH_KEY_URI, SENTINEL_TRACK_ID};

const ZERO_FRAME: [u8; 4] = [0, 0, 0, 0];

/// Decrypts one track's [`SamplePlan`] through a [`DeviceLink`].
///
/// Holds the link's exclusive gate for the whole call; failure bookkeeping
/// goes through the fleet's [`RetryLedger`].
pub struct DecryptSession<'a> {
    link: Arc<DeviceLink>,
    ledger: &'a RetryLedger,
    cfg: &'a DecryptRetryConfig,
}

impl<'a> DecryptSession<'a> {
    pub fn new(link: Arc<DeviceLink>, ledger: &'a RetryLedger, cfg: &'a DecryptRetryConfig) -> Self {
        Self { link, ledger, cfg }
    }

    /// Stream every sample through the oracle and return the plaintext,
    /// concatenated in plan order.
    pub async fn decrypt(
        &self,
        plan: &SamplePlan,
        keys: &KeySet,
        track_id: &str,
    ) -> Result<Bytes, RipError> {
        if plan.is_empty() {
            return Ok(Bytes::new());
        }

        let _gate = self.link.acquire().await?;
        let serial = self.link.serial().to_string();
        let mut attempt: u32 = 0;

        loop {
            let result = self.attempt(plan, keys, track_id).await;
            match result {
                Ok(plaintext) => {
                    self.ledger.reset(&serial);
                    return Ok(plaintext);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => match self.ledger.escalate(&serial, self.cfg) {
                    EscalationStep::Fatal => {
                        warn!(serial = %serial, track_id, error = %err, "decrypt retry budget exhausted");
                        return Err(RipError::DecryptFailed {
                            track_id: track_id.to_string(),
                        });
                    }
                    EscalationStep::RecoverThenRetry => {
                        warn!(serial = %serial, track_id, error = %err, "recovering device before retry");
                        self.link.mark_broken_and_recover().await?;
                    }
                    EscalationStep::Retry => {
                        warn!(serial = %serial, track_id, error = %err, "retrying decrypt call");
                    }
                },
            }
            tokio::time::sleep(self.cfg.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }

    /// One whole-call attempt: connect, stream, terminate.
    async fn attempt(
        &self,
        plan: &SamplePlan,
        keys: &KeySet,
        track_id: &str,
    ) -> Result<Bytes, RipError> {
        let mut stream = self.connect().await?;
        let plaintext = stream_plan(&mut stream, plan, keys, track_id, self.link.serial()).await?;
        stream.shutdown().await.ok();
        Ok(plaintext)
    }

    /// Open the oracle connection, recovering the device between refused
    /// attempts.
    async fn connect(&self) -> Result<TcpStream, RipError> {
        let addr = (self.link.host().to_string(), self.link.port());
        for attempt in 0..self.cfg.max_connect_attempts {
            match TcpStream::connect(addr.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    warn!(
                        serial = self.link.serial(),
                        attempt = attempt + 1,
                        error = %err,
                        "oracle connection refused"
                    );
                    if attempt + 1 < self.cfg.max_connect_attempts {
                        self.link.mark_broken_and_recover().await?;
                        tokio::time::sleep(self.cfg.backoff.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }
        Err(RipError::OracleConnect {
            serial: self.link.serial().to_string(),
        })
    }
}

/// Drive the full wire exchange for one plan over an established stream.
///
/// Generic over the transport so protocol tests run over in-memory duplex
/// pipes; production callers hand in the TCP stream.
pub async fn stream_plan<S>(
    stream: &mut S,
    plan: &SamplePlan,
    keys: &KeySet,
    track_id: &str,
    serial: &str,
) -> Result<Bytes, RipError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = Vec::with_capacity(plan.total_len());
    let mut current_group: Option<usize> = None;

    for sample in &plan.samples {
        if current_group != Some(sample.key_group) {
            // The oracle holds per-announcement key state; a zero frame
            // resets it before a mid-stream re-announcement.
            if current_group.is_some() {
                stream.write_all(&ZERO_FRAME).await?;
            }
            let uri = keys
                .uri(sample.key_group)
                .ok_or(RipError::KeyIndexOutOfRange {
                    index: sample.key_group,
                })?;
            write_announcement(stream, track_id, uri).await?;
            current_group = Some(sample.key_group);
        }

        let len = u32::try_from(sample.data.len()).map_err(|_| RipError::FrameTooLong {
            what: "sample",
            len: sample.data.len(),
        })?;
        stream.write_u32_le(len).await?;
        stream.write_all(&sample.data).await?;
        stream.flush().await?;

        let mut plaintext = vec![0u8; sample.data.len()];
        stream
            .read_exact(&mut plaintext)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::UnexpectedEof => RipError::OracleShortRead {
                    serial: serial.to_string(),
                },
                _ => RipError::from(err),
            })?;
        out.extend_from_slice(&plaintext);
    }

    stream.write_all(&ZERO_FRAME).await?;
    stream.flush().await?;
    debug!(track_id, samples = plan.samples.len(), bytes = out.len(), "plan streamed");
    Ok(Bytes::from(out))
}

/// `[1B len][id][1B len][uri]`, substituting the sentinel id for prefetch
/// keys.
async fn write_announcement<S>(stream: &mut S, track_id: &str, key_uri: &str) -> Result<(), RipError>
where
    S: AsyncWrite + Unpin,
{
    let id = if key_uri == PREFETCH_KEY_URI {
        SENTINEL_TRACK_ID
    } else {
        track_id
    };
    for (what, field) in [("track id", id), ("key URI", key_uri)] {
        let len = u8::try_from(field.len()).map_err(|_| RipError::FrameTooLong {
            what,
            len: field.len(),
        })?;
        stream.write_u8(len).await?;
        stream.write_all(field.as_bytes()).await?;
    }
    Ok(())
}
