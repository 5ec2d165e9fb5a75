//! Replay of recorded request streams through a limiter.
//!
//! Input is line oriented: `<timestamp> <entity>`, where the timestamp is
//! either integer seconds since the epoch or an RFC 3339 date-time. Blank
//! lines and lines starting with `#` are ignored.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::Format;
use crate::error::{Result, SlidewinError};
use crate::ratelimit::{SlidingWindowLimiter, Timestamp};

/// A single request read from the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// 1-based input line number
    pub line: usize,
    pub timestamp: Timestamp,
    pub entity: String,
}

impl Request {
    /// Parse one input line.
    ///
    /// Returns `Ok(None)` for blank and comment lines.
    pub fn parse(line: usize, text: &str) -> Result<Option<Self>> {
        let text = text.trim();
        if text.is_empty() || text.starts_with('#') {
            return Ok(None);
        }

        let mut fields = text.split_whitespace();
        let parse_error = |reason: String| SlidewinError::Parse { line, reason };

        let raw_timestamp = fields
            .next()
            .ok_or_else(|| parse_error("missing timestamp".to_string()))?;
        let entity = fields
            .next()
            .ok_or_else(|| parse_error("missing entity".to_string()))?;
        if let Some(extra) = fields.next() {
            return Err(parse_error(format!("unexpected field '{}'", extra)));
        }

        let timestamp = parse_timestamp(raw_timestamp).map_err(parse_error)?;

        Ok(Some(Self {
            line,
            timestamp,
            entity: entity.to_string(),
        }))
    }
}

fn parse_timestamp(raw: &str) -> std::result::Result<Timestamp, String> {
    if let Ok(secs) = raw.parse::<i64>() {
        let timestamp = Timestamp::from_secs(secs);
        if timestamp.is_sentinel() {
            return Err(format!("timestamp '{}' is out of range", raw));
        }
        return Ok(timestamp);
    }

    DateTime::parse_from_rfc3339(raw)
        .map(|dt| Timestamp::from(dt.with_timezone(&Utc)))
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

/// How each request is applied to the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Record only admitted requests, atomically with the check.
    #[default]
    Acquire,
    /// Check admission, then record every request regardless of the outcome.
    RecordAll,
}

/// Admission outcome for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allowed,
    Denied,
    /// Out-of-order timestamp; nothing was recorded
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allowed => "allowed",
            Decision::Denied => "denied",
            Decision::Rejected => "rejected",
        }
    }
}

/// The result of replaying one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub line: usize,
    pub timestamp: Timestamp,
    pub entity: String,
    pub decision: Decision,
    /// Whether the timestamp was written to the entity's history
    pub recorded: bool,
    /// Newest known timestamp, when the request was rejected as out of order
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<Timestamp>,
}

impl Outcome {
    /// Render the outcome as a single output line (without newline).
    pub fn render(&self, format: Format) -> Result<String> {
        match format {
            Format::Text => Ok(format!(
                "{}\t{}\t{}\t{}",
                self.line,
                self.timestamp,
                self.entity,
                self.decision.as_str()
            )),
            Format::Json => Ok(serde_json::to_string(self)?),
        }
    }
}

/// Counters for a finished replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub allowed: usize,
    pub denied: usize,
    pub rejected: usize,
    /// Malformed lines
    pub skipped: usize,
    /// Entities with a history at the end of the replay
    pub entities: usize,
}

/// Feeds requests through a shared limiter.
pub struct Replayer {
    limiter: Arc<SlidingWindowLimiter<String>>,
    mode: Mode,
    format: Format,
}

impl Replayer {
    pub fn new(limiter: Arc<SlidingWindowLimiter<String>>, mode: Mode, format: Format) -> Self {
        Self {
            limiter,
            mode,
            format,
        }
    }

    /// Apply one request to the limiter.
    pub fn apply(&self, request: Request) -> Outcome {
        let Request {
            line,
            timestamp,
            entity,
        } = request;

        let result = match self.mode {
            Mode::Acquire => self
                .limiter
                .try_acquire(timestamp, entity.clone())
                .map(|allowed| (allowed, allowed)),
            Mode::RecordAll => {
                let allowed = self.limiter.allow(timestamp, entity.as_str());
                self.limiter
                    .record(timestamp, entity.clone())
                    .map(|_| (allowed, true))
            }
        };

        let (decision, recorded, latest) = match result {
            Ok((true, recorded)) => (Decision::Allowed, recorded, None),
            Ok((false, recorded)) => (Decision::Denied, recorded, None),
            Err(err) => (Decision::Rejected, false, Some(err.latest)),
        };

        Outcome {
            line,
            timestamp,
            entity,
            decision,
            recorded,
            latest,
        }
    }

    /// Replay every line of `reader`, writing one decision per request to
    /// `writer`, until the input ends or `shutdown` resolves.
    ///
    /// Lines that are not valid UTF-8 are skipped like any other malformed line.
    pub async fn run<R, W, F>(&self, mut reader: R, writer: &mut W, shutdown: F) -> Result<Summary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let mut buf = Vec::new();
        let mut summary = Summary::default();
        let mut line_no = 0;

        tokio::pin!(shutdown);

        loop {
            let read = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Replay interrupted");
                    break;
                }
                read = reader.read_until(b'\n', &mut buf) => read?,
            };
            if read == 0 {
                break;
            }
            line_no += 1;

            let parsed = std::str::from_utf8(&buf)
                .map_err(|e| SlidewinError::Parse {
                    line: line_no,
                    reason: format!("invalid UTF-8: {}", e),
                })
                .and_then(|text| Request::parse(line_no, text));
            buf.clear();

            let request = match parsed {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed line");
                    summary.skipped += 1;
                    continue;
                }
            };

            let outcome = self.apply(request);
            debug!(
                line = outcome.line,
                entity = %outcome.entity,
                decision = outcome.decision.as_str(),
                "Replayed request"
            );

            match outcome.decision {
                Decision::Allowed => summary.allowed += 1,
                Decision::Denied => summary.denied += 1,
                Decision::Rejected => summary.rejected += 1,
            }

            let mut rendered = outcome.render(self.format)?;
            rendered.push('\n');
            writer.write_all(rendered.as_bytes()).await?;
        }

        writer.flush().await?;
        summary.entities = self.limiter.entity_count();

        Ok(summary)
    }
}
