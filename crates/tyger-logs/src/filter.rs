//! Archived-log filtering (spec §4.6): translate `tailLines` into a skip
//! count from stored `lineCount` metadata, parse RFC3339Nano timestamps up
//! to the first space for `since`, and strip/preserve the timestamp+space
//! prefix per `includeTimestamps` — without buffering the archive.

use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tyger_types::TygerError;

use crate::LogOptions;

/// Splits a log line into its `(timestamp, rest)` if it starts with an
/// RFC3339Nano timestamp followed by a space; otherwise `None`.
fn parse_timestamp_prefix(line: &[u8]) -> Option<(DateTime<Utc>, usize)> {
    let text = std::str::from_utf8(line).ok()?;
    let space = text.find(' ')?;
    let ts = DateTime::parse_from_rfc3339(&text[..space]).ok()?;
    Some((ts.with_timezone(&Utc), space + 1))
}

struct FilterState<R> {
    reader: R,
    skip_remaining: u64,
    since: Option<DateTime<Utc>>,
    include_timestamps: bool,
}

/// Streams filtered lines out of an already-opened archive reader.
/// `total_lines` is the archive's stored `lineCount` metadata, used to turn
/// `tailLines` into a skip count with no buffering of prior lines.
pub fn filter_archive_lines<R>(
    reader: R,
    total_lines: Option<u64>,
    opts: LogOptions,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, TygerError>> + Send>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let skip = match (opts.tail_lines, total_lines) {
        (Some(tail), Some(total)) => total.saturating_sub(tail),
        _ => 0,
    };
    let state = FilterState {
        reader,
        skip_remaining: skip,
        since: opts.since,
        include_timestamps: opts.include_timestamps,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            let mut line = Vec::new();
            match state.reader.read_until(b'\n', &mut line).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    return Some((Err(TygerError::transient(format!("read archive: {e}"))), state))
                }
            }
            if state.skip_remaining > 0 {
                state.skip_remaining -= 1;
                continue;
            }
            let prefix = parse_timestamp_prefix(&line);
            if let Some(since) = state.since {
                if let Some((ts, _)) = prefix {
                    if ts < since {
                        continue;
                    }
                }
            }
            let out = match (state.include_timestamps, prefix) {
                (true, _) | (false, None) => line,
                (false, Some((_, rest_start))) => line[rest_start..].to_vec(),
            };
            return Some((Ok(Bytes::from(out)), state));
        }
    }))
}
