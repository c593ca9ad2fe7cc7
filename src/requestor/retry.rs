use crate::error::HookError;
use crate::hook::RetryOverride;
use std::time::Duration;

/// Which error classes a hook opts into retrying, from the `rp` fragment
/// option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryToken {
    /// `ct` — connect/transport failures.
    ConnectFailure,
    /// `rt` — response (ack) timeout.
    ResponseTimeout,
    /// `4xx` — client-error statuses.
    Status4xx,
    /// `5xx` — server-error statuses.
    Status5xx,
    /// `all` — anything retryable.
    All,
}

impl RetryToken {
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "ct" => Some(RetryToken::ConnectFailure),
            "rt" => Some(RetryToken::ResponseTimeout),
            "4xx" => Some(RetryToken::Status4xx),
            "5xx" => Some(RetryToken::Status5xx),
            "all" => Some(RetryToken::All),
            _ => None,
        }
    }

    /// Parse a comma-separated policy list, dropping unknown tokens.
    pub fn parse_list(list: &str) -> Vec<RetryToken> {
        list.split(',').filter_map(RetryToken::parse).collect()
    }

    fn matches(&self, err: &HookError) -> bool {
        match self {
            RetryToken::All => matches!(
                err,
                HookError::Transport(_)
                    | HookError::Handshake { .. }
                    | HookError::ResponseTimeout
                    | HookError::Status { .. }
            ),
            RetryToken::ConnectFailure => {
                matches!(err, HookError::Transport(_) | HookError::Handshake { .. })
            }
            RetryToken::ResponseTimeout => matches!(err, HookError::ResponseTimeout),
            RetryToken::Status4xx => {
                matches!(err, HookError::Status { code } if (400..500).contains(code))
            }
            RetryToken::Status5xx => {
                matches!(err, HookError::Status { code } if (500..600).contains(code))
            }
        }
    }
}

/// Attempt budget plus the error classes worth another try.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub tokens: Vec<RetryToken>,
    pub max_attempts: u8,
}

impl RetryPolicy {
    /// Build from a hook's fragment override, falling back to the given
    /// defaults when the fragment is silent.
    pub fn from_override(o: &RetryOverride, default_attempts: u8) -> Self {
        Self {
            tokens: o
                .policy
                .clone()
                .unwrap_or_else(|| vec![RetryToken::ConnectFailure]),
            max_attempts: o.count.unwrap_or(default_attempts).clamp(1, 5),
        }
    }

    pub fn should_retry(&self, err: &HookError) -> bool {
        self.tokens.iter().any(|t| t.matches(err))
    }
}

/// Backoff schedule: 500 ms, doubling while under 2000 ms, then +2000 ms
/// per step.
pub const INITIAL_BACKOFF_MS: u64 = 500;

pub fn next_backoff_ms(current: u64) -> u64 {
    if current < 2000 {
        current * 2
    } else {
        current + 2000
    }
}

pub fn backoff_delay(attempt: u8) -> Duration {
    let mut ms = INITIAL_BACKOFF_MS;
    for _ in 1..attempt {
        ms = next_backoff_ms(ms);
    }
    Duration::from_millis(ms)
}
