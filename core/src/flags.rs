use std::time::Duration;

use env_flags::env_flags;

env_flags! {
    /// Force-enable the LLM debug log even when `~/.bb7/debug` is absent.
    pub BB7_DEBUG: bool = false;

    pub BB7_REQUEST_MAX_RETRIES: u64 = 4;

    // We generally don't want to disconnect mid-turn; five minutes is a
    // conservative ceiling so a stalled provider still gets cut off.
    pub BB7_STREAM_IDLE_TIMEOUT_MS: Duration = Duration::from_millis(300_000), |value| {
        value.parse().map(Duration::from_millis)
    };
}
