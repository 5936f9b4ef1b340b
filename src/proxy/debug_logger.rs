use std::io::Write;
use std::path::PathBuf;
use std::sync::LazyLock;

use serde_json::{json, Value};

use crate::constants::ENV_DEBUG;
use crate::modules::system::parse_env_truthy;

// Resolved once per process: a truthy OPENCODE_ANTIGRAVITY_DEBUG pins the
// sink to one timestamped file in the working directory.
static DEBUG_LOG_PATH: LazyLock<Option<PathBuf>> = LazyLock::new(|| {
    let enabled = std::env::var(ENV_DEBUG)
        .map(|v| parse_env_truthy(&v))
        .unwrap_or(false);
    if !enabled {
        return None;
    }
    let filename = format!(
        "antigravity-debug-{}.log",
        chrono::Utc::now().format("%Y%m%d%H%M%S")
    );
    Some(PathBuf::from(filename))
});

pub fn is_enabled() -> bool {
    DEBUG_LOG_PATH.is_some()
}

// Appends one JSON line. Sink failures are logged and swallowed; debugging
// must never take the request path down.
pub fn log_event(kind: &str, payload: Value) {
    let Some(path) = DEBUG_LOG_PATH.as_ref() else {
        return;
    };
    let line = json!({
        "ts": chrono::Utc::now().to_rfc3339(),
        "kind": kind,
        "payload": payload,
    });
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", line));
    if let Err(e) = result {
        tracing::warn!("[W-DEBUG-SINK] failed_to_append_debug_log: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The sink path latches on first use; with the flag unset the sink stays
    // disabled and logging is a no-op.
    #[test]
    fn disabled_without_env_flag() {
        let _guard = crate::test_utils::lock_env();
        let _unset = crate::test_utils::ScopedEnvVar::unset(ENV_DEBUG);
        assert!(!is_enabled());
        log_event("noop", json!({"ok": true}));
    }
}
