pub mod logger;

use crate::constants::{ENV_HEADLESS, SSH_ENV_SIGNALS};

// A session is headless when the host opted in explicitly or when any of the
// standard ssh/tty signals are present.
pub fn is_headless() -> bool {
    if std::env::var(ENV_HEADLESS).is_ok() {
        return true;
    }
    SSH_ENV_SIGNALS
        .iter()
        .any(|key| std::env::var(key).is_ok())
}

pub fn parse_env_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_env, ScopedEnvVar};

    #[test]
    fn headless_detected_from_opencode_flag() {
        let _guard = lock_env();
        let _unset_conn = ScopedEnvVar::unset("SSH_CONNECTION");
        let _unset_client = ScopedEnvVar::unset("SSH_CLIENT");
        let _unset_tty = ScopedEnvVar::unset("SSH_TTY");
        let _flag = ScopedEnvVar::set("OPENCODE_HEADLESS", "1");
        assert!(is_headless());
    }

    #[test]
    fn headless_detected_from_ssh_signal() {
        let _guard = lock_env();
        let _unset_flag = ScopedEnvVar::unset("OPENCODE_HEADLESS");
        let _unset_client = ScopedEnvVar::unset("SSH_CLIENT");
        let _unset_tty = ScopedEnvVar::unset("SSH_TTY");
        let _conn = ScopedEnvVar::set("SSH_CONNECTION", "10.0.0.1 1234 10.0.0.2 22");
        assert!(is_headless());
    }

    #[test]
    fn interactive_when_no_signals_present() {
        let _guard = lock_env();
        let _unset_flag = ScopedEnvVar::unset("OPENCODE_HEADLESS");
        let _unset_conn = ScopedEnvVar::unset("SSH_CONNECTION");
        let _unset_client = ScopedEnvVar::unset("SSH_CLIENT");
        let _unset_tty = ScopedEnvVar::unset("SSH_TTY");
        assert!(!is_headless());
    }

    #[test]
    fn truthy_parsing_accepts_the_usual_spellings() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_env_truthy(v), "{v}");
        }
        for v in ["0", "false", "off", "", "2"] {
            assert!(!parse_env_truthy(v), "{v}");
        }
    }
}
