use once_cell::sync::Lazy;
use reqwest::Client;

#[cfg(not(any(feature = "tls-native", feature = "tls-rustls")))]
compile_error!("one TLS backend feature must be enabled: `tls-native` or `tls-rustls`");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsBackendSelection {
    NativeTls,
    Rustls,
}

pub static SHARED_CLIENT: Lazy<Client> = Lazy::new(|| create_base_client(15));
pub static SHARED_CLIENT_LONG: Lazy<Client> = Lazy::new(|| create_base_client(60));
// Dispatch traffic may stream for minutes; no total timeout, the host's
// cancellation is the only deadline.
pub static DISPATCH_CLIENT: Lazy<Client> = Lazy::new(create_dispatch_client);

fn parse_tls_backend_override() -> Option<TlsBackendSelection> {
    let raw = std::env::var("ANTIGRAVITY_RELAY_TLS_BACKEND").ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "native" | "native-tls" | "default-tls" => Some(TlsBackendSelection::NativeTls),
        "rustls" => Some(TlsBackendSelection::Rustls),
        _ => None,
    }
}

fn supports_tls_backend(selection: TlsBackendSelection) -> bool {
    match selection {
        TlsBackendSelection::NativeTls => cfg!(feature = "tls-native"),
        TlsBackendSelection::Rustls => cfg!(feature = "tls-rustls"),
    }
}

fn compiled_default_tls_backend() -> TlsBackendSelection {
    #[cfg(all(feature = "tls-native", not(feature = "tls-rustls")))]
    {
        return TlsBackendSelection::NativeTls;
    }
    #[cfg(all(feature = "tls-rustls", not(feature = "tls-native")))]
    {
        return TlsBackendSelection::Rustls;
    }
    #[cfg(all(feature = "tls-native", feature = "tls-rustls"))]
    {
        TlsBackendSelection::NativeTls
    }
}

fn selected_tls_backend() -> TlsBackendSelection {
    if let Some(requested) = parse_tls_backend_override() {
        if supports_tls_backend(requested) {
            return requested;
        }
        tracing::warn!(
            "ANTIGRAVITY_RELAY_TLS_BACKEND requested an unavailable backend for this build; falling back to compiled default"
        );
    }
    compiled_default_tls_backend()
}

pub fn apply_tls_backend(builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
    match selected_tls_backend() {
        TlsBackendSelection::NativeTls => builder,
        TlsBackendSelection::Rustls => {
            #[cfg(feature = "tls-rustls")]
            {
                return builder.use_rustls_tls();
            }
            #[cfg(not(feature = "tls-rustls"))]
            {
                builder
            }
        }
    }
}

fn create_base_client(timeout_secs: u64) -> Client {
    apply_tls_backend(Client::builder())
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .user_agent(crate::constants::USER_AGENT.as_str())
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn create_dispatch_client() -> Client {
    apply_tls_backend(Client::builder())
        .connect_timeout(std::time::Duration::from_secs(20))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .user_agent(crate::constants::USER_AGENT.as_str())
        .build()
        .unwrap_or_else(|_| Client::new())
}

pub fn get_client() -> Client {
    SHARED_CLIENT.clone()
}

pub fn get_long_client() -> Client {
    SHARED_CLIENT_LONG.clone()
}

pub fn get_dispatch_client() -> Client {
    DISPATCH_CLIENT.clone()
}

pub fn tls_backend_name() -> &'static str {
    match selected_tls_backend() {
        TlsBackendSelection::NativeTls => "native-tls",
        TlsBackendSelection::Rustls => "rustls",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_clients_build() {
        let _ = get_client();
        let _ = get_long_client();
        let _ = get_dispatch_client();
    }

    #[test]
    fn tls_backend_name_matches_compiled_default_without_override() {
        let _guard = crate::test_utils::lock_env();
        let _unset = crate::test_utils::ScopedEnvVar::unset("ANTIGRAVITY_RELAY_TLS_BACKEND");
        let name = tls_backend_name();
        assert!(name == "native-tls" || name == "rustls");
    }
}
