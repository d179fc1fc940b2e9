//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Every getter calls `init_env()` first, so binaries and tests may read config in any order.
use std::str::FromStr;
use std::sync::Once;
use tracing::info;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        if dotenv::dotenv().is_err() {
            // Fallback to the crate root so `cargo run` from a sub-directory still finds it.
            let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
            let _ = dotenv::from_filename(candidate);
        }
    });
}

/// Get required env var; error if missing or blank.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    env_opt(key).ok_or_else(|| anyhow::anyhow!("missing env var {key}"))
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        Err(_) => default,
    }
}

/// Database URL resolution. Explicit DSNs win over composed `DB_*` parts.
pub fn db_url() -> anyhow::Result<String> {
    init_env();
    for k in [
        "DATABASE_URL",
        "SUPABASE_DB_URL",
        "SUPABASE_DB_SESSION_URL",
        "DB_URL",
    ] {
        if let Some(v) = env_opt(k) {
            return Ok(v);
        }
    }
    if let Some(dsn) = build_dsn_from_parts() {
        return Ok(dsn);
    }
    Err(anyhow::anyhow!("no database URL env vars set"))
}

/// Swap the Supabase transaction pooler (6543) for the session pooler (5432): COPY and
/// explicit transactions do not survive transaction pooling.
pub fn prefer_session_mode(url: &str) -> String {
    if url.contains("pooler.supabase.com:6543") {
        tracing::warn!(
            "detected Supabase transaction pooler (:6543); switching to :5432 (session)"
        );
        url.replace("pooler.supabase.com:6543", "pooler.supabase.com:5432")
    } else {
        url.to_string()
    }
}

fn build_dsn_from_parts() -> Option<String> {
    let host = env_opt("DB_HOST")?;
    let user = env_opt("DB_USERNAME")?;
    let password = env_opt("DB_PASSWORD");
    let database = env_opt("DB_DATABASE").unwrap_or_else(|| "postgres".into());
    let port: u16 = env_parse("DB_PORT", 5432u16);
    let ssl_mode = env_opt("DB_SSLMODE").unwrap_or_else(|| "prefer".into());

    // Build via url::Url so reserved characters in the password are percent-encoded.
    let mut out = url::Url::parse("postgresql://localhost").ok()?;
    out.set_username(&user).ok()?;
    if let Some(pass) = password {
        out.set_password(Some(&pass)).ok()?;
    }
    let host_trimmed = host.trim().trim_matches(|c| c == '[' || c == ']');
    if host_trimmed.contains(':') {
        out.set_host(Some(&format!("[{host_trimmed}]"))).ok()?;
    } else {
        out.set_host(Some(host_trimmed)).ok()?;
    }
    out.set_port(Some(port)).ok()?;
    out.set_path(&format!("/{database}"));
    if ssl_mode != "disable" {
        out.query_pairs_mut().append_pair("sslmode", &ssl_mode);
    }
    Some(out.to_string())
}

fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD") || k.contains("SECRET") || k.contains("KEY") || k.contains("TOKEN")
    {
        return "***".to_string();
    }
    let val_trim = val.trim();
    // Postgres DSNs carry credentials even when the key looks harmless.
    if let Ok(mut u) = url::Url::parse(val_trim) {
        let scheme = u.scheme().to_ascii_lowercase();
        if scheme == "postgres" || scheme == "postgresql" {
            let _ = u.set_username("***");
            let _ = u.set_password(Some("***"));
            return u.to_string();
        }
    }
    val_trim.to_string()
}

/// Validate required keys and log a consolidated, redacted snapshot of configuration.
pub fn preflight_check(title: &str, required: &[&str], also_log: &[&str]) -> anyhow::Result<()> {
    init_env();
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|k| env_opt(k).is_none())
        .collect();
    let snapshot: Vec<(String, String)> = also_log
        .iter()
        .map(|&k| (k.to_string(), redact_value(k, &env_opt(k).unwrap_or_default())))
        .collect();
    info!(target = "preflight", title, snapshot = ?snapshot, "configuration snapshot");
    if !missing.is_empty() {
        return Err(anyhow::anyhow!("missing required env: {:?}", missing));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_swap_only_touches_transaction_pooler() {
        assert_eq!(
            prefer_session_mode("postgres://u:p@aws-0.pooler.supabase.com:6543/postgres"),
            "postgres://u:p@aws-0.pooler.supabase.com:5432/postgres"
        );
        assert_eq!(
            prefer_session_mode("postgres://localhost:5432/scrobbles"),
            "postgres://localhost:5432/scrobbles"
        );
    }

    #[test]
    fn redacts_keys_and_dsn_credentials() {
        assert_eq!(redact_value("LASTFM_API_KEY", "abc123"), "***");
        let dsn = redact_value("DATABASE_URL", "postgres://alice:hunter2@db:5432/app");
        assert!(!dsn.contains("hunter2"));
        assert!(!dsn.contains("alice"));
        assert_eq!(redact_value("LASTFM_USERNAME", " rj "), "rj");
    }
}
