use printsync::config::{ConfigError, ConfigLoader};
use std::{
    env, fs,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const VARS: &[&str] = &[
    "PRINTSYNC_PROFILE",
    "PRINTSYNC_API_BIND_ADDR",
    "PRINTSYNC_LOG_LEVEL",
    "PRINTSYNC_VENDOR_API_TOKEN",
    "PRINTSYNC_WEBHOOK_SECRET",
    "PRINTSYNC_SYNC_MIN_CHUNK",
    "PRINTSYNC_SYNC_MAX_CHUNK",
    "PRINTSYNC_SYNC_RETRY_DELAY_SECONDS",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    for var in VARS {
        unsafe {
            env::remove_var(var);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(dir.path().to_path_buf())
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.sync.min_chunk, 5);
    assert_eq!(cfg.sync.max_chunk, 50);
    assert_eq!(cfg.sync.stagger_interval_seconds, 60);
    assert_eq!(cfg.sync.retry_delay_seconds, 900);
    assert_eq!(cfg.sync.max_retries, 3);
    assert_eq!(cfg.trigger.full_sync_interval_seconds, 0);
    assert!(cfg.webhook.secret.is_none());
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "PRINTSYNC_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "PRINTSYNC_API_BIND_ADDR=192.168.0.10:5000\nPRINTSYNC_SYNC_RETRY_DELAY_SECONDS=60\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "PRINTSYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );
    // Selects the profile before the profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "PRINTSYNC_PROFILE=test\nPRINTSYNC_API_BIND_ADDR=127.0.0.1:4000\n",
    );

    let cfg = loader(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.sync.retry_delay_seconds, 60);
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "PRINTSYNC_API_BIND_ADDR=127.0.0.1:3000\n");
    unsafe {
        env::set_var("PRINTSYNC_API_BIND_ADDR", "0.0.0.0:9090");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("PRINTSYNC_API_BIND_ADDR", "not-an-addr");
    }
    let err = loader(&temp_dir)
        .load()
        .expect_err("invalid bind addr should fail");
    assert!(matches!(err, ConfigError::InvalidBindAddr { .. }));

    clear_env();
}

#[test]
fn chunk_bounds_outside_limits_are_rejected() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "PRINTSYNC_SYNC_MIN_CHUNK=20\nPRINTSYNC_SYNC_MAX_CHUNK=10\n",
    );

    let err = loader(&temp_dir).load().expect_err("min above max");
    assert!(matches!(err, ConfigError::InvalidChunkBounds { .. }));
}

#[test]
fn unparseable_numbers_name_the_variable() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "PRINTSYNC_SYNC_MAX_CHUNK=lots\n");

    let err = loader(&temp_dir).load().expect_err("not a number");
    match err {
        ConfigError::InvalidValue { key, value } => {
            assert_eq!(key, "PRINTSYNC_SYNC_MAX_CHUNK");
            assert_eq!(value, "lots");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn production_profile_requires_vendor_token_and_webhook_secret() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "PRINTSYNC_PROFILE=prod\n");

    let err = loader(&temp_dir).load().expect_err("token required");
    assert!(matches!(err, ConfigError::MissingVendorToken));

    write_env_file(
        &temp_dir,
        ".env.prod",
        "PRINTSYNC_VENDOR_API_TOKEN=tok\nPRINTSYNC_WEBHOOK_SECRET=whsec\n",
    );
    let cfg = loader(&temp_dir).load().expect("prod config loads");
    assert_eq!(cfg.vendor.api_token.as_deref(), Some("tok"));

    let redacted = cfg.redacted_json().unwrap();
    assert!(!redacted.contains("whsec"));
    assert!(!redacted.contains("\"tok\""));
}
