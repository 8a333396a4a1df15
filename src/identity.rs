// Stable per-installation client identity with redundant persistence

use crate::error::{FerError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Key under which the identifier is persisted in every backend
pub const CLIENT_ID_KEY: &str = "fer_client_id";

/// Prefix of generated identifiers
pub const CLIENT_ID_PREFIX: &str = "fer_client_";

/// A key-value store able to hold the client identifier
pub trait IdentityBackend: Send + Sync {
    /// Short name used in log messages
    fn name(&self) -> &'static str;

    fn load(&self, key: &str) -> Result<Option<String>>;

    fn store(&self, key: &str, value: &str) -> Result<()>;
}

/// Primary store: one file per key inside a directory
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl IdentityBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let value = fs::read_to_string(&path)?;
        let value = value.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(key), value)?;
        Ok(())
    }
}

/// Lifetime of a cookie written without an explicit max age
pub const DEFAULT_COOKIE_MAX_AGE_DAYS: u32 = 365;

/// Secondary store: a cookie-style jar file.
///
/// Each line reads `name=value; expires=<RFC 2822>; path=/; SameSite=Strict`.
/// Expired entries read as absent.
pub struct CookieJarBackend {
    path: PathBuf,
    max_age: TimeDelta,
}

impl CookieJarBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self::with_max_age_days(path, DEFAULT_COOKIE_MAX_AGE_DAYS)
    }

    pub fn with_max_age_days<P: AsRef<Path>>(path: P, days: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_age: TimeDelta::days(i64::from(days)),
        }
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}

struct Cookie<'a> {
    name: &'a str,
    value: &'a str,
    expires: Option<DateTime<Utc>>,
}

fn parse_cookie(line: &str) -> Option<Cookie<'_>> {
    let mut parts = line.split(';').map(str::trim);
    let (name, value) = parts.next()?.split_once('=')?;
    let expires = parts
        .filter_map(|attr| attr.split_once('='))
        .find(|(attr, _)| attr.eq_ignore_ascii_case("expires"))
        .and_then(|(_, date)| DateTime::parse_from_rfc2822(date).ok())
        .map(|date| date.with_timezone(&Utc));
    Some(Cookie {
        name: name.trim(),
        value: value.trim(),
        expires,
    })
}

impl IdentityBackend for CookieJarBackend {
    fn name(&self) -> &'static str {
        "cookie"
    }

    fn load(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        for line in self.read_lines()? {
            let Some(cookie) = parse_cookie(&line) else {
                continue;
            };
            if cookie.name != key {
                continue;
            }
            if cookie.expires.is_some_and(|expires| expires <= now) {
                debug!("Cookie {} expired", key);
                return Ok(None);
            }
            return Ok((!cookie.value.is_empty()).then(|| cookie.value.to_string()));
        }
        Ok(None)
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        let expires = Utc::now()
            .checked_add_signed(self.max_age)
            .ok_or_else(|| FerError::Storage("Cookie expiry out of range".to_string()))?;

        let mut lines: Vec<String> = self
            .read_lines()?
            .into_iter()
            .filter(|line| parse_cookie(line).map_or(true, |c| c.name != key))
            .collect();
        lines.push(format!(
            "{key}={value}; expires={}; path=/; SameSite=Strict",
            expires.to_rfc2822()
        ));

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, lines.join("\n") + "\n")?;
        Ok(())
    }
}

/// In-process store, optionally failing every read or write
#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl IdentityBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self, key: &str) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(FerError::Storage("memory backend read disabled".to_string()));
        }
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(FerError::Storage("memory backend write disabled".to_string()));
        }
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl<T: IdentityBackend + ?Sized> IdentityBackend for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn load(&self, key: &str) -> Result<Option<String>> {
        (**self).load(key)
    }

    fn store(&self, key: &str, value: &str) -> Result<()> {
        (**self).store(key, value)
    }
}

/// Resolves the client identifier across two backends, repairing whichever
/// one is missing it.
pub struct DeviceIdentityStore {
    configured: Option<String>,
    primary: Box<dyn IdentityBackend>,
    secondary: Box<dyn IdentityBackend>,
    resolved: Mutex<Option<String>>,
}

impl DeviceIdentityStore {
    pub fn new(
        configured: Option<String>,
        primary: impl IdentityBackend + 'static,
        secondary: impl IdentityBackend + 'static,
    ) -> Self {
        Self {
            configured: configured.filter(|id| !id.trim().is_empty()),
            primary: Box::new(primary),
            secondary: Box::new(secondary),
            resolved: Mutex::new(None),
        }
    }

    /// Store backed by `<data_dir>/fer_client_id` and a cookie jar file
    pub fn on_disk<P: AsRef<Path>, Q: AsRef<Path>>(
        configured: Option<String>,
        data_dir: P,
        cookie_jar: Q,
        cookie_max_age_days: u32,
    ) -> Self {
        Self::new(
            configured,
            FileBackend::new(data_dir),
            CookieJarBackend::with_max_age_days(cookie_jar, cookie_max_age_days),
        )
    }

    /// Returns the client identifier, creating and persisting one on first
    /// use. Never fails: storage problems degrade to a session-only id.
    pub fn get_or_create_id(&self) -> String {
        if let Some(id) = &self.configured {
            return id.clone();
        }

        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = resolved.as_ref() {
            return id.clone();
        }

        let id = match self.read(&*self.primary).or_else(|| self.read(&*self.secondary)) {
            Some(id) => {
                debug!("Recovered client id {}", id);
                id
            }
            None => {
                let id = generate_client_id();
                info!("Generated new client id {}", id);
                id
            }
        };

        // Both stores are written independently, which also repairs a
        // backend that lost the value.
        let persisted = [&*self.primary, &*self.secondary]
            .into_iter()
            .filter(|backend| self.write(*backend, &id))
            .count();
        if persisted == 0 {
            warn!("Client id {} could not be persisted; it will not survive a restart", id);
        }

        *resolved = Some(id.clone());
        id
    }

    fn read(&self, backend: &dyn IdentityBackend) -> Option<String> {
        match backend.load(CLIENT_ID_KEY) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read client id from {} store: {}", backend.name(), e);
                None
            }
        }
    }

    fn write(&self, backend: &dyn IdentityBackend, id: &str) -> bool {
        match backend.store(CLIENT_ID_KEY, id) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to write client id to {} store: {}", backend.name(), e);
                false
            }
        }
    }
}

/// Generates `fer_client_` followed by 16 hex characters.
///
/// Uses the operating system RNG, falling back to a clock-seeded generator
/// when it is unavailable.
pub fn generate_client_id() -> String {
    let mut buf = [0u8; 8];
    if let Err(e) = OsRng.try_fill_bytes(&mut buf) {
        warn!("OS random source unavailable ({}), using fallback generator", e);
        let seed = Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
            ^ u64::from(std::process::id());
        StdRng::seed_from_u64(seed).fill_bytes(&mut buf);
    }
    let suffix: String = buf.iter().map(|b| format!("{b:02x}")).collect();
    format!("{CLIENT_ID_PREFIX}{suffix}")
}
