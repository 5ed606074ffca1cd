//! Run configuration from the environment (after `.env`), with CLI overrides
//! applied by the binary.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crm::destination::KommoClient;
use crate::crm::http::{CrmHttp, RateLimitSettings, RequestThrottle, RetryPolicy};
use crate::crm::source::AmoClient;
use crate::migration::ledger::JsonLedger;
use crate::migration::writer::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::util::env::{env_opt, env_parse, env_req};

pub const DEFAULT_BACKUP_DIR: &str = "./backups";

#[derive(Clone)]
pub struct CrmAccount {
    pub base_url: String,
    pub token: String,
}

impl std::fmt::Debug for CrmAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrmAccount")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl CrmAccount {
    fn from_env(url_key: &str, token_key: &str) -> Result<Self> {
        Ok(Self {
            base_url: env_req(url_key)?,
            token: env_req(token_key)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MigrateConfig {
    pub source: CrmAccount,
    pub destination: CrmAccount,
    pub pipeline_id: u64,
    pub chunk_size: usize,
    pub rate_limit: RateLimitSettings,
    pub retry: RetryPolicy,
    pub http_timeout_secs: u64,
    pub backup_dir: PathBuf,
}

impl MigrateConfig {
    /// Everything a live run needs. Fails when a credential is missing.
    pub fn from_env() -> Result<Self> {
        let pipeline_raw = env_req("KOMMO_PIPELINE_ID")?;
        let pipeline_id = pipeline_raw
            .parse::<u64>()
            .with_context(|| format!("KOMMO_PIPELINE_ID is not an integer: {pipeline_raw}"))?;
        Ok(Self {
            source: CrmAccount::from_env("AMO_BASE_URL", "AMO_TOKEN")?,
            destination: CrmAccount::from_env("KOMMO_BASE_URL", "KOMMO_TOKEN")?,
            pipeline_id,
            chunk_size: clamp_chunk(env_parse("MIGRATE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)),
            rate_limit: RateLimitSettings::from_env(
                "CRM_MAX_OPS_PER_WINDOW",
                "CRM_WINDOW_SECS",
                RateLimitSettings::CRM_DEFAULT.max_ops_per_window,
                RateLimitSettings::CRM_DEFAULT.window_secs,
            ),
            retry: RetryPolicy {
                max_retries: env_parse("CRM_MAX_RETRIES", RetryPolicy::default().max_retries),
                base_delay: Duration::from_millis(env_parse("CRM_BACKOFF_MS", 1000u64)),
            },
            http_timeout_secs: env_parse("CRM_HTTP_TIMEOUT_SECS", 30u64),
            backup_dir: backup_dir_from_env(),
        })
    }

    pub fn with_chunk_size(mut self, chunk_size: Option<usize>) -> Self {
        if let Some(n) = chunk_size {
            self.chunk_size = clamp_chunk(n);
        }
        self
    }

    pub fn with_backup_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.backup_dir = dir;
        }
        self
    }

    /// Throttle shared by every destination write of the run.
    pub fn throttle(&self) -> RequestThrottle {
        RequestThrottle::new(self.rate_limit.clone())
    }

    pub fn destination_client(&self) -> Result<KommoClient> {
        let http = CrmHttp::new(
            "kommo",
            &self.destination.base_url,
            &self.destination.token,
            self.http_timeout_secs,
            self.retry.clone(),
        )?;
        Ok(KommoClient::new(http))
    }

    /// The source account has its own request budget.
    pub fn source_client(&self) -> Result<AmoClient> {
        let http = CrmHttp::new(
            "amo",
            &self.source.base_url,
            &self.source.token,
            self.http_timeout_secs,
            self.retry.clone(),
        )?;
        Ok(AmoClient::new(http, RequestThrottle::new(self.rate_limit.clone())))
    }

    pub fn open_ledger(&self) -> Result<JsonLedger> {
        open_ledger(&self.backup_dir)
    }
}

/// `BACKUP_DIR`, or `./backups`.
pub fn backup_dir_from_env() -> PathBuf {
    env_opt("BACKUP_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR))
}

pub fn open_ledger(backup_dir: &Path) -> Result<JsonLedger> {
    JsonLedger::open(backup_dir.join(JsonLedger::FILE_NAME))
}

fn clamp_chunk(n: usize) -> usize {
    n.clamp(1, MAX_CHUNK_SIZE)
}
