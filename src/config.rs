use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_CATALOG_API_BASE: &str = "http://localhost:8080/api/admin";
const DEFAULT_MODEL_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL_NAME: &str = "gpt-4o-mini";
const DEFAULT_ENRICHMENT_LANGUAGE: &str = "Simplified Chinese";
const DEFAULT_BATCH_DELAY_MS: u64 = 1_000;
const DEFAULT_CATALOG_PAGE_SIZE: usize = 100;
const MAX_CATALOG_PAGE_SIZE: usize = 500;
const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub catalog_api_base: String,
    pub catalog_api_token: Option<SecretString>,
    pub model_api_base: String,
    pub model_api_key: Option<SecretString>,
    pub model_name: String,
    pub model_temperature: f32,
    pub enrichment_language: String,
    pub batch_delay_ms: u64,
    pub catalog_page_size: usize,
    pub http_timeout_secs: u64,
    pub journal_dir: PathBuf,
    pub journal_batch_size: usize,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub catalog_api_base: String,
    pub model_api_base: String,
    pub model_name: String,
    pub model_temperature: f32,
    pub enrichment_language: String,
    pub batch_delay_ms: u64,
    pub catalog_page_size: usize,
    pub http_timeout_secs: u64,
    pub journal_dir: String,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
    pub has_catalog_token: bool,
    pub has_model_api_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            catalog_api_base: parse_url("CATALOG_API_BASE", DEFAULT_CATALOG_API_BASE),
            catalog_api_token: parse_secret("CATALOG_API_TOKEN"),
            model_api_base: parse_url("MODEL_API_BASE", DEFAULT_MODEL_API_BASE),
            model_api_key: parse_secret("MODEL_API_KEY"),
            model_name: env::var("MODEL_NAME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
            model_temperature: parse_f32("MODEL_TEMPERATURE", 0.3).clamp(0.0, 2.0),
            enrichment_language: env::var("ENRICHMENT_LANGUAGE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ENRICHMENT_LANGUAGE.to_string()),
            batch_delay_ms: parse_u64("BATCH_DELAY_MS", DEFAULT_BATCH_DELAY_MS),
            catalog_page_size: clamp_page_size(parse_usize(
                "CATALOG_PAGE_SIZE",
                DEFAULT_CATALOG_PAGE_SIZE,
            )),
            http_timeout_secs: parse_u64("HTTP_TIMEOUT_SECS", 60).max(1),
            journal_dir: env::var("JOURNAL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("journal")),
            journal_batch_size: parse_usize("JOURNAL_BATCH_SIZE", 10).max(1),
            journal_max_bytes: parse_u64("JOURNAL_MAX_BYTES", DEFAULT_JOURNAL_MAX_BYTES),
            journal_max_files: parse_usize("JOURNAL_MAX_FILES", DEFAULT_JOURNAL_MAX_FILES).max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            catalog_api_base: self.catalog_api_base.clone(),
            model_api_base: self.model_api_base.clone(),
            model_name: self.model_name.clone(),
            model_temperature: self.model_temperature,
            enrichment_language: self.enrichment_language.clone(),
            batch_delay_ms: self.batch_delay_ms,
            catalog_page_size: self.catalog_page_size,
            http_timeout_secs: self.http_timeout_secs,
            journal_dir: self.journal_dir.to_string_lossy().to_string(),
            journal_max_bytes: self.journal_max_bytes,
            journal_max_files: self.journal_max_files,
            has_catalog_token: self.catalog_api_token.is_some(),
            has_model_api_key: self.model_api_key.is_some(),
        }
    }
}

pub fn clamp_page_size(value: usize) -> usize {
    value.clamp(1, MAX_CATALOG_PAGE_SIZE)
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| SecretString::from(v.trim().to_string()))
}

fn parse_url(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
        .trim()
        .trim_end_matches('/')
        .to_string()
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f32(key: &str, default: f32) -> f32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        catalog_api_base: "http://catalog.test/api".into(),
        catalog_api_token: None,
        model_api_base: "http://model.test/v1".into(),
        model_api_key: Some(SecretString::from("test-key".to_string())),
        model_name: "test-model".into(),
        model_temperature: 0.3,
        enrichment_language: DEFAULT_ENRICHMENT_LANGUAGE.into(),
        batch_delay_ms: 0,
        catalog_page_size: 2,
        http_timeout_secs: 5,
        journal_dir: PathBuf::from("journal"),
        journal_batch_size: 1,
        journal_max_bytes: 1024,
        journal_max_files: 3,
    }
}
